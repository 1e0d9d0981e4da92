//! End-to-end encrypted chat over a content-blind relay.
//!
//! The relay keeps a directory of connected peers and forwards every envelope
//! to everyone else without looking inside. Clients seal each message once
//! and wrap the content key for every recipient, so only the addressed peers
//! can read it. Each module focuses on a concrete responsibility:
//!
//! - [`framing`] splits the TCP byte stream into newline-delimited frames.
//! - [`envelope`] defines the JSON documents exchanged over those frames.
//! - [`crypto`] holds the session key pair and the per-recipient fanout.
//! - [`directory`] is the client's view of who is online.
//! - [`relay`] accepts connections, tracks peers, and broadcasts frames.
//! - [`client`] joins a relay and runs the receive and send paths.
//! - [`command`] parses what the user types at the client prompt.
//! - [`cli`] parses the command-line interface for server and client modes.
//!
//! Integration tests drive the relay over real sockets, both with raw frames
//! and through the client library.

pub mod cli;
pub mod client;
pub mod command;
pub mod crypto;
pub mod directory;
pub mod envelope;
pub mod framing;
pub mod relay;
