use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// First document a client sends after connecting.
///
/// It carries no `type` tag on the wire. Unknown fields are ignored, so a
/// client that labels it `"type": "auth"` is accepted as well.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub username: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub username: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    PeerList {
        peers: Vec<PeerInfo>,
    },
    PeerJoined {
        username: String,
        public_key: String,
    },
    PeerLeft {
        username: String,
    },
    /// `encrypted` maps each recipient to its wrapped content key; `body` is
    /// the payload sealed once under that content key.
    Message {
        sender: String,
        encrypted: BTreeMap<String, String>,
        body: String,
    },
    Quit {
        username: String,
    },
    /// Keepalive from a client. The relay resets its idle timer and drops it.
    Ping,
}

impl Envelope {
    pub fn to_frame(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_frame(frame: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(frame)
    }
}

impl Handshake {
    pub fn to_frame(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Parses a handshake, trimming the username and rejecting blank fields.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        let Handshake {
            username,
            public_key,
        } = serde_json::from_slice(frame).ok()?;
        let username = username.trim().to_string();
        if username.is_empty() || public_key.trim().is_empty() {
            return None;
        }
        Some(Handshake {
            username,
            public_key,
        })
    }
}

/// What the relay does with a frame read from an active connection.
///
/// Only the `type` tag is inspected; the rest of the frame is never parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Quit,
    Ping,
    Forward,
}

// Owned so escaped tags such as "qu\u0069t" still decode.
#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl Inbound {
    pub fn classify(frame: &[u8]) -> Self {
        let Ok(TypeTag { kind }) = serde_json::from_slice::<TypeTag>(frame) else {
            return Inbound::Forward;
        };
        match kind.as_deref() {
            Some("quit") => Inbound::Quit,
            Some("ping") => Inbound::Ping,
            _ => Inbound::Forward,
        }
    }
}
