use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::{crypto::DEFAULT_KEY_BITS, framing::DEFAULT_MAX_FRAME_LEN, relay::RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, forwarding sealed envelopes between connected peers.
    Server(ServerArgs),
    /// Connect to a relay and chat with end-to-end encryption.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host name or address to bind.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port to bind. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 12345)]
    pub port: u16,

    /// Seconds a new connection has to send its handshake.
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Seconds of silence before an authenticated connection is dropped. 0 disables.
    #[arg(long, default_value_t = 900)]
    pub idle_timeout_secs: u64,

    /// Largest frame accepted from a connection.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            max_frame_len: self.max_frame_bytes,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Relay host to connect to.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Relay port to connect to.
    #[arg(long, default_value_t = 12345)]
    pub port: u16,

    /// Name to join with. Prompted for when omitted.
    #[arg(long)]
    pub username: Option<String>,

    /// RSA modulus size for this session's key pair.
    #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
    pub key_bits: usize,

    /// Largest frame accepted from the relay.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,

    /// Seconds between keepalives, well under the relay's idle timeout. 0 disables.
    #[arg(long, default_value_t = 60)]
    pub keepalive_secs: u64,
}
