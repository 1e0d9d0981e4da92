use std::{future, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior, interval_at},
};
use thiserror::Error;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    command::{HELP, InputCommand},
    crypto::{self, CryptoError, Identity},
    directory::{PeerDirectory, SharedDirectory},
    envelope::{Envelope, Handshake},
    framing::FrameCodec,
};

/// Something the receive path wants the user to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Roster(Vec<String>),
    PeerJoined { username: String, fingerprint: String },
    PeerLeft(String),
    Message { sender: String, text: String },
    Unrecognized(String),
}

/// Result of sealing and sending one message.
#[derive(Debug, Default)]
pub struct Delivery {
    pub recipients: Vec<String>,
    pub skipped: Vec<(String, CryptoError)>,
}

/// Why [`Session::send_text`] did not hand a message to the relay.
#[derive(Debug, Error)]
pub enum SendError {
    /// The sealed envelope would exceed the frame limit. Nothing was sent and
    /// the connection is still usable.
    #[error("message too large: {len} byte envelope exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection lost: {0}")]
    Transport(#[source] std::io::Error),
}

/// Send path of a joined client. Owns the write half of the connection.
pub struct Session {
    username: String,
    directory: SharedDirectory,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

/// Receive path of a joined client. Owns the read half of the connection.
pub struct Inbox {
    username: String,
    identity: Arc<Identity>,
    directory: SharedDirectory,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
}

pub async fn connect<A>(addr: A) -> Result<TcpStream>
where
    A: ToSocketAddrs + std::fmt::Display,
{
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    info!("connected to {addr}");
    Ok(stream)
}

/// Sends the handshake and splits the connection into its two paths.
///
/// Both halves share one [`PeerDirectory`], guarded by a mutex.
pub async fn join(
    stream: TcpStream,
    username: &str,
    identity: Arc<Identity>,
    max_frame_len: usize,
) -> Result<(Session, Inbox)> {
    let codec = FrameCodec::with_max_frame_len(max_frame_len);
    let (reader, writer) = stream.into_split();
    let mut writer = FramedWrite::new(writer, codec.clone());

    let handshake = Handshake {
        username: username.to_string(),
        public_key: identity.public_pem().to_string(),
    };
    writer
        .send(handshake.to_frame()?)
        .await
        .context("failed to send handshake")?;

    let directory = PeerDirectory::shared(username);
    let session = Session {
        username: username.to_string(),
        directory: Arc::clone(&directory),
        writer,
    };
    let inbox = Inbox {
        username: username.to_string(),
        identity,
        directory,
        reader: FramedRead::new(reader, codec),
    };
    Ok((session, inbox))
}

impl Session {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn directory(&self) -> SharedDirectory {
        Arc::clone(&self.directory)
    }

    /// Seals `text` for every known peer and hands it to the relay.
    ///
    /// Nothing is sent when the directory is empty.
    pub async fn send_text(&mut self, text: &str) -> Result<Delivery, SendError> {
        let sealed = {
            let directory = self.directory.lock().await;
            if directory.is_empty() {
                return Ok(Delivery::default());
            }
            crypto::seal(text, &self.username, directory.recipients())?
        };

        for (username, error) in &sealed.skipped {
            debug!(%username, %error, "recipient left out of message");
        }

        let delivery = Delivery {
            recipients: sealed.encrypted.keys().cloned().collect(),
            skipped: sealed.skipped,
        };
        let envelope = Envelope::Message {
            sender: self.username.clone(),
            encrypted: sealed.encrypted,
            body: sealed.body,
        };
        let frame = envelope.to_frame()?;
        let max = self.writer.encoder().max_frame_len();
        if frame.len() > max {
            return Err(SendError::TooLarge {
                len: frame.len(),
                max,
            });
        }
        self.writer
            .send(frame)
            .await
            .map_err(SendError::Transport)?;

        Ok(delivery)
    }

    /// Tells the relay this connection is alive without sending any chat.
    pub async fn ping(&mut self) -> Result<()> {
        self.writer
            .send(Envelope::Ping.to_frame()?)
            .await
            .context("failed to send keepalive")?;
        Ok(())
    }

    /// Announces departure and closes the write half.
    pub async fn quit(mut self) -> Result<()> {
        let envelope = Envelope::Quit {
            username: self.username.clone(),
        };
        self.writer
            .send(envelope.to_frame()?)
            .await
            .context("failed to send quit")?;
        self.writer
            .close()
            .await
            .context("failed to close connection")?;
        Ok(())
    }
}

impl Inbox {
    /// Waits for the next event worth surfacing.
    ///
    /// Directory updates are applied before the matching event is returned.
    /// Messages for other peers are passed over. Returns `Ok(None)` once
    /// the relay closes the connection.
    pub async fn next_event(&mut self) -> Result<Option<ClientEvent>> {
        loop {
            let frame = match self.reader.next().await {
                Some(frame) => frame.context("failed to read from relay")?,
                None => return Ok(None),
            };

            let envelope = match Envelope::from_frame(&frame) {
                Ok(envelope) => envelope,
                Err(error) => {
                    debug!(%error, "unrecognized frame from relay");
                    return Ok(Some(ClientEvent::Unrecognized(
                        String::from_utf8_lossy(&frame).into_owned(),
                    )));
                }
            };

            if let Some(event) = self.apply(envelope).await {
                return Ok(Some(event));
            }
        }
    }

    async fn apply(&self, envelope: Envelope) -> Option<ClientEvent> {
        match envelope {
            Envelope::PeerList { peers } => {
                let mut directory = self.directory.lock().await;
                for rejected in directory.merge(&peers) {
                    debug!(username = %rejected.username, error = %rejected.error, "skipping peer");
                }
                let online = peers
                    .into_iter()
                    .map(|peer| peer.username)
                    .filter(|username| directory.contains(username))
                    .collect();
                Some(ClientEvent::Roster(online))
            }
            Envelope::PeerJoined {
                username,
                public_key,
            } => {
                let mut directory = self.directory.lock().await;
                match directory.insert(&username, &public_key) {
                    Ok(true) => {
                        let fingerprint = directory
                            .get(&username)
                            .map(|peer| peer.fingerprint.clone())
                            .unwrap_or_default();
                        Some(ClientEvent::PeerJoined {
                            username,
                            fingerprint,
                        })
                    }
                    Ok(false) => None,
                    Err(error) => {
                        debug!(%username, %error, "skipping peer");
                        None
                    }
                }
            }
            Envelope::PeerLeft { username } | Envelope::Quit { username } => {
                let removed = self.directory.lock().await.remove(&username);
                removed.then_some(ClientEvent::PeerLeft(username))
            }
            Envelope::Ping => None,
            Envelope::Message {
                sender,
                encrypted,
                body,
            } => match self.identity.open(&self.username, &sender, &encrypted, &body) {
                Ok(Some(text)) => Some(ClientEvent::Message { sender, text }),
                Ok(None) => None,
                Err(error) => {
                    debug!(%sender, %error, "failed to open message");
                    None
                }
            },
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut stdin = BufReader::new(io::stdin()).lines();

    let username = match args.username.clone() {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        Some(_) => bail!("username cannot be empty"),
        None => prompt_username(&mut stdin).await?,
    };

    let identity = generate_identity(args.key_bits).await?;
    info!(fingerprint = identity.fingerprint(), "generated session key");

    let stream = connect(format!("{}:{}", args.host, args.port)).await?;
    let (mut session, inbox) = join(stream, &username, identity, args.max_frame_bytes).await?;

    write_stdout(&format!("*** connected as {username}")).await?;

    let mut receiver = tokio::spawn(receive_loop(inbox));
    let mut keepalive = (args.keepalive_secs > 0).then(|| {
        let period = Duration::from_secs(args.keepalive_secs);
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    run_input_loop(&mut session, &mut stdin, &mut receiver, &mut keepalive).await?;

    receiver.abort();
    if let Err(error) = session.quit().await {
        debug!(?error, "relay was already gone");
    }

    Ok(())
}

async fn prompt_username(stdin: &mut Lines<BufReader<Stdin>>) -> Result<String> {
    loop {
        write_prompt("Enter your username: ").await?;
        match stdin.next_line().await? {
            Some(line) if !line.trim().is_empty() => return Ok(line.trim().to_string()),
            Some(_) => continue,
            None => bail!("stdin closed before a username was entered"),
        }
    }
}

async fn generate_identity(bits: usize) -> Result<Arc<Identity>> {
    let identity = tokio::task::spawn_blocking(move || Identity::generate(bits))
        .await
        .context("key generation task failed")??;
    Ok(Arc::new(identity))
}

async fn run_input_loop(
    session: &mut Session,
    stdin: &mut Lines<BufReader<Stdin>>,
    receiver: &mut JoinHandle<()>,
    keepalive: &mut Option<Interval>,
) -> Result<()> {
    loop {
        select! {
            _ = next_keepalive(keepalive) => {
                if let Err(error) = session.ping().await {
                    warn!(?error, "keepalive failed");
                    write_stdout("*** connection lost").await?;
                    break;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_line(line, session).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                write_stdout("*** leaving chat").await?;
                break;
            }
            _ = &mut *receiver => {
                // The receive loop already told the user why.
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_line(line: io::Result<Option<String>>, session: &mut Session) -> Result<bool> {
    let Some(line) = line? else {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    };

    let command = match InputCommand::parse(&line) {
        Ok(command) => command,
        Err(error) => {
            write_stderr(&format!("!!! {error}")).await?;
            return Ok(true);
        }
    };

    match command {
        InputCommand::Empty => Ok(true),
        InputCommand::Help => {
            write_stdout(&format!("*** {HELP}")).await?;
            Ok(true)
        }
        InputCommand::Peers => {
            render_peers(session).await?;
            Ok(true)
        }
        InputCommand::Quit => {
            write_stdout("*** leaving chat").await?;
            Ok(false)
        }
        InputCommand::Say(text) => match session.send_text(&text).await {
            Ok(delivery) => {
                if delivery.recipients.is_empty() {
                    write_stdout("*** nobody else is here to read that").await?;
                }
                Ok(true)
            }
            Err(SendError::Transport(error)) => {
                warn!(?error, "send failed");
                write_stdout("*** connection lost").await?;
                Ok(false)
            }
            // Nothing reached the socket, so the session carries on.
            Err(error) => {
                write_stdout(&format!("*** {error}")).await?;
                Ok(true)
            }
        },
    }
}

async fn next_keepalive(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn receive_loop(mut inbox: Inbox) {
    loop {
        let outcome = match inbox.next_event().await {
            Ok(Some(event)) => render_event(event).await,
            Ok(None) => {
                let _ = write_stdout("*** server closed the connection").await;
                return;
            }
            Err(error) => {
                debug!(?error, "receive loop stopped");
                let _ = write_stdout("*** connection lost").await;
                return;
            }
        };
        if let Err(error) = outcome {
            warn!(?error, "failed to write to stdout");
            return;
        }
    }
}

async fn render_event(event: ClientEvent) -> io::Result<()> {
    match event {
        ClientEvent::Roster(peers) => {
            if peers.is_empty() {
                return Ok(());
            }
            write_stdout(&format!("*** currently online: {}", peers.join(", "))).await
        }
        ClientEvent::PeerJoined { username, .. } => {
            write_stdout(&format!("*** {username} joined the chat")).await
        }
        ClientEvent::PeerLeft(username) => {
            write_stdout(&format!("*** {username} left the chat")).await
        }
        ClientEvent::Message { sender, text } => write_stdout(&format!("<{sender}> {text}")).await,
        ClientEvent::Unrecognized(raw) => write_stdout(&format!("?? {raw}")).await,
    }
}

async fn render_peers(session: &Session) -> io::Result<()> {
    let lines: Vec<String> = {
        let directory = session.directory.lock().await;
        directory
            .iter()
            .map(|(username, peer)| format!("***   {username} {}", &peer.fingerprint[..16]))
            .collect()
    };

    if lines.is_empty() {
        return write_stdout("*** no peers online").await;
    }
    write_stdout(&format!("*** {} peer(s) online:", lines.len())).await?;
    for line in lines {
        write_stdout(&line).await?;
    }
    Ok(())
}

async fn write_prompt(prompt: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{line}\n").as_bytes()).await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(format!("{line}\n").as_bytes()).await?;
    stderr.flush().await
}
