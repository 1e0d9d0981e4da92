use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
    },
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use crate::{
    crypto,
    envelope::{Envelope, Handshake, Inbound, PeerInfo},
    framing::{DEFAULT_MAX_FRAME_LEN, FrameCodec},
};

type ConnectionId = u64;

/// Frames a connection may have queued before broadcasts to it are dropped.
const OUTBOX_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long a new connection may take to send its handshake.
    pub handshake_timeout: Duration,
    /// Idle read timeout for authenticated connections; `None` waits forever.
    pub idle_timeout: Option<Duration>,
    pub max_frame_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(900)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
    config: Arc<RelayConfig>,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new()),
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            state,
            config,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &config);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &RelayState) {
    let dropped = state.clear().await;
    info!(connections = dropped, "relay shutting down");
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
    config: &Arc<RelayConfig>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<RelayState>,
    config: &Arc<RelayConfig>,
) {
    let state = Arc::clone(state);
    let config = Arc::clone(config);
    tokio::spawn(async move {
        debug!(%peer, "new connection");
        if let Err(err) = handle_connection(stream, peer, state, config).await {
            warn!(%peer, error = ?err, "connection closed with error");
        }
    });
}

struct PeerRecord {
    username: String,
    public_key: String,
    outbox: mpsc::Sender<Bytes>,
}

/// The authoritative peer directory.
///
/// Every snapshot, insert, removal and broadcast walk happens under the one
/// lock, so a broadcast never observes a half-applied join or leave.
pub(crate) struct RelayState {
    peers: Mutex<HashMap<ConnectionId, PeerRecord>>,
    next_id: AtomicU64,
}

impl RelayState {
    pub(crate) fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a peer and queues its `peer_list` while the lock is held, so the
    /// snapshot reaches the new peer ahead of any later broadcast.
    async fn register(
        &self,
        id: ConnectionId,
        handshake: &Handshake,
        outbox: mpsc::Sender<Bytes>,
    ) -> Result<()> {
        let mut peers = self.peers.lock().await;

        if peers
            .values()
            .any(|record| record.username == handshake.username)
        {
            warn!(username = %handshake.username, "username already connected; accepting anyway");
        }

        let snapshot = Envelope::PeerList {
            peers: peers
                .values()
                .map(|record| PeerInfo {
                    username: record.username.clone(),
                    public_key: record.public_key.clone(),
                })
                .collect(),
        };
        outbox
            .try_send(snapshot.to_frame()?)
            .context("failed to queue peer list")?;

        peers.insert(
            id,
            PeerRecord {
                username: handshake.username.clone(),
                public_key: handshake.public_key.clone(),
                outbox,
            },
        );
        Ok(())
    }

    async fn remove(&self, id: ConnectionId) -> Option<String> {
        let mut peers = self.peers.lock().await;
        peers.remove(&id).map(|record| record.username)
    }

    async fn clear(&self) -> usize {
        let mut peers = self.peers.lock().await;
        let count = peers.len();
        peers.clear();
        count
    }

    /// Queues `frame` for every connection except `exclude`.
    ///
    /// A full or closed outbox only costs that one connection the frame.
    /// Returns how many connections the frame was queued for.
    pub(crate) async fn broadcast(&self, frame: Bytes, exclude: Option<ConnectionId>) -> usize {
        let peers = self.peers.lock().await;
        let mut delivered = 0;

        for (id, record) in peers.iter() {
            if Some(*id) == exclude {
                continue;
            }
            match record.outbox.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection = id, username = %record.username, "outbox full; dropping frame");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection = id, username = %record.username, "outbox closed; skipping");
                }
            }
        }

        delivered
    }

    async fn broadcast_envelope(&self, envelope: &Envelope, exclude: Option<ConnectionId>) {
        match envelope.to_frame() {
            Ok(frame) => {
                self.broadcast(frame, exclude).await;
            }
            Err(error) => warn!(?error, "failed to encode envelope"),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RelayState>,
    config: Arc<RelayConfig>,
) -> Result<()> {
    let codec = FrameCodec::with_max_frame_len(config.max_frame_len);
    let (reader, writer) = stream.into_split();
    let mut reader = FramedRead::new(reader, codec.clone());
    let writer = FramedWrite::new(writer, codec);

    let Some(handshake) = perform_handshake(&mut reader, &config, peer).await else {
        return Ok(());
    };

    let connection_id = state.next_id();
    let (outbox, inbox) = mpsc::channel(OUTBOX_CAPACITY);
    state.register(connection_id, &handshake, outbox).await?;
    tokio::spawn(run_writer(writer, inbox, peer));

    info!(%peer, username = %handshake.username, "peer joined");
    state
        .broadcast_envelope(
            &Envelope::PeerJoined {
                username: handshake.username.clone(),
                public_key: handshake.public_key.clone(),
            },
            Some(connection_id),
        )
        .await;

    let outcome = run_session(&state, &mut reader, &config, connection_id).await;
    cleanup_disconnect(&state, connection_id, peer, &outcome).await;

    outcome.map(|_| ())
}

/// Reads and validates the first frame. Anything unusable drops the
/// connection without registering a peer or telling anyone.
async fn perform_handshake(
    reader: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    config: &RelayConfig,
    peer: SocketAddr,
) -> Option<Handshake> {
    let frame = match timeout(config.handshake_timeout, reader.next()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(error))) => {
            debug!(%peer, ?error, "unreadable handshake");
            return None;
        }
        Ok(None) => {
            debug!(%peer, "connection closed before handshake");
            return None;
        }
        Err(_) => {
            debug!(%peer, "handshake timed out");
            return None;
        }
    };

    let Some(handshake) = Handshake::from_frame(&frame) else {
        debug!(%peer, "malformed handshake");
        return None;
    };

    if let Err(error) = crypto::parse_public_key(&handshake.public_key) {
        debug!(%peer, username = %handshake.username, %error, "handshake carried an unusable key");
        return None;
    }

    Some(handshake)
}

#[derive(Debug)]
enum SessionEnd {
    Quit,
    Eof,
    IdleTimeout,
}

async fn run_session(
    state: &RelayState,
    reader: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    config: &RelayConfig,
    connection_id: ConnectionId,
) -> Result<SessionEnd> {
    loop {
        let next = match config.idle_timeout {
            Some(limit) => match timeout(limit, reader.next()).await {
                Ok(next) => next,
                Err(_) => return Ok(SessionEnd::IdleTimeout),
            },
            None => reader.next().await,
        };

        let frame = match next {
            Some(frame) => frame.context("failed to read frame")?,
            None => return Ok(SessionEnd::Eof),
        };

        match Inbound::classify(&frame) {
            Inbound::Quit => return Ok(SessionEnd::Quit),
            Inbound::Ping => trace!(connection = connection_id, "keepalive"),
            Inbound::Forward => {
                let delivered = state.broadcast(frame, Some(connection_id)).await;
                debug!(connection = connection_id, delivered, "forwarded frame");
            }
        }
    }
}

async fn run_writer(
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut inbox: mpsc::Receiver<Bytes>,
    peer: SocketAddr,
) {
    while let Some(frame) = inbox.recv().await {
        if let Err(err) = writer.send(frame).await {
            debug!(%peer, ?err, "failed to deliver frame");
            return;
        }
    }
    if let Err(err) = writer.close().await {
        debug!(%peer, ?err, "failed to shut down writer");
    }
}

async fn cleanup_disconnect(
    state: &RelayState,
    connection_id: ConnectionId,
    peer: SocketAddr,
    outcome: &Result<SessionEnd>,
) {
    if let Some(username) = state.remove(connection_id).await {
        match outcome {
            Ok(reason) => info!(%peer, %username, ?reason, "peer left"),
            Err(error) => info!(%peer, %username, %error, "peer dropped"),
        }
        state
            .broadcast_envelope(&Envelope::PeerLeft { username }, None)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(username: &str) -> Handshake {
        Handshake {
            username: username.into(),
            public_key: format!("{username}-key"),
        }
    }

    async fn join(
        state: &RelayState,
        username: &str,
    ) -> (ConnectionId, mpsc::Receiver<Bytes>, Envelope) {
        let id = state.next_id();
        let (tx, mut rx) = mpsc::channel(OUTBOX_CAPACITY);
        state
            .register(id, &handshake(username), tx)
            .await
            .expect("register");
        let frame = rx.recv().await.expect("peer list queued");
        let snapshot = Envelope::from_frame(&frame).expect("peer list");
        (id, rx, snapshot)
    }

    #[tokio::test]
    async fn snapshot_lists_everyone_but_the_newcomer() {
        let state = RelayState::new();
        let (_, _alice_rx, first) = join(&state, "alice").await;
        let (_, _bob_rx, second) = join(&state, "bob").await;

        assert_eq!(first, Envelope::PeerList { peers: vec![] });
        assert_eq!(
            second,
            Envelope::PeerList {
                peers: vec![PeerInfo {
                    username: "alice".into(),
                    public_key: "alice-key".into(),
                }]
            }
        );
    }

    #[tokio::test]
    async fn duplicate_usernames_are_accepted() {
        let state = RelayState::new();
        let (first, _rx_one, _) = join(&state, "alice").await;
        let (second, _rx_two, _) = join(&state, "alice").await;

        assert_ne!(first, second);
        assert_eq!(state.peers.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_survives_dead_connections() {
        let state = RelayState::new();
        let (alice, mut alice_rx, _) = join(&state, "alice").await;
        let (_, bob_rx, _) = join(&state, "bob").await;
        let (_, mut carol_rx, _) = join(&state, "carol").await;

        // Bob's writer is gone; the broadcast must still reach Carol.
        drop(bob_rx);

        let frame = Bytes::from_static(b"{\"type\":\"message\"}");
        let delivered = state.broadcast(frame.clone(), Some(alice)).await;

        assert_eq!(delivered, 1);
        assert_eq!(carol_rx.recv().await, Some(frame));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_outbox_does_not_block_other_peers() {
        let state = RelayState::new();
        let id = state.next_id();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        state
            .register(id, &handshake("slow"), slow_tx)
            .await
            .expect("register");
        let (_, mut fast_rx, _) = join(&state, "fast").await;

        // The slow outbox is already holding its peer list.
        let delivered = state.broadcast(Bytes::from_static(b"x"), None).await;

        assert_eq!(delivered, 1);
        assert_eq!(fast_rx.recv().await, Some(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn remove_returns_username_once() {
        let state = RelayState::new();
        let (id, _rx, _) = join(&state, "alice").await;

        assert_eq!(state.remove(id).await.as_deref(), Some("alice"));
        assert_eq!(state.remove(id).await, None);
    }
}
