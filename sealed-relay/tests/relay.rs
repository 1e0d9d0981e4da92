use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use sealed_relay::{
    crypto::Identity,
    envelope::{Envelope, Handshake, PeerInfo},
    framing::FrameCodec,
    relay::{Relay, RelayConfig},
};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::codec::{FramedRead, FramedWrite};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

struct TestRelay {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let relay = Relay::new(listener, config);
        let addr = relay.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = relay.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            server,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.server.await;
    }
}

struct RawPeer {
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl RawPeer {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(reader, FrameCodec::new()),
            writer: FramedWrite::new(writer, FrameCodec::new()),
        })
    }

    /// Connects, sends the handshake and consumes the `peer_list` reply.
    async fn join(addr: SocketAddr, username: &str, public_key: &str) -> Result<(Self, Vec<PeerInfo>)> {
        let mut peer = Self::connect(addr).await?;
        let handshake = Handshake {
            username: username.to_string(),
            public_key: public_key.to_string(),
        };
        peer.send(handshake.to_frame()?).await?;

        match peer.next_envelope().await? {
            Envelope::PeerList { peers } => Ok((peer, peers)),
            other => Err(anyhow!("expected peer_list, got {other:?}")),
        }
    }

    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.writer.send(frame).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        match timeout(WAIT, self.reader.next()).await? {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }

    async fn next_envelope(&mut self) -> Result<Envelope> {
        let frame = self
            .next_frame()
            .await?
            .ok_or_else(|| anyhow!("connection closed"))?;
        Ok(Envelope::from_frame(&frame)?)
    }

    async fn expect_closed(&mut self) -> Result<()> {
        match timeout(WAIT, self.reader.next()).await? {
            None | Some(Err(_)) => Ok(()),
            Some(Ok(frame)) => Err(anyhow!("expected close, got frame {frame:?}")),
        }
    }

    async fn expect_quiet(&mut self) {
        if let Ok(frame) = timeout(QUIET, self.reader.next()).await {
            panic!("expected no traffic, got {frame:?}");
        }
    }
}

fn test_key() -> String {
    Identity::generate(1024)
        .expect("identity")
        .public_pem()
        .to_string()
}

#[tokio::test]
async fn newcomer_gets_snapshot_and_others_get_join_notice() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let key = test_key();

    let (mut alice, alice_peers) = RawPeer::join(relay.addr, "alice", &key).await?;
    assert!(alice_peers.is_empty());

    let (_bob, bob_peers) = RawPeer::join(relay.addr, "bob", &key).await?;
    assert_eq!(
        bob_peers,
        vec![PeerInfo {
            username: "alice".into(),
            public_key: key.clone(),
        }]
    );

    assert_eq!(
        alice.next_envelope().await?,
        Envelope::PeerJoined {
            username: "bob".into(),
            public_key: key.clone(),
        }
    );

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn frames_reach_everyone_but_the_sender_unchanged() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let key = test_key();

    let (mut alice, _) = RawPeer::join(relay.addr, "alice", &key).await?;
    let (mut bob, _) = RawPeer::join(relay.addr, "bob", &key).await?;
    alice.next_envelope().await?;
    let (mut carol, _) = RawPeer::join(relay.addr, "carol", &key).await?;
    alice.next_envelope().await?;
    bob.next_envelope().await?;

    let message = Bytes::from_static(
        br#"{"type":"message","sender":"alice","encrypted":{"bob":"AAAA"},"body":"BBBB"}"#,
    );
    alice.send(message.clone()).await?;

    // Carol is not a key in `encrypted`, but the relay does not look.
    assert_eq!(bob.next_frame().await?, Some(message.clone()));
    assert_eq!(carol.next_frame().await?, Some(message));

    let opaque = Bytes::from_static(b"\xff\xfe not json at all");
    bob.send(opaque.clone()).await?;
    assert_eq!(alice.next_frame().await?, Some(opaque.clone()));
    assert_eq!(carol.next_frame().await?, Some(opaque));

    alice.expect_quiet().await;
    bob.expect_quiet().await;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn quit_and_reset_both_produce_one_peer_left() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let key = test_key();

    let (mut alice, _) = RawPeer::join(relay.addr, "alice", &key).await?;
    let (mut bob, _) = RawPeer::join(relay.addr, "bob", &key).await?;
    alice.next_envelope().await?;
    let (carol, _) = RawPeer::join(relay.addr, "carol", &key).await?;
    alice.next_envelope().await?;

    let quit = Envelope::Quit {
        username: "bob".into(),
    };
    bob.send(quit.to_frame()?).await?;
    assert_eq!(
        alice.next_envelope().await?,
        Envelope::PeerLeft {
            username: "bob".into()
        }
    );
    bob.expect_closed().await?;

    drop(carol);
    assert_eq!(
        alice.next_envelope().await?,
        Envelope::PeerLeft {
            username: "carol".into()
        }
    );
    alice.expect_quiet().await;

    let (_dave, dave_peers) = RawPeer::join(relay.addr, "dave", &key).await?;
    let names: Vec<_> = dave_peers.into_iter().map(|peer| peer.username).collect();
    assert_eq!(names, vec!["alice"]);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn bad_handshakes_are_dropped_without_a_trace() -> Result<()> {
    let relay = TestRelay::start(RelayConfig::default()).await?;
    let key = test_key();
    let (mut alice, _) = RawPeer::join(relay.addr, "alice", &key).await?;

    let attempts: [&'static [u8]; 4] = [
        b"this is not json",
        br#"{"username":"mallory"}"#,
        br#"{"username":"","public_key":"x"}"#,
        br#"{"username":"mallory","public_key":"not a pem"}"#,
    ];
    for attempt in attempts {
        let mut raw = RawPeer::connect(relay.addr).await?;
        raw.send(Bytes::from_static(attempt)).await?;
        raw.expect_closed().await?;
    }

    alice.expect_quiet().await;

    let (_bob, bob_peers) = RawPeer::join(relay.addr, "bob", &key).await?;
    assert_eq!(bob_peers.len(), 1);
    assert_eq!(bob_peers[0].username, "alice");

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn silent_connections_time_out() -> Result<()> {
    let config = RelayConfig {
        handshake_timeout: Duration::from_millis(200),
        idle_timeout: Some(Duration::from_millis(300)),
        ..RelayConfig::default()
    };
    let relay = TestRelay::start(config).await?;
    let key = test_key();

    let mut lurker = RawPeer::connect(relay.addr).await?;
    lurker.expect_closed().await?;

    let (mut alice, _) = RawPeer::join(relay.addr, "alice", &key).await?;
    alice.expect_closed().await?;

    let (_bob, bob_peers) = RawPeer::join(relay.addr, "bob", &key).await?;
    assert!(bob_peers.is_empty());

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn oversized_frame_drops_only_the_offender() -> Result<()> {
    let config = RelayConfig {
        max_frame_len: 1024,
        ..RelayConfig::default()
    };
    let relay = TestRelay::start(config).await?;
    let key = test_key();

    let (mut alice, _) = RawPeer::join(relay.addr, "alice", &key).await?;
    let (bob, _) = RawPeer::join(relay.addr, "bob", &key).await?;
    alice.next_envelope().await?;

    let RawPeer { reader, writer } = bob;
    let mut stream = writer.into_inner();
    stream.write_all(&vec![b'a'; 4096]).await?;
    stream.flush().await?;

    assert_eq!(
        alice.next_envelope().await?,
        Envelope::PeerLeft {
            username: "bob".into()
        }
    );
    drop(reader);

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn keepalives_hold_the_idle_timer_and_are_not_relayed() -> Result<()> {
    let idle = Duration::from_millis(500);
    let config = RelayConfig {
        idle_timeout: Some(idle),
        ..RelayConfig::default()
    };
    let relay = TestRelay::start(config).await?;
    let key = test_key();

    let (mut alice, _) = RawPeer::join(relay.addr, "alice", &key).await?;
    let (mut bob, _) = RawPeer::join(relay.addr, "bob", &key).await?;
    alice.next_envelope().await?;

    let ping = Envelope::Ping.to_frame()?;
    for _ in 0..8 {
        sleep(idle / 5).await;
        alice.send(ping.clone()).await?;
        bob.send(ping.clone()).await?;
    }

    // Neither side saw a ping or a departure.
    alice.expect_quiet().await;
    bob.expect_quiet().await;
    alice.send(ping.clone()).await?;
    bob.send(ping).await?;

    let (_carol, carol_peers) = RawPeer::join(relay.addr, "carol", &key).await?;
    let mut names: Vec<_> = carol_peers.into_iter().map(|peer| peer.username).collect();
    names.sort();
    assert_eq!(names, vec!["alice", "bob"]);

    relay.stop().await;
    Ok(())
}
