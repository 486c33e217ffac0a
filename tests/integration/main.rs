//! Knock integration test harness.
//!
//! Every test binds real UDP sockets on 127.0.0.1 with ephemeral ports and
//! drives nodes through the public `Node` API only. Timings are shortened
//! so handshake timeouts and idle sweeps finish in a few seconds.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

use knock_core::{KnockConfig, Keypair};
use knock_session::{CloseReason, Node, SessionHandle, SessionHandler};

mod failures;
mod messaging;
mod rendezvous;
mod sessions;
mod trust;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a test waits for any single event before giving up.
pub const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Loopback config with short timers. Keepalives are effectively off so
/// idle sweeps are deterministic; tests that need them override it.
pub fn test_config() -> KnockConfig {
    let mut config = KnockConfig::default();
    config.network.bind_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.network.port = 0;
    config.rendezvous.timeout_ms = 50;
    config.rendezvous.max_timeout_ms = 200;
    config.rendezvous.attempts = 3;
    config.session.handshake_timeout_secs = 1;
    config.session.retransmit_ms = 100;
    config.session.keepalive_secs = 3600;
    config.session.idle_timeout_secs = 3600;
    config.session.maintenance_ms = 50;
    config
}

#[derive(Debug)]
pub enum Event {
    Established(SessionHandle, [u8; 32]),
    Message(SessionHandle, Bytes),
    Closed(SessionHandle, CloseReason),
}

/// Forwards every handler callback onto a channel the test can await.
pub struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

impl SessionHandler for Recorder {
    fn on_established(&self, session: &SessionHandle, remote_static: &[u8; 32]) {
        let _ = self.events.send(Event::Established(*session, *remote_static));
    }

    fn on_message(&self, session: &SessionHandle, payload: Bytes) -> Result<()> {
        self.events
            .send(Event::Message(*session, payload))
            .context("recorder dropped")
    }

    fn on_closed(&self, session: &SessionHandle, reason: CloseReason) {
        let _ = self.events.send(Event::Closed(*session, reason));
    }
}

/// A bound node plus the stream of its handler events.
pub struct TestNode {
    pub node: Node,
    pub public_key: [u8; 32],
    events: mpsc::UnboundedReceiver<Event>,
}

impl TestNode {
    pub async fn spawn(config: KnockConfig) -> Result<Self> {
        Self::spawn_with(config, Keypair::generate()).await
    }

    pub async fn spawn_with(config: KnockConfig, keypair: Keypair) -> Result<Self> {
        let public_key = keypair.public;
        let node = Node::bind(&config, keypair).await.context("bind failed")?;
        let (tx, events) = mpsc::unbounded_channel();
        node.listen(Arc::new(Recorder { events: tx }))?;
        Ok(Self {
            node,
            public_key,
            events,
        })
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.node.local_addr()
    }

    pub async fn next_event(&mut self) -> Result<Event> {
        match tokio::time::timeout(EVENT_WAIT, self.events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => bail!("event channel closed"),
            Err(_) => bail!("no event within {EVENT_WAIT:?}"),
        }
    }

    pub async fn expect_established(&mut self) -> Result<(SessionHandle, [u8; 32])> {
        loop {
            if let Event::Established(handle, key) = self.next_event().await? {
                return Ok((handle, key));
            }
        }
    }

    pub async fn expect_message(&mut self) -> Result<(SessionHandle, Bytes)> {
        loop {
            if let Event::Message(handle, payload) = self.next_event().await? {
                return Ok((handle, payload));
            }
        }
    }

    pub async fn expect_closed(&mut self) -> Result<(SessionHandle, CloseReason)> {
        loop {
            if let Event::Closed(handle, reason) = self.next_event().await? {
                return Ok((handle, reason));
            }
        }
    }

    /// True if no event arrives within `wait`.
    pub async fn quiet_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.events.recv()).await.is_err()
    }
}

/// Two fresh nodes with an established session from `a` to `b`.
pub async fn connected_pair() -> Result<(TestNode, TestNode, SessionHandle, SessionHandle)> {
    let mut a = TestNode::spawn(test_config()).await?;
    let mut b = TestNode::spawn(test_config()).await?;

    let at_a = a.node.open_session(b.addr()).await?;
    let (at_b, key) = b.expect_established().await?;
    assert_eq!(key, a.public_key);
    let _ = a.expect_established().await?;
    Ok((a, b, at_a, at_b))
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
