//! Transport multiplexer — one socket, one receive loop, one lane per endpoint.
//!
//! ```text
//!   socket ──► receive loop ──┬─► rendezvous replies ──► pending discovery
//!                             │
//!                             └─► admission ──► lane(endpoint) ──► registry / codec
//!
//!   maintenance tick ──► expire handshakes, retransmit, keepalive, sweep idle
//! ```
//!
//! The receive loop is the only admission point and never awaits anything
//! but the socket. A lane is a task that processes one endpoint's datagrams
//! in arrival order; lanes for different endpoints run in parallel.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use knock_core::config::SessionConfig;
use knock_core::wire::MAX_DATAGRAM;
use knock_core::{CodecError, HandshakeError, HandshakeMessage, PacketKind};

use crate::error::TransportError;
use crate::node::{CloseReason, SessionHandle, SessionHandler};
use crate::registry::{HandshakeOutcome, Initiation, RemovedSession, SessionRegistry};
use crate::rendezvous::RendezvousClient;
use crate::session::SessionId;
use crate::socket::LocalSocket;
use crate::Endpoint;

/// A lane with no session and no traffic for this long exits.
const LANE_IDLE: Duration = Duration::from_secs(10);

type Waiter = oneshot::Sender<Result<SessionHandle, TransportError>>;

pub(crate) struct Transport {
    pub(crate) socket: Arc<LocalSocket>,
    pub(crate) registry: SessionRegistry,
    pub(crate) rendezvous: RendezvousClient,
    settings: SessionConfig,
    lanes: DashMap<Endpoint, mpsc::Sender<Bytes>>,
    /// Callers of `open` waiting for an endpoint to establish, whichever
    /// side ends up initiating.
    waiters: DashMap<Endpoint, Vec<Waiter>>,
    handler: RwLock<Option<Arc<dyn SessionHandler>>>,
    shut_down: AtomicBool,
}

impl Transport {
    pub(crate) fn new(
        socket: Arc<LocalSocket>,
        registry: SessionRegistry,
        rendezvous: RendezvousClient,
        settings: SessionConfig,
    ) -> Self {
        Self {
            socket,
            registry,
            rendezvous,
            settings,
            lanes: DashMap::new(),
            waiters: DashMap::new(),
            handler: RwLock::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn SessionHandler>) -> Result<(), TransportError> {
        let mut slot = self.handler.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(TransportError::AlreadyListening);
        }
        *slot = Some(handler);
        Ok(())
    }

    fn handler(&self) -> Option<Arc<dyn SessionHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Refuse new work without closing anything. Lanes wind down once idle.
    pub(crate) fn halt(&self) {
        self.shut_down.store(true, Ordering::Release);
    }

    // ── Receive loop ──────────────────────────────────────────────────────────

    pub(crate) async fn receive_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("receive loop shutting down");
                    return;
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    self.on_datagram(&buf[..len], from);
                }
            }
        }
    }

    /// Classify and admit one datagram. Never blocks.
    fn on_datagram(self: &Arc<Self>, datagram: &[u8], from: Endpoint) {
        let kind = match PacketKind::of(datagram) {
            Ok(k) => k,
            Err(e) => {
                tracing::trace!(%from, error = %e, "dropping datagram");
                return;
            }
        };

        match kind {
            PacketKind::RendezvousReply => {
                self.rendezvous.on_reply(datagram, from);
                return;
            }
            PacketKind::RendezvousProbe => {
                tracing::trace!(%from, "ignoring rendezvous probe");
                return;
            }
            _ => {}
        }

        if !self.registry.contains(from)
            && (kind != PacketKind::HandshakeInit || !self.registry.accepts_inbound())
        {
            tracing::debug!(%from, ?kind, "dropping datagram from unknown endpoint");
            return;
        }

        self.enqueue(from, Bytes::copy_from_slice(datagram));
    }

    fn enqueue(self: &Arc<Self>, from: Endpoint, mut datagram: Bytes) {
        // A closed lane is replaced once; a full one drops the datagram.
        for _ in 0..2 {
            let lane = self
                .lanes
                .entry(from)
                .or_insert_with(|| self.spawn_lane(from))
                .clone();
            match lane.try_send(datagram) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(%from, "lane full, dropping datagram");
                    return;
                }
                Err(TrySendError::Closed(returned)) => {
                    self.lanes.remove_if(&from, |_, tx| tx.same_channel(&lane));
                    datagram = returned;
                }
            }
        }
    }

    fn spawn_lane(self: &Arc<Self>, endpoint: Endpoint) -> mpsc::Sender<Bytes> {
        let (tx, rx) = mpsc::channel(self.settings.lane_capacity.max(1));
        tokio::spawn(self.clone().lane(endpoint, rx));
        tracing::trace!(peer = %endpoint, "lane started");
        tx
    }

    async fn lane(self: Arc<Self>, endpoint: Endpoint, mut rx: mpsc::Receiver<Bytes>) {
        loop {
            match tokio::time::timeout(LANE_IDLE, rx.recv()).await {
                Ok(Some(datagram)) => self.process(endpoint, &datagram).await,
                Ok(None) => break,
                Err(_) if self.registry.contains(endpoint) && !self.is_shut_down() => continue,
                Err(_) => {
                    // Stop admitting, finish what already arrived, exit.
                    rx.close();
                    while let Some(datagram) = rx.recv().await {
                        self.process(endpoint, &datagram).await;
                    }
                    break;
                }
            }
        }
        self.lanes.remove_if(&endpoint, |_, tx| tx.is_closed());
        tracing::trace!(peer = %endpoint, "lane exited");
    }

    async fn process(&self, endpoint: Endpoint, datagram: &[u8]) {
        match PacketKind::of(datagram) {
            Ok(kind) if kind.is_handshake() => self.process_handshake(endpoint, datagram).await,
            Ok(kind) if kind.is_sealed() => self.process_sealed(endpoint, datagram),
            _ => {}
        }
    }

    async fn process_handshake(&self, endpoint: Endpoint, datagram: &[u8]) {
        let msg = match HandshakeMessage::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(peer = %endpoint, error = %e, "malformed handshake message");
                if let Some(removed) = self.registry.abort_handshake(endpoint) {
                    self.handshake_failed(removed, HandshakeError::MalformedMessage);
                }
                return;
            }
        };

        let advance = self.registry.advance(endpoint, &msg, Instant::now());
        if let Some(old) = advance.superseded {
            self.closed(old, CloseReason::Superseded);
        }

        match advance.outcome {
            HandshakeOutcome::NeedsReply(bytes) => {
                self.reply(endpoint, advance.session, &bytes).await;
            }
            HandshakeOutcome::Established {
                reply,
                remote_static,
            } => {
                let Some(id) = advance.session else { return };
                if let Some(bytes) = reply {
                    self.reply(endpoint, Some(id), &bytes).await;
                }
                let handle = SessionHandle { endpoint, id };
                if let Some(info) = self.registry.info(endpoint) {
                    tracing::info!(
                        peer = %endpoint,
                        session = %id,
                        role = ?info.role,
                        key = hex::encode(&remote_static[..8]),
                        channel = info.channel_id.map(|c| hex::encode(&c[..8])).unwrap_or_default(),
                        "session established"
                    );
                }
                self.resolve_waiters(endpoint, handle);
                if let Some(handler) = self.handler() {
                    handler.on_established(&handle, &remote_static);
                }
            }
            HandshakeOutcome::Failed(e) => {
                tracing::warn!(peer = %endpoint, error = %e, "handshake failed");
                if let Some(id) = advance.session {
                    self.handshake_failed(
                        RemovedSession {
                            endpoint,
                            id,
                            was_established: false,
                        },
                        e,
                    );
                }
            }
            HandshakeOutcome::Ignored => {
                tracing::trace!(peer = %endpoint, msg = msg.number(), "handshake message ignored");
            }
        }
    }

    /// Send a handshake reply, unless the session that produced it has
    /// since been removed or superseded.
    async fn reply(&self, endpoint: Endpoint, id: Option<SessionId>, bytes: &[u8]) {
        if let Some(id) = id {
            if !self.registry.is_live(endpoint, id) {
                tracing::debug!(peer = %endpoint, session = %id, "dropping stale handshake reply");
                return;
            }
        }
        if let Err(e) = self.socket.send_to(bytes, endpoint).await {
            tracing::warn!(peer = %endpoint, error = %e, "failed to send handshake reply");
        }
    }

    fn process_sealed(&self, endpoint: Endpoint, datagram: &[u8]) {
        let (id, decoded) = match self.registry.decode(endpoint, datagram) {
            Ok(r) => r,
            Err(TransportError::Codec(CodecError::AuthenticationFailed)) => {
                tracing::warn!(peer = %endpoint, "dropping unauthenticated datagram");
                return;
            }
            Err(TransportError::Codec(CodecError::ReplayOrOutOfOrder(nonce))) => {
                tracing::debug!(peer = %endpoint, nonce, "dropping replayed datagram");
                return;
            }
            Err(e) => {
                tracing::debug!(peer = %endpoint, error = %e, "dropping sealed datagram");
                return;
            }
        };
        let handle = SessionHandle { endpoint, id };

        match decoded.kind {
            PacketKind::Data => {
                tracing::trace!(peer = %endpoint, len = decoded.payload.len(), "data received");
                if let Some(handler) = self.handler() {
                    if let Err(e) = handler.on_message(&handle, Bytes::from(decoded.payload)) {
                        tracing::warn!(peer = %endpoint, error = %e, "session handler failed");
                    }
                }
            }
            PacketKind::Keepalive => tracing::trace!(peer = %endpoint, "keepalive received"),
            PacketKind::Close => {
                tracing::info!(peer = %endpoint, session = %id, "peer closed session");
                if let Some(removed) = self.registry.remove_session(endpoint, id) {
                    self.closed(removed, CloseReason::Peer);
                }
            }
            _ => {}
        }
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    pub(crate) async fn maintenance_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.settings.maintenance_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("maintenance loop shutting down");
                    return;
                }
                _ = tick.tick() => self.maintain(Instant::now()).await,
            }
        }
    }

    async fn maintain(&self, now: Instant) {
        self.waiters.retain(|_, parked| {
            parked.retain(|w| !w.is_closed());
            !parked.is_empty()
        });

        for removed in self
            .registry
            .expire_handshakes(now, self.settings.handshake_timeout())
        {
            tracing::info!(peer = %removed.endpoint, session = %removed.id, "handshake timed out");
            self.fail_waiters(removed.endpoint, || TransportError::HandshakeTimeout);
            self.closed(removed, CloseReason::HandshakeTimeout);
        }

        for (endpoint, id, bytes) in self
            .registry
            .due_retransmits(now, self.settings.retransmit_interval())
        {
            tracing::trace!(peer = %endpoint, session = %id, "retransmitting handshake message");
            if let Err(e) = self.socket.send_to(&bytes, endpoint).await {
                tracing::debug!(peer = %endpoint, error = %e, "retransmit failed");
            }
        }

        for (endpoint, id, packet) in self
            .registry
            .due_keepalives(now, self.settings.keepalive_interval())
        {
            tracing::trace!(peer = %endpoint, session = %id, "sending keepalive");
            if let Err(e) = self.socket.send_to(&packet, endpoint).await {
                tracing::debug!(peer = %endpoint, error = %e, "keepalive failed");
            }
        }

        for removed in self.registry.sweep_idle(self.settings.idle_timeout()) {
            tracing::info!(peer = %removed.endpoint, session = %removed.id, "idle session swept");
            self.closed(removed, CloseReason::Idle);
        }
    }

    // ── Caller operations ─────────────────────────────────────────────────────

    pub(crate) async fn open(&self, endpoint: Endpoint) -> Result<SessionHandle, TransportError> {
        if self.is_shut_down() {
            return Err(TransportError::Shutdown);
        }

        // Register before initiating so a fast completion is not missed.
        let rx = self.park(endpoint);

        match self.registry.initiate(endpoint) {
            Ok(Initiation::Started { session, msg1 }) => {
                tracing::info!(peer = %endpoint, session = %session, "opening session");
                if let Err(e) = self.socket.send_to(&msg1, endpoint).await {
                    tracing::warn!(peer = %endpoint, error = %e, "failed to send handshake init");
                    self.registry.remove_session(endpoint, session);
                    let (kind, text) = (e.kind(), e.to_string());
                    self.fail_waiters(endpoint, || {
                        TransportError::Socket(io::Error::new(kind, text.clone()))
                    });
                }
            }
            Ok(Initiation::InProgress(session)) => {
                tracing::debug!(peer = %endpoint, session = %session, "handshake already in progress");
            }
            Ok(Initiation::Established(id)) => {
                self.resolve_waiters(endpoint, SessionHandle { endpoint, id });
            }
            Err(e) => {
                self.fail_waiters(endpoint, || TransportError::HandshakeFailed(e.clone()));
            }
        }

        // The maintenance loop answers with HandshakeTimeout first; this
        // only guards against a stalled runtime.
        let backstop = self.settings.handshake_timeout() * 2 + self.settings.maintenance_interval();
        match tokio::time::timeout(backstop, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Shutdown),
            Err(_) => {
                self.prune_waiters(endpoint);
                Err(TransportError::HandshakeTimeout)
            }
        }
    }

    /// Queue a waiter for `endpoint`, dropping any left by callers that
    /// have gone away.
    fn park(&self, endpoint: Endpoint) -> oneshot::Receiver<Result<SessionHandle, TransportError>> {
        let (tx, rx) = oneshot::channel();
        let mut parked = self.waiters.entry(endpoint).or_default();
        parked.retain(|w| !w.is_closed());
        parked.push(tx);
        rx
    }

    fn prune_waiters(&self, endpoint: Endpoint) {
        self.waiters.remove_if_mut(&endpoint, |_, parked| {
            parked.retain(|w| !w.is_closed());
            parked.is_empty()
        });
    }

    pub(crate) async fn send(&self, handle: &SessionHandle, payload: &[u8]) -> Result<(), TransportError> {
        let packet = self.registry.encode(handle.endpoint, handle.id, payload)?;
        self.socket.send_to(&packet, handle.endpoint).await?;
        Ok(())
    }

    /// Send an authenticated Close, then remove the session.
    pub(crate) async fn close(&self, handle: &SessionHandle, reason: CloseReason) -> Result<(), TransportError> {
        let packet = self.registry.close_notice(handle.endpoint, handle.id)?;
        let sent = self.socket.send_to(&packet, handle.endpoint).await;
        if let Some(removed) = self.registry.remove_session(handle.endpoint, handle.id) {
            tracing::info!(peer = %handle.endpoint, session = %handle.id, "session closed");
            self.closed(removed, reason);
        }
        sent?;
        Ok(())
    }

    /// Close every established session and fail every waiter.
    pub(crate) async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for info in self.registry.snapshot() {
            let handle = SessionHandle {
                endpoint: info.endpoint,
                id: info.id,
            };
            if let Err(e) = self.close(&handle, CloseReason::Shutdown).await {
                tracing::debug!(peer = %info.endpoint, error = %e, "close at shutdown failed");
            }
        }
        for removed in self.registry.clear() {
            self.closed(removed, CloseReason::Shutdown);
        }
        let endpoints: Vec<Endpoint> = self.waiters.iter().map(|e| *e.key()).collect();
        for endpoint in endpoints {
            self.fail_waiters(endpoint, || TransportError::Shutdown);
        }
    }

    // ── Notifications ─────────────────────────────────────────────────────────

    fn resolve_waiters(&self, endpoint: Endpoint, handle: SessionHandle) {
        if let Some((_, waiters)) = self.waiters.remove(&endpoint) {
            for waiter in waiters {
                let _ = waiter.send(Ok(handle));
            }
        }
    }

    fn fail_waiters<F>(&self, endpoint: Endpoint, error: F)
    where
        F: Fn() -> TransportError,
    {
        if let Some((_, waiters)) = self.waiters.remove(&endpoint) {
            for waiter in waiters {
                let _ = waiter.send(Err(error()));
            }
        }
    }

    fn handshake_failed(&self, removed: RemovedSession, error: HandshakeError) {
        self.fail_waiters(removed.endpoint, || TransportError::HandshakeFailed(error.clone()));
        self.closed(removed, CloseReason::HandshakeFailed(error));
    }

    /// Tell the handler about a removed session it has seen, or one whose
    /// handshake timed out.
    fn closed(&self, removed: RemovedSession, reason: CloseReason) {
        if !removed.was_established && reason != CloseReason::HandshakeTimeout {
            return;
        }
        if let Some(handler) = self.handler() {
            let handle = SessionHandle {
                endpoint: removed.endpoint,
                id: removed.id,
            };
            handler.on_closed(&handle, reason);
        }
    }
}
