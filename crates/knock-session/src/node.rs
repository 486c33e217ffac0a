//! Caller-facing API: a bound node that opens, serves and closes sessions.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use knock_core::{HandshakeError, KnockConfig, Keypair, Phase};

use crate::error::TransportError;
use crate::registry::SessionRegistry;
use crate::rendezvous::{self, RendezvousClient};
use crate::session::{SessionId, SessionInfo};
use crate::socket::LocalSocket;
use crate::transport::Transport;
use crate::trust::TrustPolicy;
use crate::Endpoint;

/// Names one session. Stays valid only while that exact session is the
/// current one for its endpoint; afterwards operations fail with
/// `UnknownSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub endpoint: Endpoint,
    pub id: SessionId,
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.endpoint, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `Node::close` on this side.
    Local,
    /// The peer sent an authenticated Close.
    Peer,
    Idle,
    HandshakeTimeout,
    HandshakeFailed(HandshakeError),
    /// The peer started a new handshake from the same endpoint.
    Superseded,
    Shutdown,
}

/// Receives session events. Called from the endpoint's lane, so calls for
/// one endpoint never overlap; keep them short.
pub trait SessionHandler: Send + Sync {
    fn on_established(&self, session: &SessionHandle, remote_static: &[u8; 32]);

    /// One decrypted application payload.
    fn on_message(&self, session: &SessionHandle, payload: Bytes) -> anyhow::Result<()>;

    fn on_closed(&self, session: &SessionHandle, reason: CloseReason) {
        let _ = (session, reason);
    }
}

pub struct Node {
    transport: Arc<Transport>,
    public_key: [u8; 32],
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind the socket and start the receive and maintenance loops.
    pub async fn bind(config: &KnockConfig, keypair: Keypair) -> Result<Self, TransportError> {
        let addr = SocketAddr::new(config.network.bind_addr, config.network.port);
        let socket = Arc::new(LocalSocket::bind(addr)?);

        let public_key = keypair.public;
        let trust = TrustPolicy::from_config(&config.trust.trusted_peers);
        if !trust.is_open() {
            tracing::info!(peers = trust.list().len(), "trust allowlist active");
        }
        let registry = SessionRegistry::new(Arc::new(keypair), trust, config.network.accept_inbound);

        let transport = Arc::new(Transport::new(
            socket,
            registry,
            RendezvousClient::new(&config.rendezvous),
            config.session.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let tasks = vec![
            tokio::spawn(transport.clone().receive_loop(shutdown_tx.subscribe())),
            tokio::spawn(transport.clone().maintenance_loop(shutdown_tx.subscribe())),
        ];

        tracing::info!(
            local = %transport.socket.local_addr(),
            public_key = hex::encode(&public_key[..8]),
            accept_inbound = config.network.accept_inbound,
            "node ready"
        );

        Ok(Self {
            transport,
            public_key,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> Endpoint {
        self.transport.socket.local_addr()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// The mapping learned by the last successful discovery.
    pub fn public_endpoint(&self) -> Option<Endpoint> {
        self.transport.socket.public_endpoint()
    }

    /// Ask the rendezvous service at `host:port` for our public mapping.
    /// Established sessions keep running while this waits.
    pub async fn discover_public_endpoint(&self, host: &str, port: u16) -> Result<Endpoint, TransportError> {
        let server = rendezvous::resolve(host, port, self.local_addr()).await?;
        self.transport
            .rendezvous
            .discover(&self.transport.socket, server)
            .await
    }

    /// Handshake with `endpoint` and wait until the session is established.
    /// If a handshake with it is already under way, waits for that one.
    pub async fn open_session(&self, endpoint: Endpoint) -> Result<SessionHandle, TransportError> {
        self.transport.open(endpoint).await
    }

    /// Install the event handler. Only one per node.
    pub fn listen(&self, handler: Arc<dyn SessionHandler>) -> Result<(), TransportError> {
        self.transport.set_handler(handler)
    }

    pub async fn send(&self, session: &SessionHandle, payload: &[u8]) -> Result<(), TransportError> {
        if self.transport.is_shut_down() {
            return Err(TransportError::Shutdown);
        }
        self.transport.send(session, payload).await
    }

    pub async fn close(&self, session: &SessionHandle) -> Result<(), TransportError> {
        self.transport.close(session, CloseReason::Local).await
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.transport.registry.snapshot()
    }

    /// The established session for `endpoint`, if there is one.
    pub fn session(&self, endpoint: Endpoint) -> Option<SessionHandle> {
        self.transport
            .registry
            .info(endpoint)
            .filter(|info| info.phase == Phase::Established)
            .map(|info| SessionHandle {
                endpoint,
                id: info.id,
            })
    }

    /// Close every session and stop the background tasks.
    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
        let _ = self.shutdown_tx.send(());

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("node shut down");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.transport.halt();
        let _ = self.shutdown_tx.send(());
    }
}
