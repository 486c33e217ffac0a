//! Rendezvous — learning the public (NAT-mapped) address of our socket.
//!
//! The client sends a probe carrying a random transaction id and waits for
//! the service to echo back the source address it observed. Replies arrive
//! on the shared socket, so the transport's receive loop routes them here
//! through `on_reply`; discovery itself only awaits a oneshot.
//!
//! The service is trusted for address observation only. Nothing it says is
//! used for authentication.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use zerocopy::AsBytes;

use knock_core::config::RendezvousConfig;
use knock_core::crypto::generate_txid;
use knock_core::wire::{RendezvousProbe, RendezvousReply, MAX_DATAGRAM, TXID_LEN};

use crate::error::TransportError;
use crate::socket::LocalSocket;
use crate::Endpoint;

struct PendingProbe {
    server: Endpoint,
    reply: oneshot::Sender<Endpoint>,
}

pub struct RendezvousClient {
    pending: DashMap<[u8; TXID_LEN], PendingProbe>,
    attempts: u32,
    timeout: Duration,
    max_timeout: Duration,
}

impl RendezvousClient {
    pub fn new(config: &RendezvousConfig) -> Self {
        Self {
            pending: DashMap::new(),
            attempts: config.attempts.max(1),
            timeout: config.timeout(),
            max_timeout: config.max_timeout(),
        }
    }

    /// Probe `server` until it answers or the attempts run out.
    ///
    /// One transaction id covers every attempt, so a slow answer to an
    /// earlier probe still counts. The wait doubles per attempt up to
    /// `max_timeout`. A failed send counts as a failed attempt.
    pub async fn discover(
        &self,
        socket: &LocalSocket,
        server: Endpoint,
    ) -> Result<Endpoint, TransportError> {
        let txid = generate_txid();
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(txid, PendingProbe { server, reply: tx });
        let probe = RendezvousProbe::new(txid);

        let mut wait = self.timeout;
        let mut observed = None;
        for attempt in 1..=self.attempts {
            match socket.send_to(probe.as_bytes(), server).await {
                Ok(_) => {
                    tracing::debug!(%server, attempt, "rendezvous probe sent");
                    if let Ok(Ok(endpoint)) = tokio::time::timeout(wait, &mut rx).await {
                        observed = Some(endpoint);
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(%server, attempt, error = %e, "rendezvous probe send failed");
                    tokio::time::sleep(wait).await;
                }
            }
            wait = (wait * 2).min(self.max_timeout);
        }
        self.pending.remove(&txid);

        match observed {
            Some(endpoint) => {
                socket.set_public_endpoint(endpoint);
                tracing::info!(%server, public = %endpoint, "public endpoint discovered");
                Ok(endpoint)
            }
            None => {
                tracing::warn!(%server, attempts = self.attempts, "rendezvous unreachable");
                Err(TransportError::RendezvousUnreachable {
                    attempts: self.attempts,
                })
            }
        }
    }

    /// Hand a reply datagram to the discovery waiting for it. Replies from
    /// anyone but the probed server, or with an unknown transaction id, are
    /// dropped. Returns true if a discovery was resolved.
    pub fn on_reply(&self, datagram: &[u8], from: Endpoint) -> bool {
        let reply = match RendezvousReply::decode(datagram) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(%from, error = %e, "malformed rendezvous reply");
                return false;
            }
        };
        let Some(txid) = reply.txid_bytes() else {
            tracing::debug!(%from, "rendezvous reply with bad transaction id");
            return false;
        };
        match self.pending.remove_if(&txid, |_, pending| pending.server == from) {
            Some((_, pending)) => pending.reply.send(reply.endpoint()).is_ok(),
            None => {
                tracing::warn!(%from, "unsolicited rendezvous reply");
                false
            }
        }
    }
}

/// Resolve `host:port` to an endpoint of the same family as `local`.
pub async fn resolve(host: &str, port: u16, local: Endpoint) -> Result<Endpoint, TransportError> {
    let mut candidates = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::Resolve(format!("{host}:{port}: {e}")))?;
    candidates
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| TransportError::Resolve(format!("{host}:{port}: no usable address")))
}

// ── Reflector ─────────────────────────────────────────────────────────────────

/// A minimal rendezvous service: answers every probe with the address the
/// probe came from.
pub struct Reflector {
    socket: Arc<LocalSocket>,
    shutdown: broadcast::Receiver<()>,
}

impl Reflector {
    pub fn new(socket: Arc<LocalSocket>, shutdown: broadcast::Receiver<()>) -> Self {
        Self { socket, shutdown }
    }

    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tracing::info!(local = %self.socket.local_addr(), "rendezvous reflector listening");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("rendezvous reflector shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    let probe = match RendezvousProbe::decode(&buf[..len]) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::trace!(%from, error = %e, "ignoring non-probe datagram");
                            continue;
                        }
                    };
                    let reply = match RendezvousReply::observed(&probe.txid, from).encode() {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to encode rendezvous reply");
                            continue;
                        }
                    };
                    match self.socket.send_to(&reply, from).await {
                        Ok(_) => tracing::debug!(%from, "reflected observed address"),
                        Err(e) => tracing::warn!(%from, error = %e, "failed to send rendezvous reply"),
                    }
                }
            }
        }
    }
}
