//! knockd — Knock secure-session daemon.
//!
//! `knockd` runs a node: it binds the configured port, optionally learns its
//! public mapping from a rendezvous service, opens sessions to the configured
//! peers and forwards stdin lines to every established session.
//!
//! `knockd rendezvous [port]` runs a reflector that answers probes with the
//! observed source address.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use knock_core::KnockConfig;
use knock_session::{CloseReason, LocalSocket, Node, Reflector, SessionHandle, SessionHandler};

mod identity;

const DEFAULT_RENDEZVOUS_PORT: u16 = 3478;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = KnockConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = KnockConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        KnockConfig::default()
    });

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("rendezvous") {
        let port = match args.next() {
            Some(p) => p.parse().context("invalid rendezvous port")?,
            None => DEFAULT_RENDEZVOUS_PORT,
        };
        return run_reflector(&config, port, shutdown_tx).await;
    }

    run_node(config, shutdown_tx).await
}

async fn run_reflector(config: &KnockConfig, port: u16, shutdown: broadcast::Sender<()>) -> Result<()> {
    let addr = SocketAddr::new(config.network.bind_addr, port);
    let socket = Arc::new(LocalSocket::bind(addr).context("failed to bind rendezvous socket")?);
    Reflector::new(socket, shutdown.subscribe()).run().await?;
    Ok(())
}

async fn run_node(config: KnockConfig, shutdown: broadcast::Sender<()>) -> Result<()> {
    let keypair = identity::load_or_generate(&config.identity.keypair_path)?;
    tracing::info!(public_key = hex::encode(keypair.public), "keypair ready");

    let node = Arc::new(
        Node::bind(&config, keypair)
            .await
            .context("failed to bind node")?,
    );
    node.listen(Arc::new(LogHandler))?;

    if let Some(server) = &config.rendezvous.server {
        let (host, port) = split_host_port(server, DEFAULT_RENDEZVOUS_PORT);
        match node.discover_public_endpoint(host, port).await {
            Ok(public) => tracing::info!(%public, "share this endpoint with peers"),
            Err(e) => tracing::warn!(error = %e, "continuing without a public endpoint"),
        }
    }

    for peer in &config.peers.connect {
        let endpoint: SocketAddr = match peer.parse() {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(peer, error = %e, "skipping invalid peer address");
                continue;
            }
        };
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = node.open_session(endpoint).await {
                tracing::warn!(peer = %endpoint, error = %e, "failed to open session");
            }
        });
    }

    let stdin_task = tokio::spawn(forward_stdin(node.clone()));

    let mut shutdown_rx = shutdown.subscribe();
    let _ = shutdown_rx.recv().await;

    stdin_task.abort();
    node.shutdown().await;
    tracing::info!("knockd stopped");
    Ok(())
}

/// Send every stdin line to every established session.
async fn forward_stdin(node: Arc<Node>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                return;
            }
        };
        if line.is_empty() {
            continue;
        }
        for info in node.sessions() {
            let Some(session) = node.session(info.endpoint) else {
                continue;
            };
            if let Err(e) = node.send(&session, line.as_bytes()).await {
                tracing::warn!(peer = %info.endpoint, error = %e, "send failed");
            }
        }
    }
}

fn split_host_port(server: &str, default_port: u16) -> (&str, u16) {
    match server.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(':') => match port.parse() {
            Ok(port) => (host.trim_start_matches('[').trim_end_matches(']'), port),
            Err(_) => (server, default_port),
        },
        _ => (server, default_port),
    }
}

struct LogHandler;

impl SessionHandler for LogHandler {
    fn on_established(&self, session: &SessionHandle, remote_static: &[u8; 32]) {
        tracing::info!(%session, peer_key = hex::encode(remote_static), "peer connected");
    }

    fn on_message(&self, session: &SessionHandle, payload: Bytes) -> Result<()> {
        match std::str::from_utf8(&payload) {
            Ok(text) => tracing::info!(%session, text, "message"),
            Err(_) => tracing::info!(%session, len = payload.len(), "binary message"),
        }
        Ok(())
    }

    fn on_closed(&self, session: &SessionHandle, reason: CloseReason) {
        tracing::info!(%session, ?reason, "session closed");
    }
}
