//! Configuration system for Knock.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $KNOCK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/knock/config.toml
//!   3. ~/.config/knock/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnockConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub rendezvous: RendezvousConfig,
    pub session: SessionConfig,
    pub trust: TrustConfig,
    pub peers: PeersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the hex X25519 static key. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_addr: IpAddr,
    /// UDP port for every datagram. 0 = OS-assigned.
    pub port: u16,
    /// Accept handshakes from endpoints we never contacted.
    pub accept_inbound: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// `host:port` of the address discovery service. None = skip discovery.
    pub server: Option<String>,
    /// Wait for the first attempt. Doubles per attempt.
    pub timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub handshake_timeout_secs: u64,
    /// Resend interval for the last handshake message.
    pub retransmit_ms: u64,
    pub keepalive_secs: u64,
    pub idle_timeout_secs: u64,
    /// Maintenance tick.
    pub maintenance_ms: u64,
    /// Queued datagrams per endpoint before new ones are dropped.
    pub lane_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Peer static public keys (hex) allowed to complete a handshake.
    /// Empty = any peer.
    pub trusted_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Endpoints (`addr:port`) to open sessions to at startup.
    pub connect: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for KnockConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            rendezvous: RendezvousConfig::default(),
            session: SessionConfig::default(),
            trust: TrustConfig::default(),
            peers: PeersConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 50000,
            accept_inbound: true,
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            server: None,
            timeout_ms: 500,
            max_timeout_ms: 4000,
            attempts: 5,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 5,
            retransmit_ms: 500,
            keepalive_secs: 15,
            idle_timeout_secs: 60,
            maintenance_ms: 250,
            lane_capacity: 64,
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            trusted_peers: Vec::new(),
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            connect: Vec::new(),
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

impl RendezvousConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms.max(self.timeout_ms))
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_ms.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("knock")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl KnockConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            KnockConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("KNOCK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&KnockConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply KNOCK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = var("KNOCK_IDENTITY__KEYPAIR_PATH") {
            self.identity.keypair_path = PathBuf::from(v);
        }
        if let Some(addr) = var("KNOCK_NETWORK__BIND_ADDR").and_then(|v| v.parse().ok()) {
            self.network.bind_addr = addr;
        }
        if let Some(port) = var("KNOCK_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = port;
        }
        if let Some(v) = var("KNOCK_NETWORK__ACCEPT_INBOUND") {
            self.network.accept_inbound = flag(v);
        }
        if let Some(v) = var("KNOCK_RENDEZVOUS__SERVER") {
            self.rendezvous.server = (!v.is_empty()).then_some(v);
        }
        if let Some(secs) = var("KNOCK_SESSION__IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.session.idle_timeout_secs = secs;
        }
        if let Some(secs) = var("KNOCK_SESSION__KEEPALIVE_SECS").and_then(|v| v.parse().ok()) {
            self.session.keepalive_secs = secs;
        }
        if let Some(v) = var("KNOCK_TRUST__TRUSTED_PEERS") {
            self.trust.trusted_peers = split_list(&v);
        }
        if let Some(v) = var("KNOCK_PEERS__CONNECT") {
            self.peers.connect = split_list(&v);
        }
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
