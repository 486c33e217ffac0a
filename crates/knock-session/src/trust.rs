//! Trust policy — which static keys may complete a handshake.
//!
//! Two rules per key:
//! - Trusted: on the allowlist
//! - Blocked: always rejected
//!
//! With no Trusted rules the policy is open and any peer that proves a
//! static key is accepted (Blocked keys excepted). Once one key is trusted
//! the policy becomes an allowlist.
//!
//! The check runs when the remote static key becomes known: after message 2
//! on the initiator, after message 3 on the responder. A rejected key is a
//! handshake authentication failure.

use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    Trusted,
    Blocked,
}

/// Shared, cheaply cloneable trust rules keyed by static public key.
#[derive(Clone, Default)]
pub struct TrustPolicy {
    rules: Arc<DashMap<[u8; 32], TrustLevel>>,
}

impl TrustPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the hex keys in the config. Malformed entries are skipped.
    pub fn from_config(trusted_peers: &[String]) -> Self {
        let policy = Self::new();
        policy.apply_config(trusted_peers);
        policy
    }

    pub fn apply_config(&self, trusted_peers: &[String]) {
        for hex_key in trusted_peers {
            match hex::decode(hex_key).ok().and_then(|b| <[u8; 32]>::try_from(b).ok()) {
                Some(key) => {
                    self.rules.insert(key, TrustLevel::Trusted);
                    tracing::info!(
                        peer = &hex_key[..16.min(hex_key.len())],
                        "trusted peer from config"
                    );
                }
                None => {
                    tracing::warn!(entry = %hex_key, "ignoring malformed trusted peer key");
                }
            }
        }
    }

    pub fn trust(&self, public_key: [u8; 32]) {
        self.rules.insert(public_key, TrustLevel::Trusted);
        tracing::info!(peer = hex::encode(&public_key[..8]), "peer trusted");
    }

    pub fn block(&self, public_key: [u8; 32]) {
        self.rules.insert(public_key, TrustLevel::Blocked);
        tracing::info!(peer = hex::encode(&public_key[..8]), "peer blocked");
    }

    /// True when no allowlist is configured.
    pub fn is_open(&self) -> bool {
        !self
            .rules
            .iter()
            .any(|entry| *entry.value() == TrustLevel::Trusted)
    }

    pub fn allows(&self, public_key: &[u8; 32]) -> bool {
        match self.rules.get(public_key).map(|r| *r.value()) {
            Some(TrustLevel::Trusted) => true,
            Some(TrustLevel::Blocked) => false,
            None => self.is_open(),
        }
    }

    pub fn list(&self) -> Vec<([u8; 32], TrustLevel)> {
        self.rules
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }
}
