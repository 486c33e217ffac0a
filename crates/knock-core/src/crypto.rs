//! Cryptographic primitives for Knock.
//!
//! Provides:
//!   1. BLAKE3 hashing — channel ids and key fingerprints for logs
//!   2. X25519 static identity keypairs
//!   3. Directional ChaCha20-Poly1305 cipher states with explicit nonces
//!   4. The sliding replay window used by the datagram codec
//!
//! All key material derives ZeroizeOnDrop — wiped from memory when dropped.
//! There is no unsafe code in this module.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::wire::TXID_LEN;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Derive the channel id both peers agree on from the handshake transcript.
///
///   channel_id = BLAKE3("knock.channel" || transcript_hash)
///
/// Safe to log: it reveals nothing about the traffic keys.
pub fn derive_channel_id(transcript_hash: &[u8; 32]) -> [u8; 32] {
    let mut h = blake3::Hasher::new();
    h.update(b"knock.channel");
    h.update(transcript_hash);
    *h.finalize().as_bytes()
}

/// Generate a random rendezvous transaction id.
pub fn generate_txid() -> [u8; TXID_LEN] {
    let mut txid = [0u8; TXID_LEN];
    rand::thread_rng().fill_bytes(&mut txid);
    txid
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term static X25519 keypair.
///
/// Transmitted (encrypted) during the handshake so the peer can authenticate
/// us. The private key never leaves this struct except for persistence.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key — zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    /// Public key — the node's identity.
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// Borrow the private key for the Noise builder.
    pub(crate) fn private(&self) -> &[u8; 32] {
        &self.private
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

// ── Cipher state ──────────────────────────────────────────────────────────────

/// Symmetric key + nonce counter for ONE traffic direction.
///
/// The AEAD nonce follows the Noise ChaChaPoly convention: 32 bits of zero
/// followed by the 64-bit little-endian counter. The counter travels on the
/// wire so the receiver can decrypt reordered datagrams.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CipherState {
    key: [u8; 32],
    nonce: u64,
}

impl CipherState {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, nonce: 0 }
    }

    /// The nonce the next `seal` will use.
    pub fn next_nonce(&self) -> u64 {
        self.nonce
    }

    /// Encrypt under the next nonce. `aad` is a closure of the nonce so the
    /// caller can bind a header that carries it.
    ///
    /// Returns (nonce, ciphertext || 16-byte tag).
    pub fn seal<F>(&mut self, plaintext: &[u8], aad: F) -> Result<(u64, Vec<u8>), CryptoError>
    where
        F: FnOnce(u64) -> Vec<u8>,
    {
        // u64::MAX is reserved by Noise; never reuse a nonce.
        if self.nonce == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let nonce = self.nonce;
        let aad = aad(nonce);
        let ciphertext = self
            .cipher()
            .encrypt(
                &aead_nonce(nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Seal)?;
        self.nonce += 1;
        Ok((nonce, ciphertext))
    }

    /// Verify and decrypt a ciphertext produced under `nonce`.
    pub fn open(&self, nonce: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .decrypt(
                &aead_nonce(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// BLAKE3 fingerprint of the key. Lets tests and diagnostics compare
    /// keys across peers without exposing them.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut h = blake3::Hasher::new();
        h.update(b"knock.key-fingerprint");
        h.update(&self.key);
        *h.finalize().as_bytes()
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }
}

fn aead_nonce(counter: u64) -> Nonce {
    let mut n = [0u8; 12];
    n[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::clone_from_slice(&n)
}

// ── Replay Window ─────────────────────────────────────────────────────────────

/// Sliding-window replay protection (RFC 6479 style).
///
/// Tracks the highest seen nonce and a bitmap of the last 2048 nonces.
/// Rejects duplicates and nonces that fall behind the window.
pub const WINDOW_SIZE: u64 = 2048;

pub struct ReplayWindow {
    highest: u64,
    seen_any: bool,
    bitmap: Vec<u64>, // 2048 bits = 32 u64s
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            seen_any: false,
            bitmap: vec![0u64; (WINDOW_SIZE / 64) as usize],
        }
    }

    /// Returns true if the nonce is acceptable (not replayed, not too old).
    pub fn check(&self, nonce: u64) -> bool {
        if !self.seen_any || nonce > self.highest {
            return true;
        }
        let diff = self.highest - nonce;
        if diff >= WINDOW_SIZE {
            return false; // too old
        }
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] & (1u64 << bit) == 0
    }

    /// Mark a nonce as seen. Call only after successful authentication.
    pub fn mark(&mut self, nonce: u64) {
        if !self.seen_any {
            self.seen_any = true;
            self.highest = nonce;
        } else if nonce > self.highest {
            let shift = nonce - self.highest;
            self.shift_window(shift);
            self.highest = nonce;
        }
        let diff = self.highest - nonce;
        if diff >= WINDOW_SIZE {
            return;
        }
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] |= 1u64 << bit;
    }

    pub fn highest(&self) -> Option<u64> {
        self.seen_any.then_some(self.highest)
    }

    fn shift_window(&mut self, shift: u64) {
        if shift >= WINDOW_SIZE {
            self.bitmap.fill(0);
            return;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = (shift % 64) as u32;
        if word_shift > 0 {
            self.bitmap.rotate_right(word_shift);
            for w in &mut self.bitmap[..word_shift] {
                *w = 0;
            }
        }
        if bit_shift > 0 {
            let len = self.bitmap.len();
            for i in (1..len).rev() {
                self.bitmap[i] =
                    (self.bitmap[i] << bit_shift) | (self.bitmap[i - 1] >> (64 - bit_shift));
            }
            self.bitmap[0] <<= bit_shift;
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("authentication tag mismatch")]
    AuthenticationFailed,

    #[error("send nonce space exhausted, rekey required")]
    NonceExhausted,

    #[error("AEAD encryption failed")]
    Seal,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
