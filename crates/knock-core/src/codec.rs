//! Secure datagram codec for established sessions.
//!
//! Wire format per sealed packet:
//!   [DataHeader (12)] [ciphertext (plaintext + 16-byte tag)]
//!
//! The header (kind, version, reserved, explicit nonce) is the AEAD
//! associated data, so every bit of the packet is authenticated. Inbound
//! nonces pass the replay window before the AEAD is tried; the window only
//! advances once the tag verifies, so a forged packet cannot burn a nonce.

use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};
use zeroize::Zeroize;

use crate::crypto::{derive_channel_id, CipherState, CryptoError, ReplayWindow};
use crate::handshake::SessionKeys;
use crate::wire::{DataHeader, PacketKind, DATA_HEADER_LEN, MAX_PLAINTEXT, TAG_LEN};

/// An authenticated, decrypted sealed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub kind: PacketKind,
    pub nonce: u64,
    pub payload: Vec<u8>,
}

/// Both directions of an established session plus its replay state.
pub struct SecureChannel {
    send: CipherState,
    recv: CipherState,
    window: ReplayWindow,
    transcript_hash: [u8; 32],
    remote_static: [u8; 32],
    channel_id: [u8; 32],
}

impl SecureChannel {
    pub fn from_keys(keys: SessionKeys) -> Self {
        let SessionKeys {
            send,
            recv,
            transcript_hash,
            remote_static,
        } = keys;
        Self {
            send,
            recv,
            window: ReplayWindow::new(),
            channel_id: derive_channel_id(&transcript_hash),
            transcript_hash,
            remote_static,
        }
    }

    pub fn transcript_hash(&self) -> &[u8; 32] {
        &self.transcript_hash
    }

    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    /// Identical on both sides; safe to log.
    pub fn channel_id(&self) -> &[u8; 32] {
        &self.channel_id
    }

    /// Seal an application payload into a Data packet.
    pub fn encode(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.seal(PacketKind::Data, plaintext)
    }

    /// An empty Keepalive packet.
    pub fn keepalive(&mut self) -> Result<Vec<u8>, CodecError> {
        self.seal(PacketKind::Keepalive, &[])
    }

    /// An empty Close packet.
    pub fn close_notice(&mut self) -> Result<Vec<u8>, CodecError> {
        self.seal(PacketKind::Close, &[])
    }

    fn seal(&mut self, kind: PacketKind, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(CodecError::PayloadTooLarge(plaintext.len()));
        }
        let (nonce, ciphertext) = self
            .send
            .seal(plaintext, |n| DataHeader::new(kind, n).as_bytes().to_vec())?;

        let mut packet = Vec::with_capacity(DATA_HEADER_LEN + ciphertext.len());
        packet.extend_from_slice(DataHeader::new(kind, nonce).as_bytes());
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// Verify, replay-check and decrypt one sealed packet.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Decoded, CodecError> {
        if packet.len() < DATA_HEADER_LEN + TAG_LEN {
            return Err(CodecError::Truncated(packet.len()));
        }
        let (head, ciphertext) = packet.split_at(DATA_HEADER_LEN);
        let header = DataHeader::read_from(head).ok_or(CodecError::Truncated(packet.len()))?;

        // Any header corruption (kind, version, reserved) must fail the same
        // way a corrupted tag does.
        let kind = match PacketKind::try_from(header.header.kind) {
            Ok(kind) if kind.is_sealed() => kind,
            _ => return Err(CodecError::AuthenticationFailed),
        };

        let nonce = header.nonce();
        if !self.window.check(nonce) {
            return Err(CodecError::ReplayOrOutOfOrder(nonce));
        }
        let payload = self.recv.open(nonce, head, ciphertext)?;
        self.window.mark(nonce);

        Ok(Decoded {
            kind,
            nonce,
            payload,
        })
    }

    /// Wipe both keys now rather than waiting for drop.
    pub fn clear(&mut self) {
        self.send.zeroize();
        self.recv.zeroize();
        self.transcript_hash.zeroize();
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("channel_id", &hex::encode(&self.channel_id[..8]))
            .field("send_nonce", &self.send.next_nonce())
            .field("recv_highest", &self.window.highest())
            .finish_non_exhaustive()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("session not established")]
    SessionNotEstablished,

    #[error("packet failed authentication")]
    AuthenticationFailed,

    #[error("nonce {0} replayed or outside the window")]
    ReplayOrOutOfOrder(u64),

    #[error("sealed packet too short ({0} bytes)")]
    Truncated(usize),

    #[error("send nonce space exhausted")]
    NonceExhausted,

    #[error("payload of {0} bytes does not fit in one datagram")]
    PayloadTooLarge(usize),
}

impl From<CryptoError> for CodecError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::NonceExhausted => CodecError::NonceExhausted,
            CryptoError::AuthenticationFailed | CryptoError::Seal => {
                CodecError::AuthenticationFailed
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
