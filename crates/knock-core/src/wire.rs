//! Knock wire format — on-wire types for every datagram on the shared socket.
//!
//! These types ARE the protocol. Every field, every size, every reserved byte
//! is part of the wire format; changing one is a version bump.
//!
//! Every datagram starts with the same 4-byte header:
//!
//!   [kind u8] [version u8] [reserved u8; 2]
//!
//! Fixed-size types are #[repr(C, packed)] with zerocopy derives, so parsing
//! is a length check plus a copy. There is no unsafe code in this module.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current wire format version.
/// A receiver seeing an unknown version silently drops the datagram.
pub const WIRE_VERSION: u8 = 0x01;

/// Common header length (kind, version, reserved).
pub const HEADER_LEN: usize = 4;

/// Data header length: common header plus the explicit 8-byte nonce.
pub const DATA_HEADER_LEN: usize = 12;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// Noise_XX message sizes for 25519_ChaChaPoly_BLAKE2s with empty payloads.
pub const NOISE_MSG1_LEN: usize = 32;
pub const NOISE_MSG2_LEN: usize = 96;
pub const NOISE_MSG3_LEN: usize = 64;

/// Rendezvous transaction id length (same size as a STUN transaction id).
pub const TXID_LEN: usize = 12;

/// Largest UDP payload we will ever send or accept.
pub const MAX_DATAGRAM: usize = 65507;

/// Largest plaintext that fits in one Data packet.
pub const MAX_PLAINTEXT: usize = MAX_DATAGRAM - DATA_HEADER_LEN - TAG_LEN;

// ── Packet kinds ──────────────────────────────────────────────────────────────

/// First byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Noise_XX message 1: `-> e`.
    HandshakeInit = 0x01,
    /// Noise_XX message 2: `<- e, ee, s, es`.
    HandshakeResponse = 0x02,
    /// Noise_XX message 3: `-> s, se`.
    HandshakeComplete = 0x03,
    /// Encrypted application payload.
    Data = 0x10,
    /// Encrypted empty payload that keeps the NAT mapping alive.
    Keepalive = 0x11,
    /// Encrypted empty payload announcing teardown.
    Close = 0x12,
    /// Address discovery probe to the rendezvous service.
    RendezvousProbe = 0x40,
    /// Observed address reply from the rendezvous service.
    RendezvousReply = 0x41,
}

impl PacketKind {
    /// Read and validate the common header of a datagram.
    pub fn of(datagram: &[u8]) -> Result<Self, WireError> {
        if datagram.len() < HEADER_LEN {
            return Err(WireError::Truncated(datagram.len()));
        }
        if datagram[1] != WIRE_VERSION {
            return Err(WireError::UnknownVersion(datagram[1]));
        }
        PacketKind::try_from(datagram[0])
    }

    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketKind::HandshakeInit | PacketKind::HandshakeResponse | PacketKind::HandshakeComplete
        )
    }

    /// Kinds carried inside an established session's cipher.
    pub fn is_sealed(self) -> bool {
        matches!(self, PacketKind::Data | PacketKind::Keepalive | PacketKind::Close)
    }

    pub fn is_rendezvous(self) -> bool {
        matches!(self, PacketKind::RendezvousProbe | PacketKind::RendezvousReply)
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketKind::HandshakeInit),
            0x02 => Ok(PacketKind::HandshakeResponse),
            0x03 => Ok(PacketKind::HandshakeComplete),
            0x10 => Ok(PacketKind::Data),
            0x11 => Ok(PacketKind::Keepalive),
            0x12 => Ok(PacketKind::Close),
            0x40 => Ok(PacketKind::RendezvousProbe),
            0x41 => Ok(PacketKind::RendezvousReply),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<PacketKind> for u8 {
    fn from(k: PacketKind) -> u8 {
        k as u8
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Common 4-byte datagram header.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    pub kind: u8,
    pub version: u8,
    /// Must be zero on send. Covered by the AEAD on sealed packets.
    pub reserved: [u8; 2],
}

assert_eq_size!(PacketHeader, [u8; 4]);

impl PacketHeader {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind: kind.into(),
            version: WIRE_VERSION,
            reserved: [0u8; 2],
        }
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Noise_XX handshake message 1 — sent by the initiator.
/// Wire size: 36 bytes (4 header + 32 ephemeral key).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HandshakeInit {
    pub header: PacketHeader,
    /// Raw Noise_XX message 1 bytes — the initiator's ephemeral public key.
    pub noise_msg: [u8; NOISE_MSG1_LEN],
}

assert_eq_size!(HandshakeInit, [u8; 36]);

/// Noise_XX handshake message 2 — sent by the responder after reading message 1.
/// Wire size: 100 bytes (4 header + 96 noise message).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HandshakeResponse {
    pub header: PacketHeader,
    /// Ephemeral key, encrypted static key + tag, empty payload tag.
    pub noise_msg: [u8; NOISE_MSG2_LEN],
}

assert_eq_size!(HandshakeResponse, [u8; 100]);

/// Noise_XX handshake message 3 — sent by the initiator after reading message 2.
/// Wire size: 68 bytes (4 header + 64 noise message).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HandshakeComplete {
    pub header: PacketHeader,
    /// Encrypted static key + tag, empty payload tag.
    pub noise_msg: [u8; NOISE_MSG3_LEN],
}

assert_eq_size!(HandshakeComplete, [u8; 68]);

/// One of the three handshake messages, parsed from a datagram.
///
/// Kind and length are both checked: no two messages are interchangeable.
#[derive(Debug, Clone, Copy)]
pub enum HandshakeMessage {
    Init(HandshakeInit),
    Response(HandshakeResponse),
    Complete(HandshakeComplete),
}

impl HandshakeMessage {
    /// Parse a handshake datagram. The length must match the kind exactly.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let kind = PacketKind::of(datagram)?;
        let bad_length = |expected: usize| WireError::BadLength {
            kind,
            expected,
            got: datagram.len(),
        };
        match kind {
            PacketKind::HandshakeInit => HandshakeInit::read_from(datagram)
                .map(Self::Init)
                .ok_or_else(|| bad_length(std::mem::size_of::<HandshakeInit>())),
            PacketKind::HandshakeResponse => HandshakeResponse::read_from(datagram)
                .map(Self::Response)
                .ok_or_else(|| bad_length(std::mem::size_of::<HandshakeResponse>())),
            PacketKind::HandshakeComplete => HandshakeComplete::read_from(datagram)
                .map(Self::Complete)
                .ok_or_else(|| bad_length(std::mem::size_of::<HandshakeComplete>())),
            other => Err(WireError::UnexpectedKind(other)),
        }
    }

    /// Wrap raw Noise bytes for handshake message `number` (1, 2 or 3).
    pub fn from_noise(number: u8, noise_msg: &[u8]) -> Result<Self, WireError> {
        match number {
            1 => Ok(Self::Init(HandshakeInit {
                header: PacketHeader::new(PacketKind::HandshakeInit),
                noise_msg: noise_msg.try_into().map_err(|_| WireError::BadLength {
                    kind: PacketKind::HandshakeInit,
                    expected: NOISE_MSG1_LEN,
                    got: noise_msg.len(),
                })?,
            })),
            2 => Ok(Self::Response(HandshakeResponse {
                header: PacketHeader::new(PacketKind::HandshakeResponse),
                noise_msg: noise_msg.try_into().map_err(|_| WireError::BadLength {
                    kind: PacketKind::HandshakeResponse,
                    expected: NOISE_MSG2_LEN,
                    got: noise_msg.len(),
                })?,
            })),
            3 => Ok(Self::Complete(HandshakeComplete {
                header: PacketHeader::new(PacketKind::HandshakeComplete),
                noise_msg: noise_msg.try_into().map_err(|_| WireError::BadLength {
                    kind: PacketKind::HandshakeComplete,
                    expected: NOISE_MSG3_LEN,
                    got: noise_msg.len(),
                })?,
            })),
            other => Err(WireError::UnknownKind(other)),
        }
    }

    /// Position in the handshake sequence: 1, 2 or 3.
    pub fn number(&self) -> u8 {
        match self {
            Self::Init(_) => 1,
            Self::Response(_) => 2,
            Self::Complete(_) => 3,
        }
    }

    /// The raw Noise message carried by this packet.
    pub fn noise_msg(&self) -> &[u8] {
        match self {
            Self::Init(m) => &m.noise_msg,
            Self::Response(m) => &m.noise_msg,
            Self::Complete(m) => &m.noise_msg,
        }
    }

    /// Full datagram bytes, header included.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Init(m) => m.as_bytes(),
            Self::Response(m) => m.as_bytes(),
            Self::Complete(m) => m.as_bytes(),
        }
    }
}

// ── Sealed packets ────────────────────────────────────────────────────────────

/// Header of Data, Keepalive and Close packets.
///
/// Wire format per packet:
///   [header (4)] [u64 nonce LE (8)] [ciphertext (payload + 16-byte MAC)]
///
/// The whole 12-byte header is the AEAD associated data.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DataHeader {
    pub header: PacketHeader,
    pub nonce: [u8; 8],
}

assert_eq_size!(DataHeader, [u8; DATA_HEADER_LEN]);

impl DataHeader {
    pub fn new(kind: PacketKind, nonce: u64) -> Self {
        Self {
            header: PacketHeader::new(kind),
            nonce: nonce.to_le_bytes(),
        }
    }

    pub fn nonce(&self) -> u64 {
        u64::from_le_bytes(self.nonce)
    }
}

// ── Rendezvous ────────────────────────────────────────────────────────────────

/// Address discovery probe.
/// Wire size: 16 bytes (4 header + 12 transaction id).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RendezvousProbe {
    pub header: PacketHeader,
    pub txid: [u8; TXID_LEN],
}

assert_eq_size!(RendezvousProbe, [u8; 16]);

impl RendezvousProbe {
    pub fn new(txid: [u8; TXID_LEN]) -> Self {
        Self {
            header: PacketHeader::new(PacketKind::RendezvousProbe),
            txid,
        }
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        match PacketKind::of(datagram)? {
            PacketKind::RendezvousProbe => {
                Self::read_from(datagram).ok_or(WireError::BadLength {
                    kind: PacketKind::RendezvousProbe,
                    expected: std::mem::size_of::<Self>(),
                    got: datagram.len(),
                })
            }
            other => Err(WireError::UnexpectedKind(other)),
        }
    }
}

/// Body of a rendezvous reply: the source address the service observed.
///
/// Encoded as header + JSON, e.g.
/// `{"txid":"00112233445566778899aabb","address":"203.0.113.5","port":50000}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousReply {
    /// Hex transaction id copied from the probe.
    pub txid: String,
    pub address: IpAddr,
    pub port: u16,
}

impl RendezvousReply {
    pub fn observed(txid: &[u8; TXID_LEN], from: SocketAddr) -> Self {
        Self {
            txid: hex::encode(txid),
            address: from.ip(),
            port: from.port(),
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// The transaction id, if it is well-formed hex of the right length.
    pub fn txid_bytes(&self) -> Option<[u8; TXID_LEN]> {
        hex::decode(&self.txid).ok()?.try_into().ok()
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body =
            serde_json::to_vec(self).map_err(|e| WireError::MalformedReply(e.to_string()))?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(PacketHeader::new(PacketKind::RendezvousReply).as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        match PacketKind::of(datagram)? {
            PacketKind::RendezvousReply => serde_json::from_slice(&datagram[HEADER_LEN..])
                .map_err(|e| WireError::MalformedReply(e.to_string())),
            other => Err(WireError::UnexpectedKind(other)),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short for a header ({0} bytes)")]
    Truncated(usize),

    #[error("unknown packet kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("{kind:?} must be {expected} bytes, got {got}")]
    BadLength {
        kind: PacketKind,
        expected: usize,
        got: usize,
    },

    #[error("unexpected packet kind {0:?} here")]
    UnexpectedKind(PacketKind),

    #[error("malformed rendezvous reply: {0}")]
    MalformedReply(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
