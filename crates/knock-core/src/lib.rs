//! knock-core — wire format, cryptographic primitives, the Noise handshake
//! engine and the sealed datagram codec. All other Knock crates depend on
//! this one.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod handshake;
pub mod wire;

pub use codec::{CodecError, Decoded, SecureChannel};
pub use config::KnockConfig;
pub use crypto::Keypair;
pub use handshake::{Handshake, HandshakeError, HandshakeStep, Phase, Role, SessionKeys};
pub use wire::{HandshakeMessage, PacketKind, WireError};
