use knock_core::{CodecError, HandshakeError};
use thiserror::Error;

/// Errors surfaced by the session layer to callers of `Node`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rendezvous service unreachable after {attempts} attempts")]
    RendezvousUnreachable { attempts: u32 },

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake failed: {0}")]
    HandshakeFailed(#[from] HandshakeError),

    #[error("no such session")]
    UnknownSession,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("a session handler is already installed")]
    AlreadyListening,

    #[error("node is shut down")]
    Shutdown,
}
