//! knock-session — the runtime half of Knock: the UDP socket, rendezvous
//! discovery, hole punching, the session registry and the transport
//! multiplexer that ties them together behind [`Node`].

pub mod error;
pub mod node;
pub mod registry;
pub mod rendezvous;
pub mod session;
pub mod socket;
mod transport;
pub mod trust;

/// A remote UDP address as seen by our socket.
pub type Endpoint = std::net::SocketAddr;

pub use error::TransportError;
pub use node::{CloseReason, Node, SessionHandle, SessionHandler};
pub use registry::SessionRegistry;
pub use rendezvous::{Reflector, RendezvousClient};
pub use session::{SessionId, SessionInfo};
pub use socket::LocalSocket;
pub use trust::{TrustLevel, TrustPolicy};
