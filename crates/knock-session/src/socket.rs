//! The one UDP socket a node owns, plus its discovered public mapping.

use std::io;
use std::sync::{PoisonError, RwLock};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::Endpoint;

/// Socket receive buffer we ask the kernel for. Best effort.
const RECV_BUFFER_BYTES: usize = 1 << 20;

pub struct LocalSocket {
    socket: UdpSocket,
    local: Endpoint,
    public: RwLock<Option<Endpoint>>,
}

impl LocalSocket {
    /// Bind a non-blocking UDP socket. Must be called inside a tokio runtime.
    pub fn bind(addr: Endpoint) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
            tracing::debug!(error = %e, "SO_RCVBUF not applied");
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        let local = socket.local_addr()?;
        tracing::info!(%local, "socket bound");

        Ok(Self {
            socket,
            local,
            public: RwLock::new(None),
        })
    }

    pub fn local_addr(&self) -> Endpoint {
        self.local
    }

    /// The mapping the rendezvous service last observed, if any.
    pub fn public_endpoint(&self) -> Option<Endpoint> {
        *self.public.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_public_endpoint(&self, endpoint: Endpoint) {
        *self.public.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint);
    }

    pub async fn send_to(&self, datagram: &[u8], to: Endpoint) -> io::Result<usize> {
        self.socket.send_to(datagram, to).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.socket.recv_from(buf).await
    }
}
