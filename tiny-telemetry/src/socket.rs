//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket`.  The server
//! side receives raw datagrams (decoding happens in the per-packet task so
//! malformed input can still be counted); the client side sends encoded
//! [`Packet`]s.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::error::Error;
use crate::packet::Packet;

/// Receive buffer size.  Longer datagrams are truncated by the transport.
pub const MAX_DATAGRAM: usize = 4096;

/// An async, datagram-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let inner = UdpSocket::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// Bind an ephemeral port of the same address family as `peer`.
    pub async fn bind_for(peer: SocketAddr) -> Result<Self, Error> {
        let any: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        Self::bind(any).await
    }

    /// Receive the next datagram, at most [`MAX_DATAGRAM`] bytes of it.
    pub async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, addr))
    }

    /// Encode `packet` and send it as a single UDP datagram to `dest`.
    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> io::Result<()> {
        self.send_raw(&packet.encode(), dest).await
    }

    /// Send pre-encoded bytes as one datagram.
    pub async fn send_raw(&self, bytes: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.inner.send_to(bytes, dest).await?;
        Ok(())
    }
}
