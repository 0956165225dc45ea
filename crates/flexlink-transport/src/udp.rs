//! UDP transport for VITA-49 streaming and discovery.
//!
//! [`UdpTransport`] wraps a [`tokio::net::UdpSocket`] with error mapping
//! consistent with the rest of the transport layer. Two binding modes
//! exist:
//!
//! - [`bind`](UdpTransport::bind) -- a plain exclusive bind, used for the
//!   DAX TX send socket and for tests.
//! - [`bind_reuse`](UdpTransport::bind_reuse) -- address- and port-reuse
//!   plus broadcast receive, used for the discovery port (4992) and the
//!   DAX RX port (4991) so co-located SmartSDR clients can share them.
//!
//! On platforms without `SO_REUSEPORT` (non-unix), `bind_reuse` degrades
//! to `SO_REUSEADDR` only; a second client on the same host may then fail
//! to bind.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use flexlink_core::error::{Error, Result};

/// UDP transport for datagram-based radio communication.
#[derive(Debug)]
pub struct UdpTransport {
    /// The underlying UDP socket.
    socket: UdpSocket,
    /// The local address the socket is bound to.
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to a local address exclusively.
    ///
    /// Use `"0.0.0.0:0"` to bind to any available port on all interfaces.
    pub async fn bind(addr: &str) -> Result<Self> {
        tracing::debug!(addr = %addr, "Binding UDP socket");

        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::Stream(format!("failed to bind UDP socket on {addr}: {e}")))?;

        let local_addr = socket.local_addr().map_err(Error::Io)?;
        tracing::debug!(local_addr = %local_addr, "UDP socket bound");

        Ok(Self { socket, local_addr })
    }

    /// Bind to a well-known port with address/port reuse and broadcast
    /// receive enabled.
    ///
    /// This is required for the SmartSDR discovery port: the radio
    /// broadcasts beacons to 4992 and several clients on one host must be
    /// able to listen concurrently.
    pub fn bind_reuse(port: u16) -> Result<Self> {
        let addr = SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, port));

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::Stream(format!("failed to create UDP socket: {e}")))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| Error::Stream(format!("failed to set SO_REUSEADDR: {e}")))?;
        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .map_err(|e| Error::Stream(format!("failed to set SO_REUSEPORT: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| Error::Stream(format!("failed to set SO_BROADCAST: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::Stream(format!("failed to set nonblocking: {e}")))?;

        socket
            .bind(&addr.into())
            .map_err(|e| Error::Stream(format!("failed to bind UDP socket on {addr}: {e}")))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| Error::Stream(format!("failed to register UDP socket: {e}")))?;

        let local_addr = socket.local_addr().map_err(Error::Io)?;
        tracing::debug!(local_addr = %local_addr, "UDP socket bound (reuse + broadcast)");

        Ok(Self { socket, local_addr })
    }

    /// The local address this socket is bound to.
    ///
    /// Useful when binding to port 0 to discover the assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a datagram to the specified address.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        tracing::trace!(
            local = %self.local_addr,
            remote = %addr,
            bytes = data.len(),
            "Sending datagram"
        );

        self.socket
            .send_to(data, addr)
            .await
            .map_err(|e| Error::Transport(format!("UDP send to {addr} failed: {e}")))?;

        Ok(())
    }

    /// Receive a datagram, blocking until one arrives or the socket is
    /// closed. Returns `(bytes_read, source_addr)`.
    ///
    /// For VITA-49 frames an 8192-byte buffer is always sufficient.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await.map_err(Error::Io)
    }

    /// Receive a datagram with a timeout, ignoring the source address.
    ///
    /// Returns [`Error::Timeout`] if no datagram arrives within `timeout`.
    pub async fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
            Ok(Ok((n, _src))) => Ok(n),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout),
        }
    }
}
