//! TCP connection helper and the plain/TLS stream wrapper.
//!
//! The SmartSDR control channel is plain TCP on the LAN (port 4992) and
//! TLS on the WAN (the radio's advertised public port). [`NetStream`]
//! wraps both behind one `AsyncRead + AsyncWrite` type so the control
//! connection's read loop does not care which transport it is on.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use flexlink_core::error::{Error, Result};

/// Connect a TCP stream with a timeout, Nagle disabled.
///
/// The `addr` parameter is a `host:port` string. Rig commands are small
/// and latency-sensitive, so `TCP_NODELAY` is always set.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    tracing::debug!(addr = %addr, timeout_ms = timeout.as_millis(), "Connecting TCP");

    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            tracing::debug!(addr = %addr, "TCP connect timed out");
            Error::Timeout
        })?
        .map_err(|e| Error::Transport(format!("TCP connect to {addr} failed: {e}")))?;

    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    Ok(stream)
}

/// A control-channel stream: plain TCP on the LAN, TLS on the WAN.
///
/// Implements `AsyncRead`/`AsyncWrite` by delegating to whichever variant
/// is active, so session code can be written once against `NetStream`.
#[derive(Debug)]
pub enum NetStream {
    /// Plain TCP (LAN).
    Tcp(TcpStream),
    /// TLS over TCP (WAN).
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
