//! One side of a connection pair.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

/// A live stream on either side of a pair.
///
/// Dropping a leg closes its socket.
pub enum Leg {
    /// Plaintext TCP.
    Plain(TcpStream),
    /// TLS over TCP, originated or terminated by the tunnel.
    Tls(Box<TlsStream<TcpStream>>),
}

impl Leg {
    pub fn is_tls(&self) -> bool {
        matches!(self, Leg::Tls(_))
    }
}

impl std::fmt::Debug for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leg::Plain(stream) => f.debug_tuple("Plain").field(stream).finish(),
            Leg::Tls(_) => f.write_str("Tls(..)"),
        }
    }
}

impl From<TcpStream> for Leg {
    fn from(stream: TcpStream) -> Self {
        Leg::Plain(stream)
    }
}

impl From<TlsStream<TcpStream>> for Leg {
    fn from(stream: TlsStream<TcpStream>) -> Self {
        Leg::Tls(Box::new(stream))
    }
}

impl AsyncRead for Leg {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Leg::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Leg::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Leg {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Leg::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Leg::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Leg::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Leg::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    /// Half-close: TLS sends close_notify before the TCP FIN.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Leg::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Leg::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
