//! Protocol Sniffer (C3): classifies an accepted connection by its first bytes without
//! consuming them, then hands back a stream that still delivers those bytes to whatever
//! reads it next.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

const PEEK_DEADLINE: Duration = Duration::from_millis(500);
const PEEK_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Http,
    Tls,
    OpaqueTcp,
    Unknown,
}

/// A stream that, on subsequent reads, delivers exactly what the wrapped socket would
/// have delivered from its current position. Because classification uses a non-consuming
/// peek, the wrapped socket already satisfies this on its own; this newtype exists to
/// make the invariant explicit at the type level and to provide `get_ref`/`into_inner`
/// for identity extraction by the TCP splicer's kernel fast path.
pub struct WrappedStream(TcpStream);

impl WrappedStream {
    pub fn get_ref(&self) -> &TcpStream {
        &self.0
    }

    pub fn into_inner(self) -> TcpStream {
        self.0
    }
}

impl AsyncRead for WrappedStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl AsyncWrite for WrappedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.0.is_write_vectored()
    }
}

/// Sets a peek deadline, attempts to peek `PEEK_LEN` bytes without consuming them, and
/// classifies the connection by its leading bytes.
pub async fn classify(stream: TcpStream) -> (ProtocolKind, WrappedStream) {
    let mut buf = [0u8; PEEK_LEN];
    let peeked = tokio::time::timeout(PEEK_DEADLINE, peek_at_least(&stream, &mut buf, 2)).await;

    let kind = match peeked {
        Ok(Ok(n)) if n >= 2 => classify_bytes(&buf[..n]),
        _ => ProtocolKind::Unknown,
    };

    (kind, WrappedStream(stream))
}

/// How long to wait between peeks when fewer than `min` bytes have arrived yet. `peek`
/// doesn't consume, so a socket holding a single buffered byte is perpetually
/// "readable" — `readable().await` would resolve immediately on every call and spin the
/// task hot for the whole outer deadline. A short sleep between peeks avoids that without
/// giving up the outer `timeout`'s bound on total wait time.
const PEEK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Peeks repeatedly until at least `min` bytes are available or the socket reports EOF
/// or an error. Returns the number of bytes peeked.
async fn peek_at_least(stream: &TcpStream, buf: &mut [u8], min: usize) -> std::io::Result<usize> {
    loop {
        let n = stream.peek(buf).await?;
        if n >= min || n == 0 {
            return Ok(n);
        }
        // Fewer bytes than needed are currently available; wait a bit before peeking
        // again without consuming what's already there.
        tokio::time::sleep(PEEK_RETRY_INTERVAL).await;
    }
}

fn classify_bytes(prefix: &[u8]) -> ProtocolKind {
    const HTTP_PREFIXES: &[&[u8]] = &[b"GET ", b"POST", b"PUT ", b"DELE", b"HEAD", b"HTTP"];
    if prefix[0] == 0x16 {
        return ProtocolKind::Tls;
    }
    for p in HTTP_PREFIXES {
        if prefix.len() >= p.len() && &prefix[..p.len()] == *p {
            return ProtocolKind::Http;
        }
    }
    ProtocolKind::OpaqueTcp
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn classifies_http_get() {
        let (mut client, server) = connected_pair().await;
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let (kind, _wrapped) = classify(server).await;
        assert_eq!(kind, ProtocolKind::Http);
    }

    #[tokio::test]
    async fn classifies_tls_client_hello() {
        let (mut client, server) = connected_pair().await;
        client.write_all(&[0x16, 0x03, 0x01, 0x00, 0x05]).await.unwrap();
        let (kind, _wrapped) = classify(server).await;
        assert_eq!(kind, ProtocolKind::Tls);
    }

    #[tokio::test]
    async fn classifies_opaque_binary() {
        let (mut client, server) = connected_pair().await;
        client.write_all(&[0x01, 0x02, 0x03, 0x04]).await.unwrap();
        let (kind, _wrapped) = classify(server).await;
        assert_eq!(kind, ProtocolKind::OpaqueTcp);
    }

    #[tokio::test]
    async fn wrapped_stream_delivers_peeked_prefix_then_remainder() {
        let (mut client, server) = connected_pair().await;
        client.write_all(b"GET /x HTTP/1.1\r\n\r\n").await.unwrap();
        let (kind, mut wrapped) = classify(server).await;
        assert_eq!(kind, ProtocolKind::Http);

        use tokio::io::AsyncReadExt;
        let mut out = vec![0u8; 19];
        wrapped.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"GET /x HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn fewer_than_two_bytes_is_unknown() {
        let (mut client, server) = connected_pair().await;
        client.write_all(&[0x01]).await.unwrap();
        let (kind, _wrapped) = classify(server).await;
        assert_eq!(kind, ProtocolKind::Unknown);
    }
}
