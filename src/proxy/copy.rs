//! Bidirectional byte relay shared by the TCP splicer and the HTTP upgrade path.
//!
//! Two copy loops run concurrently, one per direction, joined by `tokio::join!` rather
//! than `try_join!`: termination or an error in either direction must close both sockets,
//! and we want to observe both outcomes rather than cancel one future the instant the
//! other errors. A disconnect-shaped error on one side is not itself an error worth
//! propagating — see `ignore_io_errors`.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const INITIAL_BUFFER_SIZE: usize = 1024;
const LARGE_BUFFER_SIZE: usize = 16 * 1024 - 64;
const JUMBO_BUFFER_SIZE: usize = 16 * (16 * 1024) - 64;
const RESIZE_THRESHOLD_LARGE: u64 = 128 * 1024;
const RESIZE_THRESHOLD_JUMBO: u64 = 10 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum CopyError {
    #[error("client transport error: {0}")]
    Client(#[source] std::io::Error),
    #[error("upstream transport error: {0}")]
    Upstream(#[source] std::io::Error),
}

/// Per-session byte counters, reported at session end alongside duration.
#[derive(Default)]
pub struct ConnectionResult {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ConnectionResult {
    pub fn increment_send(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_recv(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// True for error kinds that merely signal "the peer went away", which both directions
/// of a splice trigger in one another as their ordinary termination path.
fn is_benign_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

async fn copy_direction<R, W>(mut reader: R, mut writer: W, counter: impl Fn(u64)) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; INITIAL_BUFFER_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if is_benign_disconnect(&e) => break,
            Err(e) => return Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            if is_benign_disconnect(&e) {
                break;
            }
            return Err(e);
        }
        total += n as u64;
        counter(n as u64);

        if total > RESIZE_THRESHOLD_JUMBO && buf.len() < JUMBO_BUFFER_SIZE {
            buf.resize(JUMBO_BUFFER_SIZE, 0);
        } else if total > RESIZE_THRESHOLD_LARGE && buf.len() < LARGE_BUFFER_SIZE {
            buf.resize(LARGE_BUFFER_SIZE, 0);
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Splits both sides and relays bytes until one direction terminates; the other
/// direction's pending read/write is then woken by the resulting socket close.
pub async fn copy_bidirectional<A, B>(client: A, upstream: B, stats: &ConnectionResult) -> Result<(), CopyError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (upstream_r, upstream_w) = tokio::io::split(upstream);

    let client_to_upstream = copy_direction(client_r, upstream_w, |n| stats.increment_send(n));
    let upstream_to_client = copy_direction(upstream_r, client_w, |n| stats.increment_recv(n));

    let (c2u, u2c) = tokio::join!(client_to_upstream, upstream_to_client);
    c2u.map_err(CopyError::Client)?;
    u2c.map_err(CopyError::Upstream)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).await.unwrap();
        let (b, _) = listener.accept().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn relays_bytes_both_directions_and_counts_them() {
        let (client_side, server_side) = pair().await;
        let (upstream_side, upstream_listener_side) = pair().await;

        let stats = ConnectionResult::default();
        let relay = tokio::spawn(async move {
            copy_bidirectional(server_side, upstream_listener_side, &stats).await.unwrap();
            stats
        });

        let mut client_side = client_side;
        let mut upstream_side = upstream_side;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client_side.write_all(b"hello upstream").await.unwrap();
        let mut buf = [0u8; 14];
        upstream_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello upstream");

        upstream_side.write_all(b"hello client!!").await.unwrap();
        let mut buf2 = [0u8; 14];
        client_side.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"hello client!!");

        drop(client_side);
        drop(upstream_side);
        let stats = relay.await.unwrap();
        assert_eq!(stats.sent(), 14);
        assert_eq!(stats.received(), 14);
    }
}
