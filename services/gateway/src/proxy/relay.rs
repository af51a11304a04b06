//! Bidirectional byte relay between the client transport and the backend.
//!
//! Three units run concurrently in the session task: client to backend,
//! backend to client, and a watcher on the session's cancellation token.
//! Whichever finishes first ends the session. The losers are dropped, so no
//! write can happen after that point, and both write sides are then shut
//! down so each peer observes end-of-stream.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Read buffer size for each copy loop.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Upper bound on shutting down one write side once the relay has ended.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Direction of a copy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client_to_backend",
            Direction::BackendToClient => "backend_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What ended the relay.
#[derive(Debug)]
pub enum RelayEnd {
    /// The client closed its side.
    ClientClosed,
    /// The backend closed its side.
    BackendClosed,
    /// The session was cancelled.
    Cancelled,
    /// No data arrived in one direction within the idle timeout.
    IdleTimeout { direction: Direction },
    /// A copy loop hit an I/O error.
    Failed { direction: Direction, error: io::Error },
}

impl RelayEnd {
    /// Stable name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayEnd::ClientClosed => "client_closed",
            RelayEnd::BackendClosed => "backend_closed",
            RelayEnd::Cancelled => "cancelled",
            RelayEnd::IdleTimeout { .. } => "idle_timeout",
            RelayEnd::Failed { .. } => "io_error",
        }
    }
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::IdleTimeout { direction } => write!(f, "idle timeout ({direction})"),
            RelayEnd::Failed { direction, error } => write!(f, "{direction}: {error}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of one relay.
#[derive(Debug)]
pub struct RelayOutcome {
    pub end: RelayEnd,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// How a single copy loop stopped.
#[derive(Debug)]
enum HalfEnd {
    Eof,
    Idle,
    Error(io::Error),
}

/// Relay bytes between `client` and `backend` until either side closes, an
/// I/O error occurs, or `cancel` fires.
pub async fn relay<C, B>(
    client: C,
    backend: B,
    cancel: &CancellationToken,
    idle_timeout: Option<Duration>,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let to_backend = AtomicU64::new(0);
    let from_backend = AtomicU64::new(0);

    let end = tokio::select! {
        biased;

        _ = cancel.cancelled() => RelayEnd::Cancelled,
        half = copy_half(&mut client_read, &mut backend_write, &to_backend, idle_timeout) => {
            half_end(half, Direction::ClientToBackend)
        }
        half = copy_half(&mut backend_read, &mut client_write, &from_backend, idle_timeout) => {
            half_end(half, Direction::BackendToClient)
        }
    };

    shutdown_quietly(&mut backend_write, "backend").await;
    shutdown_quietly(&mut client_write, "client").await;

    RelayOutcome {
        end,
        bytes_to_backend: to_backend.load(Ordering::Relaxed),
        bytes_from_backend: from_backend.load(Ordering::Relaxed),
    }
}

fn half_end(half: HalfEnd, direction: Direction) -> RelayEnd {
    match (half, direction) {
        (HalfEnd::Eof, Direction::ClientToBackend) => RelayEnd::ClientClosed,
        (HalfEnd::Eof, Direction::BackendToClient) => RelayEnd::BackendClosed,
        (HalfEnd::Idle, direction) => RelayEnd::IdleTimeout { direction },
        (HalfEnd::Error(error), direction) => RelayEnd::Failed { direction, error },
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    idle_timeout: Option<Duration>,
) -> HalfEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let read_result = if let Some(timeout) = idle_timeout {
            match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => return HalfEnd::Idle,
            }
        } else {
            reader.read(&mut buf).await
        };

        let n = match read_result {
            Ok(0) => return HalfEnd::Eof,
            Ok(n) => n,
            Err(e) => return HalfEnd::Error(e),
        };

        // Both WebSocket and TLS writers buffer until flushed.
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return HalfEnd::Error(e);
        }
        if let Err(e) = writer.flush().await {
            return HalfEnd::Error(e);
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

async fn shutdown_quietly<W: AsyncWrite + Unpin>(writer: &mut W, side: &'static str) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(side, error = %e, "Shutdown failed"),
        Err(_) => debug!(side, "Shutdown timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut client, gw_client) = duplex(1024);
        let (gw_backend, mut backend) = duplex(1024);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(async move { relay(gw_client, gw_backend, &cancel, None).await });

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        backend.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        client.shutdown().await.unwrap();
        let outcome = task.await.unwrap();
        assert!(matches!(outcome.end, RelayEnd::ClientClosed));
        assert_eq!(outcome.bytes_to_backend, 5);
        assert_eq!(outcome.bytes_from_backend, 3);

        // The backend sees the close propagated.
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_backend_close_ends_relay() {
        let (mut client, gw_client) = duplex(1024);
        let (gw_backend, mut backend) = duplex(1024);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(async move { relay(gw_client, gw_backend, &cancel, None).await });

        backend.write_all(b"bye").await.unwrap();
        backend.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        let outcome = task.await.unwrap();
        assert!(matches!(outcome.end, RelayEnd::BackendClosed));
        assert_eq!(outcome.bytes_from_backend, 3);
    }

    #[tokio::test]
    async fn test_cancel_closes_both_peers() {
        let (mut client, gw_client) = duplex(1024);
        let (gw_backend, mut backend) = duplex(1024);
        let cancel = CancellationToken::new();
        let relay_cancel = cancel.clone();

        let task =
            tokio::spawn(async move { relay(gw_client, gw_backend, &relay_cancel, None).await });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();

        cancel.cancel();
        let outcome = task.await.unwrap();
        assert!(matches!(outcome.end, RelayEnd::Cancelled));
        assert_eq!(outcome.bytes_to_backend, 4);

        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(backend.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (_client, gw_client) = duplex(64);
        let (gw_backend, _backend) = duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = relay(gw_client, gw_backend, &cancel, None).await;
        assert!(matches!(outcome.end, RelayEnd::Cancelled));
        assert_eq!(outcome.bytes_to_backend, 0);
        assert_eq!(outcome.bytes_from_backend, 0);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_client, gw_client) = duplex(64);
        let (gw_backend, _backend) = duplex(64);
        let cancel = CancellationToken::new();

        let outcome = relay(
            gw_client,
            gw_backend,
            &cancel,
            Some(Duration::from_millis(50)),
        )
        .await;
        assert!(matches!(outcome.end, RelayEnd::IdleTimeout { .. }));
        assert_eq!(outcome.end.as_str(), "idle_timeout");
    }

    #[test]
    fn test_relay_end_display() {
        let end = RelayEnd::Failed {
            direction: Direction::BackendToClient,
            error: io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
        };
        assert_eq!(end.to_string(), "backend_to_client: broken pipe");
        assert_eq!(RelayEnd::Cancelled.to_string(), "cancelled");
    }
}
