//! Directional forwarding.
//!
//! A [`Forwarder`] copies bytes from one endpoint to the other until the
//! source reports end-of-stream or either side errors. Whatever the outcome,
//! it then shuts down both directions of its *destination* and drops it. It
//! never touches its source: the forwarder running the opposite direction on
//! the same connection owns that socket as its own destination.
//!
//! Whichever direction stops first therefore tears down the socket the other
//! direction is reading from, which unblocks the pending read. The second
//! shutdown of an already-shut socket fails with `ENOTCONN` or similar; that
//! error is expected and ignored.
//!
//! ```text
//!  client ──read──> [client->upstream] ──write──> upstream
//!  client <──write── [upstream->client] <──read── upstream
//! ```

use std::fmt;
use std::io;
use std::net::Shutdown;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Reference transfer chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Which way a forwarder moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client socket to upstream socket.
    ClientToUpstream,
    /// Upstream socket to client socket.
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client->upstream"),
            Direction::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Forwarder lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ForwarderState {
    Running,
    ClosingDestination,
    Terminated,
}

/// Why a forwarder stopped.
#[derive(Debug)]
pub enum Termination {
    /// Source returned a zero-length read.
    Eof,
    /// Reading from the source failed.
    ReadFailed(io::Error),
    /// Writing to the destination failed.
    WriteFailed(io::Error),
    /// No data arrived from the source within the idle timeout.
    IdleTimeout(Duration),
}

impl Termination {
    /// Orderly end-of-stream, as opposed to a failure.
    pub fn is_eof(&self) -> bool {
        matches!(self, Termination::Eof)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Eof => write!(f, "eof"),
            Termination::ReadFailed(e) => write!(f, "read failed: {}", e),
            Termination::WriteFailed(e) => write!(f, "write failed: {}", e),
            Termination::IdleTimeout(t) => write!(f, "idle for {:?}", t),
        }
    }
}

/// Outcome of one forwarder run.
#[derive(Debug)]
pub struct ForwardReport {
    pub direction: Direction,
    /// Bytes fully written to the destination.
    pub bytes: u64,
    pub termination: Termination,
}

/// The write side of a relayed socket.
///
/// `shutdown_both` must be safe to call on a socket the peer direction has
/// already shut down; callers ignore its error.
pub trait Destination: AsyncWrite + Unpin {
    /// Shut down reads and writes on the underlying socket.
    fn shutdown_both(&mut self) -> io::Result<()>;
}

impl Destination for OwnedWriteHalf {
    fn shutdown_both(&mut self) -> io::Result<()> {
        let stream: &TcpStream = self.as_ref();
        SockRef::from(stream).shutdown(Shutdown::Both)
    }
}

impl Destination for TcpStream {
    fn shutdown_both(&mut self) -> io::Result<()> {
        SockRef::from(&*self).shutdown(Shutdown::Both)
    }
}

/// Copies one direction of a connection.
pub struct Forwarder<R, W> {
    direction: Direction,
    source: R,
    destination: W,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
    state: ForwarderState,
}

impl<R, W> Forwarder<R, W>
where
    R: AsyncRead + Unpin,
    W: Destination,
{
    /// Create a forwarder with the reference chunk size and no idle timeout.
    pub fn new(direction: Direction, source: R, destination: W) -> Self {
        Self {
            direction,
            source,
            destination,
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_timeout: None,
            state: ForwarderState::Running,
        }
    }

    /// Bytes requested per read. Clamped to at least one.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Stop if a single read waits longer than `idle_timeout`.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn state(&self) -> ForwarderState {
        self.state
    }

    /// Copy until EOF or error, then close the destination.
    ///
    /// Consumes the forwarder, so the terminal state is reached exactly once.
    pub async fn run(mut self) -> ForwardReport {
        let (bytes, termination) = self.pump().await;

        self.advance(ForwarderState::ClosingDestination);
        if let Err(e) = self.destination.shutdown_both() {
            trace!(direction = %self.direction, error = %e, "Destination already shut down");
        }
        self.advance(ForwarderState::Terminated);

        debug!(
            direction = %self.direction,
            bytes = bytes,
            termination = %termination,
            "Forwarder finished"
        );

        // Dropping `self` releases our handle on the destination.
        ForwardReport {
            direction: self.direction,
            bytes,
            termination,
        }
    }

    async fn pump(&mut self) -> (u64, Termination) {
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;

        loop {
            let read_result = match self.idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, self.source.read(&mut buf)).await {
                    Ok(result) => result,
                    Err(_) => return (total, Termination::IdleTimeout(idle)),
                },
                None => self.source.read(&mut buf).await,
            };

            match read_result {
                Ok(0) => return (total, Termination::Eof),
                Ok(n) => {
                    if let Err(e) = self.destination.write_all(&buf[..n]).await {
                        return (total, Termination::WriteFailed(e));
                    }
                    total += n as u64;
                }
                Err(e) => return (total, Termination::ReadFailed(e)),
            }
        }
    }

    fn advance(&mut self, next: ForwarderState) {
        debug_assert!(next > self.state, "forwarder state moved backwards");
        trace!(direction = %self.direction, from = ?self.state, to = ?next, "Forwarder state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::net::TcpListener;
    use tokio_test::io::{Builder, Mock};

    /// Mock destination that counts `shutdown_both` calls.
    struct MockDestination {
        inner: Mock,
        shutdowns: Arc<AtomicUsize>,
    }

    impl MockDestination {
        fn new(inner: Mock) -> (Self, Arc<AtomicUsize>) {
            let shutdowns = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    inner,
                    shutdowns: Arc::clone(&shutdowns),
                },
                shutdowns,
            )
        }
    }

    impl AsyncWrite for MockDestination {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl Destination for MockDestination {
        fn shutdown_both(&mut self) -> io::Result<()> {
            // Second shutdown of a socket reports NotConnected, like the OS.
            if self.shutdowns.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_copies_until_eof_and_closes_destination() {
        let source = Builder::new().read(b"hello").read(b" world").build();
        let (destination, shutdowns) =
            MockDestination::new(Builder::new().write(b"hello").write(b" world").build());

        let forwarder = Forwarder::new(Direction::ClientToUpstream, source, destination);
        assert_eq!(forwarder.state(), ForwarderState::Running);

        let report = forwarder.run().await;
        assert_eq!(report.direction, Direction::ClientToUpstream);
        assert_eq!(report.bytes, 11);
        assert!(report.termination.is_eof());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reads_are_bounded_by_chunk_size() {
        let source = Builder::new().read(b"abcdefgh").build();
        let (destination, _) = MockDestination::new(
            Builder::new().write(b"abc").write(b"def").write(b"gh").build(),
        );

        let report = Forwarder::new(Direction::UpstreamToClient, source, destination)
            .with_chunk_size(3)
            .run()
            .await;
        assert_eq!(report.bytes, 8);
        assert!(report.termination.is_eof());
    }

    #[tokio::test]
    async fn test_read_error_still_closes_destination() {
        let source = Builder::new()
            .read(b"partial")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (destination, shutdowns) =
            MockDestination::new(Builder::new().write(b"partial").build());

        let report = Forwarder::new(Direction::ClientToUpstream, source, destination)
            .run()
            .await;
        assert_eq!(report.bytes, 7);
        match report.termination {
            Termination::ReadFailed(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected read failure, got {}", other),
        }
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_error_stops_without_retry() {
        let source = Builder::new().read(b"first").read(b"second").build();
        let (destination, shutdowns) = MockDestination::new(
            Builder::new()
                .write(b"first")
                .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
                .build(),
        );

        let report = Forwarder::new(Direction::UpstreamToClient, source, destination)
            .run()
            .await;
        assert_eq!(report.bytes, 5);
        assert!(matches!(report.termination, Termination::WriteFailed(_)));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_of_already_closed_destination_is_ignored() {
        let source = Builder::new().build();
        let (mut destination, shutdowns) = MockDestination::new(Builder::new().build());

        // Peer direction got there first.
        destination.shutdown_both().unwrap();

        let report = Forwarder::new(Direction::ClientToUpstream, source, destination)
            .run()
            .await;
        assert!(report.termination.is_eof());
        assert_eq!(report.bytes, 0);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idle_timeout_terminates_forwarder() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = TcpStream::connect(addr).await.unwrap();
        let (_held, _) = listener.accept().await.unwrap();

        let sink_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sink = TcpStream::connect(sink_listener.local_addr().unwrap())
            .await
            .unwrap();
        let (mut sink_peer, _) = sink_listener.accept().await.unwrap();

        let report = Forwarder::new(Direction::UpstreamToClient, silent, sink)
            .with_idle_timeout(Some(Duration::from_millis(50)))
            .run()
            .await;
        assert!(matches!(report.termination, Termination::IdleTimeout(_)));

        // Destination was shut down, so its peer sees EOF.
        let mut buf = [0u8; 8];
        let n = sink_peer.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::ClientToUpstream.to_string(), "client->upstream");
        assert_eq!(Direction::UpstreamToClient.to_string(), "upstream->client");
    }
}
