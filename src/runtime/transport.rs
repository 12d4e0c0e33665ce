//! Deadline-bounded transfer primitives.
//!
//! Every handler moves bytes through these functions. Each one loops over
//! "wait for readiness, then one transfer call" so short reads and short
//! writes are absorbed here and never reach application logic.
//!
//! ## Timeouts
//!
//! `timeout` bounds each readiness wait, not the whole transfer: a peer that
//! keeps trickling bytes keeps the transfer alive. `None` waits forever.
//!
//! ## Interrupted calls
//!
//! `EINTR` is retried transparently in both directions, for the readiness
//! wait (with the time remaining) and for the transfer call itself.

use std::fmt;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{error, trace, warn};

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

/// Which readiness a wait is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Outcome of a readiness wait.
#[derive(Debug)]
pub enum Readiness {
    /// The handle can make progress.
    Ready,
    /// Nothing happened within the timeout.
    TimedOut,
    /// The wait itself failed.
    Failed(io::Error),
}

/// A connection the transfer loops can drive.
///
/// `recv_once`/`send_once` perform a single transfer and may move fewer
/// bytes than asked; they report "not ready" as `WouldBlock`.
pub trait Transport {
    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> Readiness;
    fn recv_once(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send_once(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl Transport for TcpStream {
    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> Readiness {
        wait_fd(self.as_raw_fd(), interest, timeout)
    }

    fn recv_once(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: the pointer and length come from a live, exclusively borrowed slice.
        let rc = unsafe {
            libc::recv(
                self.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    fn send_once(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: the pointer and length come from a live slice.
        let rc = unsafe { libc::send(self.as_raw_fd(), buf.as_ptr().cast(), buf.len(), SEND_FLAGS) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }
}

/// Failure of a transfer primitive.
#[derive(Debug)]
pub enum TransportError {
    /// No readiness within the timeout.
    TimedOut,
    /// The peer closed the connection mid-transfer.
    Closed { transferred: usize },
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::TimedOut => write!(f, "timed out waiting for readiness"),
            TransportError::Closed { transferred } => {
                write!(f, "connection closed after {transferred} bytes")
            }
            TransportError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Wait until `fd` is ready for `interest`, or `timeout` elapses.
pub fn wait_fd(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> Readiness {
    let events = match interest {
        Interest::Readable => libc::POLLIN,
        Interest::Writable => libc::POLLOUT,
    };
    // A deadline past the representable range waits indefinitely.
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

    loop {
        let timeout_ms = match deadline {
            None => -1,
            Some(deadline) => poll_millis(deadline.saturating_duration_since(Instant::now())),
        };

        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: `pfd` is a valid pollfd array of length 1 for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };

        match rc {
            0 => return Readiness::TimedOut,
            rc if rc < 0 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Readiness::Failed(err);
            }
            _ => {
                if pfd.revents & libc::POLLNVAL != 0 {
                    return Readiness::Failed(io::Error::from_raw_os_error(libc::EBADF));
                }
                // POLLERR/POLLHUP are surfaced by the following transfer call.
                return Readiness::Ready;
            }
        }
    }
}

/// Round up so a sub-millisecond remainder still waits instead of spinning.
fn poll_millis(remaining: Duration) -> libc::c_int {
    let millis = remaining.as_nanos().div_ceil(1_000_000);
    millis.min(libc::c_int::MAX as u128) as libc::c_int
}

/// Receive exactly `buf.len()` bytes.
///
/// Returns `Ok(buf.len())` on success. A timeout or a peer close returns
/// `Ok(0)` and discards whatever partial data arrived; callers treat 0 as
/// "nothing usable". Errors from the wait or the transfer are returned.
pub fn recv_all<T: Transport + ?Sized>(
    io: &mut T,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<usize, TransportError> {
    let expected = buf.len();
    let mut received = 0;

    while received < expected {
        match io.wait(Interest::Readable, timeout) {
            Readiness::Ready => {}
            Readiness::TimedOut => {
                warn!(expected, received, ?timeout, "recv_all timed out");
                return Ok(0);
            }
            Readiness::Failed(e) => {
                error!(error = %e, "recv_all readiness wait failed");
                return Err(TransportError::Io(e));
            }
        }

        match io.recv_once(&mut buf[received..]) {
            Ok(0) => {
                warn!(expected, received, "recv_all: connection closed");
                return Ok(0);
            }
            Ok(n) => {
                received += n;
                trace!(bytes = n, received, expected, "recv_all progress");
            }
            Err(ref e) if is_retryable(e) => continue,
            Err(e) => {
                error!(error = %e, "recv_all failed");
                return Err(TransportError::Io(e));
            }
        }
    }

    Ok(received)
}

/// Send all of `buf`.
///
/// Returns `Ok(buf.len())` only when every byte was handed to the kernel.
/// Timeouts and a peer that stops accepting data are errors for the writer.
pub fn send_all<T: Transport + ?Sized>(
    io: &mut T,
    buf: &[u8],
    timeout: Option<Duration>,
) -> Result<usize, TransportError> {
    let length = buf.len();
    let mut sent = 0;

    while sent < length {
        match io.wait(Interest::Writable, timeout) {
            Readiness::Ready => {}
            Readiness::TimedOut => {
                warn!(length, sent, ?timeout, "send_all timed out");
                return Err(TransportError::TimedOut);
            }
            Readiness::Failed(e) => {
                error!(error = %e, "send_all readiness wait failed");
                return Err(TransportError::Io(e));
            }
        }

        match io.send_once(&buf[sent..]) {
            Ok(0) => {
                warn!(length, sent, "send_all: connection closed");
                return Err(TransportError::Closed { transferred: sent });
            }
            Ok(n) => {
                sent += n;
                trace!(bytes = n, sent, length, "send_all progress");
            }
            Err(ref e) if is_retryable(e) => continue,
            Err(e) => {
                error!(error = %e, "send_all failed");
                return Err(TransportError::Io(e));
            }
        }
    }

    Ok(sent)
}

/// Receive whatever is available, up to `buf.len()` bytes, in one transfer.
///
/// `Ok(0)` means the peer closed the connection.
pub fn recv_some<T: Transport + ?Sized>(
    io: &mut T,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<usize, TransportError> {
    if buf.is_empty() {
        return Ok(0);
    }

    loop {
        match io.wait(Interest::Readable, timeout) {
            Readiness::Ready => {}
            Readiness::TimedOut => return Err(TransportError::TimedOut),
            Readiness::Failed(e) => return Err(TransportError::Io(e)),
        }

        match io.recv_once(buf) {
            Ok(n) => return Ok(n),
            Err(ref e) if is_retryable(e) => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
}

/// Interrupted calls, and readiness that went stale before the transfer.
fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Scripted peer: each transfer call pops the next step.
    #[derive(Default)]
    struct Scripted {
        recv_steps: VecDeque<io::Result<Vec<u8>>>,
        /// Max bytes accepted per send call; `None` entries close the connection.
        send_steps: VecDeque<Option<io::Result<usize>>>,
        sent: Vec<u8>,
        send_calls: usize,
    }

    impl Transport for Scripted {
        fn wait(&self, _interest: Interest, _timeout: Option<Duration>) -> Readiness {
            Readiness::Ready
        }

        fn recv_once(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.recv_steps.pop_front().unwrap_or_else(|| Ok(Vec::new())) {
                Ok(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                Err(e) => Err(e),
            }
        }

        fn send_once(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.send_calls += 1;
            match self.send_steps.pop_front().flatten() {
                Some(Ok(limit)) => {
                    let n = limit.min(buf.len());
                    self.sent.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    /// Never becomes ready.
    struct Gated(Scripted);

    impl Transport for Gated {
        fn wait(&self, _interest: Interest, _timeout: Option<Duration>) -> Readiness {
            Readiness::TimedOut
        }

        fn recv_once(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.recv_once(buf)
        }

        fn send_once(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.send_once(buf)
        }
    }

    struct Broken;

    impl Transport for Broken {
        fn wait(&self, _interest: Interest, _timeout: Option<Duration>) -> Readiness {
            Readiness::Failed(io::Error::from_raw_os_error(libc::EBADF))
        }

        fn recv_once(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            panic!("transfer after failed wait")
        }

        fn send_once(&mut self, _buf: &[u8]) -> io::Result<usize> {
            panic!("transfer after failed wait")
        }
    }

    fn interrupted() -> io::Error {
        io::Error::from(io::ErrorKind::Interrupted)
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn test_zero_length_returns_immediately() {
        // A broken transport panics on transfer and fails every wait.
        let mut io = Broken;
        let mut empty = [0u8; 0];
        assert_eq!(recv_all(&mut io, &mut empty, None).unwrap(), 0);
        assert_eq!(recv_all(&mut io, &mut empty, Some(Duration::ZERO)).unwrap(), 0);
        assert_eq!(send_all(&mut io, &empty, None).unwrap(), 0);
        assert_eq!(recv_some(&mut io, &mut empty, None).unwrap(), 0);
    }

    #[test]
    fn test_send_all_short_writes() {
        let mut io = Scripted::default();
        io.send_steps = VecDeque::from(vec![Some(Ok(2)), Some(Ok(2)), Some(Ok(2))]);

        assert_eq!(send_all(&mut io, b"hello", None).unwrap(), 5);
        assert_eq!(io.sent, b"hello");
        assert_eq!(io.send_calls, 3);
    }

    #[test]
    fn test_send_all_peer_closes_mid_write() {
        let mut io = Scripted::default();
        io.send_steps = VecDeque::from(vec![Some(Ok(2)), None]);

        match send_all(&mut io, b"hello", None) {
            Err(TransportError::Closed { transferred }) => assert_eq!(transferred, 2),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(io.sent, b"he");
    }

    #[test]
    fn test_send_all_retries_interrupted() {
        let mut io = Scripted::default();
        io.send_steps = VecDeque::from(vec![
            Some(Err(interrupted())),
            Some(Ok(3)),
            Some(Err(io::Error::from(io::ErrorKind::WouldBlock))),
            Some(Ok(2)),
        ]);

        assert_eq!(send_all(&mut io, b"hello", None).unwrap(), 5);
        assert_eq!(io.send_calls, 4);
    }

    #[test]
    fn test_send_all_error() {
        let mut io = Scripted::default();
        io.send_steps = VecDeque::from(vec![Some(Err(io::Error::from(
            io::ErrorKind::BrokenPipe,
        )))]);

        assert!(matches!(
            send_all(&mut io, b"hello", None),
            Err(TransportError::Io(_))
        ));
    }

    #[test]
    fn test_recv_all_accumulates() {
        let mut io = Scripted::default();
        io.recv_steps = VecDeque::from(vec![
            Ok(b"he".to_vec()),
            Err(interrupted()),
            Ok(b"l".to_vec()),
            Ok(b"lo".to_vec()),
        ]);

        let mut buf = [0u8; 5];
        assert_eq!(recv_all(&mut io, &mut buf, None).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_recv_all_close_discards_partial() {
        let mut io = Scripted::default();
        io.recv_steps = VecDeque::from(vec![Ok(b"hel".to_vec()), Ok(Vec::new())]);

        let mut buf = [0u8; 5];
        assert_eq!(recv_all(&mut io, &mut buf, None).unwrap(), 0);
    }

    #[test]
    fn test_readiness_outcomes() {
        let mut gated = Gated(Scripted::default());
        let mut buf = [0u8; 4];
        assert_eq!(recv_all(&mut gated, &mut buf, Some(Duration::ZERO)).unwrap(), 0);
        assert!(matches!(
            send_all(&mut gated, b"data", Some(Duration::ZERO)),
            Err(TransportError::TimedOut)
        ));
        assert!(matches!(
            recv_some(&mut gated, &mut buf, Some(Duration::ZERO)),
            Err(TransportError::TimedOut)
        ));

        let mut broken = Broken;
        assert!(matches!(
            recv_all(&mut broken, &mut buf, None),
            Err(TransportError::Io(_))
        ));
        assert!(matches!(
            send_all(&mut broken, b"data", None),
            Err(TransportError::Io(_))
        ));
    }

    #[test]
    fn test_recv_all_times_out_on_idle_peer() {
        let (mut server, _client) = socket_pair();
        let mut buf = [0u8; 16];

        let start = Instant::now();
        let n = recv_all(&mut server, &mut buf, Some(Duration::from_millis(200))).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(n, 0);
        assert!(elapsed >= Duration::from_millis(150), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "took too long: {elapsed:?}");
    }

    #[test]
    fn test_send_all_times_out_when_peer_stops_reading() {
        let (mut server, _client) = socket_pair();
        // Larger than any loopback socket buffer pair.
        let payload = vec![0u8; 64 * 1024 * 1024];

        let start = Instant::now();
        let result = send_all(&mut server, &payload, Some(Duration::from_millis(200)));
        assert!(matches!(result, Err(TransportError::TimedOut)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_round_trip_over_socket() {
        let (mut server, mut client) = socket_pair();

        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(recv_all(&mut server, &mut buf, Some(Duration::from_secs(5))).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        assert_eq!(send_all(&mut server, &buf, Some(Duration::from_secs(5))).unwrap(), 5);
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"hello");

        drop(client);
        let mut more = [0u8; 8];
        assert_eq!(recv_some(&mut server, &mut more, Some(Duration::from_secs(5))).unwrap(), 0);
    }

    #[test]
    fn test_huge_timeout_waits_forever() {
        let (mut server, mut client) = socket_pair();
        let config = crate::config::Config {
            timeout_seconds: i64::MAX,
            ..crate::config::Config::default()
        };
        let forever = config.io_timeout();
        assert!(forever.is_some());

        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(recv_all(&mut server, &mut buf, forever).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        assert_eq!(send_all(&mut server, b"world", forever).unwrap(), 5);
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"world");

        client.write_all(b"!").unwrap();
        let mut more = [0u8; 8];
        assert_eq!(recv_some(&mut server, &mut more, forever).unwrap(), 1);
        assert!(matches!(
            wait_fd(server.as_raw_fd(), Interest::Writable, Some(Duration::MAX)),
            Readiness::Ready
        ));
    }

    #[test]
    fn test_poll_millis_rounds_up() {
        assert_eq!(poll_millis(Duration::ZERO), 0);
        assert_eq!(poll_millis(Duration::from_micros(1)), 1);
        assert_eq!(poll_millis(Duration::from_millis(250)), 250);
        assert_eq!(poll_millis(Duration::from_secs(u64::MAX)), libc::c_int::MAX);
    }
}
