//! Shutdown coordination.
//!
//! Shutdown is two-phased and strictly sequenced:
//!
//! 1. A termination signal sets the [`Termination`] flag. The acceptor
//!    observes it before its next accept and stops taking connections.
//! 2. Once the acceptor has returned, [`drain_and_wait`] blocks until every
//!    in-flight handler has finished. Handlers are never cancelled.
//!
//! ## Waking the acceptor
//!
//! A blocked `accept` does not notice the flag on its own. The acceptor arms
//! the flag with the listener's fd; [`Termination::request`] then calls
//! `shutdown(2)` on that fd, which makes the pending `accept` fail (Linux
//! returns `EINVAL`) so the loop re-checks the flag and exits. `shutdown(2)`
//! is async-signal-safe, so this works from the signal handler.

use crate::runtime::WorkerTracker;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// The process-wide flag set by signal delivery.
pub static TERMINATION: Termination = Termination::new();

/// One-shot termination request.
///
/// Holds 0 until the first request, then the requesting signal number
/// forever. Every operation is a single atomic access plus, at most, one
/// `shutdown(2)`: nothing allocates or locks.
#[derive(Debug)]
pub struct Termination {
    signal: AtomicI32,
    wake_fd: AtomicI32,
}

impl Default for Termination {
    fn default() -> Self {
        Self::new()
    }
}

impl Termination {
    pub const fn new() -> Self {
        Self {
            signal: AtomicI32::new(0),
            wake_fd: AtomicI32::new(-1),
        }
    }

    /// Request termination on behalf of `signal` (a positive signal number).
    ///
    /// Idempotent: only the first request is recorded, and only it returns
    /// `true`. Every request wakes an armed acceptor.
    pub fn request(&self, signal: i32) -> bool {
        let first = self
            .signal
            .compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        let fd = self.wake_fd.load(Ordering::SeqCst);
        if fd >= 0 {
            // SAFETY: shutdown(2) on a descriptor has no memory-safety preconditions.
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
        }

        first
    }

    pub fn is_requested(&self) -> bool {
        self.signal.load(Ordering::SeqCst) != 0
    }

    /// The signal that requested termination, if any.
    pub fn signal(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }

    /// Register the listener to shut down when termination is requested.
    ///
    /// The returned guard disarms on drop; it must not outlive the listener.
    pub fn arm<'a, L: AsRawFd>(&'a self, listener: &'a L) -> Armed<'a> {
        self.wake_fd.store(listener.as_raw_fd(), Ordering::SeqCst);
        Armed { termination: self }
    }
}

/// Keeps a listener registered with a [`Termination`].
#[derive(Debug)]
pub struct Armed<'a> {
    termination: &'a Termination,
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        self.termination.wake_fd.store(-1, Ordering::SeqCst);
    }
}

const SIGINT_MSG: &[u8] = b"\n***SIGINT received. Shutting down...***\n";
const SIGTERM_MSG: &[u8] = b"\n***SIGTERM received. Shutting down...***\n";
const SIGPIPE_MSG: &[u8] = b"\n***SIGPIPE received. Client disconnected unexpectedly.***\n";

extern "C" fn on_signal(signum: libc::c_int) {
    let saved = Errno::save();
    match signum {
        libc::SIGINT => {
            write_stderr(SIGINT_MSG);
            TERMINATION.request(signum);
        }
        libc::SIGTERM => {
            write_stderr(SIGTERM_MSG);
            TERMINATION.request(signum);
        }
        libc::SIGPIPE => write_stderr(SIGPIPE_MSG),
        _ => {}
    }
    saved.restore();
}

/// Unbuffered write to fd 2; the only output allowed in signal context.
fn write_stderr(msg: &[u8]) {
    // SAFETY: write(2) is async-signal-safe and `msg` is a static byte string.
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
    }
}

/// errno of the interrupted thread, preserved across the handler.
struct Errno(libc::c_int);

impl Errno {
    fn save() -> Self {
        // SAFETY: the errno location is thread-local and always valid.
        Errno(unsafe { *errno_location() })
    }

    fn restore(self) {
        // SAFETY: as above.
        unsafe { *errno_location() = self.0 }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

/// Install handlers for SIGINT, SIGTERM and SIGPIPE.
///
/// SIGINT and SIGTERM request termination; the first one wins. SIGPIPE is
/// reported and otherwise ignored so a vanished peer never kills the process.
pub fn install_signal_handlers() -> io::Result<()> {
    for signum in [libc::SIGINT, libc::SIGTERM, libc::SIGPIPE] {
        // SAFETY: a zeroed sigaction is a valid starting value; the handler only
        // performs async-signal-safe operations.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = 0;

            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Block until no handlers are live.
///
/// Polls the live count every `interval`, logging progress. With
/// `limit = None` this waits indefinitely; otherwise it gives up once `limit`
/// has elapsed and returns `false`.
///
/// Must only run after the acceptor has returned, or the count could rise
/// again after reaching zero.
pub fn drain_and_wait(tracker: &WorkerTracker, interval: Duration, limit: Option<Duration>) -> bool {
    let start = Instant::now();

    loop {
        let live = tracker.live();
        if live == 0 {
            info!("All clients disconnected");
            return true;
        }

        let remaining = match limit {
            Some(limit) => match limit.checked_sub(start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => Some(remaining),
                _ => {
                    error!(live, ?limit, "Drain timed out with clients still connected");
                    return false;
                }
            },
            None => None,
        };

        info!(live, "Waiting for clients to disconnect");
        thread::sleep(remaining.map_or(interval, |r| r.min(interval)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;

    #[test]
    fn test_first_request_wins() {
        let termination = Termination::new();
        assert!(!termination.is_requested());
        assert_eq!(termination.signal(), None);

        assert!(termination.request(libc::SIGTERM));
        assert!(!termination.request(libc::SIGINT));

        assert!(termination.is_requested());
        assert_eq!(termination.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn test_request_wakes_blocked_accept() {
        let termination = Arc::new(Termination::new());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let acceptor = {
            let termination = Arc::clone(&termination);
            thread::spawn(move || {
                let _armed = termination.arm(&listener);
                if termination.is_requested() {
                    return true;
                }
                listener.accept().is_err()
            })
        };

        thread::sleep(Duration::from_millis(100));
        termination.request(libc::SIGINT);
        assert!(acceptor.join().unwrap());
    }

    // The only test that touches the process-wide flag.
    #[test]
    fn test_signal_handlers_set_process_flag() {
        install_signal_handlers().unwrap();

        // SAFETY: raise(3) delivers to this thread; the handlers are installed.
        unsafe {
            assert_eq!(libc::raise(libc::SIGPIPE), 0);
        }
        assert!(!TERMINATION.is_requested());

        // SAFETY: as above.
        unsafe {
            assert_eq!(libc::raise(libc::SIGTERM), 0);
            assert_eq!(libc::raise(libc::SIGINT), 0);
        }
        assert!(TERMINATION.is_requested());
        assert_eq!(TERMINATION.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn test_disarm_on_drop() {
        let termination = Termination::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        drop(termination.arm(&listener));

        // Disarmed: the listener keeps listening after the request.
        termination.request(libc::SIGTERM);
        let addr = listener.local_addr().unwrap();
        assert!(std::net::TcpStream::connect(addr).is_ok());
        assert!(listener.accept().is_ok());
    }

    #[test]
    fn test_drain_returns_once_idle() {
        let tracker = Arc::new(WorkerTracker::new(8));
        assert!(drain_and_wait(&tracker, Duration::from_millis(10), None));

        let guard = tracker.enter();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            drop(guard);
        });

        let start = Instant::now();
        assert!(drain_and_wait(&tracker, Duration::from_millis(10), None));
        assert!(start.elapsed() >= Duration::from_millis(50));
        releaser.join().unwrap();
    }

    #[test]
    fn test_drain_limit() {
        let tracker = Arc::new(WorkerTracker::new(8));
        let _guard = tracker.enter();

        let start = Instant::now();
        assert!(!drain_and_wait(
            &tracker,
            Duration::from_millis(20),
            Some(Duration::from_millis(100))
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(tracker.live(), 1);
    }
}
