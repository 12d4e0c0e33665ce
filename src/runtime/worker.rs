//! Worker lifecycle: one detached thread per accepted connection.
//!
//! Workers are never joined. Their completion is observable only through
//! [`WorkerTracker::live`], which the shutdown drain polls.
//!
//! The increment and decrement are carried by a [`WorkerGuard`]: it is
//! created before the thread starts and moved into it alongside the
//! connection. Whichever way the worker ends (normal return, panic, or the
//! thread never starting at all) the guard is dropped exactly once.

use crate::runtime::Connection;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Process-wide count of live connection workers.
#[derive(Debug)]
pub struct WorkerTracker {
    live: AtomicUsize,
    /// Advisory only: exceeding it is logged, never refused.
    max_clients: usize,
}

impl WorkerTracker {
    pub fn new(max_clients: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            max_clients,
        }
    }

    /// Number of workers between spawn and close.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Count a new worker. The count drops again when the guard does.
    pub fn enter(self: &Arc<Self>) -> WorkerGuard {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        if live > self.max_clients {
            warn!(
                live,
                max_clients = self.max_clients,
                "Live clients exceed max_clients (advisory, still serving)"
            );
        }
        WorkerGuard {
            tracker: Arc::clone(self),
        }
    }
}

/// One unit of the live-worker count.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the worker slot"]
pub struct WorkerGuard {
    tracker: Arc<WorkerTracker>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let prev = self.tracker.live.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "live-worker count underflow");
    }
}

/// Run `body` on a new detached thread that owns `conn`.
///
/// The worker is counted before the thread starts. On error the thread was
/// never created: `conn` has already been closed and the count rolled back,
/// and the caller only needs to report it.
pub fn spawn<F>(conn: Connection, tracker: &Arc<WorkerTracker>, body: F) -> io::Result<()>
where
    F: FnOnce(Connection) + Send + 'static,
{
    let guard = tracker.enter();

    thread::Builder::new()
        .name(format!("conn-{}", conn.id()))
        .spawn(move || {
            let _guard = guard;
            body(conn);
        })?;

    Ok(())
}
