//! Thread-per-connection runtime.
//!
//! - `transport`: deadline-bounded `send_all`/`recv_all` over one connection
//! - `connection`: connection handle and the per-connection handler loop
//! - `worker`: detached worker threads and the live-worker count
//! - `shutdown`: termination flag, signal handlers, and the drain
//! - `listener`: listening socket setup

mod connection;
mod listener;
mod shutdown;
pub mod transport;
mod worker;

pub use connection::{handle_connection, ConnState, Connection, HandlerSettings, READ_BUFFER_SIZE};
pub use listener::{any_addr, bind_listener};
pub use shutdown::{drain_and_wait, install_signal_handlers, Armed, Termination, TERMINATION};
pub use worker::{spawn, WorkerGuard, WorkerTracker};
