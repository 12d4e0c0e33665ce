//! threaded-server: a thread-per-connection TCP server
//!
//! Accepts connections on one listening socket and serves each on its own
//! detached thread. On SIGINT/SIGTERM it stops accepting, then waits for
//! every in-flight connection to finish before exiting.
//!
//! Features:
//! - Deadline-bounded, short-transfer-safe `send_all`/`recv_all`
//! - Live-worker accounting that survives spawn failures and panics
//! - Signal-safe termination flag that wakes a blocked `accept`
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod logging;
pub mod protocols;
pub mod runtime;
pub mod server;
