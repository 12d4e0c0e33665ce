//! TCP server: accept loop and shutdown sequencing.
//!
//! `serve` runs the accept loop on the calling thread until termination is
//! requested, releases the listener, and then drains: it returns only after
//! every connection handler has finished.

use crate::config::Config;
use crate::protocols::{EchoService, Service};
use crate::runtime::{
    any_addr, bind_listener, drain_and_wait, handle_connection, spawn, Connection,
    HandlerSettings, Termination, WorkerTracker,
};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause after accept fails for lack of descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Server instance
pub struct Server<F> {
    config: Config,
    tracker: Arc<WorkerTracker>,
    new_service: F,
    drain_interval: Duration,
}

impl<F, S> Server<F>
where
    F: Fn() -> S,
    S: Service + Send + 'static,
{
    /// Create a server that builds one service per accepted connection.
    pub fn new(config: Config, new_service: F) -> Self {
        Server {
            tracker: Arc::new(WorkerTracker::new(config.max_clients)),
            drain_interval: config.drain_poll(),
            config,
            new_service,
        }
    }

    /// Bind the listening socket described by the configuration.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        if self.config.enable_udp {
            return Err(ServerError::UnsupportedTransport);
        }

        let addr = any_addr(self.config.port, self.config.enable_ipv6);
        let listener = bind_listener(addr, self.config.max_backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(
            addr = %addr,
            ip_version = if addr.is_ipv6() { "IPv6" } else { "IPv4" },
            transport = "TCP",
            backlog = self.config.max_backlog,
            "Server listening"
        );
        Ok(listener)
    }

    /// Accept connections until termination, then wait for handlers to finish.
    pub fn serve(&self, listener: TcpListener, termination: &Termination) -> Result<(), ServerError> {
        self.accept_loop(&listener, termination);
        drop(listener);

        if let Some(signal) = termination.signal() {
            info!(signal, "Terminated by signal");
        }

        if drain_and_wait(&self.tracker, self.drain_interval, self.config.drain_limit()) {
            info!("Server shut down gracefully");
            Ok(())
        } else {
            Err(ServerError::DrainTimedOut {
                live: self.tracker.live(),
            })
        }
    }

    /// Hand each accepted connection to its own worker until termination.
    ///
    /// Returns once the flag is observed; no accept happens afterwards.
    pub fn accept_loop(&self, listener: &TcpListener, termination: &Termination) {
        let _armed = termination.arm(listener);
        let settings = HandlerSettings {
            idle_timeout: self.config.idle_timeout(),
            io_timeout: self.config.io_timeout(),
        };
        let mut next_id: u64 = 0;

        info!("Accept loop started");

        while !termination.is_requested() {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if termination.is_requested() {
                        debug!(error = %e, "Accept woken by shutdown");
                        break;
                    }
                    warn!(error = %e, "Accept failed");
                    if is_resource_exhaustion(&e) {
                        thread::sleep(ACCEPT_BACKOFF);
                    }
                    continue;
                }
            };

            next_id += 1;
            let conn = Connection::new(next_id, stream, peer);
            let service = (self.new_service)();

            match spawn(conn, &self.tracker, move |conn| {
                handle_connection(conn, service, settings)
            }) {
                Ok(()) => info!(
                    conn = next_id,
                    peer = %peer,
                    live = self.tracker.live(),
                    "Accepted new client connection"
                ),
                Err(e) => error!(
                    conn = next_id,
                    peer = %peer,
                    error = %e,
                    "Failed to start handler thread, connection closed"
                ),
            }
        }

        info!("Accept loop terminating, not accepting new connections");
    }

    /// Live-worker count shared with every handler.
    pub fn tracker(&self) -> &Arc<WorkerTracker> {
        &self.tracker
    }

    /// Override the drain poll interval.
    #[cfg(test)]
    fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Bind per the configuration and serve echo until terminated.
pub fn run(config: Config, termination: &Termination) -> Result<(), ServerError> {
    let server = Server::new(config, EchoService::new);
    let listener = server.bind()?;
    server.serve(listener, termination)
}

/// Server failures that end the process with a non-zero status.
#[derive(Debug)]
pub enum ServerError {
    /// UDP was requested; only TCP is served.
    UnsupportedTransport,
    Bind { addr: SocketAddr, source: io::Error },
    /// A bounded drain gave up with handlers still running.
    DrainTimedOut { live: usize },
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::UnsupportedTransport => {
                write!(f, "UDP is not supported by the threaded server")
            }
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to listen on {addr}: {source}")
            }
            ServerError::DrainTimedOut { live } => {
                write!(f, "Shutdown drain timed out with {live} clients still connected")
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}
