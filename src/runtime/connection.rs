//! Connection state machine for a single accepted TCP connection.
//!
//! A `Connection` is owned by exactly one handler thread for its whole
//! life. The handler drives it through `Active` (receive, process, send)
//! until the peer closes, an I/O step fails, or the service ends the
//! session, then releases it by consuming it in [`Connection::close`].

use crate::protocols::{Service, Step};
use crate::runtime::transport::{recv_some, send_all, TransportError};
use bytes::BytesMut;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, info, info_span, trace, warn};

/// Size of the per-connection receive buffer.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Exchanging requests and responses.
    Active,
    /// Finished; waiting to be released.
    Closing,
    /// Socket shut down and descriptor released.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    stream: TcpStream,
    /// Peer address, copied at accept time.
    peer: SocketAddr,
    state: ConnState,
    bytes_in: u64,
    bytes_out: u64,
}

impl Connection {
    /// Wrap a freshly accepted stream.
    pub fn new(id: u64, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            stream,
            peer,
            state: ConnState::Active,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Mark the connection finished. No further I/O is attempted.
    pub fn start_closing(&mut self) {
        if self.state == ConnState::Active {
            self.state = ConnState::Closing;
        }
    }

    /// Shut the socket down and release it.
    ///
    /// Consumes the connection, so it can only happen once.
    pub fn close(mut self) -> ConnState {
        self.start_closing();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!(conn = self.id, error = %e, "Socket shutdown failed");
        }
        self.state = ConnState::Closed;
        debug!(
            conn = self.id,
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            "Connection closed"
        );
        self.state
    }
}

/// Timeouts a handler applies to its connection.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    /// How long to wait for the next request. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Readiness bound while sending a response.
    pub io_timeout: Option<Duration>,
}

/// Serve `conn` with `service` until the session ends, then release it.
pub fn handle_connection<S: Service>(mut conn: Connection, mut service: S, settings: HandlerSettings) {
    let span = info_span!("conn", id = conn.id, peer = %conn.peer);
    let _enter = span.enter();

    info!("Client handler started");

    let mut request = BytesMut::zeroed(READ_BUFFER_SIZE);
    let mut response = BytesMut::with_capacity(READ_BUFFER_SIZE);

    while conn.state == ConnState::Active {
        exchange(&mut conn, &mut service, &mut request, &mut response, &settings);
    }

    conn.close();
    info!("Client handler finished");
}

/// One receive, process, send round. Moves `conn` to `Closing` when the
/// session cannot continue.
fn exchange<S: Service>(
    conn: &mut Connection,
    service: &mut S,
    request: &mut BytesMut,
    response: &mut BytesMut,
    settings: &HandlerSettings,
) {
    let n = match recv_some(&mut conn.stream, &mut request[..], settings.idle_timeout) {
        Ok(0) => {
            debug!("Client disconnected");
            conn.start_closing();
            return;
        }
        Ok(n) => n,
        Err(TransportError::TimedOut) => {
            warn!(timeout = ?settings.idle_timeout, "Client idle too long");
            conn.start_closing();
            return;
        }
        Err(e) => {
            warn!(error = %e, "Receive failed");
            conn.start_closing();
            return;
        }
    };
    conn.bytes_in += n as u64;
    trace!(bytes = n, "Received request");

    response.clear();
    let step = service.process(&request[..n], response);

    if !response.is_empty() {
        match send_all(&mut conn.stream, &response[..], settings.io_timeout) {
            Ok(sent) => {
                conn.bytes_out += sent as u64;
                trace!(bytes = sent, "Sent response");
            }
            Err(e) => {
                warn!(error = %e, expected = response.len(), "Send failed");
                conn.start_closing();
                return;
            }
        }
    }

    if step == Step::Close {
        debug!("Session ended by service");
        conn.start_closing();
    }
}
