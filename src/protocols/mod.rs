//! Application services run by connection handlers.
//!
//! A handler owns the transport; a service only sees request bytes and
//! fills a response buffer. The handler sends whatever the service wrote,
//! then honours the returned [`Step`].
//!
//! - `echo`: placeholder service that returns each request unchanged

pub mod echo;

use bytes::BytesMut;

pub use echo::EchoService;

/// What the handler does after sending the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Wait for the next request.
    Continue,
    /// End the session and close the connection.
    Close,
}

/// Per-connection application logic.
///
/// One instance is created per accepted connection and moved into that
/// connection's worker thread, so implementations may keep session state
/// without synchronization.
pub trait Service {
    /// Handle one received chunk. An empty `response` sends nothing.
    fn process(&mut self, request: &[u8], response: &mut BytesMut) -> Step;
}
