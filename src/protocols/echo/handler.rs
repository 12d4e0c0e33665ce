//! Echo service implementation.

use bytes::BytesMut;
use tracing::trace;

use crate::protocols::{Service, Step};

/// Echoes each request back to the client.
#[derive(Debug, Default)]
pub struct EchoService {
    echoed: u64,
}

impl EchoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes echoed on this connection.
    pub fn echoed(&self) -> u64 {
        self.echoed
    }
}

impl Service for EchoService {
    fn process(&mut self, request: &[u8], response: &mut BytesMut) -> Step {
        if is_quit(request) {
            response.extend_from_slice(b"OK\r\n");
            return Step::Close;
        }

        trace!(message = %String::from_utf8_lossy(request), "Echoing message");
        response.extend_from_slice(request);
        self.echoed += request.len() as u64;
        Step::Continue
    }
}

/// `QUIT` on a line of its own.
fn is_quit(request: &[u8]) -> bool {
    let line = request
        .strip_suffix(b"\r\n")
        .or_else(|| request.strip_suffix(b"\n"));
    matches!(line, Some(line) if line.eq_ignore_ascii_case(b"QUIT"))
}
