//! Echo service.
//!
//! Stand-in application logic for exercising the connection lifecycle:
//! every received chunk is written back unchanged.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  hello
//! Response: hello
//!
//! Request:  QUIT\r\n
//! Response: OK\r\n        (then the server closes the connection)
//! ```

pub mod handler;

pub use handler::EchoService;
