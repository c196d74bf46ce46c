//! Echo service.
//!
//! Every frame a peer sends is written back to it unchanged, on the same
//! connection and in the same order. Useful for throughput testing and as
//! the server side of request/response tests: a request carrying an id comes
//! back carrying the same id.

pub mod handler;

pub use handler::EchoHandler;
