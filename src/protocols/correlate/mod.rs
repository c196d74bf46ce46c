//! Request/response correlation.
//!
//! A request frame is the request id (`u32`, big-endian) followed by the
//! body. The reply carries the same id. Replies may arrive in any order and
//! on any worker; each one settles the pending request with its id.
//!
//! ```text
//! +----------------+-----------------+
//! | id: u32 BE     | body            |
//! +----------------+-----------------+
//! ```
//!
//! When a connection goes away, every request it still owes a reply for
//! fails with `ChannelError::Closed`.

pub mod handler;
pub mod parser;

pub use handler::RequestCorrelator;
