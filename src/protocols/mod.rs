//! Handlers built on the channel engine.
//!
//! - `echo`: writes every received frame back to its sender
//! - `correlate`: request/response matching keyed by a 4-byte request id

pub mod correlate;
pub mod echo;

pub use correlate::RequestCorrelator;
pub use echo::EchoHandler;
