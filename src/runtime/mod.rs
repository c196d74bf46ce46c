//! Non-blocking I/O runtime.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS):
//! - `WorkerPool`: fixed set of worker threads, one poll loop each
//! - `Connection`: per-stream state machine, read buffer and write queue
//! - `ConnectionHandle`: thread-safe access to a connection from outside
//!   its worker
//! - `ConnectionId`: stable identity across slab key reuse

mod buffer;
mod connection;
mod event_loop;
mod pool;
mod token;

pub use connection::{ConnState, ConnectionHandle};
pub use pool::WorkerPool;
pub use token::ConnectionId;

pub(crate) use pool::wait_all;
pub(crate) use token::{GroupId, LISTENER_TOKEN, WAKER_TOKEN};
