//! wirechan: non-blocking length-framed TCP channels
//!
//! Messages travel as frames: a 4-byte big-endian length followed by that
//! many payload bytes, optionally compressed. Sockets are driven by a fixed
//! pool of mio workers; every connection is pinned to one worker, and all
//! of its reads, writes and handler callbacks happen on that worker.
//!
//! - [`ServerChannel`] accepts connections and gives each one a handler
//! - [`ClientChannel`] owns a single outbound connection
//! - [`ConnectionHandle::send`] queues a frame and returns a [`Completion`]
//! - [`PendingRegistry`] matches asynchronous replies to requests

pub mod client;
pub mod completion;
pub mod compress;
pub mod config;
pub mod error;
pub mod frame;
pub mod handler;
pub mod metrics;
pub mod protocols;
pub mod registry;
pub mod runtime;
pub mod server;

pub use client::ClientChannel;
pub use completion::{Completion, Promise};
pub use compress::{Compressor, ZstdCompressor};
pub use config::{ChannelConfig, CompressorKind};
pub use error::{ChannelError, Result};
pub use frame::{FrameCodec, MessageCodec};
pub use handler::{ChannelHandler, HandlerFactory, SharedHandler};
pub use metrics::{AtomicCounter, Counter};
pub use registry::PendingRegistry;
pub use runtime::{ConnState, ConnectionHandle, ConnectionId, WorkerPool};
pub use server::ServerChannel;
