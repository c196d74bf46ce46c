//! Error taxonomy for channels and connections.
//!
//! Errors are cheap to clone so a single connection failure can settle every
//! pending completion that depended on it.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by channels, connections and codecs.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// Transport-level connect or accept failure.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Declared frame length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// Payload could not be compressed or decompressed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Generic read/write failure.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Operation attempted on, or interrupted by, a closed channel.
    #[error("channel closed")]
    Closed,

    /// A request with this id is already awaiting its reply.
    #[error("request {0} is already in flight")]
    RequestInFlight(u64),

    /// Invalid channel configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ChannelError {
    /// Whether this error means the channel was closed rather than broken.
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(Arc::new(e))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_cloneable() {
        let err: ChannelError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        let copy = err.clone();
        assert!(matches!(copy, ChannelError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert_eq!(err.to_string(), "I/O error: pipe");
    }

    #[test]
    fn test_display() {
        let err = ChannelError::FrameTooLarge { len: 10, max: 4 };
        assert_eq!(err.to_string(), "frame of 10 bytes exceeds maximum of 4 bytes");
        assert!(ChannelError::Closed.is_closed());
        assert!(!err.is_closed());
    }
}
