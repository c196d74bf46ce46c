//! Echo handler.

use crate::handler::ChannelHandler;
use crate::runtime::ConnectionHandle;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Replies to each frame with the same payload.
#[derive(Debug, Default)]
pub struct EchoHandler {
    echoed: AtomicU64,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames echoed so far, across all connections.
    pub fn echoed(&self) -> u64 {
        self.echoed.load(Ordering::Relaxed)
    }
}

impl ChannelHandler for EchoHandler {
    fn on_open(&self, conn: &ConnectionHandle) {
        trace!(conn = %conn.id(), peer = %conn.peer_addr(), "Echo connection open");
    }

    fn on_message(&self, conn: &ConnectionHandle, payload: Bytes) {
        match conn.send(&payload) {
            Ok(_) => {
                self.echoed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => debug!(conn = %conn.id(), error = %e, "Dropping echo"),
        }
    }

    fn on_close(&self, conn: &ConnectionHandle) {
        trace!(conn = %conn.id(), "Echo connection closed");
    }
}
