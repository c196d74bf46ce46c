//! Correlating handler.

use super::parser::{self, ParseResult};
use crate::completion::Completion;
use crate::error::{ChannelError, Result};
use crate::handler::ChannelHandler;
use crate::metrics::Counter;
use crate::registry::PendingRegistry;
use crate::runtime::ConnectionHandle;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Client-side handler that matches replies to outstanding requests.
///
/// One correlator may be shared by several client connections; ids are
/// unique across all of them, and a closing connection only fails the
/// requests it sent.
pub struct RequestCorrelator {
    pending: Arc<PendingRegistry<u32, Bytes>>,
    unmatched: AtomicU64,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(PendingRegistry::new()),
            unmatched: AtomicU64::new(0),
        }
    }

    /// Track outstanding requests in `counter`.
    pub fn with_counter(counter: Arc<dyn Counter>) -> Self {
        Self {
            pending: Arc::new(PendingRegistry::new().with_counter(counter)),
            unmatched: AtomicU64::new(0),
        }
    }

    /// Send `body` as request `id` on `conn`.
    ///
    /// The completion settles with the reply body, or with an error if the
    /// frame could not be written or `conn` closed first. Fails
    /// synchronously if `id` is already in flight or the send is rejected.
    pub fn request(
        &self,
        conn: &ConnectionHandle,
        id: u32,
        body: &[u8],
    ) -> Result<Completion<Bytes>> {
        let reply = self
            .pending
            .register(id, Some(conn.id()))
            .ok_or(ChannelError::RequestInFlight(u64::from(id)))?;

        match conn.send(&parser::encode(id, body)) {
            Ok(sent) => {
                let pending = Arc::clone(&self.pending);
                sent.on_complete(move |result| {
                    if let Err(e) = result {
                        pending.fail(id, e.clone());
                    }
                });
                Ok(reply)
            }
            Err(e) => {
                self.pending.fail(id, e.clone());
                Err(e)
            }
        }
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Replies that matched no outstanding request.
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHandler for RequestCorrelator {
    fn on_message(&self, conn: &ConnectionHandle, payload: Bytes) {
        match parser::parse(payload) {
            ParseResult::Complete { id, body } => {
                if !self.pending.fulfill(id, body) {
                    self.unmatched.fetch_add(1, Ordering::Relaxed);
                    debug!(conn = %conn.id(), id, "Reply for unknown request");
                }
            }
            ParseResult::TooShort => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                warn!(conn = %conn.id(), "Reply too short for a request id");
            }
        }
    }

    fn on_close(&self, conn: &ConnectionHandle) {
        let failed = self.pending.fail_owned_by(conn.id(), &ChannelError::Closed);
        if failed > 0 {
            debug!(conn = %conn.id(), failed, "Failed outstanding requests");
        }
    }
}
