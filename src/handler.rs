//! Handler contract between the engine and application logic.
//!
//! For any one connection the engine calls its handler from a single worker
//! thread only, never concurrently, delivers each decoded frame exactly once
//! and in arrival order, and always ends with `on_close` (preceded by
//! `on_error` when the connection failed).
//!
//! Callbacks run on the I/O worker: they must not block, and in particular
//! must not wait on a completion that the same worker has to settle.

use crate::error::ChannelError;
use crate::runtime::ConnectionHandle;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

pub trait ChannelHandler: Send + Sync + 'static {
    /// The connection reached OPEN.
    fn on_open(&self, _conn: &ConnectionHandle) {}

    /// One fully assembled, decoded frame payload.
    fn on_message(&self, conn: &ConnectionHandle, payload: Bytes);

    /// The connection failed; `on_close` follows.
    fn on_error(&self, _conn: &ConnectionHandle, _cause: &ChannelError) {}

    /// The connection is gone. Called exactly once.
    fn on_close(&self, _conn: &ConnectionHandle) {}
}

impl<F> ChannelHandler for F
where
    F: Fn(&ConnectionHandle, Bytes) + Send + Sync + 'static,
{
    fn on_message(&self, conn: &ConnectionHandle, payload: Bytes) {
        self(conn, payload)
    }
}

/// Supplies a handler for every accepted connection.
pub trait HandlerFactory: Send + Sync + 'static {
    fn new_handler(&self, peer: SocketAddr) -> Arc<dyn ChannelHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(SocketAddr) -> Arc<dyn ChannelHandler> + Send + Sync + 'static,
{
    fn new_handler(&self, peer: SocketAddr) -> Arc<dyn ChannelHandler> {
        self(peer)
    }
}

/// One handler instance shared by every connection.
#[derive(Clone)]
pub struct SharedHandler(Arc<dyn ChannelHandler>);

impl SharedHandler {
    pub fn new<H: ChannelHandler>(handler: Arc<H>) -> Self {
        Self(handler)
    }
}

impl HandlerFactory for SharedHandler {
    fn new_handler(&self, _peer: SocketAddr) -> Arc<dyn ChannelHandler> {
        Arc::clone(&self.0)
    }
}
