//! Client channel: one outbound connection driven by a worker pool.

use crate::completion::Completion;
use crate::compress;
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::frame::{FrameCodec, MessageCodec};
use crate::handler::ChannelHandler;
use crate::runtime::{ConnectionHandle, ConnectionId, WorkerPool};
use crate::server::{configure_stream, resolve};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extra time allowed on top of the close linger when waiting for the flush.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A connected, framed TCP client.
///
/// Replies arrive on the handler passed to [`ClientChannel::connect`], on the
/// worker thread that owns the connection.
pub struct ClientChannel {
    handle: ConnectionHandle,
    pool: WorkerPool,
    owns_pool: bool,
    closed: AtomicBool,
    close_timeout: Duration,
}

impl ClientChannel {
    /// Connect to `addr` on a private single-worker pool.
    ///
    /// Blocks until the connection is open, the connect fails, or the
    /// configured connect timeout passes.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        handler: Arc<dyn ChannelHandler>,
        config: ChannelConfig,
    ) -> Result<Self> {
        let pool = WorkerPool::new(&ChannelConfig {
            workers: 1,
            ..config.clone()
        })?;
        let result = Self::open(addr, handler, &config, &pool);
        match result {
            Ok(handle) => Ok(Self::new(handle, pool, true, &config)),
            Err(e) => {
                pool.shutdown();
                Err(e)
            }
        }
    }

    /// Connect to `addr` using a shared pool.
    pub fn connect_with_pool<A: ToSocketAddrs>(
        addr: A,
        handler: Arc<dyn ChannelHandler>,
        config: ChannelConfig,
        pool: &WorkerPool,
    ) -> Result<Self> {
        config.validate()?;
        let handle = Self::open(addr, handler, &config, pool)?;
        Ok(Self::new(handle, pool.clone(), false, &config))
    }

    fn new(
        handle: ConnectionHandle,
        pool: WorkerPool,
        owns_pool: bool,
        config: &ChannelConfig,
    ) -> Self {
        Self {
            handle,
            pool,
            owns_pool,
            closed: AtomicBool::new(false),
            close_timeout: config.close_linger() + CLOSE_GRACE,
        }
    }

    fn open<A: ToSocketAddrs>(
        addr: A,
        handler: Arc<dyn ChannelHandler>,
        config: &ChannelConfig,
        pool: &WorkerPool,
    ) -> Result<ConnectionHandle> {
        let addr = resolve(addr)?;
        let stream = start_connect(addr)?;
        if let Err(e) = configure_stream(&stream, config) {
            warn!(addr = %addr, error = %e, "Failed to configure client stream");
        }

        let codec = MessageCodec::new(
            FrameCodec::new(config.max_frame_size),
            compress::from_config(config),
        );
        let (handle, connected) = pool.register(stream, addr, handler, codec, None, true)?;
        let Some(connected) = connected else {
            return Ok(handle);
        };

        match connected.wait_timeout(config.connect_timeout()) {
            Some(Ok(())) => {
                info!(conn = %handle.id(), addr = %addr, worker = handle.worker(), "Connected");
                Ok(handle)
            }
            Some(Err(ChannelError::Connect(msg))) => Err(ChannelError::Connect(msg)),
            Some(Err(e)) => Err(ChannelError::Connect(e.to_string())),
            None => {
                handle.close();
                Err(ChannelError::Connect(format!(
                    "timed out connecting to {addr} after {:?}",
                    config.connect_timeout()
                )))
            }
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.handle.is_closed()
    }

    /// Frame `payload` and queue it. See [`ConnectionHandle::send`].
    pub fn send(&self, payload: &[u8]) -> Result<Completion<()>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.handle.send(payload)
    }

    /// Flush queued frames (bounded by the close linger), close the
    /// connection and release the pool if this channel owns it. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let done = self.handle.close();
        let result = match done.wait_timeout(self.close_timeout) {
            Some(_) => Ok(()),
            None => Err(ChannelError::from(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out closing connection",
            ))),
        };
        if self.owns_pool {
            self.pool.shutdown();
        }
        debug!(conn = %self.handle.id(), "Client closed");
        result
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(conn = %self.handle.id(), error = %e, "Error closing client");
        }
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("handle", &self.handle)
            .field("owns_pool", &self.owns_pool)
            .finish()
    }
}

/// Begin a non-blocking connect to `addr`.
fn start_connect(addr: SocketAddr) -> Result<mio::net::TcpStream> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_nonblocking(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(ChannelError::Connect(format!("connect {addr}: {e}"))),
    }

    let stream: std::net::TcpStream = socket.into();
    Ok(mio::net::TcpStream::from_std(stream))
}
