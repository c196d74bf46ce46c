//! Server channel: a listening socket plus the connections it accepted.
//!
//! A dedicated acceptor thread polls the listener and hands every accepted
//! stream to the worker pool, which pins it to the least-loaded worker.

use crate::compress;
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::frame::{FrameCodec, MessageCodec};
use crate::handler::HandlerFactory;
use crate::runtime::{wait_all, GroupId, WorkerPool, LISTENER_TOKEN, WAKER_TOKEN};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Waker};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Extra time allowed on top of the close linger when waiting for workers.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct Acceptor {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: JoinHandle<()>,
}

/// Listening channel. Accepted connections share the handlers supplied by
/// its [`HandlerFactory`].
pub struct ServerChannel {
    local_addr: SocketAddr,
    pool: WorkerPool,
    owns_pool: bool,
    group: GroupId,
    acceptor: Mutex<Option<Acceptor>>,
    closed: AtomicBool,
    close_timeout: Duration,
}

impl ServerChannel {
    /// Bind to `addr` and serve on a new pool of `config.worker_count()`
    /// workers, owned by this channel.
    pub fn bind<A, F>(addr: A, factory: F, config: ChannelConfig) -> Result<Self>
    where
        A: ToSocketAddrs,
        F: HandlerFactory,
    {
        let pool = WorkerPool::new(&config)?;
        Self::start(addr, factory, config, pool, true)
    }

    /// Bind to `addr` and serve on an existing, shared pool.
    pub fn bind_with_pool<A, F>(
        addr: A,
        factory: F,
        config: ChannelConfig,
        pool: &WorkerPool,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
        F: HandlerFactory,
    {
        config.validate()?;
        Self::start(addr, factory, config, pool.clone(), false)
    }

    fn start<A, F>(
        addr: A,
        factory: F,
        config: ChannelConfig,
        pool: WorkerPool,
        owns_pool: bool,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
        F: HandlerFactory,
    {
        let result = Self::spawn_acceptor(addr, factory, &config, &pool);
        let (local_addr, group, acceptor) = match result {
            Ok(started) => started,
            Err(e) => {
                if owns_pool {
                    pool.shutdown();
                }
                return Err(e);
            }
        };

        info!(addr = %local_addr, workers = pool.worker_count(), "Server listening");
        Ok(Self {
            local_addr,
            pool,
            owns_pool,
            group,
            acceptor: Mutex::new(Some(acceptor)),
            closed: AtomicBool::new(false),
            close_timeout: config.close_linger() + CLOSE_GRACE,
        })
    }

    fn spawn_acceptor<A, F>(
        addr: A,
        factory: F,
        config: &ChannelConfig,
        pool: &WorkerPool,
    ) -> Result<(SocketAddr, GroupId, Acceptor)>
    where
        A: ToSocketAddrs,
        F: HandlerFactory,
    {
        let addr = resolve(addr)?;
        let listener = create_listener(addr, config)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let stop = Arc::new(AtomicBool::new(false));
        let group = GroupId::next();

        let codec = MessageCodec::new(
            FrameCodec::new(config.max_frame_size),
            compress::from_config(config),
        );
        let accept = AcceptLoop {
            poll,
            listener,
            factory,
            pool: pool.clone(),
            codec,
            group,
            stop: Arc::clone(&stop),
            config: config.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("wirechan-accept-{}", local_addr.port()))
            .spawn(move || accept.run())?;

        Ok((local_addr, group, Acceptor { stop, waker, thread }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live connections accepted by this server.
    pub fn connection_count(&self) -> usize {
        self.pool.group_count(self.group)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting, close the listener, then close every accepted
    /// connection (flushing queued frames within the close linger). Shuts
    /// down the pool if this channel created it. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(acceptor) = self.acceptor.lock().take() {
            acceptor.stop.store(true, Ordering::Release);
            if let Err(e) = acceptor.waker.wake() {
                warn!(error = %e, "Failed to wake acceptor");
            }
            if acceptor.thread.thread().id() != thread::current().id()
                && acceptor.thread.join().is_err()
            {
                warn!("Acceptor thread panicked");
            }
        }

        let waits = self.pool.close_group(self.group);
        if !wait_all(&waits, self.close_timeout) {
            warn!(addr = %self.local_addr, "Timed out closing server connections");
        }
        if self.owns_pool {
            self.pool.shutdown();
        }
        info!(addr = %self.local_addr, "Server closed");
    }
}

impl Drop for ServerChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerChannel")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .field("pool", &self.pool)
            .finish()
    }
}

struct AcceptLoop<F> {
    poll: Poll,
    listener: TcpListener,
    factory: F,
    pool: WorkerPool,
    codec: MessageCodec,
    group: GroupId,
    stop: Arc<AtomicBool>,
    config: ChannelConfig,
}

impl<F: HandlerFactory> AcceptLoop<F> {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Acceptor poll failed");
                return;
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_connections();
                }
            }
        }
        debug!("Acceptor stopped");
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = configure_stream(&stream, &self.config) {
                        warn!(peer = %peer, error = %e, "Failed to configure accepted stream");
                    }
                    let handler = self.factory.new_handler(peer);
                    match self.pool.register(
                        stream,
                        peer,
                        handler,
                        self.codec.clone(),
                        Some(self.group),
                        false,
                    ) {
                        Ok((handle, _)) => {
                            debug!(conn = %handle.id(), peer = %peer, "Accepted connection")
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Rejected connection"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = ChannelError::Connect(e.to_string());
                    error!(error = %err, "Accept error");
                    break;
                }
            }
        }
    }
}

pub(crate) fn resolve<A: ToSocketAddrs>(addr: A) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| ChannelError::Connect(format!("resolve address: {e}")))?
        .next()
        .ok_or_else(|| ChannelError::Connect("address resolved to nothing".into()))
}

/// Apply per-stream socket options from `config`.
pub(crate) fn configure_stream(
    stream: &mio::net::TcpStream,
    config: &ChannelConfig,
) -> io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    if let Some(size) = config.socket_buffer_size {
        let sock = socket2::SockRef::from(stream);
        sock.set_recv_buffer_size(size)?;
        sock.set_send_buffer_size(size)?;
    }
    Ok(())
}

/// Create a non-blocking listening socket.
fn create_listener(addr: SocketAddr, config: &ChannelConfig) -> Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if let Some(size) = config.socket_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket
        .bind(&addr.into())
        .map_err(|e| ChannelError::Connect(format!("bind {addr}: {e}")))?;
    socket.listen(config.listen_backlog)?;

    Ok(socket.into())
}
