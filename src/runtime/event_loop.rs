//! mio event loop run by every I/O worker.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Each iteration does at most one
//! bounded read and one bounded write per ready connection. A connection
//! that may have more work than one bounded operation covers (a read that
//! returned data, a finished frame with more queued) goes on a backlog and is
//! revisited on the next iteration, after a zero-timeout poll, so one busy
//! socket cannot starve the others.
//!
//! Other threads never touch worker state directly. They submit
//! [`Command`]s through a channel and wake the poll instance.

use crate::completion::Promise;
use crate::error::ChannelError;
use crate::handler::ChannelHandler;
use crate::runtime::connection::{
    ConnState, Connection, ConnectionHandle, ReadOutcome, WriteOutcome,
};
use crate::runtime::pool::PoolShared;
use crate::runtime::token::{ConnectionId, GroupId, WAKER_TOKEN};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Work handed to a worker from other threads.
pub(crate) enum Command {
    /// Take ownership of a stream.
    Register {
        stream: TcpStream,
        handle: ConnectionHandle,
        handler: Arc<dyn ChannelHandler>,
        group: Option<GroupId>,
        /// Present for outbound connects still in progress.
        connected: Option<Promise<()>>,
    },
    /// Queue an encoded frame.
    Write {
        id: ConnectionId,
        frame: Bytes,
        promise: Promise<()>,
    },
    /// Flush then close one connection.
    Close {
        id: ConnectionId,
        done: Option<Promise<()>>,
    },
    /// Flush then close every connection in a group.
    CloseGroup { group: GroupId, done: Promise<()> },
    /// Close everything and exit the loop.
    Shutdown,
}

/// Sending side of a worker's command queue.
#[derive(Clone)]
pub(crate) struct WorkerLink {
    index: usize,
    tx: Sender<Command>,
    waker: Arc<Waker>,
}

impl WorkerLink {
    pub(crate) fn new(index: usize, tx: Sender<Command>, waker: Arc<Waker>) -> Self {
        Self { index, tx, waker }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Queue `command` and wake the worker. Hands the command back if the
    /// worker has exited.
    pub(crate) fn submit(&self, command: Command) -> Result<(), Command> {
        self.tx.send(command).map_err(|e| e.into_inner())?;
        if let Err(e) = self.waker.wake() {
            warn!(worker = self.index, error = %e, "Failed to wake worker");
        }
        Ok(())
    }
}

/// Readiness captured from one poll event.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    read_closed: bool,
    writable: bool,
    error: bool,
}

/// Per-worker tuning.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
    pub(crate) read_chunk: usize,
    pub(crate) events_capacity: usize,
    pub(crate) close_linger: Duration,
}

/// State owned by one worker thread.
pub(crate) struct Worker {
    index: usize,
    poll: Poll,
    events: Events,
    rx: Receiver<Command>,
    shared: Arc<PoolShared>,
    settings: WorkerSettings,
    connections: Slab<Connection>,
    /// ConnectionId -> slab key.
    keys: HashMap<ConnectionId, usize>,
    /// Connections to revisit next iteration.
    backlog: Vec<usize>,
    ready: Vec<Readiness>,
    group_waiters: Vec<(GroupId, Promise<()>)>,
    closing: usize,
    shutting_down: bool,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        poll: Poll,
        rx: Receiver<Command>,
        shared: Arc<PoolShared>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            index,
            poll,
            events: Events::with_capacity(settings.events_capacity),
            rx,
            shared,
            settings,
            connections: Slab::new(),
            keys: HashMap::new(),
            backlog: Vec::new(),
            ready: Vec::with_capacity(settings.events_capacity),
            group_waiters: Vec::new(),
            closing: 0,
            shutting_down: false,
        }
    }

    pub(crate) fn run(mut self) {
        info!(worker = self.index, "Worker started");

        loop {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.index, error = %e, "Poll failed");
                break;
            }

            // Work deferred by the previous iteration.
            let backlog = std::mem::take(&mut self.backlog);

            self.drain_commands();

            let mut ready = std::mem::take(&mut self.ready);
            ready.clear();
            ready.extend(self.events.iter().map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable(),
                read_closed: event.is_read_closed(),
                writable: event.is_writable(),
                error: event.is_error(),
            }));
            for r in &ready {
                if r.token != WAKER_TOKEN {
                    self.handle_event(r);
                }
            }
            self.ready = ready;

            for key in backlog {
                self.revisit(key);
            }

            if self.closing > 0 {
                self.expire_lingering(Instant::now());
            }
            self.notify_group_waiters();

            if self.shutting_down && self.connections.is_empty() {
                break;
            }
        }

        self.finish();
        info!(worker = self.index, "Worker stopped");
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.backlog.is_empty() {
            return Some(Duration::ZERO);
        }
        if self.closing == 0 {
            return None;
        }
        let now = Instant::now();
        self.connections
            .iter()
            .filter_map(|(_, conn)| match conn.state {
                ConnState::Closing { deadline } => Some(deadline.saturating_duration_since(now)),
                _ => None,
            })
            .min()
    }

    fn drain_commands(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(command) => self.apply(command),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register {
                stream,
                handle,
                handler,
                group,
                connected,
            } => self.register(stream, handle, handler, group, connected),
            Command::Write { id, frame, promise } => match self.keys.get(&id).copied() {
                Some(key) => self.enqueue(key, frame, promise),
                None => {
                    promise.fail(ChannelError::Closed);
                }
            },
            Command::Close { id, done } => match self.keys.get(&id).copied() {
                Some(key) => self.begin_close(key, done),
                None => {
                    if let Some(done) = done {
                        done.fulfill(());
                    }
                }
            },
            Command::CloseGroup { group, done } => {
                let keys: Vec<usize> = self
                    .connections
                    .iter()
                    .filter(|(_, c)| c.group == Some(group))
                    .map(|(key, _)| key)
                    .collect();
                debug!(worker = self.index, connections = keys.len(), "Closing group");
                for key in keys {
                    self.begin_close(key, None);
                }
                self.group_waiters.push((group, done));
            }
            Command::Shutdown => {
                self.shutting_down = true;
                let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
                debug!(worker = self.index, connections = keys.len(), "Shutting down");
                for key in keys {
                    self.begin_close(key, None);
                }
            }
        }
    }

    fn register(
        &mut self,
        mut stream: TcpStream,
        handle: ConnectionHandle,
        handler: Arc<dyn ChannelHandler>,
        group: Option<GroupId>,
        connected: Option<Promise<()>>,
    ) {
        let id = handle.id();
        if self.shutting_down {
            self.shared.unregister(id);
            handle.mark_closed();
            if let Some(p) = connected {
                p.fail(ChannelError::Closed);
            }
            return;
        }

        let state = if connected.is_some() {
            ConnState::Connecting
        } else {
            ConnState::Open
        };
        let interest = state.interest(false);

        let entry = self.connections.vacant_entry();
        let key = entry.key();
        if let Some(interest) = interest {
            if let Err(e) = self.poll.registry().register(&mut stream, Token(key), interest) {
                warn!(worker = self.index, conn = %id, error = %e, "Failed to register connection");
                self.shared.unregister(id);
                handle.mark_closed();
                if let Some(p) = connected {
                    p.fail(ChannelError::Connect(e.to_string()));
                }
                return;
            }
        }

        let mut conn = Connection::new(
            stream,
            state,
            handle,
            Arc::clone(&handler),
            group,
            self.settings.read_chunk,
        );
        conn.interest = interest;
        conn.connected = connected;
        entry.insert(conn);
        self.keys.insert(id, key);

        debug!(
            worker = self.index,
            conn = %id,
            peer = %self.connections[key].handle.peer_addr(),
            state = ?state,
            "Registered connection"
        );

        if state == ConnState::Open {
            let conn = &self.connections[key];
            handler.on_open(&conn.handle);
        }
    }

    fn enqueue(&mut self, key: usize, frame: Bytes, promise: Promise<()>) {
        let conn = &mut self.connections[key];
        if conn.state.is_terminal() {
            promise.fail(ChannelError::Closed);
            return;
        }
        trace!(conn = %conn.id(), len = frame.len(), "Queued frame");
        conn.enqueue(frame, promise);
        if conn.state == ConnState::Open {
            self.sync_interest(key);
        }
    }

    fn handle_event(&mut self, ready: &Readiness) {
        let key = ready.token.0;
        let Some(conn) = self.connections.get(key) else {
            return;
        };

        if conn.state == ConnState::Connecting {
            if ready.writable || ready.readable || ready.read_closed || ready.error {
                self.finish_connect(key);
            }
            return;
        }

        if ready.error {
            let err = match self.connections[key].stream.take_error() {
                Ok(Some(e)) | Err(e) => ChannelError::from(e),
                Ok(None) => ChannelError::from(io::Error::other("socket error")),
            };
            self.fail(key, err);
            return;
        }

        if ready.readable || ready.read_closed {
            self.on_readable(key);
        }
        // The FIN may have shared an edge with data; keep reading until EOF.
        if ready.read_closed
            && self
                .connections
                .get(key)
                .is_some_and(|c| c.state == ConnState::Open)
        {
            self.schedule(key, true, false);
        }
        if ready.writable && self.connections.contains(key) {
            self.on_writable(key);
        }
    }

    fn revisit(&mut self, key: usize) {
        let Some(conn) = self.connections.get_mut(key) else {
            return;
        };
        let (read, write) = (conn.revisit_read, conn.revisit_write);
        conn.revisit_read = false;
        conn.revisit_write = false;

        if read {
            self.on_readable(key);
        }
        if write && self.connections.contains(key) {
            self.on_writable(key);
        }
    }

    fn schedule(&mut self, key: usize, read: bool, write: bool) {
        let conn = &mut self.connections[key];
        let queued = conn.revisit_read || conn.revisit_write;
        conn.revisit_read |= read;
        conn.revisit_write |= write;
        if !queued {
            self.backlog.push(key);
        }
    }

    fn finish_connect(&mut self, key: usize) {
        let conn = &mut self.connections[key];
        match conn.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                self.fail(key, ChannelError::Connect(e.to_string()));
                return;
            }
        }
        match conn.stream.peer_addr() {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => return,
            Err(e) => {
                self.fail(key, ChannelError::Connect(e.to_string()));
                return;
            }
        }

        conn.state = ConnState::Open;
        debug!(worker = self.index, conn = %conn.id(), "Connected");
        if let Some(p) = conn.connected.take() {
            p.fulfill(());
        }
        conn.handler.on_open(&conn.handle);

        if conn.handle.is_closed() {
            // Closed while the connect was in flight.
            self.begin_close(key, None);
        } else {
            let has_writes = conn.has_pending_writes();
            self.sync_interest(key);
            // Data may already be waiting; the edge may have come with connect.
            if self.connections.contains(key) {
                self.schedule(key, true, has_writes);
            }
        }
    }

    fn on_readable(&mut self, key: usize) {
        let read_chunk = self.settings.read_chunk;
        let conn = &mut self.connections[key];
        if conn.state != ConnState::Open {
            return;
        }

        match conn.read_once(read_chunk) {
            Ok(ReadOutcome::Data { n }) => {
                trace!(conn = %conn.id(), n, buffered = conn.buffered_bytes(), "Read");
                if let Err(e) = conn.dispatch_frames() {
                    self.fail(key, e);
                    return;
                }
                // Edge-triggered: nothing else wakes us for data or a FIN
                // already sitting in the socket.
                if self.connections[key].state == ConnState::Open {
                    self.schedule(key, true, false);
                }
            }
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::Eof) => self.peer_closed(key),
            Err(e) => self.fail(key, e.into()),
        }
    }

    fn on_writable(&mut self, key: usize) {
        let conn = &mut self.connections[key];
        if !matches!(conn.state, ConnState::Open | ConnState::Closing { .. }) {
            return;
        }

        match conn.write_once() {
            Ok(WriteOutcome::Drained) => {
                if matches!(conn.state, ConnState::Closing { .. }) {
                    self.close_now(key);
                } else {
                    self.sync_interest(key);
                }
            }
            Ok(WriteOutcome::More) => self.schedule(key, false, true),
            Ok(WriteOutcome::Blocked) => {
                trace!(conn = %conn.id(), queued = conn.queued_bytes(), "Write blocked");
            }
            Err(e) => self.fail(key, e.into()),
        }
    }

    fn begin_close(&mut self, key: usize, done: Option<Promise<()>>) {
        let deadline = Instant::now() + self.settings.close_linger;
        let conn = &mut self.connections[key];
        conn.handle.mark_closed();
        if let Some(done) = done {
            conn.close_waiters.push(done);
        }

        let state = conn.state;
        match state {
            ConnState::Open if conn.has_pending_writes() => {
                debug!(conn = %conn.id(), queued = conn.queued_bytes(), "Closing, flushing writes");
                conn.state = ConnState::Closing { deadline };
                self.closing += 1;
                self.sync_interest(key);
                self.schedule(key, false, true);
            }
            ConnState::Closing { .. } => {}
            _ => self.close_now(key),
        }
    }

    fn expire_lingering(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, c)| matches!(c.state, ConnState::Closing { deadline } if deadline <= now))
            .map(|(key, _)| key)
            .collect();
        for key in expired {
            warn!(
                conn = %self.connections[key].id(),
                queued = self.connections[key].queued_bytes(),
                "Close linger expired, dropping queued frames"
            );
            self.close_now(key);
        }
    }

    /// The peer shut down its side of the stream.
    fn peer_closed(&mut self, key: usize) {
        let conn = &self.connections[key];
        let buffered = conn.buffered_bytes();
        if buffered > 0 {
            let detail = match conn.partial_frame() {
                Some((expected, received)) => {
                    format!("peer closed after {received} of {expected} frame bytes")
                }
                None => format!("peer closed inside a length prefix ({buffered} bytes)"),
            };
            let err = io::Error::new(io::ErrorKind::UnexpectedEof, detail);
            self.fail(key, err.into());
        } else {
            debug!(conn = %self.connections[key].id(), "Peer closed connection");
            self.close_now(key);
        }
    }

    /// Transition to CLOSED and release the socket.
    fn close_now(&mut self, key: usize) {
        let Some(mut conn) = self.remove(key) else {
            return;
        };
        conn.state = ConnState::Closed;
        let dropped = conn.fail_writes(&ChannelError::Closed);
        if let Some(p) = conn.connected.take() {
            p.fail(ChannelError::Closed);
        }
        let _ = conn.stream.shutdown(Shutdown::Both);

        debug!(worker = self.index, conn = %conn.id(), dropped, "Connection closed");
        conn.handler.on_close(&conn.handle);
        for waiter in conn.close_waiters.drain(..) {
            waiter.fulfill(());
        }
    }

    /// Transition to FAILED, notify the handler and release the socket.
    fn fail(&mut self, key: usize, err: ChannelError) {
        let Some(mut conn) = self.remove(key) else {
            return;
        };
        conn.state = ConnState::Failed;

        let err = match (conn.connected.take(), err) {
            (Some(p), ChannelError::Connect(msg)) => {
                p.fail(ChannelError::Connect(msg.clone()));
                ChannelError::Connect(msg)
            }
            (Some(p), other) => {
                let err = ChannelError::Connect(other.to_string());
                p.fail(err.clone());
                err
            }
            (None, other) => other,
        };

        warn!(worker = self.index, conn = %conn.id(), error = %err, "Connection failed");
        conn.fail_writes(&err);
        let _ = conn.stream.shutdown(Shutdown::Both);

        conn.handler.on_error(&conn.handle, &err);
        conn.handler.on_close(&conn.handle);
        for waiter in conn.close_waiters.drain(..) {
            waiter.fulfill(());
        }
    }

    fn remove(&mut self, key: usize) -> Option<Connection> {
        let mut conn = self.connections.try_remove(key)?;
        if matches!(conn.state, ConnState::Closing { .. }) {
            self.closing -= 1;
        }
        self.keys.remove(&conn.id());
        self.shared.unregister(conn.id());
        conn.handle.mark_closed();
        if conn.interest.is_some() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        Some(conn)
    }

    fn sync_interest(&mut self, key: usize) {
        let conn = &mut self.connections[key];
        let desired = conn.desired_interest();
        if desired == conn.interest {
            return;
        }

        let result = match (conn.interest, desired) {
            (Some(_), Some(interest)) => {
                self.poll
                    .registry()
                    .reregister(&mut conn.stream, Token(key), interest)
            }
            (None, Some(interest)) => {
                self.poll
                    .registry()
                    .register(&mut conn.stream, Token(key), interest)
            }
            (Some(_), None) => self.poll.registry().deregister(&mut conn.stream),
            (None, None) => Ok(()),
        };

        match result {
            Ok(()) => conn.interest = desired,
            Err(e) => self.fail(key, e.into()),
        }
    }

    fn notify_group_waiters(&mut self) {
        if self.group_waiters.is_empty() {
            return;
        }
        let connections = &self.connections;
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.group_waiters)
            .into_iter()
            .partition(|(group, _)| !connections.iter().any(|(_, c)| c.group == Some(*group)));
        self.group_waiters = waiting;
        for (_, promise) in done {
            promise.fulfill(());
        }
    }

    /// Release whatever is left once the loop has exited.
    fn finish(&mut self) {
        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_now(key);
        }
        for (_, promise) in self.group_waiters.drain(..) {
            promise.fulfill(());
        }

        // Commands that raced with shutdown: settle their promises and
        // release their registrations.
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Register {
                    handle, connected, ..
                } => {
                    self.shared.unregister(handle.id());
                    handle.mark_closed();
                    if let Some(p) = connected {
                        p.fail(ChannelError::Closed);
                    }
                }
                Command::Write { promise, .. } => {
                    promise.fail(ChannelError::Closed);
                }
                Command::Close { done, .. } => {
                    if let Some(done) = done {
                        done.fulfill(());
                    }
                }
                Command::CloseGroup { done, .. } => {
                    done.fulfill(());
                }
                Command::Shutdown => {}
            }
        }
    }
}
