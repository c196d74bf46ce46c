//! Connection state machine and the handle handed to application code.
//!
//! A [`Connection`] lives inside exactly one worker's slab and is only ever
//! touched by that worker thread: its read buffer, write queue and state are
//! never shared. Everything else talks to it through a [`ConnectionHandle`],
//! which turns calls into commands on the owning worker's queue.

use crate::completion::{self, Completion, Promise};
use crate::error::{ChannelError, Result};
use crate::frame::MessageCodec;
use crate::handler::ChannelHandler;
use crate::runtime::buffer::{PendingWrite, WriteQueue};
use crate::runtime::event_loop::{Command, WorkerLink};
use crate::runtime::token::{ConnectionId, GroupId};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of a connection.
///
/// `CONNECTING -> OPEN -> CLOSING -> CLOSED`, with `FAILED` reachable from
/// every non-terminal state. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outbound connect in progress.
    Connecting,
    /// Reading and writing frames.
    Open,
    /// Close requested; flushing queued frames until `deadline`.
    Closing { deadline: Instant },
    Closed,
    Failed,
}

impl ConnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Failed)
    }

    /// Interest the socket needs in this state, given whether frames are queued.
    pub(crate) fn interest(&self, has_writes: bool) -> Option<Interest> {
        match self {
            ConnState::Connecting => Some(Interest::READABLE | Interest::WRITABLE),
            ConnState::Open if has_writes => Some(Interest::READABLE | Interest::WRITABLE),
            ConnState::Open => Some(Interest::READABLE),
            ConnState::Closing { .. } => Some(Interest::WRITABLE),
            ConnState::Closed | ConnState::Failed => None,
        }
    }
}

/// Result of one bounded read.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// Bytes were appended to the read buffer. The socket may still hold
    /// more, or a pending EOF, until a read reports `WouldBlock`.
    Data { n: usize },
    WouldBlock,
    Eof,
}

/// Result of one bounded write.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// The queue is empty.
    Drained,
    /// The head frame finished and more frames are queued.
    More,
    /// The socket took only part of the head frame, or nothing at all.
    Blocked,
}

/// Worker-side state of one TCP stream.
pub(crate) struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) state: ConnState,
    pub(crate) handle: ConnectionHandle,
    pub(crate) handler: Arc<dyn ChannelHandler>,
    pub(crate) group: Option<GroupId>,
    /// Interest currently registered with the poll instance.
    pub(crate) interest: Option<Interest>,
    /// Settled when an outbound connect completes.
    pub(crate) connected: Option<Promise<()>>,
    /// Settled when the connection is gone.
    pub(crate) close_waiters: Vec<Promise<()>>,
    /// Revisit flags for the worker's backlog.
    pub(crate) revisit_read: bool,
    pub(crate) revisit_write: bool,
    read_buf: BytesMut,
    writes: WriteQueue,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        state: ConnState,
        handle: ConnectionHandle,
        handler: Arc<dyn ChannelHandler>,
        group: Option<GroupId>,
        read_capacity: usize,
    ) -> Self {
        Self {
            stream,
            state,
            handle,
            handler,
            group,
            interest: None,
            connected: None,
            close_waiters: Vec::new(),
            revisit_read: false,
            revisit_write: false,
            read_buf: BytesMut::with_capacity(read_capacity),
            writes: WriteQueue::new(),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub(crate) fn desired_interest(&self) -> Option<Interest> {
        self.state.interest(!self.writes.is_empty())
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Bytes of an unfinished frame sitting in the read buffer.
    pub(crate) fn buffered_bytes(&self) -> usize {
        self.read_buf.len()
    }

    /// `(expected, received)` payload bytes of the frame being assembled.
    pub(crate) fn partial_frame(&self) -> Option<(usize, usize)> {
        self.handle.codec().frames().assembly(&self.read_buf)
    }

    pub(crate) fn enqueue(&mut self, frame: Bytes, promise: Promise<()>) {
        self.writes.push(PendingWrite::new(frame, promise));
    }

    /// Perform a single non-blocking read of at most `chunk` bytes.
    pub(crate) fn read_once(&mut self, chunk: usize) -> io::Result<ReadOutcome> {
        let start = self.read_buf.len();
        self.read_buf.resize(start + chunk, 0);

        let result = self.stream.read(&mut self.read_buf[start..]);
        let n = match result {
            Ok(n) => n,
            Err(e) => {
                self.read_buf.truncate(start);
                return match e.kind() {
                    io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
                    io::ErrorKind::Interrupted => Ok(ReadOutcome::Data { n: 0 }),
                    _ => Err(e),
                };
            }
        };

        self.read_buf.truncate(start + n);
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        Ok(ReadOutcome::Data { n })
    }

    /// Decode every complete frame in the read buffer and hand each one to
    /// the handler, in arrival order.
    pub(crate) fn dispatch_frames(&mut self) -> Result<usize> {
        let codec = self.handle.codec();
        let mut count = 0;
        while let Some(payload) = codec.decode(&mut self.read_buf)? {
            self.handler.on_message(&self.handle, payload);
            count += 1;
            if self.handle.is_closed() {
                // Close requested from inside the handler: stop delivering.
                break;
            }
        }
        Ok(count)
    }

    /// Perform a single non-blocking write of the head frame's remainder.
    pub(crate) fn write_once(&mut self) -> io::Result<WriteOutcome> {
        let Some(head) = self.writes.head() else {
            return Ok(WriteOutcome::Drained);
        };

        let n = match self.stream.write(head) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(WriteOutcome::Blocked);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(WriteOutcome::More);
            }
            Err(e) => return Err(e),
        };

        let head_len = head.len();
        if let Some(promise) = self.writes.advance(n) {
            promise.fulfill(());
        }

        if n < head_len {
            Ok(WriteOutcome::Blocked)
        } else if self.writes.is_empty() {
            Ok(WriteOutcome::Drained)
        } else {
            Ok(WriteOutcome::More)
        }
    }

    /// Fail every queued write with `err`.
    pub(crate) fn fail_writes(&mut self, err: &ChannelError) -> usize {
        self.writes.fail_all(err)
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.writes.queued_bytes()
    }
}

struct HandleInner {
    id: ConnectionId,
    peer: SocketAddr,
    codec: MessageCodec,
    link: WorkerLink,
    closed: AtomicBool,
}

/// Cloneable, thread-safe reference to a connection.
///
/// Handlers receive one with every callback and may keep it to reply later
/// from any thread. All operations only enqueue work for the owning worker.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        codec: MessageCodec,
        link: WorkerLink,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                peer,
                codec,
                link,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Index of the worker this connection is pinned to.
    pub fn worker(&self) -> usize {
        self.inner.link.index()
    }

    /// Whether a close was requested or the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn codec(&self) -> MessageCodec {
        self.inner.codec.clone()
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Frame `payload` and queue it for writing.
    ///
    /// Fails synchronously if the connection is closed or the payload does
    /// not fit in a frame. The returned completion settles once every byte
    /// of the frame has been handed to the socket, or with an error if the
    /// connection goes away first.
    pub fn send(&self, payload: &[u8]) -> Result<Completion<()>> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let frame = self.inner.codec.encode(payload)?;
        let (promise, completion) = completion::pair();
        self.inner
            .link
            .submit(Command::Write {
                id: self.inner.id,
                frame,
                promise,
            })
            .map_err(|_| ChannelError::Closed)?;
        Ok(completion)
    }

    /// Request a graceful close: queued frames are flushed first.
    ///
    /// The completion settles once the connection is gone. Closing an
    /// already closed connection settles immediately.
    pub fn close(&self) -> Completion<()> {
        self.mark_closed();
        let (promise, completion) = completion::pair();
        let command = Command::Close {
            id: self.inner.id,
            done: Some(promise),
        };
        if let Err(command) = self.inner.link.submit(command) {
            // Worker is gone, so is the connection.
            if let Command::Close { done: Some(p), .. } = command {
                p.fulfill(());
            }
        }
        completion
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("worker", &self.inner.link.index())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_state_interest() {
        let deadline = Instant::now() + Duration::from_secs(1);

        assert_eq!(
            ConnState::Connecting.interest(false),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
        assert_eq!(ConnState::Open.interest(false), Some(Interest::READABLE));
        assert_eq!(
            ConnState::Open.interest(true),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
        assert_eq!(
            ConnState::Closing { deadline }.interest(true),
            Some(Interest::WRITABLE)
        );
        assert_eq!(ConnState::Closed.interest(true), None);
        assert!(ConnState::Failed.is_terminal());
        assert!(!ConnState::Closing { deadline }.is_terminal());
    }

    #[test]
    fn test_handle_submits_commands() {
        use crate::frame::FrameCodec;
        use crate::runtime::token::WAKER_TOKEN;
        use mio::{Poll, Waker};

        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = ConnectionId::next();
        let handle = ConnectionHandle::new(
            id,
            "127.0.0.1:9".parse().unwrap(),
            MessageCodec::new(FrameCodec::new(16), None),
            WorkerLink::new(3, tx, waker),
        );
        assert_eq!(handle.worker(), 3);

        let sent = handle.send(b"hi").unwrap();
        match rx.try_recv().unwrap() {
            Command::Write { id: target, frame, promise } => {
                assert_eq!(target, id);
                assert_eq!(&frame[..], &[0, 0, 0, 2, b'h', b'i']);
                promise.fulfill(());
            }
            _ => panic!("expected a write"),
        }
        assert!(matches!(sent.try_result(), Some(Ok(()))));

        assert!(matches!(
            handle.send(&[0u8; 17]),
            Err(ChannelError::FrameTooLarge { len: 17, max: 16 })
        ));

        let closed = handle.close();
        assert!(handle.is_closed());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Command::Close { id: target, .. } if target == id
        ));
        assert!(matches!(handle.send(b"late"), Err(ChannelError::Closed)));

        // The close command was dropped unhandled; with the worker gone a
        // new close settles on the spot.
        drop(rx);
        assert!(matches!(closed.try_result(), Some(Err(ChannelError::Closed))));
        assert!(matches!(handle.close().try_result(), Some(Ok(()))));
    }
}
