//! Per-connection outbound frame queue.
//!
//! Frames are written strictly in submission order: every byte of the head
//! frame goes out before the first byte of the next one. Partial writes are
//! tracked as an offset into the head frame so a write can resume wherever
//! the socket stopped accepting bytes.

use crate::completion::Promise;
use crate::error::ChannelError;
use bytes::Bytes;
use std::collections::VecDeque;

/// A framed message waiting to be written.
pub(crate) struct PendingWrite {
    frame: Bytes,
    promise: Promise<()>,
}

impl PendingWrite {
    pub(crate) fn new(frame: Bytes, promise: Promise<()>) -> Self {
        Self { frame, promise }
    }
}

/// FIFO of frames plus the write offset into the head frame.
#[derive(Default)]
pub(crate) struct WriteQueue {
    frames: VecDeque<PendingWrite>,
    /// Bytes of the head frame already handed to the socket.
    head_written: usize,
    /// Unwritten bytes across the whole queue.
    queued_bytes: usize,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, write: PendingWrite) {
        self.queued_bytes += write.frame.len();
        self.frames.push_back(write);
    }

    /// Unwritten remainder of the head frame.
    pub(crate) fn head(&self) -> Option<&[u8]> {
        self.frames
            .front()
            .map(|w| &w.frame[self.head_written..])
    }

    /// Record `n` bytes of the head frame as written.
    ///
    /// Returns the head's promise once its last byte has gone out; the caller
    /// settles it.
    pub(crate) fn advance(&mut self, n: usize) -> Option<Promise<()>> {
        let head_len = self.frames.front()?.frame.len();
        debug_assert!(self.head_written + n <= head_len, "advance past head frame");

        self.head_written += n;
        self.queued_bytes -= n;
        if self.head_written < head_len {
            return None;
        }

        self.head_written = 0;
        self.frames.pop_front().map(|w| w.promise)
    }

    /// Fail every queued frame, including a partially written head.
    pub(crate) fn fail_all(&mut self, err: &ChannelError) -> usize {
        let count = self.frames.len();
        for write in self.frames.drain(..) {
            write.promise.fail(err.clone());
        }
        self.head_written = 0;
        self.queued_bytes = 0;
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }
}
