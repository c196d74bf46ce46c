//! Fixed-size pool of I/O workers.
//!
//! Each worker is one thread running its own poll loop. New connections are
//! placed on the least-loaded worker (ties broken round-robin) and stay
//! there for their whole life. The registration table, mapping every live
//! connection to its worker, is the only state shared across threads.

use crate::completion::{self, Completion};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::frame::MessageCodec;
use crate::handler::ChannelHandler;
use crate::runtime::connection::ConnectionHandle;
use crate::runtime::event_loop::{Command, Worker, WorkerLink, WorkerSettings};
use crate::runtime::token::{ConnectionId, GroupId, WAKER_TOKEN};
use mio::net::TcpStream;
use mio::{Poll, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct Registration {
    worker: usize,
    group: Option<GroupId>,
}

/// Registration table shared by the pool and its workers.
pub(crate) struct PoolShared {
    registrations: Mutex<HashMap<ConnectionId, Registration>>,
    loads: Vec<AtomicUsize>,
    next: AtomicUsize,
}

impl PoolShared {
    fn new(workers: usize) -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
            loads: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Pick a worker for `id` and record the placement.
    fn assign(&self, id: ConnectionId, group: Option<GroupId>) -> usize {
        let mut registrations = self.registrations.lock();
        let n = self.loads.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        let worker = (0..n)
            .map(|i| (start + i) % n)
            .min_by_key(|&w| self.loads[w].load(Ordering::Relaxed))
            .unwrap_or(0);
        self.loads[worker].fetch_add(1, Ordering::Relaxed);
        registrations.insert(id, Registration { worker, group });
        worker
    }

    /// Drop `id` from the table. Safe to call more than once.
    pub(crate) fn unregister(&self, id: ConnectionId) {
        if let Some(reg) = self.registrations.lock().remove(&id) {
            self.loads[reg.worker].fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn worker_of(&self, id: ConnectionId) -> Option<usize> {
        self.registrations.lock().get(&id).map(|r| r.worker)
    }

    fn count(&self, group: Option<GroupId>) -> usize {
        let registrations = self.registrations.lock();
        match group {
            None => registrations.len(),
            Some(g) => registrations.values().filter(|r| r.group == Some(g)).count(),
        }
    }
}

struct PoolInner {
    links: Vec<WorkerLink>,
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl PoolInner {
    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(workers = self.links.len(), "Shutting down worker pool");
        for link in &self.links {
            let _ = link.submit(Command::Shutdown);
        }

        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() == current {
                // Dropped from inside a handler; this worker exits on its own.
                continue;
            }
            if handle.join().is_err() {
                warn!("I/O worker panicked");
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a set of I/O worker threads. Cheap to clone; the workers stop
/// when [`WorkerPool::shutdown`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Start `config.worker_count()` workers.
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        config.validate()?;
        let count = config.worker_count();
        let settings = WorkerSettings {
            read_chunk: config.read_buffer_size,
            events_capacity: config.events_capacity,
            close_linger: config.close_linger(),
        };
        let shared = Arc::new(PoolShared::new(count));

        let mut links = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for index in 0..count {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            let (tx, rx) = crossbeam_channel::unbounded();
            links.push(WorkerLink::new(index, tx, waker));

            let worker = Worker::new(index, poll, rx, Arc::clone(&shared), settings);
            let handle = thread::Builder::new()
                .name(format!("wirechan-io-{index}"))
                .spawn(move || worker.run());
            match handle {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    // Stop what was already started before bailing out.
                    for link in &links {
                        let _ = link.submit(Command::Shutdown);
                    }
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        info!(workers = count, "Worker pool started");
        Ok(Self {
            inner: Arc::new(PoolInner {
                links,
                shared,
                threads: Mutex::new(threads),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.inner.links.len()
    }

    /// Number of live connections across all workers.
    pub fn connection_count(&self) -> usize {
        self.inner.shared.count(None)
    }

    /// Worker a live connection is pinned to.
    pub fn worker_of(&self, id: ConnectionId) -> Option<usize> {
        self.inner.shared.worker_of(id)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Close every connection (flushing queued frames within the close
    /// linger) and stop all workers. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub(crate) fn group_count(&self, group: GroupId) -> usize {
        self.inner.shared.count(Some(group))
    }

    /// Hand `stream` to a worker.
    ///
    /// With `connecting` set the stream is an outbound connect still in
    /// progress; the returned completion settles when it finishes.
    pub(crate) fn register(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn ChannelHandler>,
        codec: MessageCodec,
        group: Option<GroupId>,
        connecting: bool,
    ) -> Result<(ConnectionHandle, Option<Completion<()>>)> {
        if self.is_shut_down() {
            return Err(ChannelError::Closed);
        }

        let id = ConnectionId::next();
        let worker = self.inner.shared.assign(id, group);
        let link = self.inner.links[worker].clone();
        let handle = ConnectionHandle::new(id, peer, codec, link.clone());

        let (connected, completion) = if connecting {
            let (p, c) = completion::pair();
            (Some(p), Some(c))
        } else {
            (None, None)
        };

        let command = Command::Register {
            stream,
            handle: handle.clone(),
            handler,
            group,
            connected,
        };
        if link.submit(command).is_err() {
            self.inner.shared.unregister(id);
            handle.mark_closed();
            return Err(ChannelError::Closed);
        }

        debug!(conn = %id, worker, peer = %peer, "Assigned connection");
        Ok((handle, completion))
    }

    /// Ask every worker to close the connections of `group`.
    pub(crate) fn close_group(&self, group: GroupId) -> Vec<Completion<()>> {
        self.inner
            .links
            .iter()
            .map(|link| {
                let (done, completion) = completion::pair();
                if let Err(Command::CloseGroup { done, .. }) =
                    link.submit(Command::CloseGroup { group, done })
                {
                    done.fulfill(());
                }
                completion
            })
            .collect()
    }
}

/// Wait for all `completions`, giving up after `timeout` in total.
pub(crate) fn wait_all(completions: &[Completion<()>], timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    completions.iter().all(|c| {
        let left = deadline.saturating_duration_since(std::time::Instant::now());
        c.wait_timeout(left).is_some()
    })
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("connections", &self.connection_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_loaded_assignment() {
        let shared = PoolShared::new(3);
        let ids: Vec<ConnectionId> = (0..6).map(|_| ConnectionId::next()).collect();

        let workers: Vec<usize> = ids.iter().map(|&id| shared.assign(id, None)).collect();
        for w in 0..3 {
            assert_eq!(workers.iter().filter(|&&x| x == w).count(), 2);
        }
        assert_eq!(shared.count(None), 6);

        // free up worker of ids[0]; the next connection lands there
        let freed = workers[0];
        shared.unregister(ids[0]);
        shared.unregister(ids[0]);
        assert_eq!(shared.count(None), 5);
        assert_eq!(shared.assign(ConnectionId::next(), None), freed);
    }

    #[test]
    fn test_group_count() {
        let shared = PoolShared::new(2);
        let g = GroupId::next();
        let a = ConnectionId::next();
        shared.assign(a, Some(g));
        shared.assign(ConnectionId::next(), None);
        assert_eq!(shared.count(Some(g)), 1);
        assert!(shared.worker_of(a).is_some());
        shared.unregister(a);
        assert_eq!(shared.count(Some(g)), 0);
        assert_eq!(shared.worker_of(a), None);
    }

    #[test]
    fn test_pool_start_and_shutdown() {
        let config = ChannelConfig {
            workers: 2,
            ..ChannelConfig::default()
        };
        let pool = WorkerPool::new(&config).unwrap();
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(pool.connection_count(), 0);

        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shut_down());

        let waits = pool.close_group(GroupId::next());
        assert!(wait_all(&waits, Duration::from_secs(1)));
    }
}
