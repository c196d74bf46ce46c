//! Registry of requests awaiting a reply.
//!
//! Each entry holds the [`Promise`] for one outstanding request. Settling
//! removes the entry under the map lock before the promise is touched, so an
//! entry is settled exactly once no matter how many threads race to fulfill,
//! fail or sweep it.

use crate::completion::{self, Completion, Promise};
use crate::error::ChannelError;
use crate::metrics::Counter;
use crate::runtime::ConnectionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

struct Entry<T> {
    owner: Option<ConnectionId>,
    promise: Promise<T>,
}

/// Concurrency-safe map from request id to its pending result.
pub struct PendingRegistry<K, T> {
    entries: Mutex<HashMap<K, Entry<T>>>,
    counter: Option<Arc<dyn Counter>>,
}

impl<K, T> PendingRegistry<K, T>
where
    K: Eq + Hash + Copy,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            counter: None,
        }
    }

    /// Track the number of outstanding entries in `counter`.
    pub fn with_counter(mut self, counter: Arc<dyn Counter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Register a new outstanding request.
    ///
    /// Returns `None` if `id` is already outstanding.
    pub fn register(&self, id: K, owner: Option<ConnectionId>) -> Option<Completion<T>> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return None;
        }
        let (promise, completion) = completion::pair();
        entries.insert(id, Entry { owner, promise });
        drop(entries);

        if let Some(counter) = &self.counter {
            counter.increment();
        }
        Some(completion)
    }

    /// Settle `id` with a reply. Returns false if it was not outstanding.
    pub fn fulfill(&self, id: K, value: T) -> bool {
        match self.take(id) {
            Some(promise) => promise.fulfill(value),
            None => false,
        }
    }

    /// Settle `id` with a failure. Returns false if it was not outstanding.
    pub fn fail(&self, id: K, err: ChannelError) -> bool {
        match self.take(id) {
            Some(promise) => promise.fail(err),
            None => false,
        }
    }

    /// Fail every entry registered for `owner`; returns how many were failed.
    pub fn fail_owned_by(&self, owner: ConnectionId, err: &ChannelError) -> usize {
        let drained: Vec<Promise<T>> = {
            let mut entries = self.entries.lock();
            let ids: Vec<K> = entries
                .iter()
                .filter(|(_, e)| e.owner == Some(owner))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id))
                .map(|e| e.promise)
                .collect()
        };
        self.settle_all(drained, err)
    }

    /// Fail every outstanding entry.
    pub fn fail_all(&self, err: &ChannelError) -> usize {
        let drained: Vec<Promise<T>> = self
            .entries
            .lock()
            .drain()
            .map(|(_, e)| e.promise)
            .collect();
        self.settle_all(drained, err)
    }

    pub fn contains(&self, id: K) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn take(&self, id: K) -> Option<Promise<T>> {
        let entry = self.entries.lock().remove(&id)?;
        if let Some(counter) = &self.counter {
            counter.decrement();
        }
        Some(entry.promise)
    }

    fn settle_all(&self, promises: Vec<Promise<T>>, err: &ChannelError) -> usize {
        let count = promises.len();
        for promise in promises {
            if let Some(counter) = &self.counter {
                counter.decrement();
            }
            promise.fail(err.clone());
        }
        count
    }
}

impl<K, T> Default for PendingRegistry<K, T>
where
    K: Eq + Hash + Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AtomicCounter;
    use std::thread;

    #[test]
    fn test_register_and_fulfill() {
        let counter = Arc::new(AtomicCounter::new());
        let registry = PendingRegistry::<u32, &'static str>::new().with_counter(counter.clone());

        let reply = registry.register(1, None).unwrap();
        assert!(registry.register(1, None).is_none(), "duplicate id while outstanding");
        assert_eq!(counter.get(), 1);

        assert!(registry.fulfill(1, "pong"));
        assert!(!registry.fulfill(1, "again"));
        assert!(!registry.fail(1, ChannelError::Closed));
        assert_eq!(reply.wait().unwrap(), "pong");
        assert_eq!(counter.get(), 0);

        // the id is free again once settled
        assert!(registry.register(1, None).is_some());
    }

    #[test]
    fn test_fail_owned_by() {
        let registry = PendingRegistry::<u32, ()>::new();
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        let ra = registry.register(1, Some(a)).unwrap();
        let rb = registry.register(2, Some(b)).unwrap();

        assert_eq!(registry.fail_owned_by(a, &ChannelError::Closed), 1);
        assert!(ra.wait().unwrap_err().is_closed());
        assert!(!rb.is_complete());
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.fail_all(&ChannelError::Closed), 1);
        assert!(rb.wait().is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_settle_exactly_once() {
        let registry = Arc::new(PendingRegistry::<u32, u32>::new());
        let completions: Vec<_> = (0..256).map(|i| registry.register(i, None).unwrap()).collect();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut won = 0;
                    for i in 0..256 {
                        let settled = if t % 2 == 0 {
                            registry.fulfill(i, t)
                        } else {
                            registry.fail(i, ChannelError::Closed)
                        };
                        if settled {
                            won += 1;
                        }
                    }
                    won
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 256);
        assert!(completions.iter().all(|c| c.is_complete()));
        assert!(registry.is_empty());
    }
}
