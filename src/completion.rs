//! One-shot results for asynchronous operations.
//!
//! A [`Promise`] is the write side and is settled at most once. Its
//! [`Completion`] is the read side; it can be cloned, polled, waited on with
//! or without a timeout, or given callbacks.
//!
//! A promise that is dropped without being settled settles its completion
//! with [`ChannelError::Closed`]. Operations lost in a shutdown therefore
//! still resolve.

use crate::error::{ChannelError, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct State<T> {
    result: Option<Arc<Result<T>>>,
    callbacks: Vec<Callback<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Inner<T> {
    fn settle(&self, result: Result<T>) -> bool {
        let result = Arc::new(result);
        let callbacks = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(Arc::clone(&result));
            self.cond.notify_all();
            std::mem::take(&mut state.callbacks)
        };

        for cb in callbacks {
            cb(&result);
        }
        true
    }
}

/// Create a connected promise/completion pair.
pub fn pair<T>() -> (Promise<T>, Completion<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            result: None,
            callbacks: Vec::new(),
        }),
        cond: Condvar::new(),
    });
    (
        Promise {
            inner: Some(Arc::clone(&inner)),
        },
        Completion { inner },
    )
}

/// Write side of a one-shot result.
pub struct Promise<T> {
    inner: Option<Arc<Inner<T>>>,
}

impl<T> Promise<T> {
    /// Settle with success.
    pub fn fulfill(self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with failure.
    pub fn fail(self, err: ChannelError) -> bool {
        self.settle(Err(err))
    }

    pub fn settle(mut self, result: Result<T>) -> bool {
        match self.inner.take() {
            Some(inner) => inner.settle(result),
            None => false,
        }
    }

    /// Whether the read side was already settled through another path.
    pub fn is_settled(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |inner| inner.state.lock().result.is_some())
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.settle(Err(ChannelError::Closed));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Read side of a one-shot result.
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Completion<T> {
    /// A completion that is already settled.
    pub fn ready(result: Result<T>) -> Self {
        let (promise, completion) = pair();
        promise.settle(result);
        completion
    }

    /// Block until settled.
    pub fn wait(&self) -> Result<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(result) = state.result.as_ref() {
                return Result::clone(result);
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Block until settled or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(result) = state.result.as_ref() {
                return Some(Result::clone(result));
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return state.result.as_deref().cloned();
            }
        }
    }

    /// The result, if already settled.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.inner.state.lock().result.as_deref().cloned()
    }
}

impl<T> Completion<T> {
    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().result.is_some()
    }

    /// Run `f` once the result is settled; immediately if it already is.
    ///
    /// Callbacks for I/O operations run on the worker thread that settles
    /// them and must not block.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match state.result.clone() {
            Some(result) => {
                drop(state);
                f(&result);
            }
            None => state.callbacks.push(Box::new(f)),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_settles_once() {
        let (promise, completion) = pair::<u32>();
        assert!(completion.try_result().is_none());
        assert!(promise.fulfill(7));
        assert_eq!(completion.wait().unwrap(), 7);
        assert_eq!(completion.clone().try_result().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_drop_settles_closed() {
        let (promise, completion) = pair::<()>();
        drop(promise);
        assert!(matches!(completion.wait(), Err(ChannelError::Closed)));
    }

    #[test]
    fn test_wait_timeout() {
        let (promise, completion) = pair::<u8>();
        assert!(completion.wait_timeout(Duration::from_millis(10)).is_none());

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            promise.fail(ChannelError::Connect("refused".into()));
        });
        let result = completion.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(ChannelError::Connect(_))));
        handle.join().unwrap();
    }

    #[test]
    fn test_callbacks_run_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (promise, completion) = pair::<u8>();

        let c = Arc::clone(&calls);
        completion.on_complete(move |r| {
            assert!(r.is_ok());
            c.fetch_add(1, Ordering::SeqCst);
        });
        promise.fulfill(1);

        // registered after settlement: runs immediately
        let c = Arc::clone(&calls);
        completion.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ready() {
        let completion = Completion::ready(Err::<(), _>(ChannelError::Closed));
        assert!(completion.is_complete());
        assert!(completion.wait().unwrap_err().is_closed());
    }
}
