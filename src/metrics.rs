//! Counter interface consumed by handlers to track in-flight work.
//!
//! The engine itself never needs metrics; exporters live outside the crate
//! and only have to implement [`Counter`].

use std::sync::atomic::{AtomicI64, Ordering};

pub trait Counter: Send + Sync {
    fn increment(&self);
    fn decrement(&self);
}

/// In-process counter, useful for tests and simple gauges.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicI64);

impl AtomicCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}

impl Counter for AtomicCounter {
    fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
