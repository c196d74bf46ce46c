//! Identifiers for connections, connection groups and reserved poll tokens.
//!
//! Slab keys are reused as soon as a connection goes away, so everything
//! that outlives a single poll iteration (handles, commands, registry
//! entries) refers to connections by a process-unique [`ConnectionId`]
//! instead.

use mio::Token;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Token of the cross-thread waker in every poll instance.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Token of the listening socket in the acceptor's poll instance.
pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);
static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Set of connections closed together, e.g. everything a server accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GroupId(u64);

impl GroupId {
    pub(crate) fn next() -> Self {
        Self(NEXT_GROUP.fetch_add(1, Ordering::Relaxed))
    }
}
