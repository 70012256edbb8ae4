//! Live connection accounting.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Process-wide count of active tunneled connections.
///
/// Only the socket tunnel writes it; everything else reads.
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    open: AtomicI64,
}

impl ConnectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of open connections.
    pub fn current(&self) -> i64 {
        self.open.load(Ordering::Relaxed)
    }

    /// Count a connection as open until the returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.open.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counter: Arc::clone(self),
        }
    }

    /// Plain-text telemetry rendering.
    pub fn render(&self) -> String {
        format!("Connections {}\n", self.current())
    }
}

/// Decrements the counter exactly once when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<ConnectionCounter>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.open.fetch_sub(1, Ordering::Relaxed);
    }
}
