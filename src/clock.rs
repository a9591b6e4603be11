//! Time source abstraction.
//!
//! All scheduling in the consensus client (election timeouts, request
//! deadlines, retry backoff, shutdown drain) goes through a [`Clock`] so
//! that tests can drive time deterministically with [`MockClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond time source.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds. Also used as the record timestamp for
    /// control batches, so implementations should return wall-clock time.
    fn now_ms(&self) -> u64;
}

/// Wall-clock backed time source.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced time source for tests.
///
/// Clones share the same underlying counter, so a test can hold one handle
/// while the client holds another.
#[derive(Debug, Default, Clone)]
pub struct MockClock {
    ms: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn sleep(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::SeqCst)
    }
}
