//! Clock abstraction for deterministic testing.
//!
//! Decouples connection and cache logic from the system clock so tests can
//! drive expiry and replay-window checks with fixed timestamps instead of
//! real sleeps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies the current time as milliseconds since the Unix epoch.
///
/// # Invariants
///
/// `unix_ms_now()` must never return a value smaller than a previous call on
/// the same instance within one process lifetime.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn unix_ms_now(&self) -> u64;
}

/// Clock backed by [`SystemTime::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_ms_now(&self) -> u64 {
        #[allow(clippy::expect_used, reason = "system clock before 1970 is not a recoverable state")]
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch");
        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Clock with a manually advanced timestamp, for tests.
#[derive(Debug)]
pub struct FixedClock {
    now_ms: AtomicU64,
}

impl FixedClock {
    /// Start the clock at `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self { now_ms: AtomicU64::new(start_ms) }
    }

    /// Move the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Set the clock to an absolute timestamp.
    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn unix_ms_now(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
