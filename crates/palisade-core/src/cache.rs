//! Per-connection outgoing dedup and incoming FIFO caches.
//!
//! Both caches are accessed only from a single connection's I/O task, so
//! they use plain `VecDeque`/`HashSet` guarded by a `Mutex` rather than a
//! lock-free structure — there is no cross-task contention to optimize
//! away, this is just interior mutability behind `&self`.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;

const CACHE_CAPACITY: usize = 20;
const FINGERPRINT_LEN: usize = 9;

/// 9-byte fingerprint: first 4 bytes and last 5 bytes of an outgoing frame.
///
/// Frames shorter than 9 bytes are padded with zero bytes in the unused
/// positions rather than panicking; packets below `HEADER_SIZE` (22 bytes)
/// never reach this path in practice, but the fingerprint function itself
/// makes no assumption about caller-supplied length.
#[must_use]
pub fn fingerprint(frame: &[u8]) -> [u8; FINGERPRINT_LEN] {
    let mut out = [0u8; FINGERPRINT_LEN];

    let head_len = frame.len().min(4);
    out[..head_len].copy_from_slice(&frame[..head_len]);

    let tail_len = frame.len().min(5);
    let tail_start = frame.len() - tail_len;
    out[FINGERPRINT_LEN - tail_len..].copy_from_slice(&frame[tail_start..]);

    out
}

/// Bounded FIFO set of outgoing-frame fingerprints.
///
/// This is **store-only** telemetry: [`Self::record`] never suppresses a
/// send, it only reports whether the fingerprint was already present so
/// callers can log a duplicate-retransmit observation.
pub struct OutgoingDedupCache {
    inner: Mutex<DedupInner>,
}

struct DedupInner {
    order: VecDeque<[u8; FINGERPRINT_LEN]>,
    seen: HashSet<[u8; FINGERPRINT_LEN]>,
}

impl OutgoingDedupCache {
    /// Create an empty cache with the spec-mandated capacity of 20.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DedupInner {
                order: VecDeque::with_capacity(CACHE_CAPACITY),
                seen: HashSet::with_capacity(CACHE_CAPACITY),
            }),
        }
    }

    /// Record `fp` in the cache, evicting the oldest entry on overflow.
    ///
    /// Returns `true` if `fp` was already present before this call.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    pub fn record(&self, fp: [u8; FINGERPRINT_LEN]) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if inner.seen.contains(&fp) {
            return true;
        }

        if inner.order.len() >= CACHE_CAPACITY {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }

        inner.order.push_back(fp);
        inner.seen.insert(fp);
        false
    }
}

impl Default for OutgoingDedupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded queue of materialized payloads awaiting dispatch.
///
/// Overflow drops the oldest entry (capacity 20).
pub struct IncomingFifoCache {
    inner: Mutex<VecDeque<Bytes>>,
}

impl IncomingFifoCache {
    /// Create an empty cache with the spec-mandated capacity of 20.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(CACHE_CAPACITY)) }
    }

    /// Push a payload, dropping the oldest entry if the cache is full.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    pub fn push(&self, payload: Bytes) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.len() >= CACHE_CAPACITY {
            inner.pop_front();
        }
        inner.push_back(payload);
    }

    /// Pop the oldest payload, if any.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    pub fn pop(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.pop_front()
    }

    /// Peek at the oldest payload without removing it.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    #[must_use]
    pub fn peek(&self) -> Option<Bytes> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.front().cloned()
    }

    /// Number of payloads currently queued.
    #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// `true` if no payloads are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IncomingFifoCache {
    fn default() -> Self {
        Self::new()
    }
}
