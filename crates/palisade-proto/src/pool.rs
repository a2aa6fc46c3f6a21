//! Process-wide, thread-safe buffer pool.
//!
//! Rented buffers are returned on every exit path via [`PooledBuffer`]'s
//! `Drop` impl, satisfying the "every rented buffer is paired with a
//! guaranteed-release path" requirement even when a caller bails out early
//! with `?`.

use std::sync::Mutex;

/// Below this payload size, [`crate::packet::Packet::encode`] writes into a
/// stack-allocated buffer instead of renting from the pool.
pub const STACK_THRESHOLD: usize = 512;

/// Rent/return contract for sized byte buffers.
///
/// Implementations MUST be safe to call concurrently from many tasks.
pub trait BufferPool: Send + Sync {
    /// Obtain a buffer of at least `size` bytes, zero-filled.
    fn rent(&self, size: usize) -> Vec<u8>;

    /// Return a buffer for reuse. If `clear` is set, the pool zeroes it
    /// before making it available again (used when the buffer may have
    /// held decrypted application data).
    fn give_back(&self, buf: Vec<u8>, clear: bool);

    /// Largest single buffer this pool will hand out before falling back to
    /// a one-off heap allocation.
    fn max_buffer_size(&self) -> usize;
}

/// Simple size-bucketed pool backed by a mutex-guarded free list.
///
/// Buckets are powers of two between 1 KiB and `max_buffer_size`. This is
/// not a sophisticated allocator — it exists to avoid repeated allocation
/// churn on the hot receive-buffer-grow path, not to be a general-purpose
/// arena.
pub struct SharedBufferPool {
    max_buffer_size: usize,
    free_lists: Mutex<Vec<Vec<Vec<u8>>>>,
    bucket_sizes: Vec<usize>,
}

impl SharedBufferPool {
    /// Create a pool capping individual buffers at `max_buffer_size` bytes.
    #[must_use]
    pub fn new(max_buffer_size: usize) -> Self {
        let mut bucket_sizes = Vec::new();
        let mut size = 1024usize;
        while size < max_buffer_size {
            bucket_sizes.push(size);
            size *= 2;
        }
        bucket_sizes.push(max_buffer_size);

        let free_lists = Mutex::new(vec![Vec::new(); bucket_sizes.len()]);

        Self { max_buffer_size, free_lists, bucket_sizes }
    }

    fn bucket_for(&self, size: usize) -> Option<usize> {
        self.bucket_sizes.iter().position(|&cap| cap >= size)
    }
}

impl BufferPool for SharedBufferPool {
    fn rent(&self, size: usize) -> Vec<u8> {
        let Some(bucket) = self.bucket_for(size) else {
            return vec![0u8; size];
        };

        #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
        let mut lists = self.free_lists.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(mut buf) = lists[bucket].pop() {
            if buf.len() < size {
                buf.resize(size, 0);
            }
            buf
        } else {
            vec![0u8; self.bucket_sizes[bucket]]
        }
    }

    fn give_back(&self, mut buf: Vec<u8>, clear: bool) {
        if clear {
            buf.iter_mut().for_each(|b| *b = 0);
        }

        let Some(bucket) = self.bucket_for(buf.len()) else { return };

        #[allow(clippy::disallowed_methods, reason = "mutex poisoning should panic, not hide data loss")]
        let mut lists = self.free_lists.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        lists[bucket].push(buf);
    }

    fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }
}

/// An RAII handle around a rented buffer; returns it to the pool on drop.
pub struct PooledBuffer<'a> {
    pool: &'a dyn BufferPool,
    buf: Option<Vec<u8>>,
    clear_on_return: bool,
}

impl<'a> PooledBuffer<'a> {
    /// Rent a buffer of at least `size` bytes from `pool`.
    #[must_use]
    pub fn rent(pool: &'a dyn BufferPool, size: usize, clear_on_return: bool) -> Self {
        Self { pool, buf: Some(pool.rent(size)), clear_on_return }
    }

    /// Mutable access to the underlying buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().map(Vec::as_mut_slice).unwrap_or_default()
    }

    /// Immutable access to the underlying buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf, self.clear_on_return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_returns_requested_capacity() {
        let pool = SharedBufferPool::new(65536);
        let buf = pool.rent(100);
        assert!(buf.len() >= 100);
    }

    #[test]
    fn give_back_makes_buffer_reusable() {
        let pool = SharedBufferPool::new(65536);
        let buf = pool.rent(100);
        let cap = buf.len();
        pool.give_back(buf, true);
        let reused = pool.rent(100);
        assert_eq!(reused.len(), cap);
        assert!(reused.iter().all(|&b| b == 0));
    }

    #[test]
    fn pooled_buffer_returns_on_drop() {
        let pool = SharedBufferPool::new(65536);
        {
            let mut handle = PooledBuffer::rent(&pool, 200, false);
            handle.as_mut_slice()[0] = 42;
        }
        let reused = pool.rent(200);
        assert!(reused.len() >= 200);
    }

    #[test]
    fn oversized_request_falls_back_to_heap() {
        let pool = SharedBufferPool::new(4096);
        let buf = pool.rent(1_000_000);
        assert_eq!(buf.len(), 1_000_000);
    }
}
