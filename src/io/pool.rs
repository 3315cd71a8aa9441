//! Lock-free byte-buffer pool
//!
//! Read loops obtain a buffer per message and release it as soon as the
//! message is parsed; the parsed message owns its data from then on.
//! Buffers are recycled through a lock-free `ArrayQueue` so concurrent
//! read loops never contend on a mutex.
//!
//! Buffers larger than the pool's buffer size are never returned; a TCP
//! message that exceeded the configured size was read into a fresh
//! allocation and is simply dropped.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use dnsgate::io::BufferPool;
//!
//! let pool = Arc::new(BufferPool::new(64, 512));
//!
//! let buffer = pool.get();
//! assert_eq!(buffer.len(), 512);
//! drop(buffer); // returned to the pool
//!
//! assert!(pool.stats().returns() > 0);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Statistics for a buffer pool
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    /// Buffers allocated fresh because the pool was empty
    allocations: AtomicU64,
    /// Buffers reused from the pool
    reuses: AtomicU64,
    /// Buffers returned to the pool
    returns: AtomicU64,
    /// Buffers dropped because the pool was full
    drops: AtomicU64,
}

impl BufferPoolStats {
    /// Get the number of fresh allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Get the number of reuses
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Get the number of returns
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Get the number of drops
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Pool internals shared between the pool and its outstanding buffers
#[derive(Debug)]
struct PoolInner {
    queue: ArrayQueue<Vec<u8>>,
    buf_size: usize,
    stats: BufferPoolStats,
}

/// Lock-free pool of equally sized byte buffers
#[derive(Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool holding up to `capacity` buffers of `buf_size` bytes
    #[must_use]
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue: ArrayQueue::new(capacity.max(1)),
                buf_size,
                stats: BufferPoolStats::default(),
            }),
        }
    }

    /// Get a zero-initialized buffer of the pool's buffer size
    ///
    /// Reuses a pooled buffer when one is available.
    #[must_use]
    pub fn get(&self) -> PooledBuffer {
        let buf = match self.inner.queue.pop() {
            Some(mut buf) => {
                self.inner.stats.reuses.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(self.inner.buf_size, 0);
                buf
            }
            None => {
                self.inner.stats.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.inner.buf_size]
            }
        };

        PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    /// The size of buffers handed out by this pool
    #[must_use]
    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// Pool statistics
    #[must_use]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.inner.stats
    }
}

/// A buffer checked out of a [`BufferPool`]
///
/// Dereferences to `[u8]`; returned to the pool on drop when its capacity
/// still matches the pool's buffer size.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.capacity() != self.pool.buf_size {
            // Oversized buffers were allocated outside the pool and are
            // not recycled; undersized ones cannot serve a full read.
            return;
        }

        if self.pool.queue.push(buf).is_ok() {
            self.pool.stats.returns.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pool.stats.drops.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_allocates_when_empty() {
        let pool = BufferPool::new(4, 512);
        let buf = pool.get();

        assert_eq!(buf.len(), 512);
        assert_eq!(pool.stats().allocations(), 1);
        assert_eq!(pool.stats().reuses(), 0);
    }

    #[test]
    fn test_drop_returns_and_reuses() {
        let pool = BufferPool::new(4, 512);

        let buf = pool.get();
        drop(buf);
        assert_eq!(pool.stats().returns(), 1);

        let buf = pool.get();
        assert_eq!(pool.stats().reuses(), 1);
        assert_eq!(buf.len(), 512);
    }

    #[test]
    fn test_reused_buffer_is_zeroed_to_full_size() {
        let pool = BufferPool::new(4, 16);

        let mut buf = pool.get();
        buf[0] = 0xFF;
        drop(buf);

        let buf = pool.get();
        assert_eq!(buf.len(), 16);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn test_full_pool_drops_buffers() {
        let pool = BufferPool::new(1, 8);

        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);

        assert_eq!(pool.stats().returns(), 1);
        assert_eq!(pool.stats().drops(), 1);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let pool = Arc::new(BufferPool::new(32, 64));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.get();
                        assert_eq!(buf.len(), 64);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread panicked");
        }

        let stats = pool.stats();
        assert_eq!(stats.allocations() + stats.reuses(), 800);
    }
}
