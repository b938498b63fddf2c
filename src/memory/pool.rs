//! Thread-safe object pools for I/O buffers and operation descriptors.
//!
//! A [`Pool`] hands out [`Lease`]s checked out of its [`Slab`]. Dropping a lease
//! recycles the object and parks it back in its slab slot, so the next
//! [`Pool::allocate`] reuses it instead of provisioning a new one. The slab's chunk
//! count tracks how many objects the pool has had to provision.
//!
//! Buffers that must be owned by several in-flight operations at once are frozen
//! into a [`SharedBuffer`]. Cloning one bumps its reference count; the buffer goes
//! back to its pool when the last clone is dropped.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use log::{debug, trace};
use parking_lot::Mutex;

use super::{
    MemoryError,
    slab::{Slab, SlabKey},
};

/// Resets pooled objects before they are handed out again.
pub trait Recycle {
    fn recycle(&mut self);
}

/// Sizing for a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Objects provisioned per slab chunk.
    pub chunk_size: usize,
    /// Upper bound on chunks; allocation past it fails with [`MemoryError::Exhausted`].
    pub max_chunks: usize,
}

impl PoolConfig {
    /// Provisions `max_sessions / 8` objects per chunk.
    pub fn for_sessions(max_sessions: usize, max_chunks: usize) -> Self {
        Self {
            chunk_size: (max_sessions / 8).max(1),
            max_chunks,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: usize,
    pub cached: usize,
    pub chunks: usize,
    pub capacity: usize,
}

struct Shared<T> {
    name: &'static str,
    config: PoolConfig,
    slab: Mutex<Slab<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

pub struct Pool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<T: Recycle> Pool<T> {
    pub fn new<F>(name: &'static str, config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        assert!(config.max_chunks > 0);

        Self {
            shared: Arc::new(Shared {
                name,
                config,
                slab: Mutex::new(Slab::new(config.chunk_size)),
                factory: Box::new(factory),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Leases an object, reusing a recycled one when available.
    pub fn allocate(&self) -> Result<Lease<T>, MemoryError> {
        let shared = &self.shared;
        let (key, value) = {
            let mut slab = shared.slab.lock();
            let full = slab.len() == slab.capacity();
            if full && slab.chunk_count() >= shared.config.max_chunks {
                return Err(MemoryError::Exhausted {
                    pool: shared.name,
                    capacity: slab.capacity(),
                });
            }
            slab.allocate(|| {
                trace!("pool {} provisioning a new object", shared.name);
                (shared.factory)()
            })
        };

        Ok(Lease {
            key,
            value: Some(value),
            pool: self.clone(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let slab = self.shared.slab.lock();
        PoolStats {
            in_use: slab.len(),
            cached: slab.parked(),
            chunks: slab.chunk_count(),
            capacity: slab.capacity(),
        }
    }

    fn release(&self, key: SlabKey, mut value: T) {
        value.recycle();
        if !self.shared.slab.lock().destroy(key, value) {
            debug!("pool {}: release of unknown slot", self.shared.name);
        }
    }
}

/// Exclusive handle to a pooled object. Dropping it returns the object to its pool.
pub struct Lease<T: Recycle> {
    key: SlabKey,
    value: Option<T>,
    pool: Pool<T>,
}

impl<T: Recycle> Lease<T> {
    /// Converts this lease into a reference-counted handle.
    pub fn freeze(self) -> SharedBuffer<T> {
        SharedBuffer {
            inner: Arc::new(self),
        }
    }
}

impl<T: Recycle> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Only `Drop` empties the slot.
        self.value.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(self.key, value);
        }
    }
}

impl<T: Recycle + fmt::Debug> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool.name())
            .field("value", &self.value)
            .finish()
    }
}

/// Reference-counted, read-only pooled object.
pub struct SharedBuffer<T: Recycle = IoBuffer> {
    inner: Arc<Lease<T>>,
}

impl<T: Recycle> SharedBuffer<T> {
    /// Number of live handles to this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T: Recycle> Clone for SharedBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Recycle> Deref for SharedBuffer<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: Recycle + fmt::Debug> fmt::Debug for SharedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("refs", &self.ref_count())
            .field("lease", &self.inner)
            .finish()
    }
}

/// Fixed-capacity byte region with a fill length.
pub struct IoBuffer {
    bytes: Box<[u8]>,
    len: usize,
}

impl IoBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The filled part of the buffer.
    pub fn filled(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The whole backing region, regardless of fill length.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.bytes.len());
    }
}

impl Recycle for IoBuffer {
    fn recycle(&mut self) {
        self.len = 0;
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("capacity", &self.bytes.len())
            .field("len", &self.len)
            .finish()
    }
}

/// Pool of [`IoBuffer`]s of one size.
pub type BufferPool = Pool<IoBuffer>;

impl BufferPool {
    pub fn buffers(name: &'static str, buffer_size: usize, config: PoolConfig) -> Self {
        Self::new(name, config, move || IoBuffer::new(buffer_size))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;

    fn config(chunk_size: usize, max_chunks: usize) -> PoolConfig {
        PoolConfig {
            chunk_size,
            max_chunks,
        }
    }

    #[test]
    fn chunk_size_follows_sessions() {
        assert_eq!(PoolConfig::for_sessions(64, 4).chunk_size, 8);
        assert_eq!(PoolConfig::for_sessions(3, 4).chunk_size, 1);
    }

    #[test]
    fn reuse_does_not_grow() {
        let pool = BufferPool::buffers("test", 16, config(2, 4));

        let mut lease = pool.allocate().unwrap();
        lease.as_mut_slice()[..3].copy_from_slice(b"abc");
        lease.set_len(3);
        drop(lease);

        let lease = pool.allocate().unwrap();
        assert!(lease.is_empty());
        assert_eq!(lease.capacity(), 16);

        let stats = pool.stats();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.in_use, 1);
    }

    #[test]
    fn released_objects_are_parked_in_slab() {
        let made = Arc::new(AtomicUsize::new(0));
        let pool = {
            let made = Arc::clone(&made);
            Pool::new("parked", config(2, 2), move || {
                made.fetch_add(1, Ordering::SeqCst);
                IoBuffer::new(8)
            })
        };

        let mut lease = pool.allocate().unwrap();
        lease.as_mut_slice()[..3].copy_from_slice(b"xyz");
        drop(lease);
        assert_eq!(pool.stats().cached, 1);

        let mut lease = pool.allocate().unwrap();
        assert_eq!(&lease.as_mut_slice()[..3], b"xyz");
        assert_eq!(made.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().cached, 0);
    }

    #[test]
    fn exhaustion_is_reported() {
        let pool = BufferPool::buffers("tiny", 4, config(1, 2));
        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();

        assert!(matches!(
            pool.allocate(),
            Err(MemoryError::Exhausted {
                pool: "tiny",
                capacity: 2
            })
        ));
    }

    #[test]
    fn shared_buffer_returns_on_last_drop() {
        let pool = BufferPool::buffers("shared", 8, config(4, 1));
        let shared = pool.allocate().unwrap().freeze();
        let copies: Vec<_> = (0..3).map(|_| shared.clone()).collect();

        assert_eq!(shared.ref_count(), 4);
        drop(shared);
        assert_eq!(pool.stats().in_use, 1);

        drop(copies);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.cached, 1);
    }

    #[test]
    fn cache_follows_slab_shrink() {
        let pool = BufferPool::buffers("shrink", 8, config(2, 8));
        let leases: Vec<_> = (0..6).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.stats().chunks, 3);

        drop(leases);
        let stats = pool.stats();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.cached, 2);
    }

    #[test]
    fn concurrent_reuse_does_not_grow() {
        let pool = BufferPool::buffers("threads", 32, config(8, 4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let lease = pool.allocate().unwrap();
                        drop(lease);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.in_use, 0);
        assert!(stats.cached <= 8);
    }
}
