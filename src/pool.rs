//! Shared I/O buffer pool
//!
//! Negotiators hand a pool to every session they accept. The handshake reads
//! the upgrade request into a pooled buffer; after that the pool belongs to
//! the frame layer and negotiation never touches it.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;

/// Default capacity of pooled buffers (matches the 4KB handshake read size)
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default number of idle buffers kept
pub const DEFAULT_MAX_CACHED: usize = 64;

struct PoolInner {
    free_list: Vec<BytesMut>,
    buffer_size: usize,
    max_cached: usize,
}

/// Cloneable handle to a pool of reusable `BytesMut` buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl BufferPool {
    /// Create a pool of `buffer_size` byte buffers keeping at most `max_cached` idle
    pub fn new(buffer_size: usize, max_cached: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                free_list: Vec::with_capacity(max_cached),
                buffer_size,
                max_cached,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // A panic while holding the lock cannot leave the free list inconsistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take an empty buffer, allocating if none is cached
    pub fn get(&self) -> BytesMut {
        let mut inner = self.lock();
        let size = inner.buffer_size;
        inner
            .free_list
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(size))
    }

    /// Return a buffer; it is dropped if the pool is full or the buffer shrank
    pub fn put(&self, mut buffer: BytesMut) {
        let mut inner = self.lock();
        if inner.free_list.len() < inner.max_cached && buffer.capacity() >= inner.buffer_size {
            buffer.clear();
            inner.free_list.push(buffer);
        }
    }

    /// Number of idle buffers
    pub fn cached(&self) -> usize {
        self.lock().free_list.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.lock().buffer_size
    }

    /// Check whether two handles share the same pool
    pub fn same_pool(&self, other: &BufferPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_CACHED)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("BufferPool")
            .field("buffer_size", &inner.buffer_size)
            .field("cached", &inner.free_list.len())
            .field("max_cached", &inner.max_cached)
            .finish()
    }
}
