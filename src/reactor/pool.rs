//! Byte buffer pools
//!
//! A pool is a bounded LIFO free-list shared by all workers. Running dry
//! never blocks: a fresh buffer is allocated outside the pool instead, and a
//! buffer returned to a full pool is dropped.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Counters snapshot of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub gets: u64,
    pub misses: u64,
    pub returns: u64,
    pub discards: u64,
}

/// Fixed-capacity free-list of pre-sized buffers
#[derive(Debug)]
pub struct BufferPool {
    name: &'static str,
    stack: Mutex<Vec<BytesMut>>,
    capacity: usize,
    buffer_size: usize,
    gets: AtomicU64,
    misses: AtomicU64,
    returns: AtomicU64,
    discards: AtomicU64,
}

impl BufferPool {
    /// Create a pool pre-filled with `capacity` buffers of `buffer_size` bytes
    pub fn new(name: &'static str, capacity: usize, buffer_size: usize) -> Self {
        let stack = (0..capacity)
            .map(|_| BytesMut::with_capacity(buffer_size))
            .collect();
        Self {
            name,
            stack: Mutex::new(stack),
            capacity,
            buffer_size,
            gets: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    /// Take an empty buffer with at least `buffer_size` bytes of capacity
    pub fn get(&self) -> BytesMut {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(buf) = self.stack.lock().pop() {
            return buf;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("{} pool exhausted, allocating {} bytes", self.name, self.buffer_size);
        BytesMut::with_capacity(self.buffer_size)
    }

    /// Give a buffer back. Zero-capacity placeholders are ignored.
    pub fn return_back(&self, mut buf: BytesMut) {
        if buf.capacity() == 0 {
            return;
        }
        self.returns.fetch_add(1, Ordering::Relaxed);
        self.refresh(&mut buf);

        let mut stack = self.stack.lock();
        if stack.len() < self.capacity {
            stack.push(buf);
        } else {
            self.discards.fetch_add(1, Ordering::Relaxed);
            trace!("{} pool full, dropping buffer", self.name);
        }
    }

    /// Reset a buffer for reuse without going through the free-list
    pub fn refresh(&self, buf: &mut BytesMut) {
        buf.clear();
        buf.reserve(self.buffer_size);
    }

    /// Buffers currently on the free-list
    pub fn available(&self) -> usize {
        self.stack.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            gets: self.gets.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }
}

/// The three pools every connection draws from
#[derive(Debug)]
pub struct BufferPools {
    /// Socket read buffers
    pub read: BufferPool,
    /// Staged writes, sized for a read plus frame overhead
    pub write: BufferPool,
    /// Frame reassembly scratch, sized for one maximal frame
    pub frame: BufferPool,
}

impl BufferPools {
    pub fn new(read: BufferPool, write: BufferPool, frame: BufferPool) -> Self {
        Self { read, write, frame }
    }

    pub(crate) fn log_stats(&self) {
        for pool in [&self.read, &self.write, &self.frame] {
            let stats = pool.stats();
            debug!(
                "{} pool: gets={} misses={} returns={} discards={} available={}/{}",
                pool.name,
                stats.gets,
                stats.misses,
                stats.returns,
                stats.discards,
                pool.available(),
                pool.capacity,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::collections::HashSet;

    #[test]
    fn test_live_buffers_never_alias() {
        let pool = BufferPool::new("test", 4, 64);
        let mut live: Vec<BytesMut> = (0..6).map(|_| pool.get()).collect();

        let ptrs: HashSet<*const u8> = live.iter().map(|b| b.as_ptr()).collect();
        assert_eq!(ptrs.len(), live.len());
        assert_eq!(pool.stats().misses, 2);

        // Return half, get them again, still no aliasing with the live half
        for buf in live.drain(..3) {
            pool.return_back(buf);
        }
        live.extend((0..3).map(|_| pool.get()));
        let ptrs: HashSet<*const u8> = live.iter().map(|b| b.as_ptr()).collect();
        assert_eq!(ptrs.len(), live.len());
    }

    #[test]
    fn test_buffers_are_reset() {
        let pool = BufferPool::new("test", 2, 128);
        let mut buf = pool.get();
        buf.put_slice(&[7u8; 100]);
        pool.return_back(buf);

        for _ in 0..3 {
            let buf = pool.get();
            assert_eq!(buf.len(), 0);
            assert!(buf.capacity() >= 128);
        }
    }

    #[test]
    fn test_refresh_after_partial_consume() {
        use bytes::Buf;

        let pool = BufferPool::new("test", 1, 32);
        let mut buf = pool.get();
        buf.put_slice(&[1u8; 32]);
        buf.advance(20);
        pool.refresh(&mut buf);
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 32);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let pool = BufferPool::new("test", 2, 16);
        let extra: Vec<BytesMut> = (0..5).map(|_| BytesMut::with_capacity(16)).collect();
        for buf in extra {
            pool.return_back(buf);
        }
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.stats().discards, 5);
    }

    #[test]
    fn test_placeholder_return_ignored() {
        let pool = BufferPool::new("test", 2, 16);
        let _held = pool.get();
        pool.return_back(BytesMut::new());
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().returns, 0);
    }
}
