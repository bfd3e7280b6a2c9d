//! Process-wide pool of fixed-size copy buffers
//!
//! Every copy session borrows one buffer for its lifetime and returns it
//! afterwards, so steady-state forwarding does not allocate.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Size of a single copy buffer
pub const BUFFER_SIZE: usize = 4 * 1024;

/// Default cap on idle buffers retained by the pool
const DEFAULT_MAX_IDLE: usize = 256;

/// Counters for pool traffic
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of buffers handed out
    gets: AtomicU64,
    /// Hand-outs served from the free list instead of a fresh allocation
    hits: AtomicU64,
    /// Buffers returned to the pool
    puts: AtomicU64,
}

impl PoolStats {
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the pool counters, for the diagnostics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub gets: u64,
    pub hits: u64,
    pub puts: u64,
    pub idle: usize,
}

/// Thread-safe pool of `BUFFER_SIZE` byte buffers
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
    stats: PoolStats,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(max_idle: usize) -> Self {
        BufferPool {
            free: Mutex::new(Vec::new()),
            max_idle,
            stats: PoolStats::default(),
        }
    }

    /// Take a buffer from the pool, allocating a fresh one if none is idle.
    pub fn get(&self) -> Vec<u8> {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(buf) = self.free.lock().unwrap().pop() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return buf;
        }
        vec![0u8; BUFFER_SIZE]
    }

    /// Return a buffer. Buffers beyond the idle cap are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            gets: self.stats.gets(),
            hits: self.stats.hits(),
            puts: self.stats.puts(),
            idle: self.free.lock().unwrap().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_allocates_buffer_of_fixed_size() {
        let pool = BufferPool::new();
        let buf = pool.get();
        assert_eq!(buf.len(), BUFFER_SIZE);
        assert_eq!(pool.stats().gets(), 1);
        assert_eq!(pool.stats().hits(), 0);
    }

    #[test]
    fn test_put_then_get_reuses_buffer() {
        let pool = BufferPool::new();
        let buf = pool.get();
        pool.put(buf);
        let _buf = pool.get();
        assert_eq!(pool.stats().gets(), 2);
        assert_eq!(pool.stats().hits(), 1);
        assert_eq!(pool.stats().puts(), 1);
    }

    #[test]
    fn test_idle_cap_drops_excess_buffers() {
        let pool = BufferPool::with_max_idle(1);
        let a = pool.get();
        let b = pool.get();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.snapshot().idle, 1);
    }

    #[test]
    fn test_concurrent_get_put() {
        use std::sync::Arc;

        let pool = Arc::new(BufferPool::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let buf = pool.get();
                    pool.put(buf);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.stats().gets(), 800);
        assert_eq!(pool.stats().puts(), 800);
    }
}
