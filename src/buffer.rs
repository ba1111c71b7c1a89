//! Packet buffer pool.
//!
//! Fixed-size blocks are kept on a lock-free free list. `get` pops a free
//! block or allocates a fresh zeroed one when the list is empty; buffers
//! return to the pool on drop and are re-zeroed before reuse so that a
//! consumer extending a payload into a recycled block never observes stale
//! bytes.

use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

pub const DEFAULT_BLOCK_SIZE: usize = 2048;
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

struct PoolInner {
    free: ArrayQueue<Vec<u8>>,
    block_size: usize,
}

/// A thread-safe pool of fixed-size packet buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(capacity: usize, block_size: usize) -> Self {
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = free.push(vec![0u8; block_size]);
        }
        BufferPool {
            inner: Arc::new(PoolInner { free, block_size }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Hands out an empty buffer spanning a whole zeroed block.
    pub fn get(&self) -> PacketBuffer {
        let data = self
            .inner
            .free
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.block_size]);
        PacketBuffer {
            data,
            start: 0,
            len: 0,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Copies an incoming datagram into a pooled buffer.
    pub fn wrap(&self, datagram: &[u8]) -> PacketBuffer {
        let mut buf = self.get();
        if buf.data.len() < datagram.len() {
            buf.data.resize(datagram.len(), 0);
        }
        buf.data[..datagram.len()].copy_from_slice(datagram);
        buf.len = datagram.len();
        buf
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(DEFAULT_POOL_CAPACITY, DEFAULT_BLOCK_SIZE)
    }
}

/// One packet worth of bytes, windowed into a pooled block.
///
/// `start..start + len` is the valid region; header stripping advances
/// `start` in place. The block goes back to its pool on drop.
pub struct PacketBuffer {
    data: Vec<u8>,
    start: usize,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PacketBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.start + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the buffer to its pool. Equivalent to dropping it.
    pub fn release(self) {}

    pub(crate) fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub(crate) fn set_window(&mut self, start: usize, len: usize) {
        debug_assert!(start + len <= self.data.len());
        self.start = start;
        self.len = len;
    }

    /// Drops `n` leading bytes by shifting the prefix `0..keep` right over
    /// them, closing the gap between the kept prefix and the remainder.
    pub(crate) fn strip_gap(&mut self, keep: usize, n: usize) {
        debug_assert!(keep + n <= self.len);
        let base = self.start;
        for i in (0..keep).rev() {
            self.data[base + i + n] = self.data[base + i];
        }
        self.start += n;
        self.len -= n;
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        let mut data = std::mem::take(&mut self.data);
        if data.len() == self.pool.block_size {
            data.iter_mut().for_each(|b| *b = 0);
            let _ = self.pool.free.push(data);
        }
        // Oversized blocks are simply freed.
    }
}
