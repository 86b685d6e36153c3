//! Fixed-cell memory pool for chunked I/O
//!
//! The pool lends 4 MiB cells up to a ceiling derived from available
//! physical memory. Reservations are all-or-nothing; a dropped cell returns
//! to the free list and wakes waiters.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::constants::{
    CELL_SIZE, MEMORY_CACHE_MAXIMUM, MEMORY_CACHE_MULTIPLIER, MEMORY_POOL_CELLS_MAXIMUM,
};
use crate::error::{Result, TransferError};

pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    cell_size: usize,
    capacity: usize,
    state: Mutex<PoolState>,
    released: Notify,
}

struct PoolState {
    in_use: usize,
    // Returned buffers kept for reuse; allocation is lazy, so this can be
    // shorter than capacity - in_use.
    free: Vec<Vec<u8>>,
}

/// One lent buffer. Dereferences to its byte slice; dropping it returns the
/// allocation to the pool.
pub struct Cell {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Cell {
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Drop for Cell {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        let mut state = self.pool.state.lock();
        state.in_use -= 1;
        state.free.push(buf);
        drop(state);
        self.pool.released.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub cell_size: usize,
}

impl MemoryPool {
    /// Pool sized from available physical memory, or from an explicit
    /// ceiling override in bytes.
    pub fn new(maximum_cache_size: Option<u64>) -> Self {
        let ceiling = maximum_cache_size.unwrap_or_else(|| {
            let available = available_physical_memory();
            ((available as f64 * MEMORY_CACHE_MULTIPLIER) as u64).min(MEMORY_CACHE_MAXIMUM)
        });
        let cells = ((ceiling / CELL_SIZE as u64) as usize)
            .clamp(1, MEMORY_POOL_CELLS_MAXIMUM);
        Self::with_capacity(cells)
    }

    /// Pool with an exact cell count. Tests use small pools.
    pub fn with_capacity(cells: usize) -> Self {
        MemoryPool {
            inner: Arc::new(PoolInner {
                cell_size: CELL_SIZE,
                capacity: cells.max(1),
                state: Mutex::new(PoolState {
                    in_use: 0,
                    free: Vec::new(),
                }),
                released: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn cell_size(&self) -> usize {
        self.inner.cell_size
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            capacity: self.inner.capacity,
            in_use: state.in_use,
            cell_size: self.inner.cell_size,
        }
    }

    /// All-or-nothing reservation. `None` means the pool is currently
    /// exhausted; `Err(OutOfMemory)` means the request can never succeed.
    pub fn try_reserve(&self, n: usize) -> Result<Option<Vec<Cell>>> {
        if n == 0 {
            return Ok(Some(Vec::new()));
        }
        if n > self.inner.capacity {
            return Err(TransferError::OutOfMemory {
                requested: n,
                capacity: self.inner.capacity,
            });
        }
        let mut state = self.inner.state.lock();
        if self.inner.capacity - state.in_use < n {
            return Ok(None);
        }
        state.in_use += n;
        let mut cells = Vec::with_capacity(n);
        for _ in 0..n {
            let buf = state
                .free
                .pop()
                .unwrap_or_else(|| vec![0u8; self.inner.cell_size]);
            cells.push(Cell {
                buf,
                pool: Arc::clone(&self.inner),
            });
        }
        Ok(cells.into())
    }

    /// Reservation that waits for cells to come back. Cancellation is the
    /// caller's concern: wrap the future in a select against its token.
    pub async fn reserve(&self, n: usize) -> Result<Vec<Cell>> {
        loop {
            // Register interest before re-checking so a release between the
            // check and the await cannot be missed.
            let mut released = std::pin::pin!(self.inner.released.notified());
            released.as_mut().enable();
            if let Some(cells) = self.try_reserve(n)? {
                return Ok(cells);
            }
            released.await;
        }
    }
}

impl Clone for MemoryPool {
    fn clone(&self) -> Self {
        MemoryPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn available_physical_memory() -> u64 {
    use sysinfo::System;
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory().max(512 * 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_or_nothing() {
        let pool = MemoryPool::with_capacity(4);
        let first = pool.try_reserve(3).unwrap().unwrap();
        assert_eq!(first.len(), 3);
        assert!(pool.try_reserve(2).unwrap().is_none());
        drop(first);
        assert!(pool.try_reserve(4).unwrap().is_some());
    }

    #[test]
    fn over_capacity_is_fatal() {
        let pool = MemoryPool::with_capacity(2);
        match pool.try_reserve(3) {
            Err(TransferError::OutOfMemory { requested, capacity }) => {
                assert_eq!((requested, capacity), (3, 2));
            }
            other => panic!("expected OutOfMemory, got {:?}", other.map(|o| o.is_some())),
        }
    }

    #[test]
    fn buffers_are_reused() {
        let pool = MemoryPool::with_capacity(1);
        let cells = pool.try_reserve(1).unwrap().unwrap();
        let ptr = cells[0].as_slice().as_ptr();
        drop(cells);
        let cells = pool.try_reserve(1).unwrap().unwrap();
        assert_eq!(ptr, cells[0].as_slice().as_ptr());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reserve_waits_for_release() {
        let pool = MemoryPool::with_capacity(1);
        let held = pool.try_reserve(1).unwrap().unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.reserve(1).await.unwrap() });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(held);
        let got = waiter.await.unwrap();
        assert_eq!(got.len(), 1);
    }
}
