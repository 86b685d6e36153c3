//! Schedulers: bounded admission for transfer jobs and listing tasks
//!
//! A transfer job is admitted only when the parallelism semaphore has a
//! permit and the memory pool can cover its cells; both waits observe the
//! run's cancellation token. The directory-listing scheduler is a separate,
//! smaller pool so listing latency and data transfers cannot starve each
//! other. Tokio's semaphore queues waiters FIFO, which is also the
//! tie-break for equally-ready jobs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::client::BlobClient;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::memory::{Cell, MemoryPool};

pub struct TransferScheduler {
    semaphore: Arc<Semaphore>,
    memory: MemoryPool,
    active: Arc<AtomicUsize>,
}

/// A granted admission: the parallelism permit plus the job's cells. Both
/// return to their pools when this drops.
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    cells: Vec<Cell>,
    active: Arc<AtomicUsize>,
}

impl Admission {
    /// Move the cells out; the permit stays with the admission, so keep it
    /// alive until the job's chunk work settles.
    pub fn take_cells(&mut self) -> Vec<Cell> {
        std::mem::take(&mut self.cells)
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TransferScheduler {
    pub fn new(parallel_operations: usize, memory: MemoryPool) -> Arc<Self> {
        Arc::new(TransferScheduler {
            semaphore: Arc::new(Semaphore::new(parallel_operations.max(1))),
            memory,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn memory(&self) -> &MemoryPool {
        &self.memory
    }

    /// Jobs currently holding an admission.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub async fn admit_with(
        self: &Arc<Self>,
        cells: usize,
        cancellation: &CancellationToken,
    ) -> Result<Admission> {
        let permit = tokio::select! {
            _ = cancellation.cancelled() => return Err(TransferError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| TransferError::Cancelled)?
            }
        };
        let cells = tokio::select! {
            _ = cancellation.cancelled() => return Err(TransferError::Cancelled),
            reserved = self.memory.reserve(cells) => reserved?,
        };
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(Admission {
            _permit: permit,
            cells,
            active: Arc::clone(&self.active),
        })
    }
}

/// Bounded pool for enumeration tasks.
pub struct ListingScheduler {
    semaphore: Arc<Semaphore>,
}

impl ListingScheduler {
    pub fn new(concurrency: usize) -> Arc<Self> {
        Arc::new(ListingScheduler {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        })
    }

    pub async fn acquire(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancellation.cancelled() => Err(TransferError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| TransferError::Cancelled)
            }
        }
    }
}

/// Everything a transfer needs to run, passed explicitly: the storage
/// client, configuration, both schedulers, and the run's cancellation
/// token. The manager owns the process-wide instances.
#[derive(Clone)]
pub struct TransferRuntime {
    pub client: Arc<dyn BlobClient>,
    pub config: Arc<TransferConfig>,
    pub scheduler: Arc<TransferScheduler>,
    pub listing: Arc<ListingScheduler>,
    pub cancellation: CancellationToken,
}

impl TransferRuntime {
    /// Runtime scoped to one run: internal token linked to the root so a
    /// fatal error can cancel the run without touching its siblings.
    pub fn for_run(&self) -> TransferRuntime {
        TransferRuntime {
            cancellation: self.cancellation.child_token(),
            ..self.clone()
        }
    }

    /// Admission against this runtime's cancellation token.
    pub async fn admit(&self, cells: usize) -> Result<Admission> {
        self.scheduler.admit_with(cells, &self.cancellation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn admission_bounds_parallelism() {
        let scheduler = TransferScheduler::new(1, MemoryPool::with_capacity(4));
        let cancel = CancellationToken::new();
        let first = scheduler.admit_with(1, &cancel).await.unwrap();
        let scheduler2 = Arc::clone(&scheduler);
        let cancel2 = cancel.clone();
        let second = tokio::spawn(async move { scheduler2.admit_with(1, &cancel2).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        drop(first);
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn admission_respects_cancellation() {
        let scheduler = TransferScheduler::new(1, MemoryPool::with_capacity(1));
        let cancel = CancellationToken::new();
        let _held = scheduler.admit_with(1, &cancel).await.unwrap();
        let waiting = {
            let scheduler = Arc::clone(&scheduler);
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.admit_with(1, &cancel).await })
        };
        cancel.cancel();
        let outcome = waiting.await.unwrap();
        assert!(matches!(outcome, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn memory_gates_even_with_permits() {
        let scheduler = TransferScheduler::new(8, MemoryPool::with_capacity(2));
        let cancel = CancellationToken::new();
        let mut first = scheduler.admit_with(2, &cancel).await.unwrap();
        let cells = first.take_cells();
        assert_eq!(cells.len(), 2);
        let scheduler2 = Arc::clone(&scheduler);
        let cancel2 = cancel.clone();
        let blocked = tokio::spawn(async move { scheduler2.admit_with(1, &cancel2).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        drop(cells);
        assert!(blocked.await.unwrap().is_ok());
    }
}
