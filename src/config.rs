//! Engine configuration
//!
//! One `TransferConfig` value parameterises a manager and everything it
//! builds. The process-wide defaults live in `Default`; tests construct
//! their own instances.

use std::time::Duration;

use crate::constants::{copy_poll, CELL_SIZE, DEFAULT_CELLS_PER_JOB};

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Target concurrency of the transfer scheduler.
    pub parallel_operations: usize,
    /// Cap for the directory-listing scheduler. `None` picks the default
    /// (6, or 4 when either endpoint of a transfer is local).
    pub max_listing_concurrency: Option<usize>,
    /// Block-blob chunk size. Minimum one cell, maximum 100 MiB.
    pub block_size: u64,
    /// Memory pool ceiling override, in bytes.
    pub maximum_cache_size: Option<u64>,
    /// Per-RPC timeout override forwarded to the storage collaborator.
    pub update_service_timeout: Option<Duration>,
    /// Cells reserved per admitted transfer job.
    pub cells_per_job: usize,
    /// Window without copy progress after which `Monitor` fails with
    /// `TransferStuck`.
    pub stall_timeout: Duration,
    /// Skip the journal format-version check on open.
    pub disable_journal_validation: bool,
}

impl TransferConfig {
    pub const MIN_BLOCK_SIZE: u64 = CELL_SIZE as u64;
    pub const MAX_BLOCK_SIZE: u64 = crate::constants::blob_limits::MAX_BLOCK_SIZE;
    pub const DEFAULT_BLOCK_SIZE: u64 = 8 * 1024 * 1024;

    /// Default listing concurrency when both endpoints are remote.
    pub const LISTING_CONCURRENCY_REMOTE: usize = 6;
    /// Default listing concurrency when either endpoint is local.
    pub const LISTING_CONCURRENCY_LOCAL: usize = 4;

    /// Listing-pool size for a transfer with the given locality.
    pub fn listing_concurrency(&self, any_local_endpoint: bool) -> usize {
        self.max_listing_concurrency.unwrap_or(if any_local_endpoint {
            Self::LISTING_CONCURRENCY_LOCAL
        } else {
            Self::LISTING_CONCURRENCY_REMOTE
        })
    }

    /// Validated block size: clamped into the protocol's legal range.
    pub fn effective_block_size(&self) -> u64 {
        self.block_size.clamp(Self::MIN_BLOCK_SIZE, Self::MAX_BLOCK_SIZE)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        TransferConfig {
            // One chunk pipeline per core, doubled so I/O waits overlap.
            parallel_operations: cpus * 2,
            max_listing_concurrency: None,
            block_size: Self::DEFAULT_BLOCK_SIZE,
            maximum_cache_size: None,
            update_service_timeout: None,
            cells_per_job: DEFAULT_CELLS_PER_JOB,
            stall_timeout: default_stall_timeout(),
            disable_journal_validation: false,
        }
    }
}

fn default_stall_timeout() -> Duration {
    let three_polls = copy_poll::MAX_WAIT * 3;
    three_polls.max(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_clamped() {
        let mut cfg = TransferConfig::default();
        cfg.block_size = 1;
        assert_eq!(cfg.effective_block_size(), TransferConfig::MIN_BLOCK_SIZE);
        cfg.block_size = u64::MAX;
        assert_eq!(cfg.effective_block_size(), TransferConfig::MAX_BLOCK_SIZE);
    }

    #[test]
    fn listing_concurrency_defaults() {
        let cfg = TransferConfig::default();
        assert_eq!(cfg.listing_concurrency(true), 4);
        assert_eq!(cfg.listing_concurrency(false), 6);
        let cfg = TransferConfig {
            max_listing_concurrency: Some(2),
            ..TransferConfig::default()
        };
        assert_eq!(cfg.listing_concurrency(true), 2);
    }

    #[test]
    fn stall_timeout_floor() {
        assert!(default_stall_timeout() >= Duration::from_secs(30));
    }
}
