//! Shared engine constants: chunk/cell sizes, protocol limits, polling cadence

/// Size of one memory-pool cell. All chunked I/O is performed in cell-sized
/// pieces, so this is also the transfer chunk granularity.
pub const CELL_SIZE: usize = 4 * 1024 * 1024;

/// Fraction of available physical memory the pool may claim.
pub const MEMORY_CACHE_MULTIPLIER: f64 = 0.5;

/// Ceiling for the memory pool, architecture dependent.
#[cfg(target_pointer_width = "64")]
pub const MEMORY_CACHE_MAXIMUM: u64 = 2 * 1024 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
pub const MEMORY_CACHE_MAXIMUM: u64 = 512 * 1024 * 1024;

/// Absolute cap on pool cell count regardless of physical memory.
pub const MEMORY_POOL_CELLS_MAXIMUM: usize = 8192;

/// Cells reserved per admitted job by default (inner chunk pipelines).
pub const DEFAULT_CELLS_PER_JOB: usize = 4;

// Remote protocol limits, enforced at job construction.
pub mod blob_limits {
    /// Maximum committed blocks per block blob.
    pub const MAX_BLOCK_COUNT: u64 = 50_000;
    /// Maximum size of a single block.
    pub const MAX_BLOCK_SIZE: u64 = 100 * 1024 * 1024;
    /// Maximum size of a single append-blob block.
    pub const MAX_APPEND_BLOCK_SIZE: u64 = 4 * 1024 * 1024;
    /// Largest blob uploadable with one put call.
    pub const SINGLE_PUT_THRESHOLD: u64 = 256 * 1024 * 1024;
    /// Span scanned per page-range query when downloading page blobs.
    pub const PAGE_RANGES_SPAN: u64 = 148 * 1024 * 1024;
}

// Server-side copy monitoring cadence.
pub mod copy_poll {
    use std::time::Duration;

    /// First poll delay, and the floor the back-off resets to near the end.
    pub const MIN_WAIT: Duration = Duration::from_millis(100);
    /// Back-off ceiling.
    pub const MAX_WAIT: Duration = Duration::from_millis(5000);
    /// Polls counted before the wait pins at [`MAX_WAIT`].
    pub const MAX_REQUEST_COUNT: u32 = 100;
    /// Remaining-byte threshold below which the wait drops back to [`MIN_WAIT`].
    pub const APPROACHING_FINISH_THRESHOLD: u64 = 500 * 1024 * 1024;
}

/// Upper bound on outstanding chunk ranges tracked per file.
pub const MAX_TRANSFER_WINDOW: usize = 128;

/// Longest relative path accepted for a sub-transfer, in characters.
pub const MAX_RELATIVE_PATH_LEN: usize = 1024;

/// Lifetime of read SAS tokens generated for server-side copy sources.
pub const COPY_SAS_LIFETIME: std::time::Duration =
    std::time::Duration::from_secs(7 * 24 * 60 * 60);

/// User agent string handed to the storage collaborator.
pub const USER_AGENT: &str = concat!("DataMovement/", env!("CARGO_PKG_VERSION"));

/// Format-version string written to journal headers.
pub const FORMAT_VERSION: &str = concat!("ferry/", env!("CARGO_PKG_VERSION"));
