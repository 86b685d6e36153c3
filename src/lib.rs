//! Ferry
//!
//! Resumable, concurrent data movement between a local filesystem and a
//! remote blob object store. The engine transfers single objects or whole
//! directory trees in bounded memory, persists its progress to a binary
//! stream journal as it goes, and can reopen that journal after a process
//! kill to continue from exactly the point it left off.
//!
//! The storage wire protocol stays behind the [`client::BlobClient`]
//! capability; [`testing::MemoryBlobStore`] implements it in memory for
//! hermetic tests.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod constants;
pub mod enumerate;
pub mod error;
pub mod journal;
pub mod location;
pub mod logger;
pub mod manager;
pub mod memory;
pub mod progress;
pub mod scheduler;
pub mod testing;
pub mod transfer;

pub use checkpoint::{TransferCheckpoint, TransferCollection};
pub use client::{BlobClient, BlobProperties, CopyState, CopyStatus};
pub use config::TransferConfig;
pub use error::{ErrorKind, TransferError};
pub use location::{
    BlobDirLocation, BlobLocation, BlobType, BlobUri, Credentials, RequestOptions, StreamHandle,
    TransferLocation,
};
pub use manager::{DirectoryMode, TransferManager};
pub use progress::{ProgressHandler, ProgressSnapshot, ProgressTracker};
pub use transfer::{
    DirectoryOptions, JobStatus, Transfer, TransferContext, TransferEvent, TransferMethod,
    TransferOutcome,
};
