//! Transfer manager: the public entry points
//!
//! Owns the process-wide schedulers, memory pool, and the in-flight
//! transfer map keyed by `(source, destination)`. Each entry point builds
//! the two locations, asks the checkpoint for the transfer (existing when
//! resuming, fresh otherwise), enforces uniqueness, and drives
//! `execute`. The transfer leaves the in-flight map on return regardless
//! of outcome.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::TransferCheckpoint;
use crate::client::BlobClient;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::location::{BlobDirLocation, BlobLocation, Credentials, StreamHandle, TransferLocation};
use crate::memory::MemoryPool;
use crate::progress::ProgressSnapshot;
use crate::scheduler::{ListingScheduler, TransferRuntime, TransferScheduler};
use crate::transfer::{
    validate_pair, DirectoryOptions, Transfer, TransferContext, TransferKey, TransferMethod,
};

/// Which orchestration a directory transfer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryMode {
    /// One enumerator streams every file.
    Flat,
    /// Producer/consumer discovery, one directory level at a time.
    Hierarchical,
}

pub struct TransferManager {
    client: Arc<dyn BlobClient>,
    config: Arc<TransferConfig>,
    scheduler: Arc<TransferScheduler>,
    listing: Arc<ListingScheduler>,
    cancellation: CancellationToken,
    active: Mutex<HashSet<TransferKey>>,
}

impl TransferManager {
    pub fn new(client: Arc<dyn BlobClient>, config: TransferConfig) -> Self {
        let memory = MemoryPool::new(config.maximum_cache_size);
        let scheduler = TransferScheduler::new(config.parallel_operations, memory);
        let listing = ListingScheduler::new(
            config
                .max_listing_concurrency
                .unwrap_or(TransferConfig::LISTING_CONCURRENCY_REMOTE),
        );
        TransferManager {
            client,
            config: Arc::new(config),
            scheduler,
            listing,
            cancellation: CancellationToken::new(),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TransferScheduler> {
        &self.scheduler
    }

    /// Root cancellation token; cancelling stops admitting new chunks and
    /// drains in-flight work.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    fn runtime(&self) -> TransferRuntime {
        TransferRuntime {
            client: Arc::clone(&self.client),
            config: Arc::clone(&self.config),
            scheduler: Arc::clone(&self.scheduler),
            listing: Arc::clone(&self.listing),
            cancellation: self.cancellation.clone(),
        }
    }

    /// Open (or initialize) a journal-backed checkpoint under this
    /// manager's validation policy.
    pub fn open_checkpoint(
        &self,
        stream: Box<dyn crate::journal::JournalStream>,
    ) -> Result<TransferCheckpoint> {
        TransferCheckpoint::open_journal(stream, !self.config.disable_journal_validation)
    }

    /// Fill per-request defaults the caller left unset.
    fn apply_request_defaults(&self, location: &mut TransferLocation) {
        let Some(timeout) = self.config.update_service_timeout else {
            return;
        };
        match location {
            TransferLocation::RemoteBlob(b) => {
                b.request_options.server_timeout.get_or_insert(timeout);
            }
            TransferLocation::RemoteBlobDirectory(d) => {
                d.request_options.server_timeout.get_or_insert(timeout);
            }
            _ => {}
        }
    }

    // -- single-object entry points --------------------------------------

    pub async fn upload(
        &self,
        source: impl Into<PathBuf>,
        destination: BlobLocation,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        let source = TransferLocation::local_file(source);
        let destination = TransferLocation::RemoteBlob(destination);
        self.run_single(source, destination, TransferMethod::SyncCopy, ctx)
            .await
    }

    pub async fn upload_stream(
        &self,
        source: StreamHandle,
        destination: BlobLocation,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        let source = TransferLocation::Stream(source);
        let destination = TransferLocation::RemoteBlob(destination);
        self.run_single(source, destination, TransferMethod::SyncCopy, ctx)
            .await
    }

    pub async fn download(
        &self,
        source: BlobLocation,
        destination: impl Into<PathBuf>,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        let source = TransferLocation::RemoteBlob(source);
        let destination = TransferLocation::local_file(destination);
        self.run_single(source, destination, TransferMethod::SyncCopy, ctx)
            .await
    }

    pub async fn download_to_stream(
        &self,
        source: BlobLocation,
        destination: StreamHandle,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        let source = TransferLocation::RemoteBlob(source);
        let destination = TransferLocation::Stream(destination);
        self.run_single(source, destination, TransferMethod::SyncCopy, ctx)
            .await
    }

    /// Server-side copy between blobs. `method` must be one of the two
    /// service-side methods.
    pub async fn copy(
        &self,
        source: BlobLocation,
        destination: BlobLocation,
        method: TransferMethod,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        require_service_method(method)?;
        let source = TransferLocation::RemoteBlob(source);
        let destination = TransferLocation::RemoteBlob(destination);
        self.run_single(source, destination, method, ctx).await
    }

    /// Server-side copy from an arbitrary readable URI.
    pub async fn copy_from_uri(
        &self,
        source_uri: impl Into<String>,
        destination: BlobLocation,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        let source = TransferLocation::SourceUri {
            uri: source_uri.into(),
        };
        let destination = TransferLocation::RemoteBlob(destination);
        self.run_single(source, destination, TransferMethod::ServiceSideAsyncCopy, ctx)
            .await
    }

    // -- directory entry points ------------------------------------------

    pub async fn upload_directory(
        &self,
        source: impl Into<PathBuf>,
        destination: BlobDirLocation,
        options: DirectoryOptions,
        mode: DirectoryMode,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        let source = TransferLocation::local_directory(source);
        let destination = TransferLocation::RemoteBlobDirectory(destination);
        self.run_directory(source, destination, TransferMethod::SyncCopy, options, mode, ctx)
            .await
    }

    pub async fn download_directory(
        &self,
        source: BlobDirLocation,
        destination: impl Into<PathBuf>,
        options: DirectoryOptions,
        mode: DirectoryMode,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        let source = TransferLocation::RemoteBlobDirectory(source);
        let destination = TransferLocation::local_directory(destination);
        self.run_directory(source, destination, TransferMethod::SyncCopy, options, mode, ctx)
            .await
    }

    pub async fn copy_directory(
        &self,
        source: BlobDirLocation,
        destination: BlobDirLocation,
        method: TransferMethod,
        options: DirectoryOptions,
        mode: DirectoryMode,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        require_service_method(method)?;
        let source = TransferLocation::RemoteBlobDirectory(source);
        let destination = TransferLocation::RemoteBlobDirectory(destination);
        self.run_directory(source, destination, method, options, mode, ctx)
            .await
    }

    // -- shared machinery ------------------------------------------------

    async fn run_single(
        &self,
        mut source: TransferLocation,
        mut destination: TransferLocation,
        method: TransferMethod,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        self.apply_request_defaults(&mut source);
        self.apply_request_defaults(&mut destination);
        validate_pair(&source, &destination)?;
        let key = TransferKey::new(&source, &destination);
        self.run(key, source, destination, ctx, move |source, destination| {
            Transfer::new_single(source, destination, method)
        })
        .await
    }

    async fn run_directory(
        &self,
        mut source: TransferLocation,
        mut destination: TransferLocation,
        method: TransferMethod,
        options: DirectoryOptions,
        mode: DirectoryMode,
        ctx: &TransferContext,
    ) -> Result<ProgressSnapshot> {
        self.apply_request_defaults(&mut source);
        self.apply_request_defaults(&mut destination);
        validate_pair(&source, &destination)?;
        let key = TransferKey::new(&source, &destination);
        let max_concurrency = self.config.parallel_operations;
        self.run(key, source, destination, ctx, move |source, destination| {
            match mode {
                DirectoryMode::Flat => {
                    Transfer::new_flat_directory(source, destination, method, options)
                }
                DirectoryMode::Hierarchical => Transfer::new_hierarchy_directory(
                    source,
                    destination,
                    method,
                    options,
                    max_concurrency,
                ),
            }
        })
        .await
    }

    async fn run(
        &self,
        key: TransferKey,
        source: TransferLocation,
        destination: TransferLocation,
        ctx: &TransferContext,
        build: impl FnOnce(TransferLocation, TransferLocation) -> Transfer,
    ) -> Result<ProgressSnapshot> {
        {
            let mut active = self.active.lock();
            if !active.insert(key.clone()) {
                return Err(TransferError::TransferAlreadyExists {
                    src: key.source,
                    dest: key.dest,
                });
            }
        }
        let _guard = ActiveGuard {
            manager: self,
            key: key.clone(),
        };

        let ephemeral;
        let checkpoint: &TransferCheckpoint = match &ctx.checkpoint {
            Some(shared) => shared.as_ref(),
            None => {
                ephemeral = TransferCheckpoint::in_memory();
                &ephemeral
            }
        };
        // A resumed root picks up the caller's current credentials.
        checkpoint.refresh_root_credentials(
            credentials_of(&source),
            credentials_of(&destination),
        )?;
        let transfer = checkpoint.get_transfer(&key, move || build(source, destination))?;

        if let Some(logger) = &ctx.logger {
            logger.transfer_started(&key.source, &key.dest);
        }
        let started = Instant::now();
        let rt = self.runtime();
        let result = transfer.execute(&rt, ctx).await;
        let snapshot = transfer.progress.snapshot();
        if let Some(logger) = &ctx.logger {
            logger.run_completed(&snapshot, started.elapsed().as_secs_f64());
        }
        result.map(|()| snapshot)
    }
}

fn require_service_method(method: TransferMethod) -> Result<()> {
    match method {
        TransferMethod::ServiceSideAsyncCopy | TransferMethod::ServiceSideSyncCopy => Ok(()),
        other => Err(TransferError::Uncategorized(format!(
            "copy requires a service-side method, got {other:?}"
        ))),
    }
}

fn credentials_of(location: &TransferLocation) -> Option<Credentials> {
    match location {
        TransferLocation::RemoteBlob(b) => Some(b.credentials.clone()),
        TransferLocation::RemoteBlobDirectory(d) => Some(d.credentials.clone()),
        _ => None,
    }
}

struct ActiveGuard<'a> {
    manager: &'a TransferManager,
    key: TransferKey,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.manager.active.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{BlobType, BlobUri};
    use crate::testing::MemoryBlobStore;

    fn manager() -> TransferManager {
        let config = TransferConfig {
            parallel_operations: 4,
            maximum_cache_size: Some(16 * crate::constants::CELL_SIZE as u64),
            ..TransferConfig::default()
        };
        TransferManager::new(Arc::new(MemoryBlobStore::new()), config)
    }

    fn blob(uri: &str) -> BlobLocation {
        BlobLocation::new(
            BlobUri::parse(uri).unwrap(),
            BlobType::Block,
            Credentials::Anonymous,
        )
    }

    #[tokio::test]
    async fn equal_endpoints_rejected() {
        let m = manager();
        let ctx = TransferContext::default();
        let result = m
            .copy(
                blob("https://e/c/same"),
                blob("https://e/c/same"),
                TransferMethod::ServiceSideAsyncCopy,
                &ctx,
            )
            .await;
        assert!(matches!(
            result,
            Err(TransferError::SourceAndDestinationLocationEqual(_))
        ));
    }

    #[tokio::test]
    async fn copy_requires_service_method() {
        let m = manager();
        let ctx = TransferContext::default();
        let result = m
            .copy(
                blob("https://e/c/a"),
                blob("https://e/c/b"),
                TransferMethod::SyncCopy,
                &ctx,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn concurrent_duplicate_key_rejected() {
        let m = Arc::new(manager());
        // Hold the key by inserting it directly, as a long-running transfer
        // would.
        let src = TransferLocation::RemoteBlob(blob("https://e/c/x"));
        let dst = TransferLocation::local_file("/tmp/x");
        let key = TransferKey::new(&src, &dst);
        m.active.lock().insert(key);
        let ctx = TransferContext::default();
        let result = m.download(blob("https://e/c/x"), "/tmp/x", &ctx).await;
        assert!(matches!(
            result,
            Err(TransferError::TransferAlreadyExists { .. })
        ));
    }
}
