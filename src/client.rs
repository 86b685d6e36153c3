//! The capability the engine consumes from its storage collaborator
//!
//! Everything the core needs from the remote store fits in one trait. The
//! concrete wire protocol (auth, retries below the engine's own policy,
//! server-side limits) lives behind it; the engine only assumes the
//! operations are cancellable and, where noted, idempotent.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::location::{BlobDirLocation, BlobLocation, BlobType};

/// Metadata key marking a zero-byte blob as a directory placeholder.
pub const FOLDER_MARKER_KEY: &str = "hdi_isfolder";

/// True when `metadata` carries the folder marker (key and value are both
/// matched case-insensitively).
pub fn is_folder_marker(metadata: &BTreeMap<String, String>) -> bool {
    metadata
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case(FOLDER_MARKER_KEY) && v.eq_ignore_ascii_case("true"))
}

#[derive(Debug, Clone, Default)]
pub struct BlobProperties {
    pub length: u64,
    pub content_md5: Option<String>,
    pub blob_type: BlobType,
    pub etag: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Aborted,
    Failed,
}

impl CopyStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CopyStatus::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct CopyState {
    pub status: CopyStatus,
    pub bytes_copied: u64,
    pub total_bytes: u64,
    pub status_description: Option<String>,
}

/// One listing result page.
#[derive(Debug, Clone, Default)]
pub struct ListSegment {
    pub items: Vec<ListItem>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ListItem {
    Blob(BlobItem),
    /// A virtual directory prefix produced by delimiter listing. Relative
    /// to the listed prefix, without the trailing delimiter.
    Prefix(String),
}

#[derive(Debug, Clone)]
pub struct BlobItem {
    /// Name relative to the listed prefix, `/`-separated.
    pub name: String,
    pub length: u64,
    pub blob_type: BlobType,
    pub content_md5: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl BlobItem {
    pub fn is_folder_marker(&self) -> bool {
        self.length == 0 && is_folder_marker(&self.metadata)
    }
}

/// Storage collaborator contract. All operations observe the caller's
/// cancellation by being dropped at a suspension point; implementations
/// must therefore leave the store consistent across cancelled calls.
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// Properties of a blob, or `None` when it does not exist. Container
    /// probes answering 403/404 are soft failures and also map to `None`.
    async fn fetch_metadata(&self, blob: &BlobLocation) -> Result<Option<BlobProperties>>;

    /// Upload a whole blob in one call, with optional content MD5 and
    /// metadata. Only legal up to the single-put threshold.
    async fn put_blob(
        &self,
        blob: &BlobLocation,
        data: &[u8],
        content_md5: Option<&str>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Stage one block. Idempotent per `block_id`.
    async fn put_block(
        &self,
        blob: &BlobLocation,
        block_id: &str,
        offset: u64,
        data: &[u8],
        md5: Option<&str>,
    ) -> Result<()>;

    /// Commit the staged block list in order.
    async fn commit_block_list(
        &self,
        blob: &BlobLocation,
        block_ids: &[String],
        content_md5: Option<&str>,
    ) -> Result<()>;

    /// Write a page/append region at `offset`.
    async fn put_page_or_append(&self, blob: &BlobLocation, offset: u64, data: &[u8])
        -> Result<()>;

    /// Read `length` bytes starting at `offset`.
    async fn get_range(&self, blob: &BlobLocation, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Begin a server-side copy; returns the copy id to poll with.
    async fn start_server_copy(
        &self,
        source_uri: &str,
        destination: &BlobLocation,
    ) -> Result<String>;

    /// Current state of the pending copy on `blob`.
    async fn get_copy_status(&self, blob: &BlobLocation) -> Result<CopyState>;

    /// Read-only SAS URI for `blob`, valid for `lifetime`.
    fn generate_read_sas(&self, blob: &BlobLocation, lifetime: Duration) -> Result<String>;

    /// One page of a (possibly delimiter-folded) listing under `prefix`.
    async fn list_blobs_segmented(
        &self,
        directory: &BlobDirLocation,
        delimiter: Option<char>,
        continuation_token: Option<&str>,
        max_results: usize,
    ) -> Result<ListSegment>;
}
