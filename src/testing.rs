//! In-memory blob store for tests
//!
//! Implements the full [`BlobClient`] contract against a process-local map.
//! Tests observe server-side effects through per-blob read/write counters,
//! script copy-status sequences to exercise the monitor path, and inject
//! transient faults to exercise the retry policy.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{
    BlobClient, BlobItem, BlobProperties, CopyState, CopyStatus, ListItem, ListSegment,
};
use crate::error::{Result, TransferError};
use crate::location::{BlobDirLocation, BlobLocation, BlobType};

#[derive(Debug, Clone, Default)]
struct StoredBlob {
    data: Vec<u8>,
    blob_type: BlobType,
    content_md5: Option<String>,
    metadata: BTreeMap<String, String>,
    staged_blocks: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct Counters {
    get_range_bytes: u64,
    put_block_calls: u64,
}

#[derive(Default)]
struct StoreInner {
    blobs: BTreeMap<String, StoredBlob>,
    counters: HashMap<String, Counters>,
    copy_scripts: HashMap<String, VecDeque<CopyState>>,
    active_copies: HashMap<String, String>,
    faults: HashMap<&'static str, (u32, String)>,
    next_copy_id: u64,
}

/// Shared in-memory store; clones address the same contents.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<Mutex<StoreInner>>,
}

fn blob_key(blob: &BlobLocation) -> String {
    blob.uri.to_uri_string()
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob directly, bypassing the client surface.
    pub fn insert_blob(
        &self,
        uri: &str,
        data: Vec<u8>,
        blob_type: BlobType,
        metadata: BTreeMap<String, String>,
    ) {
        let mut inner = self.inner.lock();
        let content_md5 = Some(md5_base64(&data));
        inner.blobs.insert(
            uri.to_string(),
            StoredBlob {
                data,
                blob_type,
                content_md5,
                metadata,
                staged_blocks: HashMap::new(),
            },
        );
    }

    /// Seed a zero-byte directory-marker blob.
    pub fn insert_folder_marker(&self, uri: &str) {
        let mut metadata = BTreeMap::new();
        metadata.insert("hdi_isfolder".to_string(), "true".to_string());
        self.insert_blob(uri, Vec::new(), BlobType::Block, metadata);
    }

    pub fn blob_data(&self, uri: &str) -> Option<Vec<u8>> {
        self.inner.lock().blobs.get(uri).map(|b| b.data.clone())
    }

    pub fn blob_md5(&self, uri: &str) -> Option<String> {
        self.inner.lock().blobs.get(uri).and_then(|b| b.content_md5.clone())
    }

    pub fn blob_count(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    /// Bytes served through `get_range` for one blob.
    pub fn read_bytes(&self, uri: &str) -> u64 {
        self.inner
            .lock()
            .counters
            .get(uri)
            .map(|c| c.get_range_bytes)
            .unwrap_or(0)
    }

    pub fn put_block_calls(&self, uri: &str) -> u64 {
        self.inner
            .lock()
            .counters
            .get(uri)
            .map(|c| c.put_block_calls)
            .unwrap_or(0)
    }

    /// Queue the exact copy states `get_copy_status` will serve for `uri`
    /// (the last entry repeats once the queue drains).
    pub fn script_copy_status(&self, uri: &str, states: Vec<CopyState>) {
        self.inner
            .lock()
            .copy_scripts
            .insert(uri.to_string(), states.into());
    }

    /// Make the next `times` calls of `op` fail with a transient storage
    /// error. Recognised ops: `put_block`, `put_blob`, `get_range`.
    pub fn inject_fault(&self, op: &'static str, times: u32) {
        self.inner
            .lock()
            .faults
            .insert(op, (times, format!("injected {op} fault")));
    }

    fn take_fault(&self, op: &'static str) -> Option<String> {
        let mut inner = self.inner.lock();
        if let Some((left, msg)) = inner.faults.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Some(msg.clone());
            }
        }
        None
    }

    fn bump<F: FnOnce(&mut Counters)>(&self, key: &str, f: F) {
        let mut inner = self.inner.lock();
        f(inner.counters.entry(key.to_string()).or_default());
    }
}

/// Base64 MD5 of a byte slice, the digest format blobs carry.
pub fn md5_base64(data: &[u8]) -> String {
    use base64::Engine;
    let digest = md5::compute(data);
    base64::engine::general_purpose::STANDARD.encode(digest.0)
}

#[async_trait]
impl BlobClient for MemoryBlobStore {
    async fn fetch_metadata(&self, blob: &BlobLocation) -> Result<Option<BlobProperties>> {
        let inner = self.inner.lock();
        Ok(inner.blobs.get(&blob_key(blob)).map(|b| BlobProperties {
            length: b.data.len() as u64,
            content_md5: b.content_md5.clone(),
            blob_type: b.blob_type,
            etag: None,
            metadata: b.metadata.clone(),
        }))
    }

    async fn put_blob(
        &self,
        blob: &BlobLocation,
        data: &[u8],
        content_md5: Option<&str>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        if let Some(msg) = self.take_fault("put_blob") {
            return Err(TransferError::Storage(msg));
        }
        let key = blob_key(blob);

        let mut inner = self.inner.lock();
        inner.blobs.insert(
            key,
            StoredBlob {
                data: data.to_vec(),
                blob_type: blob.blob_type,
                content_md5: content_md5
                    .map(str::to_string)
                    .or_else(|| Some(md5_base64(data))),
                metadata: metadata.clone(),
                staged_blocks: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn put_block(
        &self,
        blob: &BlobLocation,
        block_id: &str,
        _offset: u64,
        data: &[u8],
        _md5: Option<&str>,
    ) -> Result<()> {
        if let Some(msg) = self.take_fault("put_block") {
            return Err(TransferError::Storage(msg));
        }
        let key = blob_key(blob);
        self.bump(&key, |c| c.put_block_calls += 1);
        let mut inner = self.inner.lock();
        let entry = inner.blobs.entry(key).or_insert_with(|| StoredBlob {
            blob_type: blob.blob_type,
            ..StoredBlob::default()
        });
        entry
            .staged_blocks
            .insert(block_id.to_string(), data.to_vec());
        Ok(())
    }

    async fn commit_block_list(
        &self,
        blob: &BlobLocation,
        block_ids: &[String],
        content_md5: Option<&str>,
    ) -> Result<()> {
        let key = blob_key(blob);

        let mut inner = self.inner.lock();
        let entry = inner
            .blobs
            .get_mut(&key)
            .ok_or_else(|| TransferError::NotFound(key.clone()))?;
        let mut data = Vec::new();
        for id in block_ids {
            let block = entry
                .staged_blocks
                .get(id)
                .ok_or_else(|| TransferError::Storage(format!("unknown block id {id}")))?;
            data.extend_from_slice(block);
        }
        entry.data = data;
        entry.content_md5 = content_md5
            .map(str::to_string)
            .or_else(|| Some(md5_base64(&entry.data)));
        entry.staged_blocks.clear();
        Ok(())
    }

    async fn put_page_or_append(
        &self,
        blob: &BlobLocation,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let key = blob_key(blob);
        let mut inner = self.inner.lock();
        let entry = inner.blobs.entry(key).or_insert_with(|| StoredBlob {
            blob_type: blob.blob_type,
            ..StoredBlob::default()
        });
        let end = offset as usize + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[offset as usize..end].copy_from_slice(data);
        entry.content_md5 = Some(md5_base64(&entry.data));
        Ok(())
    }

    async fn get_range(&self, blob: &BlobLocation, offset: u64, length: u64) -> Result<Vec<u8>> {
        if let Some(msg) = self.take_fault("get_range") {
            return Err(TransferError::Storage(msg));
        }
        let key = blob_key(blob);
        let inner = self.inner.lock();
        let entry = inner
            .blobs
            .get(&key)
            .ok_or_else(|| TransferError::NotFound(key.clone()))?;
        let start = offset as usize;
        if start > entry.data.len() {
            return Err(TransferError::Storage(format!(
                "range start {start} past end of {key}"
            )));
        }
        let end = (start + length as usize).min(entry.data.len());
        let data = entry.data[start..end].to_vec();
        drop(inner);
        self.bump(&key, |c| {
            c.get_range_bytes += data.len() as u64;
        });
        Ok(data)
    }

    async fn start_server_copy(
        &self,
        source_uri: &str,
        destination: &BlobLocation,
    ) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.next_copy_id += 1;
        let copy_id = format!("copy-{:04}", inner.next_copy_id);
        let source_key = source_uri.split('?').next().unwrap_or(source_uri).to_string();
        inner
            .active_copies
            .insert(blob_key(destination), source_key);
        Ok(copy_id)
    }

    async fn get_copy_status(&self, blob: &BlobLocation) -> Result<CopyState> {
        let key = blob_key(blob);
        let mut inner = self.inner.lock();
        if let Some(script) = inner.copy_scripts.get_mut(&key) {
            let state = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script
                    .front()
                    .cloned()
                    .ok_or_else(|| TransferError::Storage("empty copy script".into()))?
            };
            if state.status == CopyStatus::Success {
                // Materialize the copy so the destination reads back.
                if let Some(src) = inner.active_copies.get(&key).cloned() {
                    if let Some(source) = inner.blobs.get(&src).cloned() {
                        inner.blobs.insert(
                            key.clone(),
                            StoredBlob {
                                staged_blocks: HashMap::new(),
                                ..source
                            },
                        );
                    }
                }
            }
            return Ok(state);
        }
        // Unscripted copies complete on the first poll.
        let src = inner
            .active_copies
            .get(&key)
            .cloned()
            .ok_or_else(|| TransferError::Storage(format!("no copy pending on {key}")))?;
        let source = inner
            .blobs
            .get(&src)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(src.clone()))?;
        let total = source.data.len() as u64;
        inner.blobs.insert(
            key,
            StoredBlob {
                staged_blocks: HashMap::new(),
                ..source
            },
        );
        Ok(CopyState {
            status: CopyStatus::Success,
            bytes_copied: total,
            total_bytes: total,
            status_description: None,
        })
    }

    fn generate_read_sas(&self, blob: &BlobLocation, lifetime: Duration) -> Result<String> {
        Ok(format!(
            "{}?sas=r&se={}",
            blob.uri.to_uri_string(),
            lifetime.as_secs()
        ))
    }

    async fn list_blobs_segmented(
        &self,
        directory: &BlobDirLocation,
        delimiter: Option<char>,
        continuation_token: Option<&str>,
        max_results: usize,
    ) -> Result<ListSegment> {
        let mut root = directory.container_uri.to_uri_string();
        root.push('/');
        if !directory.prefix.is_empty() {
            root.push_str(&directory.prefix);
            if !root.ends_with('/') {
                root.push('/');
            }
        }
        let inner = self.inner.lock();
        let mut items = Vec::new();
        let mut seen_prefixes = std::collections::BTreeSet::new();
        let mut next_token = None;
        for (key, blob) in inner.blobs.range(root.clone()..) {
            if !key.starts_with(&root) {
                break;
            }
            let rel = &key[root.len()..];
            if let Some(after) = continuation_token {
                if rel <= after {
                    continue;
                }
            }
            let produced = match delimiter.and_then(|d| rel.split_once(d)) {
                Some((first, _)) => seen_prefixes
                    .insert(first.to_string())
                    .then(|| ListItem::Prefix(first.to_string())),
                None => Some(ListItem::Blob(BlobItem {
                    name: rel.to_string(),
                    length: blob.data.len() as u64,
                    blob_type: blob.blob_type,
                    content_md5: blob.content_md5.clone(),
                    metadata: blob.metadata.clone(),
                })),
            };
            if let Some(item) = produced {
                // A page ending on a folded prefix resumes past everything
                // under that prefix.
                let token = match (&item, delimiter) {
                    (ListItem::Prefix(p), Some(d)) => format!("{p}{d}\u{10FFFF}"),
                    _ => rel.to_string(),
                };
                items.push(item);
                if items.len() >= max_results {
                    next_token = Some(token);
                    break;
                }
            }
        }
        Ok(ListSegment { items, next_token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::is_folder_marker;
    use crate::location::{BlobUri, Credentials};

    fn loc(uri: &str) -> BlobLocation {
        BlobLocation::new(
            BlobUri::parse(uri).unwrap(),
            BlobType::Block,
            Credentials::Anonymous,
        )
    }

    fn dir(uri: &str, prefix: &str) -> BlobDirLocation {
        BlobDirLocation::new(
            BlobUri::parse(uri).unwrap(),
            prefix.to_string(),
            Credentials::Anonymous,
        )
    }

    #[tokio::test]
    async fn block_staging_and_commit() {
        let store = MemoryBlobStore::new();
        let blob = loc("https://e/c/b");
        store
            .put_block(&blob, "b-0", 0, b"hello ", None)
            .await
            .unwrap();
        store
            .put_block(&blob, "b-1", 6, b"world", None)
            .await
            .unwrap();
        store
            .commit_block_list(&blob, &["b-0".into(), "b-1".into()], None)
            .await
            .unwrap();
        assert_eq!(store.blob_data("https://e/c/b").unwrap(), b"hello world");
        assert_eq!(store.put_block_calls("https://e/c/b"), 2);
    }

    #[tokio::test]
    async fn listing_pages_lexicographically() {
        let store = MemoryBlobStore::new();
        for name in ["a", "b/x", "b/y", "c"] {
            store.insert_blob(
                &format!("https://e/c/{name}"),
                vec![1],
                BlobType::Block,
                BTreeMap::new(),
            );
        }
        let d = dir("https://e/c", "");
        let page = store
            .list_blobs_segmented(&d, None, None, 2)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        let token = page.next_token.clone().unwrap();
        let rest = store
            .list_blobs_segmented(&d, None, Some(&token), 10)
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 2);
        assert!(rest.next_token.is_none());

        let folded = store
            .list_blobs_segmented(&d, Some('/'), None, 10)
            .await
            .unwrap();
        let names: Vec<String> = folded
            .items
            .iter()
            .map(|i| match i {
                ListItem::Blob(b) => b.name.clone(),
                ListItem::Prefix(p) => format!("{p}/"),
            })
            .collect();
        assert_eq!(names, vec!["a", "b/", "c"]);
    }

    #[tokio::test]
    async fn folder_marker_detection() {
        let store = MemoryBlobStore::new();
        store.insert_folder_marker("https://e/c/sub");
        let props = store
            .fetch_metadata(&loc("https://e/c/sub"))
            .await
            .unwrap()
            .unwrap();
        assert!(is_folder_marker(&props.metadata));
        assert_eq!(props.length, 0);
    }

    #[tokio::test]
    async fn faults_are_transient() {
        let store = MemoryBlobStore::new();
        let blob = loc("https://e/c/b");
        store.inject_fault("put_blob", 1);
        assert!(store
            .put_blob(&blob, b"x", None, &BTreeMap::new())
            .await
            .is_err());
        assert!(store
            .put_blob(&blob, b"x", None, &BTreeMap::new())
            .await
            .is_ok());
    }
}
