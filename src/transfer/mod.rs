//! Transfer model
//!
//! A transfer is a shared header (source, destination, method, progress,
//! journal binding) plus a kind-indexed variant; dispatch is by pattern
//! match. Identity is the `(source, destination)` pair. Serialization uses
//! explicit discriminators in a stable field order so a journal written by
//! one build reopens in another.

pub mod directory;
pub mod single;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::checkpoint::TransferCollection;
use crate::enumerate::ContinuationToken;
use crate::error::{Result, TransferError};
use crate::journal::codec::{ByteReader, ByteWriter};
use crate::journal::{JournalSlot, StreamJournal};
use crate::location::{BlobType, TransferLocation};
use crate::logger::Logger;
use crate::progress::{ProgressHandler, ProgressTracker};
use crate::scheduler::TransferRuntime;

pub use directory::{DirectoryOptions, FlatDirectoryTransfer, HierarchyDirectoryTransfer};
pub use single::{JobStatus, SingleObjectCheckpoint, SingleObjectTransfer, TransferJob};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub source: String,
    pub dest: String,
}

impl TransferKey {
    pub fn new(source: &TransferLocation, dest: &TransferLocation) -> Self {
        TransferKey {
            source: source.identity(),
            dest: dest.identity(),
        }
    }
}

impl std::fmt::Display for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source, self.dest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
    /// Read the source into memory cells and write the destination.
    SyncCopy,
    /// Start a remote copy and poll it to a terminal state.
    ServiceSideAsyncCopy,
    /// Remote copy driven synchronously: poll at the minimum cadence.
    ServiceSideSyncCopy,
    /// Directory-placeholder marker; no payload moves.
    DummyCopy,
}

impl TransferMethod {
    fn tag(self) -> u8 {
        match self {
            TransferMethod::SyncCopy => 0,
            TransferMethod::ServiceSideAsyncCopy => 1,
            TransferMethod::ServiceSideSyncCopy => 2,
            TransferMethod::DummyCopy => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => TransferMethod::SyncCopy,
            1 => TransferMethod::ServiceSideAsyncCopy,
            2 => TransferMethod::ServiceSideSyncCopy,
            3 => TransferMethod::DummyCopy,
            other => {
                return Err(TransferError::JournalCorrupt(format!(
                    "unknown transfer method tag {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Skipped,
    Failed,
}

/// Emitted to the context on every terminal transition.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub source: String,
    pub destination: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub outcome: TransferOutcome,
    pub error: Option<String>,
}

/// Per-call user hooks and sinks.
#[derive(Clone, Default)]
pub struct TransferContext {
    /// Destination exists: transfer it anyway?
    pub should_overwrite:
        Option<Arc<dyn Fn(&TransferLocation, &TransferLocation) -> bool + Send + Sync>>,
    /// Pre-flight gate; `Ok(false)` skips the file, `Err` is
    /// `FailedCheckingShouldTransfer` and cancels sibling work.
    pub should_transfer:
        Option<Arc<dyn Fn(&TransferLocation) -> std::result::Result<bool, String> + Send + Sync>>,
    /// Custom source validation; `Err` skips the file.
    pub validate_path:
        Option<Arc<dyn Fn(&TransferLocation) -> std::result::Result<(), String> + Send + Sync>>,
    pub progress_handler: Option<Arc<dyn ProgressHandler>>,
    pub event_handler: Option<Arc<dyn Fn(&TransferEvent) + Send + Sync>>,
    pub logger: Option<Arc<dyn Logger>>,
    /// Where transfers are recorded for resume. Without one, the manager
    /// uses a throwaway in-memory checkpoint.
    pub checkpoint: Option<Arc<crate::checkpoint::TransferCheckpoint>>,
}

impl TransferContext {
    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Some(logger) = &self.logger {
            logger.transfer_finished(&event);
        }
        if let Some(handler) = &self.event_handler {
            handler(&event);
        }
    }
}

impl std::fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferContext")
            .field("should_overwrite", &self.should_overwrite.is_some())
            .field("should_transfer", &self.should_transfer.is_some())
            .field("validate_path", &self.validate_path.is_some())
            .finish()
    }
}

/// Where this transfer persists itself.
#[derive(Clone)]
pub struct JournalBinding {
    pub journal: StreamJournal,
    pub slot: JournalSlot,
}

pub enum TransferKind {
    Single(SingleObjectTransfer),
    FlatDirectory(FlatDirectoryTransfer),
    HierarchyDirectory(HierarchyDirectoryTransfer),
}

const KIND_SINGLE: u8 = 0;
const KIND_FLAT: u8 = 1;
const KIND_HIERARCHY: u8 = 2;

pub struct Transfer {
    pub source: TransferLocation,
    pub destination: TransferLocation,
    pub method: TransferMethod,
    pub format_version: String,
    pub progress: ProgressTracker,
    pub kind: TransferKind,
    journal: Mutex<Option<JournalBinding>>,
}

impl Transfer {
    pub fn new_single(
        source: TransferLocation,
        destination: TransferLocation,
        method: TransferMethod,
    ) -> Transfer {
        Self::new_single_with_progress(source, destination, method, ProgressTracker::new())
    }

    /// Single transfer whose tracker is supplied by the caller, usually a
    /// child of a directory's aggregate tracker.
    pub fn new_single_with_progress(
        source: TransferLocation,
        destination: TransferLocation,
        method: TransferMethod,
        progress: ProgressTracker,
    ) -> Transfer {
        Transfer {
            source,
            destination,
            method,
            format_version: crate::constants::FORMAT_VERSION.to_string(),
            progress,
            kind: TransferKind::Single(SingleObjectTransfer::new()),
            journal: Mutex::new(None),
        }
    }

    pub fn new_flat_directory(
        source: TransferLocation,
        destination: TransferLocation,
        method: TransferMethod,
        options: DirectoryOptions,
    ) -> Transfer {
        let progress = ProgressTracker::new();
        let sub_transfers = TransferCollection::with_progress(progress.clone());
        Transfer {
            source,
            destination,
            method,
            format_version: crate::constants::FORMAT_VERSION.to_string(),
            progress,
            kind: TransferKind::FlatDirectory(FlatDirectoryTransfer::new(options, sub_transfers)),
            journal: Mutex::new(None),
        }
    }

    pub fn new_hierarchy_directory(
        source: TransferLocation,
        destination: TransferLocation,
        method: TransferMethod,
        options: DirectoryOptions,
        max_concurrency: usize,
    ) -> Transfer {
        let progress = ProgressTracker::new();
        let sub_transfers = TransferCollection::with_progress(progress.clone());
        Transfer {
            source,
            destination,
            method,
            format_version: crate::constants::FORMAT_VERSION.to_string(),
            progress,
            kind: TransferKind::HierarchyDirectory(HierarchyDirectoryTransfer::new(
                options,
                sub_transfers,
                max_concurrency,
            )),
            journal: Mutex::new(None),
        }
    }

    pub fn key(&self) -> TransferKey {
        TransferKey::new(&self.source, &self.destination)
    }

    /// Attach this transfer to its pre-reserved journal slot and route its
    /// progress tracker there.
    pub fn bind_journal(&self, journal: StreamJournal, slot: JournalSlot) {
        let sink = match slot {
            JournalSlot::Base => journal.base_progress_sink(),
            JournalSlot::Chunk(offset) => journal.chunk_progress_sink(offset),
        };
        self.progress.set_sink(Some(sink));
        *self.journal.lock() = Some(JournalBinding { journal, slot });
    }

    pub fn journal_binding(&self) -> Option<JournalBinding> {
        self.journal.lock().clone()
    }

    /// Rewrite this transfer at its pre-reserved offset.
    pub fn persist(&self) -> Result<()> {
        let binding = self.journal.lock().clone();
        let Some(binding) = binding else {
            return Ok(());
        };
        let payload = self.serialize()?;
        match binding.slot {
            JournalSlot::Base => binding.journal.set_base(&payload),
            JournalSlot::Chunk(offset) => binding.journal.update_chunk(offset, &payload),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut w = ByteWriter::new();
        match &self.kind {
            TransferKind::Single(single) => {
                w.put_u8(KIND_SINGLE);
                self.encode_header(&mut w)?;
                single.encode(&mut w);
            }
            TransferKind::FlatDirectory(flat) => {
                w.put_u8(KIND_FLAT);
                self.encode_header(&mut w)?;
                flat.encode(&mut w);
            }
            TransferKind::HierarchyDirectory(hier) => {
                w.put_u8(KIND_HIERARCHY);
                self.encode_header(&mut w)?;
                hier.encode(&mut w);
            }
        }
        Ok(w.into_bytes())
    }

    fn encode_header(&self, w: &mut ByteWriter) -> Result<()> {
        self.source.encode(w)?;
        self.destination.encode(w)?;
        w.put_u8(self.method.tag());
        w.put_str(&self.format_version);
        Ok(())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transfer> {
        Self::deserialize_with_progress(bytes, ProgressTracker::new())
    }

    /// Deserialize a sub-transfer, attaching it under the parent's
    /// aggregate tracker.
    pub fn deserialize_child(bytes: &[u8], parent_progress: &ProgressTracker) -> Result<Transfer> {
        Self::deserialize_with_progress(bytes, parent_progress.child())
    }

    fn deserialize_with_progress(bytes: &[u8], progress: ProgressTracker) -> Result<Transfer> {
        let mut r = ByteReader::new(bytes);
        let kind_tag = r.u8()?;
        let source = TransferLocation::decode(&mut r)?;
        let destination = TransferLocation::decode(&mut r)?;
        let method = TransferMethod::from_tag(r.u8()?)?;
        let format_version = r.str()?;
        let kind = match kind_tag {
            KIND_SINGLE => TransferKind::Single(SingleObjectTransfer::decode(&mut r)?),
            KIND_FLAT => {
                let sub = TransferCollection::with_progress(progress.clone());
                TransferKind::FlatDirectory(FlatDirectoryTransfer::decode(&mut r, sub)?)
            }
            KIND_HIERARCHY => {
                let sub = TransferCollection::with_progress(progress.clone());
                TransferKind::HierarchyDirectory(HierarchyDirectoryTransfer::decode(&mut r, sub)?)
            }
            other => {
                return Err(TransferError::JournalCorrupt(format!(
                    "unknown transfer kind tag {other}"
                )))
            }
        };
        Ok(Transfer {
            source,
            destination,
            method,
            format_version,
            progress,
            kind,
            journal: Mutex::new(None),
        })
    }

    /// Drive this transfer to completion. Idempotent: a finished transfer
    /// returns immediately.
    pub async fn execute(
        self: &Arc<Self>,
        rt: &TransferRuntime,
        ctx: &TransferContext,
    ) -> Result<()> {
        if let Some(handler) = &ctx.progress_handler {
            self.progress.set_handler(Some(Arc::clone(handler)));
        }
        match &self.kind {
            TransferKind::Single(single) => single::execute_single(self, single, rt, ctx).await,
            TransferKind::FlatDirectory(flat) => {
                directory::execute_flat(self, flat, rt, ctx).await
            }
            TransferKind::HierarchyDirectory(hier) => {
                directory::execute_hierarchy(self, hier, rt, ctx).await
            }
        }
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("key", &self.key().to_string())
            .field("method", &self.method)
            .finish()
    }
}

/// Sub-directory transfer: one level of a hierarchical run. Observes its
/// parent through a weak handle; the parent re-attaches it on resume.
pub struct SubDirectoryTransfer {
    pub relative_path: String,
    pub token: Mutex<ContinuationToken>,
    pub journal_offset: Option<u64>,
    pub parent: std::sync::Weak<Transfer>,
}

impl SubDirectoryTransfer {
    pub fn new(
        relative_path: String,
        token: ContinuationToken,
        journal_offset: Option<u64>,
        parent: &Arc<Transfer>,
    ) -> Self {
        SubDirectoryTransfer {
            relative_path,
            token: Mutex::new(token),
            journal_offset,
            parent: Arc::downgrade(parent),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_str(&self.relative_path);
        w.into_bytes()
    }

    pub fn decode_relative_path(bytes: &[u8]) -> Result<String> {
        ByteReader::new(bytes).str()
    }
}

pub(crate) fn encode_opt_char(w: &mut ByteWriter, c: Option<char>) {
    match c {
        Some(c) => {
            w.put_u8(1);
            w.put_u32(c as u32);
        }
        None => w.put_u8(0),
    }
}

pub(crate) fn decode_opt_char(r: &mut ByteReader<'_>) -> Result<Option<char>> {
    if r.u8()? == 0 {
        return Ok(None);
    }
    let raw = r.u32()?;
    char::from_u32(raw)
        .map(Some)
        .ok_or_else(|| TransferError::JournalCorrupt(format!("invalid delimiter scalar {raw}")))
}

/// Validation shared by the manager's entry points.
pub(crate) fn validate_pair(
    source: &TransferLocation,
    destination: &TransferLocation,
) -> Result<()> {
    if source.identity() == destination.identity() {
        return Err(TransferError::SourceAndDestinationLocationEqual(
            source.identity(),
        ));
    }
    if let (Some(src), Some(dst)) = (source.as_blob(), destination.as_blob()) {
        if src.blob_type != BlobType::Unspecified
            && dst.blob_type != BlobType::Unspecified
            && src.blob_type != dst.blob_type
        {
            return Err(TransferError::SourceAndDestinationBlobTypeDifferent {
                src: src.blob_type,
                dest: dst.blob_type,
            });
        }
    }
    Ok(())
}

