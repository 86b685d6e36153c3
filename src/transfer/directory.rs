//! Directory transfers: flat and hierarchical orchestration
//!
//! Flat: one enumerator streams files; each becomes a single-object
//! transfer admitted through the scheduler. Hierarchical: a producer and
//! consumer loop discovers sub-directories one level at a time on the
//! listing pool while file transfers run; pending directory names and
//! ongoing sub-directory listings are journaled so a killed process picks
//! up exactly where it stopped.

use std::collections::{HashMap, VecDeque};
use std::path::{Component, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::checkpoint::TransferCollection;
use crate::constants::MAX_RELATIVE_PATH_LEN;
use crate::enumerate::{
    BlobFlatEnumerator, BlobHierarchyEnumerator, ContinuationToken, EntrySource, FileEntry,
    LocalFileEnumerator, LocalHierarchyEnumerator, TransferEntry, TransferEnumerator,
};
use crate::error::{Result, TransferError};
use crate::journal::codec::{ByteReader, ByteWriter};
use crate::journal::{ChunkList, JournalSlot};
use crate::location::{BlobType, TransferLocation};
use crate::scheduler::TransferRuntime;
use crate::transfer::{
    decode_opt_char, encode_opt_char, SubDirectoryTransfer, Transfer, TransferContext,
    TransferEvent, TransferKind, TransferMethod, TransferOutcome,
};

#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    pub recursive: bool,
    pub follow_symlink: bool,
    pub search_pattern: Option<String>,
    /// Separator folded when mapping remote names to local paths.
    pub delimiter: Option<char>,
    /// Blob type created on upload.
    pub blob_type: BlobType,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        DirectoryOptions {
            recursive: true,
            follow_symlink: false,
            search_pattern: None,
            delimiter: None,
            blob_type: BlobType::Block,
        }
    }
}

impl DirectoryOptions {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_bool(self.recursive);
        w.put_bool(self.follow_symlink);
        w.put_opt_str(self.search_pattern.as_deref());
        encode_opt_char(w, self.delimiter);
        w.put_u8(match self.blob_type {
            BlobType::Unspecified => 0,
            BlobType::Block => 1,
            BlobType::Page => 2,
            BlobType::Append => 3,
        });
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(DirectoryOptions {
            recursive: r.bool()?,
            follow_symlink: r.bool()?,
            search_pattern: r.opt_str()?,
            delimiter: decode_opt_char(r)?,
            blob_type: match r.u8()? {
                0 => BlobType::Unspecified,
                1 => BlobType::Block,
                2 => BlobType::Page,
                3 => BlobType::Append,
                other => {
                    return Err(TransferError::JournalCorrupt(format!(
                        "unknown blob type tag {other}"
                    )))
                }
            },
        })
    }
}

struct FlatState {
    token: ContinuationToken,
    enumeration_started: bool,
    finished: bool,
}

pub struct FlatDirectoryTransfer {
    pub options: DirectoryOptions,
    pub sub_transfers: TransferCollection,
    state: Mutex<FlatState>,
}

impl FlatDirectoryTransfer {
    pub fn new(options: DirectoryOptions, sub_transfers: TransferCollection) -> Self {
        FlatDirectoryTransfer {
            options,
            sub_transfers,
            state: Mutex::new(FlatState {
                token: ContinuationToken::Start,
                enumeration_started: false,
                finished: false,
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn continuation_token(&self) -> ContinuationToken {
        self.state.lock().token.clone()
    }

    pub(crate) fn encode(&self, w: &mut ByteWriter) {
        let st = self.state.lock();
        self.options.encode(w);
        w.put_bool(st.enumeration_started);
        w.put_bool(st.finished);
        st.token.encode(w);
    }

    pub(crate) fn decode(
        r: &mut ByteReader<'_>,
        sub_transfers: TransferCollection,
    ) -> Result<Self> {
        let options = DirectoryOptions::decode(r)?;
        let enumeration_started = r.bool()?;
        let finished = r.bool()?;
        let token = ContinuationToken::decode(r)?;
        Ok(FlatDirectoryTransfer {
            options,
            sub_transfers,
            state: Mutex::new(FlatState {
                token,
                enumeration_started,
                finished,
            }),
        })
    }
}

struct HierState {
    enumeration_started: bool,
    finished: bool,
    pending: VecDeque<String>,
    /// Relative path -> journal chunk offset (0 without a journal).
    ongoing: HashMap<String, u64>,
    outstanding_list_tasks: u64,
}

pub struct HierarchyDirectoryTransfer {
    pub options: DirectoryOptions,
    pub sub_transfers: TransferCollection,
    pub max_concurrency: usize,
    state: Mutex<HierState>,
    work_available: Notify,
}

impl HierarchyDirectoryTransfer {
    pub fn new(
        options: DirectoryOptions,
        sub_transfers: TransferCollection,
        max_concurrency: usize,
    ) -> Self {
        HierarchyDirectoryTransfer {
            options,
            sub_transfers,
            max_concurrency: max_concurrency.max(1),
            state: Mutex::new(HierState {
                enumeration_started: false,
                finished: false,
                pending: VecDeque::new(),
                ongoing: HashMap::new(),
                // The execution loop itself holds the initial count; it is
                // retired when enumeration drains.
                outstanding_list_tasks: 1,
            }),
            work_available: Notify::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub(crate) fn encode(&self, w: &mut ByteWriter) {
        let st = self.state.lock();
        self.options.encode(w);
        w.put_u64(self.max_concurrency as u64);
        w.put_bool(st.enumeration_started);
        w.put_bool(st.finished);
    }

    pub(crate) fn decode(
        r: &mut ByteReader<'_>,
        sub_transfers: TransferCollection,
    ) -> Result<Self> {
        let options = DirectoryOptions::decode(r)?;
        let max_concurrency = r.u64()? as usize;
        let enumeration_started = r.bool()?;
        let finished = r.bool()?;
        Ok(HierarchyDirectoryTransfer {
            options,
            sub_transfers,
            max_concurrency: max_concurrency.max(1),
            state: Mutex::new(HierState {
                enumeration_started,
                finished,
                pending: VecDeque::new(),
                ongoing: HashMap::new(),
                outstanding_list_tasks: 1,
            }),
            work_available: Notify::new(),
        })
    }
}

// -------------------------------------------------------------------------
// Name resolution
// -------------------------------------------------------------------------

/// Map a source entry's relative path onto the destination, returning the
/// child's endpoints and method. Marker blobs become dummy copies.
fn resolve_child(
    parent: &Transfer,
    options: &DirectoryOptions,
    entry: &FileEntry,
) -> Result<(TransferLocation, TransferLocation, TransferMethod)> {
    match (&parent.source, &parent.destination) {
        (TransferLocation::LocalDirectory { .. }, TransferLocation::RemoteBlobDirectory(dest)) => {
            let full_path = match &entry.source {
                EntrySource::LocalFile { full_path } => full_path.clone(),
                EntrySource::Blob(_) => unreachable!("local walk yields local entries"),
            };
            let rel_blob = entry
                .rel_path
                .replace(std::path::MAIN_SEPARATOR, "/");
            let blob_type = match options.blob_type {
                BlobType::Unspecified => BlobType::Block,
                other => other,
            };
            Ok((
                TransferLocation::LocalFile {
                    path: full_path,
                    rel_path: Some(entry.rel_path.clone()),
                },
                TransferLocation::RemoteBlob(dest.blob(&rel_blob, blob_type)),
                parent.method,
            ))
        }
        (TransferLocation::RemoteBlobDirectory(source), TransferLocation::LocalDirectory { dir }) => {
            let item = match &entry.source {
                EntrySource::Blob(item) => item,
                EntrySource::LocalFile { .. } => unreachable!("blob listing yields blob entries"),
            };
            let local_rel = fold_remote_rel(&entry.rel_path, options.delimiter)?;
            let src = TransferLocation::RemoteBlob(source.blob(&entry.rel_path, item.blob_type));
            let dst = TransferLocation::LocalFile {
                path: dir.join(local_rel),
                rel_path: Some(entry.rel_path.clone()),
            };
            let method = if item.is_folder_marker() {
                TransferMethod::DummyCopy
            } else {
                parent.method
            };
            Ok((src, dst, method))
        }
        (
            TransferLocation::RemoteBlobDirectory(source),
            TransferLocation::RemoteBlobDirectory(dest),
        ) => {
            let item = match &entry.source {
                EntrySource::Blob(item) => item,
                EntrySource::LocalFile { .. } => unreachable!("blob listing yields blob entries"),
            };
            let src = TransferLocation::RemoteBlob(source.blob(&entry.rel_path, item.blob_type));
            let dst = TransferLocation::RemoteBlob(dest.blob(&entry.rel_path, item.blob_type));
            let method = if item.is_folder_marker() {
                TransferMethod::DummyCopy
            } else {
                parent.method
            };
            Ok((src, dst, method))
        }
        (src, dst) => Err(TransferError::Uncategorized(format!(
            "directory transfer between {} and {} is not supported",
            src.type_name(),
            dst.type_name()
        ))),
    }
}

/// Remote `/` becomes the local separator; delimiter runs collapse; path
/// escapes are rejected rather than resolved.
fn fold_remote_rel(rel: &str, delimiter: Option<char>) -> Result<PathBuf> {
    let delim = delimiter.unwrap_or('/');
    let mut out = PathBuf::new();
    for segment in rel.split(delim).filter(|s| !s.is_empty()) {
        if segment.contains('\0') {
            return Err(TransferError::PathCustomValidationFailed {
                path: rel.to_string(),
                reason: "name contains NUL".to_string(),
            });
        }
        let piece = PathBuf::from(segment);
        for component in piece.components() {
            match component {
                Component::Normal(c) => out.push(c),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(TransferError::PathCustomValidationFailed {
                        path: rel.to_string(),
                        reason: format!("disallowed path component {component:?}"),
                    })
                }
            }
        }
    }
    Ok(out)
}

// -------------------------------------------------------------------------
// Shared run machinery
// -------------------------------------------------------------------------

struct InFlight {
    count: Mutex<u64>,
    idle: Notify,
}

#[derive(Clone)]
struct DirectoryRun {
    parent: Arc<Transfer>,
    collection: TransferCollection,
    options: DirectoryOptions,
    rt: TransferRuntime,
    ctx: TransferContext,
    in_flight: Arc<InFlight>,
    first_error: Arc<Mutex<Option<TransferError>>>,
    /// Hierarchical file gate, `MaxTransferConcurrency + 1` permits.
    gate: Option<Arc<Semaphore>>,
}

impl DirectoryRun {
    fn new(
        parent: Arc<Transfer>,
        collection: TransferCollection,
        options: DirectoryOptions,
        rt: TransferRuntime,
        ctx: TransferContext,
        gate: Option<Arc<Semaphore>>,
    ) -> Self {
        DirectoryRun {
            parent,
            collection,
            options,
            rt,
            ctx,
            in_flight: Arc::new(InFlight {
                count: Mutex::new(0),
                idle: Notify::new(),
            }),
            first_error: Arc::new(Mutex::new(None)),
            gate,
        }
    }

    fn record_error(&self, error: TransferError) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn take_error(&self) -> Option<TransferError> {
        self.first_error.lock().take()
    }

    /// Fail one entry without creating a transfer for it.
    fn fail_entry(&self, rel: &str, error: &TransferError) {
        self.parent.progress.add_file_failed();
        self.ctx.emit(TransferEvent {
            source: format!("{}/{rel}", self.parent.source.identity()),
            destination: self.parent.destination.identity(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            outcome: TransferOutcome::Failed,
            error: Some(error.to_string()),
        });
        if let Some(logger) = &self.ctx.logger {
            logger.enumeration_error(rel, &error.to_string());
        }
    }

    /// Wrap one enumerated file as a single-object transfer and start it.
    async fn admit_file(&self, entry: FileEntry) -> Result<()> {
        if entry.rel_path.chars().count() > MAX_RELATIVE_PATH_LEN {
            self.fail_entry(
                &entry.rel_path,
                &TransferError::RelativePathTooLong {
                    path: entry.rel_path.clone(),
                    limit: MAX_RELATIVE_PATH_LEN,
                },
            );
            return Ok(());
        }
        let delim = self.options.delimiter.unwrap_or('/');
        if !self.options.recursive
            && matches!(entry.source, EntrySource::Blob(_))
            && entry.rel_path.contains(delim)
        {
            return Ok(());
        }
        // A name that cannot be resolved fails that file; peers keep
        // running.
        let (source, destination, method) = match resolve_child(&self.parent, &self.options, &entry)
        {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail_entry(&entry.rel_path, &e);
                return Ok(());
            }
        };
        let child = Arc::new(Transfer::new_single_with_progress(
            source,
            destination,
            method,
            self.collection.progress().child(),
        ));
        // The collection is the dedupe authority; a key already present
        // means the file was resumed from the journal or admitted earlier.
        if self.collection.try_insert(Arc::clone(&child)).is_err() {
            return Ok(());
        }
        if let Some(binding) = self.parent.journal_binding() {
            let payload = child.serialize()?;
            let offset = binding.journal.add_chunk(ChunkList::SingleTransfer, &payload)?;
            child.bind_journal(binding.journal, JournalSlot::Chunk(offset));
        }
        let permit = match &self.gate {
            Some(gate) => Some(
                tokio::select! {
                    _ = self.rt.cancellation.cancelled() => {
                        return Err(TransferError::Cancelled)
                    }
                    permit = Arc::clone(gate).acquire_owned() => {
                        permit.map_err(|_| TransferError::Cancelled)?
                    }
                },
            ),
            None => None,
        };
        self.spawn_child(child, permit);
        Ok(())
    }

    fn spawn_child(
        &self,
        child: Arc<Transfer>,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) {
        *self.in_flight.count.lock() += 1;
        let run = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = child.execute(&run.rt, &run.ctx).await;
            match result {
                Ok(()) => {
                    // Terminal successes leave the journal so resume does
                    // not replay them.
                    if let Some(binding) = child.journal_binding() {
                        if let JournalSlot::Chunk(offset) = binding.slot {
                            let done = match &child.kind {
                                TransferKind::Single(s) => s.job.status().is_terminal(),
                                _ => true,
                            };
                            if done {
                                let _ = binding
                                    .journal
                                    .remove_chunk(ChunkList::SingleTransfer, offset);
                            }
                        }
                    }
                }
                Err(e) => {
                    if e.is_fatal_to_siblings() {
                        run.record_error(e);
                        run.rt.cancellation.cancel();
                    } else if !matches!(e, TransferError::Cancelled) {
                        // Counted in filesFailed by the job itself; peers
                        // keep running.
                    }
                }
            }
            let mut count = run.in_flight.count.lock();
            *count -= 1;
            if *count == 0 {
                run.in_flight.idle.notify_waiters();
            }
        });
    }

    /// Wait for every outstanding file transfer to settle.
    async fn wait_idle(&self) {
        loop {
            let mut waiter = std::pin::pin!(self.in_flight.idle.notified());
            waiter.as_mut().enable();
            if *self.in_flight.count.lock() == 0 {
                return;
            }
            waiter.await;
        }
    }

    /// Re-create the in-flight sub-transfers recorded in the journal and
    /// start them.
    fn resume_children(&self) -> Result<()> {
        let Some(binding) = self.parent.journal_binding() else {
            return Ok(());
        };
        for (offset, payload) in binding.journal.read_chunks(ChunkList::SingleTransfer)? {
            let child =
                Transfer::deserialize_child(&payload, self.collection.progress())?;
            let recovered = binding.journal.read_chunk_progress(offset)?;
            child.progress.restore(&recovered);
            child.bind_journal(binding.journal.clone(), JournalSlot::Chunk(offset));
            let already_done = match &child.kind {
                TransferKind::Single(s) => s.job.status().is_terminal(),
                _ => false,
            };
            if already_done {
                // Finished before the crash but never unlinked.
                let _ = binding
                    .journal
                    .remove_chunk(ChunkList::SingleTransfer, offset);
                continue;
            }
            let child = Arc::new(child);
            if self.collection.try_insert(Arc::clone(&child)).is_err() {
                continue;
            }
            self.spawn_child(child, None);
        }
        Ok(())
    }
}

fn emit_directory_event(
    ctx: &TransferContext,
    parent: &Transfer,
    start: chrono::DateTime<Utc>,
    outcome: TransferOutcome,
    error: Option<String>,
) {
    ctx.emit(TransferEvent {
        source: parent.source.identity(),
        destination: parent.destination.identity(),
        start_time: start,
        end_time: Utc::now(),
        outcome,
        error,
    });
}

// -------------------------------------------------------------------------
// Flat execution
// -------------------------------------------------------------------------

pub(crate) async fn execute_flat(
    parent: &Arc<Transfer>,
    flat: &FlatDirectoryTransfer,
    rt: &TransferRuntime,
    ctx: &TransferContext,
) -> Result<()> {
    if flat.is_finished() {
        return Ok(());
    }
    let start = Utc::now();
    let run_rt = rt.for_run();
    let run = DirectoryRun::new(
        Arc::clone(parent),
        flat.sub_transfers.clone(),
        flat.options.clone(),
        run_rt.clone(),
        ctx.clone(),
        None,
    );

    run.resume_children()?;

    let enumeration = async {
        let _permit = run_rt.listing.acquire(&run_rt.cancellation).await?;
        let mut enumerator = flat_enumerator(parent, flat, &run_rt)?;
        {
            let mut st = flat.state.lock();
            st.enumeration_started = true;
        }
        parent.persist()?;
        loop {
            if run_rt.cancellation.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let Some(entry) = enumerator.next_entry().await else {
                break;
            };
            match entry {
                TransferEntry::File(file) => {
                    run.admit_file(file).await?;
                }
                TransferEntry::Directory(_) => {}
                TransferEntry::Error(err) => return Err(err.error),
            }
            // The chunk above is journaled before the token moves past it.
            flat.state.lock().token = enumerator.continuation_token();
            parent.persist()?;
        }
        flat.state.lock().token = enumerator.continuation_token();
        parent.persist()?;
        Ok(())
    }
    .await;

    if let Err(e) = enumeration {
        if !matches!(e, TransferError::Cancelled) {
            run.record_error(e);
        }
        run_rt.cancellation.cancel();
    }

    run.wait_idle().await;

    if let Some(error) = run.take_error() {
        emit_directory_event(ctx, parent, start, TransferOutcome::Failed, Some(error.to_string()));
        return Err(error);
    }
    if rt.cancellation.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    flat.state.lock().finished = true;
    parent.persist()?;
    emit_directory_event(ctx, parent, start, TransferOutcome::Completed, None);
    Ok(())
}

fn flat_enumerator(
    parent: &Transfer,
    flat: &FlatDirectoryTransfer,
    rt: &TransferRuntime,
) -> Result<Box<dyn TransferEnumerator>> {
    let token = flat.continuation_token();
    match &parent.source {
        TransferLocation::LocalDirectory { dir } => Ok(Box::new(LocalFileEnumerator::new(
            dir.clone(),
            flat.options.recursive,
            flat.options.follow_symlink,
            flat.options.search_pattern.clone(),
            token,
        ))),
        TransferLocation::RemoteBlobDirectory(dir) => Ok(Box::new(BlobFlatEnumerator::new(
            Arc::clone(&rt.client),
            dir.clone(),
            flat.options.search_pattern.clone(),
            false,
            token,
        ))),
        other => Err(TransferError::Uncategorized(format!(
            "cannot enumerate {}",
            other.type_name()
        ))),
    }
}

// -------------------------------------------------------------------------
// Hierarchical execution
// -------------------------------------------------------------------------

fn hierarchy_of(transfer: &Transfer) -> &HierarchyDirectoryTransfer {
    match &transfer.kind {
        TransferKind::HierarchyDirectory(h) => h,
        _ => unreachable!("sub-directory callbacks run on hierarchy transfers"),
    }
}

pub(crate) async fn execute_hierarchy(
    parent: &Arc<Transfer>,
    hier: &HierarchyDirectoryTransfer,
    rt: &TransferRuntime,
    ctx: &TransferContext,
) -> Result<()> {
    if hier.is_finished() {
        return Ok(());
    }
    let start = Utc::now();
    let run_rt = rt.for_run();
    let gate = Arc::new(Semaphore::new(hier.max_concurrency + 1));
    let run = DirectoryRun::new(
        Arc::clone(parent),
        hier.sub_transfers.clone(),
        hier.options.clone(),
        run_rt.clone(),
        ctx.clone(),
        Some(gate),
    );
    let binding = parent.journal_binding();
    let listing_cap = run_rt
        .config
        .listing_concurrency(parent.source.is_local() || parent.destination.is_local());

    run.resume_children()?;

    // Reset the loop's own count; resumed sub-directory listings re-attach
    // below and bump it per task.
    {
        let mut st = hier.state.lock();
        st.outstanding_list_tasks = 1;
        st.pending.clear();
        st.ongoing.clear();
    }

    if let Some(b) = &binding {
        // Collect the ongoing sub-directory listings with their saved
        // tokens; they are re-attached only after the pending queue has
        // been mirrored, so their pushes cannot interleave with it.
        let mut resumed = Vec::new();
        for (offset, payload) in b.journal.read_chunks(ChunkList::OngoingSubDir)? {
            let rel = SubDirectoryTransfer::decode_relative_path(&payload)?;
            let token = match b.journal.read_subdir_token(offset)? {
                Some(bytes) => ContinuationToken::from_bytes(&bytes)?,
                None => ContinuationToken::Start,
            };
            resumed.push((rel, offset, token));
        }
        // A crash between journaling a listing and consuming its queue
        // entry leaves a duplicate at the queue head; swallow those, then
        // mirror the remainder into memory.
        loop {
            let head = b.journal.peek_relpaths()?.into_iter().next();
            match head {
                Some(rel) if resumed.iter().any(|(r, _, _)| *r == rel) => {
                    b.journal.pop_relpath()?;
                }
                _ => break,
            }
        }
        for rel in b.journal.peek_relpaths()? {
            hier.state.lock().pending.push_back(rel);
        }
        for (rel, offset, token) in resumed {
            {
                let mut st = hier.state.lock();
                st.ongoing.insert(rel.clone(), offset);
                st.outstanding_list_tasks += 1;
            }
            spawn_subdir(&run, rel, Some(offset), token);
        }
    }

    {
        let mut st = hier.state.lock();
        if !st.enumeration_started {
            st.enumeration_started = true;
            st.pending.push_back(String::new());
        }
    }
    parent.persist()?;

    loop {
        // Admit pending sub-directories up to the listing cap.
        loop {
            let next = {
                let mut st = hier.state.lock();
                if st.ongoing.len() >= listing_cap {
                    None
                } else if let Some(rel) = st.pending.pop_front() {
                    st.outstanding_list_tasks += 1;
                    Some(rel)
                } else {
                    None
                }
            };
            let Some(rel) = next else { break };
            let offset = match &binding {
                Some(b) => {
                    let sub = SubDirectoryTransfer::new(
                        rel.clone(),
                        ContinuationToken::Start,
                        None,
                        parent,
                    );
                    let offset = b.journal.add_chunk(ChunkList::OngoingSubDir, &sub.encode())?;
                    // The queue entry is consumed only after the listing is
                    // durable on the ongoing list; a crash between the two
                    // is resolved by the resume-time dedupe.
                    if !rel.is_empty() {
                        let popped = b.journal.pop_relpath()?;
                        debug_assert_eq!(popped.as_deref(), Some(rel.as_str()));
                    }
                    Some(offset)
                }
                None => None,
            };
            hier.state.lock().ongoing.insert(rel.clone(), offset.unwrap_or(0));
            spawn_subdir(&run, rel, offset, ContinuationToken::Start);
        }

        // Register before the done-check so a completion landing in
        // between cannot be lost.
        let mut woken = std::pin::pin!(hier.work_available.notified());
        woken.as_mut().enable();
        {
            let st = hier.state.lock();
            if (st.outstanding_list_tasks == 1 && st.pending.is_empty())
                || run_rt.cancellation.is_cancelled()
            {
                break;
            }
        }
        tokio::select! {
            _ = run_rt.cancellation.cancelled() => break,
            _ = &mut woken => {}
        }
    }
    // Retire the loop's own outstanding count, then let any listing tasks
    // that are still draining settle before touching the verdict.
    hier.state.lock().outstanding_list_tasks -= 1;
    loop {
        let mut woken = std::pin::pin!(hier.work_available.notified());
        woken.as_mut().enable();
        if hier.state.lock().outstanding_list_tasks == 0 {
            break;
        }
        woken.await;
    }

    run.wait_idle().await;

    if let Some(error) = run.take_error() {
        emit_directory_event(ctx, parent, start, TransferOutcome::Failed, Some(error.to_string()));
        return Err(error);
    }
    if rt.cancellation.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    hier.state.lock().finished = true;
    parent.persist()?;
    emit_directory_event(ctx, parent, start, TransferOutcome::Completed, None);
    Ok(())
}

fn spawn_subdir(
    run: &DirectoryRun,
    rel: String,
    chunk_offset: Option<u64>,
    token: ContinuationToken,
) {
    let run = run.clone();
    tokio::spawn(async move {
        let sub = SubDirectoryTransfer::new(rel.clone(), token, chunk_offset, &run.parent);
        let result = run_subdir(&run, &sub).await;
        let hier = hierarchy_of(&run.parent);
        match result {
            Ok(()) => {
                if let (Some(binding), Some(offset)) =
                    (run.parent.journal_binding(), chunk_offset)
                {
                    let _ = binding.journal.remove_chunk(ChunkList::OngoingSubDir, offset);
                }
            }
            Err(e) => {
                if !matches!(e, TransferError::Cancelled) {
                    run.record_error(e);
                    run.rt.cancellation.cancel();
                }
            }
        }
        {
            let mut st = hier.state.lock();
            st.ongoing.remove(&rel);
            st.outstanding_list_tasks -= 1;
        }
        hier.work_available.notify_waiters();
    });
}

/// List one directory level, feeding files into the scheduler and child
/// directories back to the parent. The continuation token is rewritten at
/// its fixed journal offset after every entry.
async fn run_subdir(run: &DirectoryRun, sub: &SubDirectoryTransfer) -> Result<()> {
    let parent = sub
        .parent
        .upgrade()
        .ok_or_else(|| TransferError::Uncategorized("parent transfer dropped".to_string()))?;
    let hier = hierarchy_of(&parent);
    let _permit = run.rt.listing.acquire(&run.rt.cancellation).await?;
    let mut enumerator =
        level_enumerator(&parent, hier, &sub.relative_path, sub.token.lock().clone(), &run.rt)?;
    let binding = parent.journal_binding();

    while let Some(entry) = enumerator.next_entry().await {
        if run.rt.cancellation.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        match entry {
            TransferEntry::Directory(dir) => {
                if dir.rel_path.chars().count() > MAX_RELATIVE_PATH_LEN {
                    run.fail_entry(
                        &dir.rel_path,
                        &TransferError::RelativePathTooLong {
                            path: dir.rel_path.clone(),
                            limit: MAX_RELATIVE_PATH_LEN,
                        },
                    );
                } else if hier.options.recursive {
                    // Journal and memory queues must append in the same
                    // order; the state lock makes the pair atomic against
                    // pushes from sibling listings.
                    {
                        let mut st = hier.state.lock();
                        if let Some(b) = &binding {
                            b.journal.push_relpath(&dir.rel_path)?;
                        }
                        st.pending.push_back(dir.rel_path);
                    }
                    hier.work_available.notify_waiters();
                }
            }
            TransferEntry::File(file) => {
                run.admit_file(file).await?;
            }
            TransferEntry::Error(err) => {
                return Err(err.error);
            }
        }
        let token = enumerator.continuation_token();
        *sub.token.lock() = token.clone();
        if let (Some(b), Some(offset)) = (&binding, sub.journal_offset) {
            b.journal.write_subdir_token(offset, &token.to_bytes())?;
        }
    }
    Ok(())
}

fn level_enumerator(
    parent: &Transfer,
    hier: &HierarchyDirectoryTransfer,
    sub_rel: &str,
    token: ContinuationToken,
    rt: &TransferRuntime,
) -> Result<Box<dyn TransferEnumerator>> {
    match &parent.source {
        TransferLocation::LocalDirectory { dir } => Ok(Box::new(LocalHierarchyEnumerator::new(
            dir,
            sub_rel,
            hier.options.follow_symlink,
            hier.options.search_pattern.as_deref(),
            token,
        ))),
        TransferLocation::RemoteBlobDirectory(dir) => Ok(Box::new(BlobHierarchyEnumerator::new(
            Arc::clone(&rt.client),
            dir,
            sub_rel,
            hier.options.delimiter.unwrap_or('/'),
            hier.options.search_pattern.clone(),
            token,
        ))),
        other => Err(TransferError::Uncategorized(format!(
            "cannot enumerate {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_collapses_runs_and_rejects_escapes() {
        let p = fold_remote_rel("a//b/c", None).unwrap();
        let expected: PathBuf = ["a", "b", "c"].iter().collect();
        assert_eq!(p, expected);
        assert!(fold_remote_rel("a/../b", None).is_err());
        assert!(fold_remote_rel("ok/../../etc/passwd", None).is_err());
        let custom = fold_remote_rel("x|y||z", Some('|')).unwrap();
        let expected: PathBuf = ["x", "y", "z"].iter().collect();
        assert_eq!(custom, expected);
    }

    #[test]
    fn directory_options_round_trip() {
        let options = DirectoryOptions {
            recursive: false,
            follow_symlink: true,
            search_pattern: Some("*.dat".into()),
            delimiter: Some('|'),
            blob_type: BlobType::Page,
        };
        let mut w = ByteWriter::new();
        options.encode(&mut w);
        let bytes = w.into_bytes();
        let decoded = DirectoryOptions::decode(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded.recursive, options.recursive);
        assert_eq!(decoded.follow_symlink, options.follow_symlink);
        assert_eq!(decoded.search_pattern, options.search_pattern);
        assert_eq!(decoded.delimiter, options.delimiter);
        assert_eq!(decoded.blob_type, options.blob_type);
    }
}
