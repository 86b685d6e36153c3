//! Single-object transfer: the per-file state machine
//!
//! `NotStarted -> (should-transfer check) -> Transfer -> Monitor? ->
//! Finished | Failed | Skipped | SkippedDueToShouldNotTransfer`. Chunked
//! I/O claims offsets in increasing order; the checkpoint's sliding window
//! records claimed-but-unconfirmed chunks so a resumed job redoes only
//! those and continues from the entry offset.

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;

use crate::client::CopyStatus;
use crate::constants::{blob_limits, copy_poll, CELL_SIZE, MAX_TRANSFER_WINDOW};
use crate::error::{Result, TransferError};
use crate::journal::codec::{ByteReader, ByteWriter};
use crate::location::{BlobLocation, BlobType, Credentials, RequestOptions, TransferLocation};
use crate::memory::Cell;
use crate::scheduler::TransferRuntime;
use crate::transfer::{Transfer, TransferContext, TransferEvent, TransferOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    NotStarted,
    Transfer,
    Monitor,
    Finished,
    Failed,
    Skipped,
    SkippedDueToShouldNotTransfer,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished
                | JobStatus::Skipped
                | JobStatus::SkippedDueToShouldNotTransfer
        )
    }

    fn tag(self) -> u8 {
        match self {
            JobStatus::NotStarted => 0,
            JobStatus::Transfer => 1,
            JobStatus::Monitor => 2,
            JobStatus::Finished => 3,
            JobStatus::Failed => 4,
            JobStatus::Skipped => 5,
            JobStatus::SkippedDueToShouldNotTransfer => 6,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => JobStatus::NotStarted,
            1 => JobStatus::Transfer,
            2 => JobStatus::Monitor,
            3 => JobStatus::Finished,
            4 => JobStatus::Failed,
            5 => JobStatus::Skipped,
            6 => JobStatus::SkippedDueToShouldNotTransfer,
            other => {
                return Err(TransferError::JournalCorrupt(format!(
                    "unknown job status tag {other}"
                )))
            }
        })
    }
}

/// Sliding chunk window. Offsets before `entry_transfer_offset` that are
/// not in the window are confirmed done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SingleObjectCheckpoint {
    pub entry_transfer_offset: u64,
    pub transfer_window: Vec<u64>,
}

impl SingleObjectCheckpoint {
    pub fn claim(&mut self, offset: u64, len: u64) {
        debug_assert!(self.transfer_window.len() < MAX_TRANSFER_WINDOW);
        self.transfer_window.push(offset);
        self.entry_transfer_offset = self.entry_transfer_offset.max(offset + len);
    }

    pub fn confirm(&mut self, offset: u64) {
        self.transfer_window.retain(|o| *o != offset);
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.put_u64(self.entry_transfer_offset);
        w.put_u32(self.transfer_window.len() as u32);
        for offset in &self.transfer_window {
            w.put_u64(*offset);
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let entry_transfer_offset = r.u64()?;
        let count = r.u32()? as usize;
        if count > MAX_TRANSFER_WINDOW {
            return Err(TransferError::JournalCorrupt(format!(
                "transfer window of {count} exceeds {MAX_TRANSFER_WINDOW}"
            )));
        }
        let mut transfer_window = Vec::with_capacity(count);
        for _ in 0..count {
            transfer_window.push(r.u64()?);
        }
        Ok(SingleObjectCheckpoint {
            entry_transfer_offset,
            transfer_window,
        })
    }
}

#[derive(Debug, Clone)]
pub struct JobState {
    pub status: JobStatus,
    pub overwrite: Option<bool>,
    pub copy_id: Option<String>,
    pub block_size: u64,
    pub should_transfer_checked: bool,
    pub checkpoint: SingleObjectCheckpoint,
}

impl Default for JobState {
    fn default() -> Self {
        JobState {
            status: JobStatus::NotStarted,
            overwrite: None,
            copy_id: None,
            block_size: 0,
            should_transfer_checked: false,
            checkpoint: SingleObjectCheckpoint::default(),
        }
    }
}

/// Mutable job record. Only the scheduler's executing task mutates status;
/// journal persistence snapshots through the same lock.
pub struct TransferJob {
    pub state: RwLock<JobState>,
}

impl TransferJob {
    fn new() -> Self {
        TransferJob {
            state: RwLock::new(JobState::default()),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.read().status
    }
}

pub struct SingleObjectTransfer {
    pub job: TransferJob,
}

impl SingleObjectTransfer {
    pub fn new() -> Self {
        SingleObjectTransfer {
            job: TransferJob::new(),
        }
    }

    /// Pre-decide the overwrite question instead of asking the callback.
    pub fn with_overwrite(overwrite: Option<bool>) -> Self {
        let this = Self::new();
        this.job.state.write().overwrite = overwrite;
        this
    }

    pub(crate) fn encode(&self, w: &mut ByteWriter) {
        let st = self.job.state.read();
        w.put_u8(st.status.tag());
        w.put_u8(match st.overwrite {
            None => 0,
            Some(false) => 1,
            Some(true) => 2,
        });
        w.put_opt_str(st.copy_id.as_deref());
        w.put_u64(st.block_size);
        w.put_bool(st.should_transfer_checked);
        st.checkpoint.encode(w);
    }

    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let status = JobStatus::from_tag(r.u8()?)?;
        let overwrite = match r.u8()? {
            0 => None,
            1 => Some(false),
            2 => Some(true),
            other => {
                return Err(TransferError::JournalCorrupt(format!(
                    "unknown overwrite tag {other}"
                )))
            }
        };
        let copy_id = r.opt_str()?;
        let block_size = r.u64()?;
        let should_transfer_checked = r.bool()?;
        let checkpoint = SingleObjectCheckpoint::decode(r)?;
        Ok(SingleObjectTransfer {
            job: TransferJob {
                state: RwLock::new(JobState {
                    status,
                    overwrite,
                    copy_id,
                    block_size,
                    should_transfer_checked,
                    checkpoint,
                }),
            },
        })
    }
}

impl Default for SingleObjectTransfer {
    fn default() -> Self {
        Self::new()
    }
}

enum JobOutcome {
    Transferred,
    ShouldNotTransfer,
}

/// Entry point for the single-object state machine.
pub(crate) async fn execute_single(
    transfer: &Arc<Transfer>,
    single: &SingleObjectTransfer,
    rt: &TransferRuntime,
    ctx: &TransferContext,
) -> Result<()> {
    // Idempotent re-exec: terminal transfers return in O(1).
    if single.job.status().is_terminal() {
        return Ok(());
    }
    // A recovered failure repositions to Transfer, or Monitor when a copy
    // id is already on record.
    {
        let mut st = single.job.state.write();
        if st.status == JobStatus::Failed {
            st.status = if st.copy_id.is_none() {
                JobStatus::Transfer
            } else {
                JobStatus::Monitor
            };
        }
    }

    let start_time = Utc::now();
    let result = run_job(transfer, single, rt, ctx).await;
    let (outcome, error, ret) = match result {
        Ok(JobOutcome::Transferred) => {
            single.job.state.write().status = JobStatus::Finished;
            transfer.persist()?;
            transfer.progress.add_file_transferred();
            (TransferOutcome::Completed, None, Ok(()))
        }
        Ok(JobOutcome::ShouldNotTransfer) => {
            single.job.state.write().status = JobStatus::SkippedDueToShouldNotTransfer;
            transfer.persist()?;
            transfer.progress.add_file_skipped();
            (TransferOutcome::Skipped, None, Ok(()))
        }
        Err(e @ TransferError::Cancelled) => {
            // Cancellation is not failure: the persisted state stays
            // wherever the last chunk left it, ready for resume.
            transfer.persist()?;
            return Err(e);
        }
        Err(e) if e.is_skip() => {
            single.job.state.write().status = JobStatus::Skipped;
            transfer.persist()?;
            transfer.progress.add_file_skipped();
            (TransferOutcome::Skipped, Some(e.to_string()), Ok(()))
        }
        Err(e) => {
            single.job.state.write().status = JobStatus::Failed;
            transfer.persist()?;
            transfer.progress.add_file_failed();
            (TransferOutcome::Failed, Some(e.to_string()), Err(e))
        }
    };
    ctx.emit(TransferEvent {
        source: transfer.source.identity(),
        destination: transfer.destination.identity(),
        start_time,
        end_time: Utc::now(),
        outcome,
        error,
    });
    ret
}

async fn run_job(
    transfer: &Arc<Transfer>,
    single: &SingleObjectTransfer,
    rt: &TransferRuntime,
    ctx: &TransferContext,
) -> Result<JobOutcome> {
    if rt.cancellation.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    if !single.job.state.read().should_transfer_checked {
        if let Some(check) = &ctx.should_transfer {
            match check(&transfer.source) {
                Ok(true) => {}
                Ok(false) => return Ok(JobOutcome::ShouldNotTransfer),
                Err(reason) => {
                    return Err(TransferError::FailedCheckingShouldTransfer(
                        transfer.source.identity(),
                        reason,
                    ))
                }
            }
        }
        single.job.state.write().should_transfer_checked = true;
        transfer.persist()?;
    }

    if let Some(validate) = &ctx.validate_path {
        if let Err(reason) = validate(&transfer.source) {
            return Err(TransferError::PathCustomValidationFailed {
                path: transfer.source.identity(),
                reason,
            });
        }
    }

    if transfer.method != crate::transfer::TransferMethod::DummyCopy {
        check_overwrite(transfer, single, rt, ctx).await?;
    }

    {
        let mut st = single.job.state.write();
        if st.status == JobStatus::NotStarted {
            st.status = JobStatus::Transfer;
        }
    }
    transfer.persist()?;

    match transfer.method {
        crate::transfer::TransferMethod::DummyCopy => run_dummy_copy(transfer, rt).await,
        crate::transfer::TransferMethod::SyncCopy => run_sync_copy(transfer, single, rt).await,
        crate::transfer::TransferMethod::ServiceSideAsyncCopy => {
            run_service_copy(transfer, single, rt, false).await
        }
        crate::transfer::TransferMethod::ServiceSideSyncCopy => {
            run_service_copy(transfer, single, rt, true).await
        }
    }
}

/// Overwrite gate: when the destination already exists the user callback
/// (or a pre-decided flag) chooses; refusal is a skip, not a failure. The
/// answer is recorded so a resumed job does not re-ask.
async fn check_overwrite(
    transfer: &Arc<Transfer>,
    single: &SingleObjectTransfer,
    rt: &TransferRuntime,
    ctx: &TransferContext,
) -> Result<()> {
    if single.job.state.read().overwrite.is_some() {
        return check_recorded_overwrite(transfer, single);
    }
    let exists = match &transfer.destination {
        TransferLocation::RemoteBlob(blob) => rt.client.fetch_metadata(blob).await?.is_some(),
        TransferLocation::LocalFile { path, .. } => path.exists(),
        TransferLocation::Stream(_) => false,
        other => {
            return Err(TransferError::FailToValidateDestination(
                other.identity(),
                "not a writable destination".to_string(),
            ))
        }
    };
    // The answer is recorded either way: a resumed job must not re-ask
    // after its own partial write made the destination exist.
    let allowed = if !exists {
        true
    } else {
        match &ctx.should_overwrite {
            Some(cb) => cb(&transfer.source, &transfer.destination),
            None => false,
        }
    };
    single.job.state.write().overwrite = Some(allowed);
    transfer.persist()?;
    check_recorded_overwrite(transfer, single)
}

fn check_recorded_overwrite(
    transfer: &Arc<Transfer>,
    single: &SingleObjectTransfer,
) -> Result<()> {
    match single.job.state.read().overwrite {
        Some(false) => Err(TransferError::NotOverwriteExistingDestination(
            transfer.destination.identity(),
        )),
        _ => Ok(()),
    }
}

/// Directory-placeholder transfer: create the destination shape, move no
/// payload.
async fn run_dummy_copy(transfer: &Arc<Transfer>, rt: &TransferRuntime) -> Result<JobOutcome> {
    match &transfer.destination {
        TransferLocation::LocalFile { path, .. } => {
            std::fs::create_dir_all(path).map_err(|e| TransferError::io(path.clone(), e))?;
        }
        TransferLocation::LocalDirectory { dir } => {
            std::fs::create_dir_all(dir).map_err(|e| TransferError::io(dir.clone(), e))?;
        }
        TransferLocation::RemoteBlob(blob) => {
            let mut metadata = BTreeMap::new();
            metadata.insert(
                crate::client::FOLDER_MARKER_KEY.to_string(),
                "true".to_string(),
            );
            rt.client.put_blob(blob, &[], None, &metadata).await?;
        }
        other => {
            return Err(TransferError::FailToValidateDestination(
                other.identity(),
                "dummy copy needs a directory-capable destination".to_string(),
            ))
        }
    }
    Ok(JobOutcome::Transferred)
}

// -------------------------------------------------------------------------
// Sync copy: chunked read-into-cells, write-to-destination
// -------------------------------------------------------------------------

/// Source side of a sync copy, random-access.
enum ByteSource {
    File(std::fs::File),
    Stream(crate::location::StreamHandle),
}

/// Destination side of a sync copy.
enum ByteSink {
    File(std::fs::File),
    Stream(crate::location::StreamHandle),
}

struct ChunkPlan {
    redo: VecDeque<u64>,
    next: u64,
    total: u64,
    chunk: u64,
}

impl ChunkPlan {
    fn new(total: u64, chunk: u64, checkpoint: &SingleObjectCheckpoint) -> Self {
        let mut redo: Vec<u64> = checkpoint.transfer_window.clone();
        redo.sort_unstable();
        ChunkPlan {
            redo: redo.into(),
            next: checkpoint.entry_transfer_offset,
            total,
            chunk,
        }
    }

    fn claim(&mut self) -> Option<(u64, u64)> {
        if let Some(offset) = self.redo.pop_front() {
            let len = self.chunk.min(self.total - offset);
            return Some((offset, len));
        }
        if self.next >= self.total {
            return None;
        }
        let offset = self.next;
        let len = self.chunk.min(self.total - offset);
        self.next += len;
        Some((offset, len))
    }

    fn already_done(&self, checkpoint: &SingleObjectCheckpoint) -> u64 {
        let windowed: u64 = checkpoint
            .transfer_window
            .iter()
            .map(|o| self.chunk.min(self.total - o))
            .sum();
        checkpoint.entry_transfer_offset.saturating_sub(windowed)
    }
}

struct SyncState {
    plan: ChunkPlan,
    source: ByteSource,
    /// Incremental digest, alive only while reads stay sequential from
    /// offset zero (fresh runs). Resumed runs recompute at the end.
    md5: Option<md5::Context>,
    md5_watermark: u64,
}

impl SyncState {
    /// Claim one block and read it across the worker's cell group, under
    /// one lock so reads happen in increasing offset order and feed the
    /// digest in sequence.
    fn claim_and_read_block(&mut self, cells: &mut [Cell]) -> Result<Option<(u64, usize)>> {
        let Some((offset, len)) = self.plan.claim() else {
            return Ok(None);
        };
        let len = len as usize;
        let mut read = 0usize;
        for cell in cells.iter_mut() {
            if read >= len {
                break;
            }
            let n = (len - read).min(cell.len());
            let cell_offset = offset + read as u64;
            match &mut self.source {
                ByteSource::File(file) => {
                    file.seek(SeekFrom::Start(cell_offset))
                        .and_then(|_| file.read_exact(&mut cell.as_mut_slice()[..n]))
                        .map_err(|e| TransferError::io("<source>", e))?;
                }
                ByteSource::Stream(stream) => {
                    let got = stream.read_at(cell_offset, &mut cell.as_mut_slice()[..n]);
                    if got < n {
                        return Err(TransferError::Uncategorized(
                            "stream shrank during transfer".to_string(),
                        ));
                    }
                }
            }
            if let Some(md5) = &mut self.md5 {
                if cell_offset == self.md5_watermark {
                    md5.consume(&cell.as_slice()[..n]);
                    self.md5_watermark += n as u64;
                } else {
                    self.md5 = None;
                }
            }
            read += n;
        }
        Ok(Some((offset, len)))
    }
}

fn md5_b64(digest: md5::Digest) -> String {
    base64::engine::general_purpose::STANDARD.encode(digest.0)
}

fn file_md5(path: &std::path::Path) -> Result<String> {
    let mut file =
        std::fs::File::open(path).map_err(|e| TransferError::io(path.to_path_buf(), e))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| TransferError::io(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(md5_b64(ctx.compute()))
}

fn source_len(transfer: &Transfer) -> Result<u64> {
    match &transfer.source {
        TransferLocation::LocalFile { path, .. } => std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| TransferError::io(path.clone(), e)),
        TransferLocation::Stream(s) => Ok(s.len()),
        other => Err(TransferError::Uncategorized(format!(
            "sync copy cannot read from {}",
            other.type_name()
        ))),
    }
}

/// Smallest multiple of one cell that keeps the block count within the
/// protocol limit, floored at the configured block size and capped at the
/// largest legal block.
fn tune_block_size(total: u64, configured: u64) -> Result<u64> {
    if total > blob_limits::MAX_BLOCK_COUNT * blob_limits::MAX_BLOCK_SIZE {
        return Err(TransferError::BlobTooLarge(format!("{total} bytes")));
    }
    let per_block = total.div_ceil(blob_limits::MAX_BLOCK_COUNT);
    let aligned = per_block.div_ceil(CELL_SIZE as u64) * CELL_SIZE as u64;
    Ok(aligned
        .max(configured)
        .min(blob_limits::MAX_BLOCK_SIZE))
}

fn block_id(offset: u64) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{offset:032x}"))
}

async fn run_sync_copy(
    transfer: &Arc<Transfer>,
    single: &SingleObjectTransfer,
    rt: &TransferRuntime,
) -> Result<JobOutcome> {
    match (&transfer.source, &transfer.destination) {
        (_, TransferLocation::RemoteBlob(dest)) => {
            upload(transfer, single, rt, dest.clone()).await
        }
        (TransferLocation::RemoteBlob(source), _) => {
            download(transfer, single, rt, source.clone()).await
        }
        (src, dst) => Err(TransferError::Uncategorized(format!(
            "sync copy between {} and {} is not supported",
            src.type_name(),
            dst.type_name()
        ))),
    }
}

async fn upload(
    transfer: &Arc<Transfer>,
    single: &SingleObjectTransfer,
    rt: &TransferRuntime,
    dest: BlobLocation,
) -> Result<JobOutcome> {
    let total = source_len(transfer)?;
    let options = dest.request_options.clone();

    let block_size = {
        let mut st = single.job.state.write();
        if st.block_size == 0 {
            st.block_size = match dest.blob_type {
                BlobType::Append => {
                    if total > blob_limits::MAX_BLOCK_COUNT * blob_limits::MAX_APPEND_BLOCK_SIZE {
                        return Err(TransferError::BlobTooLarge(format!("{total} bytes")));
                    }
                    blob_limits::MAX_APPEND_BLOCK_SIZE
                }
                _ => tune_block_size(total, rt.config.effective_block_size())?,
            };
        }
        st.block_size
    };
    transfer.persist()?;

    let resumed = {
        let st = single.job.state.read();
        st.checkpoint.entry_transfer_offset > 0 || !st.checkpoint.transfer_window.is_empty()
    };

    // Fresh uploads within the single-put limit go up in one call,
    // provided the pool can stage the whole payload; otherwise they fall
    // through to block staging.
    let single_put_cells = (total.div_ceil(CELL_SIZE as u64) as usize).max(1);
    if !resumed
        && total <= blob_limits::SINGLE_PUT_THRESHOLD
        && dest.blob_type != BlobType::Append
        && single_put_cells <= rt.scheduler.memory().capacity()
    {
        let mut admission = rt.admit(single_put_cells).await?;
        let mut cells = admission.take_cells();
        let mut state = SyncState {
            plan: ChunkPlan::new(total, total.max(1), &SingleObjectCheckpoint::default()),
            source: open_source(transfer)?,
            md5: Some(md5::Context::new()),
            md5_watermark: 0,
        };
        let n = match state.claim_and_read_block(&mut cells)? {
            Some((_, n)) => n,
            None => 0,
        };
        let digest = state.md5.take().map(|c| md5_b64(c.compute()));
        let md5_param = options.store_blob_content_md5.then_some(digest).flatten();
        let mut data = Vec::with_capacity(n);
        for cell in &cells {
            if data.len() >= n {
                break;
            }
            let take = (n - data.len()).min(cell.len());
            data.extend_from_slice(&cell.as_slice()[..take]);
        }
        with_retries(&options, rt, || async {
            rt.client
                .put_blob(&dest, &data, md5_param.as_deref(), &BTreeMap::new())
                .await
        })
        .await?;
        claim_and_confirm_all(transfer, single, total)?;
        transfer.progress.add_bytes(total);
        return Ok(JobOutcome::Transferred);
    }

    let append = dest.blob_type == BlobType::Append;
    let cells_per_block = (block_size as usize).div_ceil(CELL_SIZE).max(1);
    // One pipeline per in-flight block, bounded by the per-job cell budget
    // and by what the pool can actually hold.
    let max_pipelines = (rt.scheduler.memory().capacity() / cells_per_block).max(1);
    let want_pipelines = if append {
        1
    } else {
        (total.div_ceil(block_size.max(1)) as usize)
            .clamp(1, rt.config.cells_per_job)
            .min(max_pipelines)
    };
    // The permit and the cells stay held until every worker settles.
    let mut admission = rt.admit(want_pipelines * cells_per_block).await?;

    let checkpoint = single.job.state.read().checkpoint.clone();
    let plan = ChunkPlan::new(total, block_size, &checkpoint);
    let done = plan.already_done(&checkpoint);
    let fresh = done == 0 && checkpoint.transfer_window.is_empty();
    let state = Arc::new(Mutex::new(SyncState {
        plan,
        source: open_source(transfer)?,
        md5: fresh.then(md5::Context::new),
        md5_watermark: 0,
    }));

    let mut cells = admission.take_cells();
    let mut workers: JoinSet<Result<()>> = JoinSet::new();
    for _ in 0..want_pipelines {
        let group: Vec<Cell> = cells.drain(..cells_per_block).collect();
        let state = Arc::clone(&state);
        let transfer = Arc::clone(transfer);
        let rt = rt.clone();
        let dest = dest.clone();
        let options = options.clone();
        workers.spawn(async move {
            upload_worker(transfer, rt, dest, options, state, group, append).await
        });
    }
    drop(cells);
    let mut first_err = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
                workers.abort_all();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                first_err.get_or_insert(TransferError::Uncategorized(e.to_string()));
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    // Page and append writes land directly; block blobs commit the staged
    // list in offset order.
    if !append && dest.blob_type != BlobType::Page {
        let digest = state.lock().md5.take().map(|c| md5_b64(c.compute()));
        let content_md5 = if options.store_blob_content_md5 {
            match digest {
                Some(d) => Some(d),
                None => Some(recompute_source_md5(transfer)?),
            }
        } else {
            None
        };
        let mut ids = Vec::new();
        let mut offset = 0;
        while offset < total {
            ids.push(block_id(offset));
            offset += block_size;
        }
        with_retries(&options, rt, || async {
            rt.client
                .commit_block_list(&dest, &ids, content_md5.as_deref())
                .await
        })
        .await?;
    }
    Ok(JobOutcome::Transferred)
}

fn open_source(transfer: &Transfer) -> Result<ByteSource> {
    Ok(match &transfer.source {
        TransferLocation::LocalFile { path, .. } => ByteSource::File(
            std::fs::File::open(path).map_err(|e| TransferError::io(path.clone(), e))?,
        ),
        TransferLocation::Stream(s) => ByteSource::Stream(s.clone()),
        other => {
            return Err(TransferError::Uncategorized(format!(
                "sync copy cannot read from {}",
                other.type_name()
            )))
        }
    })
}

fn recompute_source_md5(transfer: &Transfer) -> Result<String> {
    match &transfer.source {
        TransferLocation::LocalFile { path, .. } => file_md5(path),
        TransferLocation::Stream(s) => Ok(md5_b64(md5::compute(s.contents()))),
        other => Err(TransferError::Uncategorized(format!(
            "no digest for {}",
            other.type_name()
        ))),
    }
}

/// Fold the trivial single-put path into the checkpoint so resume sees a
/// completed window.
fn claim_and_confirm_all(
    transfer: &Arc<Transfer>,
    single: &SingleObjectTransfer,
    total: u64,
) -> Result<()> {
    {
        let mut st = single.job.state.write();
        st.checkpoint.entry_transfer_offset = total;
        st.checkpoint.transfer_window.clear();
    }
    transfer.persist()
}

async fn upload_worker(
    transfer: Arc<Transfer>,
    rt: TransferRuntime,
    dest: BlobLocation,
    options: RequestOptions,
    state: Arc<Mutex<SyncState>>,
    mut cells: Vec<Cell>,
    append: bool,
) -> Result<()> {
    let single = match &transfer.kind {
        crate::transfer::TransferKind::Single(s) => s,
        _ => unreachable!("upload worker runs on single transfers"),
    };
    loop {
        if rt.cancellation.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        // Claim + in-order read under the source lock.
        let claimed = state.lock().claim_and_read_block(&mut cells)?;
        let Some((offset, len)) = claimed else {
            return Ok(());
        };
        {
            let mut st = single.job.state.write();
            st.checkpoint.claim(offset, len as u64);
        }
        transfer.persist()?;

        let transactional = options.use_transactional_md5;
        let mut sent = 0usize;
        if append {
            let data = cells[0].as_slice();
            with_retries(&options, &rt, || async {
                rt.client
                    .put_page_or_append(&dest, offset, &data[..len])
                    .await
            })
            .await?;
        } else if dest.blob_type == BlobType::Page {
            for cell in cells.iter() {
                if sent >= len {
                    break;
                }
                let n = (len - sent).min(cell.len());
                let data = &cell.as_slice()[..n];
                let cell_offset = offset + sent as u64;
                with_retries(&options, &rt, || async {
                    rt.client.put_page_or_append(&dest, cell_offset, data).await
                })
                .await?;
                sent += n;
            }
        } else {
            let id = block_id(offset);
            // One block may span several cells; assemble the slice views.
            let mut block = Vec::with_capacity(len);
            for cell in cells.iter() {
                if block.len() >= len {
                    break;
                }
                let n = (len - block.len()).min(cell.len());
                block.extend_from_slice(&cell.as_slice()[..n]);
            }
            let md5_param = transactional.then(|| md5_b64(md5::compute(&block)));
            with_retries(&options, &rt, || async {
                rt.client
                    .put_block(&dest, &id, offset, &block, md5_param.as_deref())
                    .await
            })
            .await?;
        }

        {
            let mut st = single.job.state.write();
            st.checkpoint.confirm(offset);
        }
        transfer.persist()?;
        transfer.progress.add_bytes(len as u64);
    }
}

async fn download(
    transfer: &Arc<Transfer>,
    single: &SingleObjectTransfer,
    rt: &TransferRuntime,
    source: BlobLocation,
) -> Result<JobOutcome> {
    let options = source.request_options.clone();
    let props = rt
        .client
        .fetch_metadata(&source)
        .await?
        .ok_or_else(|| TransferError::NotFound(source.identity()))?;
    let total = props.length;

    // Chunk granularity for downloads is one cell; page-blob range scans
    // are clamped to the protocol's span.
    let chunk = (CELL_SIZE as u64).min(blob_limits::PAGE_RANGES_SPAN).max(1);
    {
        let mut st = single.job.state.write();
        if st.block_size == 0 {
            st.block_size = chunk;
        }
    }

    let sink = Arc::new(Mutex::new(open_sink(transfer, total)?));
    let checkpoint = single.job.state.read().checkpoint.clone();
    let plan = Arc::new(Mutex::new(ChunkPlan::new(total, chunk, &checkpoint)));

    let pipelines = (total.div_ceil(chunk.max(1)) as usize)
        .clamp(1, rt.config.cells_per_job)
        .min(rt.scheduler.memory().capacity().max(1));
    // The reservation bounds this job's share of pooled memory while the
    // fetched ranges are in flight.
    let _admission = rt.admit(pipelines).await?;

    let mut workers: JoinSet<Result<()>> = JoinSet::new();
    for _ in 0..pipelines {
        let plan = Arc::clone(&plan);
        let sink = Arc::clone(&sink);
        let transfer = Arc::clone(transfer);
        let rt = rt.clone();
        let source = source.clone();
        let options = options.clone();
        workers.spawn(async move {
            let single = match &transfer.kind {
                crate::transfer::TransferKind::Single(s) => s,
                _ => unreachable!(),
            };
            loop {
                if rt.cancellation.is_cancelled() {
                    return Err(TransferError::Cancelled);
                }
                let Some((offset, len)) = plan.lock().claim() else {
                    return Ok(());
                };
                {
                    let mut st = single.job.state.write();
                    st.checkpoint.claim(offset, len);
                }
                transfer.persist()?;
                let data = with_retries(&options, &rt, || async {
                    rt.client.get_range(&source, offset, len).await
                })
                .await?;
                if data.len() as u64 != len {
                    return Err(TransferError::Storage(format!(
                        "short read at {offset}: {} of {len} bytes",
                        data.len()
                    )));
                }
                sink.lock().write_at(offset, &data)?;
                {
                    let mut st = single.job.state.write();
                    st.checkpoint.confirm(offset);
                }
                transfer.persist()?;
                transfer.progress.add_bytes(len);
            }
        });
    }
    let mut first_err = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
                workers.abort_all();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                first_err.get_or_insert(TransferError::Uncategorized(e.to_string()));
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    sink.lock().flush()?;

    // End-to-end digest check against the remote's recorded MD5.
    if let Some(expected) = &props.content_md5 {
        let actual = match &transfer.destination {
            TransferLocation::LocalFile { path, .. } => file_md5(path)?,
            TransferLocation::Stream(s) => md5_b64(md5::compute(s.contents())),
            _ => expected.clone(),
        };
        if actual != *expected {
            return Err(TransferError::Storage(format!(
                "content md5 mismatch: remote {expected}, local {actual}"
            )));
        }
    }
    Ok(JobOutcome::Transferred)
}

fn open_sink(transfer: &Transfer, total: u64) -> Result<ByteSink> {
    match &transfer.destination {
        TransferLocation::LocalFile { path, .. } => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TransferError::io(parent.to_path_buf(), e))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(path)
                .map_err(|e| TransferError::io(path.clone(), e))?;
            file.set_len(total)
                .map_err(|e| TransferError::io(path.clone(), e))?;
            Ok(ByteSink::File(file))
        }
        TransferLocation::Stream(s) => Ok(ByteSink::Stream(s.clone())),
        other => Err(TransferError::Uncategorized(format!(
            "sync copy cannot write to {}",
            other.type_name()
        ))),
    }
}

impl ByteSink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            ByteSink::File(file) => file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| file.write_all(data))
                .map_err(|e| TransferError::io("<destination>", e)),
            ByteSink::Stream(s) => {
                s.write_at(offset, data);
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            ByteSink::File(file) => file
                .flush()
                .map_err(|e| TransferError::io("<destination>", e)),
            ByteSink::Stream(_) => Ok(()),
        }
    }
}

// -------------------------------------------------------------------------
// Service-side copy
// -------------------------------------------------------------------------

fn copy_source_uri(transfer: &Transfer, rt: &TransferRuntime) -> Result<String> {
    match &transfer.source {
        TransferLocation::RemoteBlob(blob) => match &blob.credentials {
            Credentials::SharedKey { .. } => rt
                .client
                .generate_read_sas(blob, crate::constants::COPY_SAS_LIFETIME),
            _ => Ok(blob.uri.to_uri_string()),
        },
        TransferLocation::SourceUri { uri } => Ok(uri.clone()),
        other => Err(TransferError::Uncategorized(format!(
            "service-side copy cannot start from {}",
            other.type_name()
        ))),
    }
}

async fn run_service_copy(
    transfer: &Arc<Transfer>,
    single: &SingleObjectTransfer,
    rt: &TransferRuntime,
    synchronous: bool,
) -> Result<JobOutcome> {
    let dest = match &transfer.destination {
        TransferLocation::RemoteBlob(blob) => blob.clone(),
        other => {
            return Err(TransferError::FailToValidateDestination(
                other.identity(),
                "service-side copy needs a blob destination".to_string(),
            ))
        }
    };

    let already_started = single.job.state.read().copy_id.is_some();
    if !already_started {
        let source_uri = copy_source_uri(transfer, rt)?;
        let copy_id = rt.client.start_server_copy(&source_uri, &dest).await?;
        let mut st = single.job.state.write();
        st.copy_id = Some(copy_id);
        if !synchronous {
            st.status = JobStatus::Monitor;
        }
        drop(st);
        transfer.persist()?;
    }

    monitor_copy(transfer, rt, &dest, synchronous).await?;
    Ok(JobOutcome::Transferred)
}

/// Poll the remote copy to a terminal state. Back-off doubles from the
/// minimum to the maximum (pinned there after the request budget), drops
/// back to the minimum when the copy is within the approaching-finish
/// threshold, and a progress stall beyond the configured window raises
/// `TransferStuck`.
async fn monitor_copy(
    transfer: &Arc<Transfer>,
    rt: &TransferRuntime,
    dest: &BlobLocation,
    synchronous: bool,
) -> Result<()> {
    let mut wait = copy_poll::MIN_WAIT;
    let mut polls: u32 = 0;
    let mut observed = transfer.progress.snapshot().bytes;
    let mut last_advance = Instant::now();
    loop {
        if rt.cancellation.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let state = rt.client.get_copy_status(dest).await?;
        if state.bytes_copied > observed {
            transfer.progress.add_bytes(state.bytes_copied - observed);
            observed = state.bytes_copied;
            last_advance = Instant::now();
        }
        match state.status {
            CopyStatus::Success => return Ok(()),
            CopyStatus::Failed | CopyStatus::Aborted => {
                return Err(TransferError::Storage(
                    state
                        .status_description
                        .unwrap_or_else(|| "server-side copy failed".to_string()),
                ))
            }
            CopyStatus::Pending => {}
        }
        if last_advance.elapsed() >= rt.config.stall_timeout {
            return Err(TransferError::TransferStuck(rt.config.stall_timeout));
        }
        let sleep_for = if synchronous {
            copy_poll::MIN_WAIT
        } else {
            let remaining = state.total_bytes.saturating_sub(state.bytes_copied);
            if remaining <= copy_poll::APPROACHING_FINISH_THRESHOLD {
                wait = copy_poll::MIN_WAIT;
            }
            wait
        };
        tokio::select! {
            _ = rt.cancellation.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep(sleep_for) => {}
        }
        if !synchronous {
            polls += 1;
            wait = if polls >= copy_poll::MAX_REQUEST_COUNT {
                copy_poll::MAX_WAIT
            } else {
                (wait * 2).min(copy_poll::MAX_WAIT)
            };
        }
    }
}

// -------------------------------------------------------------------------
// Retry policy
// -------------------------------------------------------------------------

fn retryable(e: &TransferError) -> bool {
    matches!(e, TransferError::Storage(_))
}

pub(crate) async fn with_retries<T, F, Fut>(
    options: &RequestOptions,
    rt: &TransferRuntime,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if retryable(&e) && attempt < options.retry_count => {
                attempt += 1;
                tokio::select! {
                    _ = rt.cancellation.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(options.retry_interval) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_window_round_trip() {
        let mut cp = SingleObjectCheckpoint::default();
        cp.claim(0, 4);
        cp.claim(4, 4);
        cp.confirm(0);
        let mut w = ByteWriter::new();
        cp.encode(&mut w);
        let bytes = w.into_bytes();
        let decoded = SingleObjectCheckpoint::decode(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(decoded, cp);
        assert_eq!(decoded.entry_transfer_offset, 8);
        assert_eq!(decoded.transfer_window, vec![4]);
    }

    #[test]
    fn plan_redoes_window_then_continues() {
        let cp = SingleObjectCheckpoint {
            entry_transfer_offset: 12,
            transfer_window: vec![8, 0],
        };
        let mut plan = ChunkPlan::new(20, 4, &cp);
        assert_eq!(plan.already_done(&cp), 4);
        assert_eq!(plan.claim(), Some((0, 4)));
        assert_eq!(plan.claim(), Some((8, 4)));
        assert_eq!(plan.claim(), Some((12, 4)));
        assert_eq!(plan.claim(), Some((16, 4)));
        assert_eq!(plan.claim(), None);
    }

    #[test]
    fn block_size_tuning() {
        let four_mib = CELL_SIZE as u64;
        // Small files keep the configured size.
        assert_eq!(tune_block_size(10, 2 * four_mib).unwrap(), 2 * four_mib);
        // Huge files grow the block to stay under the block-count limit.
        let huge = 50_000 * 16 * four_mib;
        let tuned = tune_block_size(huge, 2 * four_mib).unwrap();
        assert!(tuned >= huge.div_ceil(50_000));
        assert_eq!(tuned % four_mib, 0);
        assert!(tuned <= blob_limits::MAX_BLOCK_SIZE);
        // Beyond the absolute ceiling is an error.
        assert!(tune_block_size(
            blob_limits::MAX_BLOCK_COUNT * blob_limits::MAX_BLOCK_SIZE + 1,
            four_mib
        )
        .is_err());
    }

    #[test]
    fn job_status_tags_stable() {
        for status in [
            JobStatus::NotStarted,
            JobStatus::Transfer,
            JobStatus::Monitor,
            JobStatus::Finished,
            JobStatus::Failed,
            JobStatus::Skipped,
            JobStatus::SkippedDueToShouldNotTransfer,
        ] {
            assert_eq!(JobStatus::from_tag(status.tag()).unwrap(), status);
        }
    }

    #[test]
    fn block_ids_are_uniform_length() {
        let a = block_id(0);
        let b = block_id(u64::MAX);
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }
}
