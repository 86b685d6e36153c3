//! Stream journal: the binary checkpoint file behind resume
//!
//! Layout (little-endian, absolute offsets):
//!
//! ```text
//! [0,     256)   format version, u16 length prefix + UTF-8, zero padded
//! [256,   512)   head: eleven u64 fields, rest reserved
//! [512,  39936)  base transfer payload, u32 length prefix
//! [39936,40960)  base progress area (4 x u64 counters)
//! [40960,  ...)  10 KiB chunks
//! ```
//!
//! Each used chunk starts with `(prev, next)` u64 pointers forming a doubly
//! linked list (0 is nil; chunk offsets start at 40960 so 0 is never valid).
//! Content follows at +16 as a u32 length-prefixed payload; the last 1024
//! bytes of the chunk are a progress area. Ongoing sub-directory chunks keep
//! their list-continuation token at the fixed in-chunk offset 4096 so
//! in-place token rewrites never move it. Sub-directory relative paths are
//! packed four 2176-byte slots per chunk and consumed as a queue through the
//! head's write/read offsets.
//!
//! Every mutation follows the same discipline under the single journal lock:
//! write payload, splice pointers, rewrite the head, flush. After a torn
//! write the head is authoritative; stale bytes in unreferenced chunks are
//! harmless.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::FORMAT_VERSION;
use crate::error::{Result, TransferError};
use crate::progress::{ProgressSink, ProgressSnapshot};

pub const VERSION_AREA_SIZE: u64 = 256;
pub const HEAD_OFFSET: u64 = 256;
pub const BASE_TRANSFER_OFFSET: u64 = 512;
// The base region [512, 40960) splits into payload and a trailing 1 KiB
// progress area.
pub const BASE_PROGRESS_AREA: u64 = 39936;
pub const BASE_TRANSFER_MAX: usize = (BASE_PROGRESS_AREA - BASE_TRANSFER_OFFSET) as usize;
pub const CHUNK_REGION_OFFSET: u64 = 40960;
pub const CHUNK_SIZE: u64 = 10240;
pub const CHUNK_LINK_SIZE: u64 = 16;
pub const CHUNK_PROGRESS_SIZE: u64 = 1024;
pub const CHUNK_CONTENT_OFFSET: u64 = CHUNK_LINK_SIZE;
pub const CHUNK_PROGRESS_OFFSET: u64 = CHUNK_SIZE - CHUNK_PROGRESS_SIZE; // 9216
pub const CHUNK_CONTENT_MAX: usize = (CHUNK_PROGRESS_OFFSET - CHUNK_CONTENT_OFFSET - 4) as usize;
/// In-chunk offset of an ongoing sub-directory's continuation token.
pub const SUBDIR_TOKEN_OFFSET: u64 = 4096;
pub const SUBDIR_CONTENT_MAX: usize = (SUBDIR_TOKEN_OFFSET - CHUNK_CONTENT_OFFSET - 4) as usize;
pub const SUBDIR_TOKEN_MAX: usize = (CHUNK_PROGRESS_OFFSET - SUBDIR_TOKEN_OFFSET - 4) as usize;
pub const RELPATH_SLOT_SIZE: u64 = 2176;
pub const RELPATH_SLOTS_PER_CHUNK: u64 = 4;

/// Seekable backing store for a journal. Files qualify, as does a
/// `Cursor<Vec<u8>>` in tests.
pub trait JournalStream: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send> JournalStream for T {}

/// Where a transfer's record lives: the fixed base area or one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalSlot {
    Base,
    Chunk(u64),
}

/// The three payload-bearing lists plus the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkList {
    SingleTransfer,
    OngoingSubDir,
    SubDirRelpath,
    Free,
}

/// The eleven-field journal head at offset 256.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalHead {
    pub single_transfer_chunk_head: u64,
    pub single_transfer_chunk_tail: u64,
    pub ongoing_sub_dir_chunk_head: u64,
    pub ongoing_sub_dir_chunk_tail: u64,
    pub sub_dir_relpath_chunk_head: u64,
    pub sub_dir_relpath_chunk_tail: u64,
    pub free_chunk_head: u64,
    pub free_chunk_tail: u64,
    pub sub_dir_relpath_next_write_offset: u64,
    pub sub_dir_relpath_current_read_offset: u64,
    pub preserved_chunk_count: u64,
}

impl JournalHead {
    fn to_bytes(self) -> [u8; 88] {
        let fields = [
            self.single_transfer_chunk_head,
            self.single_transfer_chunk_tail,
            self.ongoing_sub_dir_chunk_head,
            self.ongoing_sub_dir_chunk_tail,
            self.sub_dir_relpath_chunk_head,
            self.sub_dir_relpath_chunk_tail,
            self.free_chunk_head,
            self.free_chunk_tail,
            self.sub_dir_relpath_next_write_offset,
            self.sub_dir_relpath_current_read_offset,
            self.preserved_chunk_count,
        ];
        let mut out = [0u8; 88];
        for (i, v) in fields.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn from_bytes(bytes: &[u8; 88]) -> JournalHead {
        let mut fields = [0u64; 11];
        for (i, f) in fields.iter_mut().enumerate() {
            let mut v = [0u8; 8];
            v.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *f = u64::from_le_bytes(v);
        }
        JournalHead {
            single_transfer_chunk_head: fields[0],
            single_transfer_chunk_tail: fields[1],
            ongoing_sub_dir_chunk_head: fields[2],
            ongoing_sub_dir_chunk_tail: fields[3],
            sub_dir_relpath_chunk_head: fields[4],
            sub_dir_relpath_chunk_tail: fields[5],
            free_chunk_head: fields[6],
            free_chunk_tail: fields[7],
            sub_dir_relpath_next_write_offset: fields[8],
            sub_dir_relpath_current_read_offset: fields[9],
            preserved_chunk_count: fields[10],
        }
    }
}

/// Outcome of [`StreamJournal::open`].
pub enum JournalOpen {
    /// First 256 bytes were all zero (or the stream was empty): a fresh
    /// journal was initialized.
    Fresh(StreamJournal),
    /// An existing journal; `base` is the root transfer payload if one was
    /// ever recorded, with its restored progress counters.
    Resumed {
        journal: StreamJournal,
        base: Option<Vec<u8>>,
        base_progress: ProgressSnapshot,
    },
}

struct JournalInner {
    stream: Box<dyn JournalStream>,
    head: JournalHead,
}

/// One journal, one lock. Every public method takes the lock for the whole
/// mutation; iteration locks per item and must be treated as a snapshot of
/// each step, not a consistent whole-list view.
#[derive(Clone)]
pub struct StreamJournal {
    inner: Arc<Mutex<JournalInner>>,
}

/// An all-zero version area denotes an empty journal. A legitimate version
/// string can never be zero-prefixed here because the length prefix of a
/// non-empty string is non-zero; the probe is exposed for callers that want
/// to decide before opening.
pub fn probe_is_empty(version_area: &[u8]) -> bool {
    version_area.iter().all(|b| *b == 0)
}

impl StreamJournal {
    /// Open or initialize a journal over `stream`. `validate_version` is
    /// the `DisableJournalValidation` escape hatch, inverted.
    pub fn open(mut stream: Box<dyn JournalStream>, validate_version: bool) -> Result<JournalOpen> {
        let mut version_area = [0u8; VERSION_AREA_SIZE as usize];
        stream
            .seek(SeekFrom::Start(0))
            .map_err(|e| TransferError::JournalCorrupt(format!("seek: {e}")))?;
        let filled = read_up_to(&mut stream, &mut version_area)
            .map_err(|e| TransferError::JournalCorrupt(format!("read version: {e}")))?;

        if filled < version_area.len() || probe_is_empty(&version_area) {
            let mut inner = JournalInner {
                stream,
                head: JournalHead::default(),
            };
            inner.write_version(FORMAT_VERSION)?;
            inner.write_head()?;
            inner.flush()?;
            return Ok(JournalOpen::Fresh(StreamJournal {
                inner: Arc::new(Mutex::new(inner)),
            }));
        }

        let found = parse_version(&version_area)?;
        if validate_version && found != FORMAT_VERSION {
            return Err(TransferError::JournalVersionMismatch {
                found,
                expected: FORMAT_VERSION.to_string(),
            });
        }

        let mut inner = JournalInner {
            stream,
            head: JournalHead::default(),
        };
        inner.head = inner.read_head()?;
        let base = inner.read_payload(BASE_TRANSFER_OFFSET, BASE_TRANSFER_MAX)?;
        let base_progress = inner.read_progress(BASE_PROGRESS_AREA)?;
        Ok(JournalOpen::Resumed {
            journal: StreamJournal {
                inner: Arc::new(Mutex::new(inner)),
            },
            base,
            base_progress,
        })
    }

    pub fn head(&self) -> JournalHead {
        self.inner.lock().head
    }

    /// Record (or rewrite) the root transfer in the fixed base area.
    pub fn set_base(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > BASE_TRANSFER_MAX - 4 {
            return Err(TransferError::JournalCorrupt(format!(
                "base transfer payload of {} bytes exceeds {}",
                payload.len(),
                BASE_TRANSFER_MAX - 4
            )));
        }
        let mut inner = self.inner.lock();
        inner.write_payload(BASE_TRANSFER_OFFSET, payload)?;
        inner.flush()
    }

    pub fn write_progress(&self, area_offset: u64, snapshot: &ProgressSnapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.write_progress(area_offset, snapshot)?;
        inner.flush()
    }

    pub fn read_progress(&self, area_offset: u64) -> Result<ProgressSnapshot> {
        self.inner.lock().read_progress(area_offset)
    }

    /// Progress sink bound to the base area.
    pub fn base_progress_sink(&self) -> Arc<dyn ProgressSink> {
        Arc::new(JournalProgressSink {
            journal: self.clone(),
            area_offset: BASE_PROGRESS_AREA,
        })
    }

    /// Progress sink bound to a chunk's trailing progress area.
    pub fn chunk_progress_sink(&self, chunk_offset: u64) -> Arc<dyn ProgressSink> {
        Arc::new(JournalProgressSink {
            journal: self.clone(),
            area_offset: chunk_offset + CHUNK_PROGRESS_OFFSET,
        })
    }

    pub fn read_chunk_progress(&self, chunk_offset: u64) -> Result<ProgressSnapshot> {
        self.read_progress(chunk_offset + CHUNK_PROGRESS_OFFSET)
    }

    /// Allocate a chunk on `list` (free list first, else extend), write the
    /// payload, splice, rewrite the head, flush. Returns the chunk offset;
    /// the offset is stable for the lifetime of the record.
    pub fn add_chunk(&self, list: ChunkList, payload: &[u8]) -> Result<u64> {
        let max = match list {
            ChunkList::OngoingSubDir => SUBDIR_CONTENT_MAX,
            _ => CHUNK_CONTENT_MAX,
        };
        if payload.len() > max {
            return Err(TransferError::JournalCorrupt(format!(
                "chunk payload of {} bytes exceeds {}",
                payload.len(),
                max
            )));
        }
        let mut inner = self.inner.lock();
        let offset = inner.alloc_chunk()?;
        inner.write_payload(offset + CHUNK_CONTENT_OFFSET, payload)?;
        // Fresh records must not see a previous tenant's counters or token.
        inner.write_progress(offset + CHUNK_PROGRESS_OFFSET, &ProgressSnapshot::default())?;
        if list == ChunkList::OngoingSubDir {
            inner.write_payload(offset + SUBDIR_TOKEN_OFFSET, &[])?;
        }
        inner.append_to_list(list, offset)?;
        inner.write_head()?;
        inner.flush()?;
        Ok(offset)
    }

    /// Rewrite a chunk's payload in place at its pre-reserved offset.
    pub fn update_chunk(&self, chunk_offset: u64, payload: &[u8]) -> Result<()> {
        if payload.len() > CHUNK_CONTENT_MAX {
            return Err(TransferError::JournalCorrupt(format!(
                "chunk payload of {} bytes exceeds {}",
                payload.len(),
                CHUNK_CONTENT_MAX
            )));
        }
        let mut inner = self.inner.lock();
        inner.write_payload(chunk_offset + CHUNK_CONTENT_OFFSET, payload)?;
        inner.flush()
    }

    /// Unlink a chunk from `list` and return it to the free list.
    pub fn remove_chunk(&self, list: ChunkList, chunk_offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.unlink(list, chunk_offset)?;
        inner.append_to_list(ChunkList::Free, chunk_offset)?;
        inner.write_head()?;
        inner.flush()
    }

    /// Walk a list, locking per item. Concurrent mutations may be observed
    /// between steps.
    pub fn read_chunks(&self, list: ChunkList) -> Result<Vec<(u64, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut cursor = {
            let inner = self.inner.lock();
            inner.list_head(list)
        };
        while cursor != 0 {
            let mut inner = self.inner.lock();
            let (_prev, next) = inner.read_links(cursor)?;
            let payload = inner
                .read_payload(cursor + CHUNK_CONTENT_OFFSET, CHUNK_CONTENT_MAX)?
                .unwrap_or_default();
            drop(inner);
            out.push((cursor, payload));
            cursor = next;
        }
        Ok(out)
    }

    /// Rewrite an ongoing sub-directory's continuation token at its fixed
    /// in-chunk offset.
    pub fn write_subdir_token(&self, chunk_offset: u64, token: &[u8]) -> Result<()> {
        if token.len() > SUBDIR_TOKEN_MAX {
            return Err(TransferError::JournalCorrupt(format!(
                "continuation token of {} bytes exceeds {}",
                token.len(),
                SUBDIR_TOKEN_MAX
            )));
        }
        let mut inner = self.inner.lock();
        inner.write_payload(chunk_offset + SUBDIR_TOKEN_OFFSET, token)?;
        inner.flush()
    }

    pub fn read_subdir_token(&self, chunk_offset: u64) -> Result<Option<Vec<u8>>> {
        self.inner
            .lock()
            .read_payload(chunk_offset + SUBDIR_TOKEN_OFFSET, SUBDIR_TOKEN_MAX)
    }

    /// Append a pending sub-directory relative path to the journal queue.
    pub fn push_relpath(&self, relpath: &str) -> Result<()> {
        let bytes = relpath.as_bytes();
        if bytes.len() > RELPATH_SLOT_SIZE as usize - 4 {
            return Err(TransferError::JournalCorrupt(format!(
                "relative path of {} bytes exceeds a relpath slot",
                bytes.len()
            )));
        }
        let mut inner = self.inner.lock();
        if inner.head.sub_dir_relpath_next_write_offset == 0 {
            let chunk = inner.alloc_chunk()?;
            inner.append_to_list(ChunkList::SubDirRelpath, chunk)?;
            inner.head.sub_dir_relpath_next_write_offset = chunk + CHUNK_CONTENT_OFFSET;
            if inner.head.sub_dir_relpath_current_read_offset == 0 {
                inner.head.sub_dir_relpath_current_read_offset = chunk + CHUNK_CONTENT_OFFSET;
            }
        }
        let slot = inner.head.sub_dir_relpath_next_write_offset;
        inner.write_payload(slot, bytes)?;
        // Keep the write pointer valid at all times: filling the last slot
        // of a chunk immediately allocates the successor.
        if slot_index(slot) + 1 < RELPATH_SLOTS_PER_CHUNK {
            inner.head.sub_dir_relpath_next_write_offset = slot + RELPATH_SLOT_SIZE;
        } else {
            let next = inner.alloc_chunk()?;
            inner.append_to_list(ChunkList::SubDirRelpath, next)?;
            inner.head.sub_dir_relpath_next_write_offset = next + CHUNK_CONTENT_OFFSET;
        }
        inner.write_head()?;
        inner.flush()
    }

    /// Read the pending relative paths without consuming them, oldest
    /// first. Used to rebuild the in-memory queue on resume.
    pub fn peek_relpaths(&self) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        let mut read = inner.head.sub_dir_relpath_current_read_offset;
        let write = inner.head.sub_dir_relpath_next_write_offset;
        while read != 0 && read != write {
            let payload = inner
                .read_payload(read, RELPATH_SLOT_SIZE as usize - 4)?
                .ok_or_else(|| {
                    TransferError::JournalCorrupt("empty relpath slot before write pointer".into())
                })?;
            out.push(String::from_utf8(payload).map_err(|_| {
                TransferError::JournalCorrupt("relpath slot is not UTF-8".into())
            })?);
            if slot_index(read) + 1 < RELPATH_SLOTS_PER_CHUNK {
                read += RELPATH_SLOT_SIZE;
            } else {
                let (_prev, next) = inner.read_links(chunk_base(read))?;
                read = next + CHUNK_CONTENT_OFFSET;
            }
        }
        Ok(out)
    }

    /// Pop the next pending relative path, freeing fully-consumed chunks.
    pub fn pop_relpath(&self) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        let read = inner.head.sub_dir_relpath_current_read_offset;
        if read == 0 || read == inner.head.sub_dir_relpath_next_write_offset {
            return Ok(None);
        }
        let payload = inner
            .read_payload(read, RELPATH_SLOT_SIZE as usize - 4)?
            .ok_or_else(|| {
                TransferError::JournalCorrupt("empty relpath slot before write pointer".into())
            })?;
        let relpath = String::from_utf8(payload)
            .map_err(|_| TransferError::JournalCorrupt("relpath slot is not UTF-8".into()))?;

        if slot_index(read) + 1 < RELPATH_SLOTS_PER_CHUNK {
            inner.head.sub_dir_relpath_current_read_offset = read + RELPATH_SLOT_SIZE;
            inner.write_head()?;
            inner.flush()?;
        } else {
            let consumed = chunk_base(read);
            let (_prev, next) = inner.read_links(consumed)?;
            inner.head.sub_dir_relpath_current_read_offset = next + CHUNK_CONTENT_OFFSET;
            inner.unlink(ChunkList::SubDirRelpath, consumed)?;
            inner.append_to_list(ChunkList::Free, consumed)?;
            inner.write_head()?;
            inner.flush()?;
        }
        Ok(Some(relpath))
    }
}

struct JournalProgressSink {
    journal: StreamJournal,
    area_offset: u64,
}

impl ProgressSink for JournalProgressSink {
    fn persist(&self, snapshot: &ProgressSnapshot) {
        // Persistence is best effort on the hot path; a failing journal
        // surfaces on the next structural mutation.
        let _ = self.journal.write_progress(self.area_offset, snapshot);
    }
}

fn chunk_base(offset: u64) -> u64 {
    CHUNK_REGION_OFFSET + ((offset - CHUNK_REGION_OFFSET) / CHUNK_SIZE) * CHUNK_SIZE
}

fn slot_index(slot_offset: u64) -> u64 {
    (slot_offset - chunk_base(slot_offset) - CHUNK_CONTENT_OFFSET) / RELPATH_SLOT_SIZE
}

fn parse_version(area: &[u8]) -> Result<String> {
    let len = u16::from_le_bytes([area[0], area[1]]) as usize;
    if len == 0 || len + 2 > area.len() {
        return Err(TransferError::JournalCorrupt(
            "version string length out of range".into(),
        ));
    }
    String::from_utf8(area[2..2 + len].to_vec())
        .map_err(|_| TransferError::JournalCorrupt("version string is not UTF-8".into()))
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl JournalInner {
    fn io_err(context: &str, e: std::io::Error) -> TransferError {
        TransferError::JournalCorrupt(format!("{context}: {e}"))
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.stream
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Self::io_err("seek", e))?;
        self.stream
            .write_all(bytes)
            .map_err(|e| Self::io_err("write", e))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.stream
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Self::io_err("seek", e))?;
        read_up_to(&mut self.stream, buf).map_err(|e| Self::io_err("read", e))
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(|e| Self::io_err("flush", e))
    }

    fn write_version(&mut self, version: &str) -> Result<()> {
        let mut area = vec![0u8; VERSION_AREA_SIZE as usize];
        let bytes = version.as_bytes();
        area[0..2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        area[2..2 + bytes.len()].copy_from_slice(bytes);
        self.write_at(0, &area)
    }

    fn write_head(&mut self) -> Result<()> {
        let bytes = self.head.to_bytes();
        self.write_at(HEAD_OFFSET, &bytes)
    }

    fn read_head(&mut self) -> Result<JournalHead> {
        let mut bytes = [0u8; 88];
        let n = self.read_at(HEAD_OFFSET, &mut bytes)?;
        if n < bytes.len() {
            return Err(TransferError::JournalCorrupt("truncated head".into()));
        }
        Ok(JournalHead::from_bytes(&bytes))
    }

    /// Length-prefixed payload write.
    fn write_payload(&mut self, offset: u64, payload: &[u8]) -> Result<()> {
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(payload);
        self.write_at(offset, &framed)
    }

    /// Length-prefixed payload read; `None` when the slot was never written
    /// (zero length or reads past EOF).
    fn read_payload(&mut self, offset: u64, max: usize) -> Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        let n = self.read_at(offset, &mut len_bytes)?;
        if n < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > max {
            return Err(TransferError::JournalCorrupt(format!(
                "payload length {len} at offset {offset} exceeds {max}"
            )));
        }
        let mut payload = vec![0u8; len];
        let n = self.read_at(offset + 4, &mut payload)?;
        if n < len {
            return Err(TransferError::JournalCorrupt(format!(
                "truncated payload at offset {offset}"
            )));
        }
        Ok(Some(payload))
    }

    fn write_progress(&mut self, area_offset: u64, snapshot: &ProgressSnapshot) -> Result<()> {
        let mut bytes = [0u8; 32];
        bytes[0..8].copy_from_slice(&snapshot.bytes.to_le_bytes());
        bytes[8..16].copy_from_slice(&snapshot.files_transferred.to_le_bytes());
        bytes[16..24].copy_from_slice(&snapshot.files_skipped.to_le_bytes());
        bytes[24..32].copy_from_slice(&snapshot.files_failed.to_le_bytes());
        self.write_at(area_offset, &bytes)
    }

    fn read_progress(&mut self, area_offset: u64) -> Result<ProgressSnapshot> {
        let mut bytes = [0u8; 32];
        let n = self.read_at(area_offset, &mut bytes)?;
        if n < bytes.len() {
            return Ok(ProgressSnapshot::default());
        }
        let field = |i: usize| {
            let mut v = [0u8; 8];
            v.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(v)
        };
        Ok(ProgressSnapshot {
            bytes: field(0),
            files_transferred: field(1),
            files_skipped: field(2),
            files_failed: field(3),
        })
    }

    fn read_links(&mut self, chunk_offset: u64) -> Result<(u64, u64)> {
        let mut bytes = [0u8; 16];
        let n = self.read_at(chunk_offset, &mut bytes)?;
        if n < bytes.len() {
            return Err(TransferError::JournalCorrupt(format!(
                "truncated chunk links at offset {chunk_offset}"
            )));
        }
        let mut prev = [0u8; 8];
        let mut next = [0u8; 8];
        prev.copy_from_slice(&bytes[0..8]);
        next.copy_from_slice(&bytes[8..16]);
        Ok((u64::from_le_bytes(prev), u64::from_le_bytes(next)))
    }

    fn write_links(&mut self, chunk_offset: u64, prev: u64, next: u64) -> Result<()> {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&prev.to_le_bytes());
        bytes[8..16].copy_from_slice(&next.to_le_bytes());
        self.write_at(chunk_offset, &bytes)
    }

    fn list_head(&self, list: ChunkList) -> u64 {
        match list {
            ChunkList::SingleTransfer => self.head.single_transfer_chunk_head,
            ChunkList::OngoingSubDir => self.head.ongoing_sub_dir_chunk_head,
            ChunkList::SubDirRelpath => self.head.sub_dir_relpath_chunk_head,
            ChunkList::Free => self.head.free_chunk_head,
        }
    }

    fn list_refs(&mut self, list: ChunkList) -> (&mut u64, &mut u64) {
        match list {
            ChunkList::SingleTransfer => (
                &mut self.head.single_transfer_chunk_head,
                &mut self.head.single_transfer_chunk_tail,
            ),
            ChunkList::OngoingSubDir => (
                &mut self.head.ongoing_sub_dir_chunk_head,
                &mut self.head.ongoing_sub_dir_chunk_tail,
            ),
            ChunkList::SubDirRelpath => (
                &mut self.head.sub_dir_relpath_chunk_head,
                &mut self.head.sub_dir_relpath_chunk_tail,
            ),
            ChunkList::Free => (&mut self.head.free_chunk_head, &mut self.head.free_chunk_tail),
        }
    }

    /// Draw from the free list, else extend the file by one chunk.
    fn alloc_chunk(&mut self) -> Result<u64> {
        if self.head.free_chunk_head != 0 {
            let offset = self.head.free_chunk_head;
            let (_prev, next) = self.read_links(offset)?;
            self.head.free_chunk_head = next;
            if next != 0 {
                let (_p, n) = self.read_links(next)?;
                self.write_links(next, 0, n)?;
            } else {
                self.head.free_chunk_tail = 0;
            }
            self.write_links(offset, 0, 0)?;
            return Ok(offset);
        }
        let offset = CHUNK_REGION_OFFSET + self.head.preserved_chunk_count * CHUNK_SIZE;
        self.head.preserved_chunk_count += 1;
        // Materialize the whole chunk so later partial reads see zeros.
        let zeros = vec![0u8; CHUNK_SIZE as usize];
        self.write_at(offset, &zeros)?;
        Ok(offset)
    }

    fn append_to_list(&mut self, list: ChunkList, offset: u64) -> Result<()> {
        let tail = {
            let (_, tail) = self.list_refs(list);
            *tail
        };
        self.write_links(offset, tail, 0)?;
        if tail != 0 {
            let (prev, _next) = self.read_links(tail)?;
            self.write_links(tail, prev, offset)?;
        }
        let (head, tail_ref) = self.list_refs(list);
        if *head == 0 {
            *head = offset;
        }
        *tail_ref = offset;
        Ok(())
    }

    fn unlink(&mut self, list: ChunkList, offset: u64) -> Result<()> {
        let (prev, next) = self.read_links(offset)?;
        if prev != 0 {
            let (pp, _pn) = self.read_links(prev)?;
            self.write_links(prev, pp, next)?;
        }
        if next != 0 {
            let (_np, nn) = self.read_links(next)?;
            self.write_links(next, prev, nn)?;
        }
        let (head, tail) = self.list_refs(list);
        if *head == offset {
            *head = next;
        }
        if *tail == offset {
            *tail = prev;
        }
        Ok(())
    }
}

/// Little-endian byte codec used for every serialized payload. Explicit
/// discriminators and a fixed field order: the journal must be re-openable
/// by a different build.
pub(crate) mod codec {
    use crate::error::{Result, TransferError};

    #[derive(Default)]
    pub struct ByteWriter {
        buf: Vec<u8>,
    }

    impl ByteWriter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn into_bytes(self) -> Vec<u8> {
            self.buf
        }

        pub fn put_u8(&mut self, v: u8) {
            self.buf.push(v);
        }

        pub fn put_bool(&mut self, v: bool) {
            self.buf.push(v as u8);
        }

        pub fn put_u32(&mut self, v: u32) {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }

        pub fn put_u64(&mut self, v: u64) {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }

        pub fn put_bytes(&mut self, v: &[u8]) {
            self.put_u32(v.len() as u32);
            self.buf.extend_from_slice(v);
        }

        pub fn put_str(&mut self, v: &str) {
            self.put_bytes(v.as_bytes());
        }

        pub fn put_opt_str(&mut self, v: Option<&str>) {
            match v {
                Some(s) => {
                    self.put_u8(1);
                    self.put_str(s);
                }
                None => self.put_u8(0),
            }
        }

        pub fn put_opt_u64(&mut self, v: Option<u64>) {
            match v {
                Some(n) => {
                    self.put_u8(1);
                    self.put_u64(n);
                }
                None => self.put_u8(0),
            }
        }
    }

    pub struct ByteReader<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> ByteReader<'a> {
        pub fn new(buf: &'a [u8]) -> Self {
            ByteReader { buf, pos: 0 }
        }

        pub fn remaining(&self) -> usize {
            self.buf.len() - self.pos
        }

        fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            if self.remaining() < n {
                return Err(TransferError::JournalCorrupt(format!(
                    "payload truncated: wanted {n} bytes, {} left",
                    self.remaining()
                )));
            }
            let slice = &self.buf[self.pos..self.pos + n];
            self.pos += n;
            Ok(slice)
        }

        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        pub fn bool(&mut self) -> Result<bool> {
            Ok(self.u8()? != 0)
        }

        pub fn u32(&mut self) -> Result<u32> {
            let b = self.take(4)?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        pub fn u64(&mut self) -> Result<u64> {
            let b = self.take(8)?;
            let mut v = [0u8; 8];
            v.copy_from_slice(b);
            Ok(u64::from_le_bytes(v))
        }

        pub fn bytes(&mut self) -> Result<Vec<u8>> {
            let len = self.u32()? as usize;
            Ok(self.take(len)?.to_vec())
        }

        pub fn str(&mut self) -> Result<String> {
            String::from_utf8(self.bytes()?)
                .map_err(|_| TransferError::JournalCorrupt("string payload is not UTF-8".into()))
        }

        pub fn opt_str(&mut self) -> Result<Option<String>> {
            if self.u8()? == 0 {
                Ok(None)
            } else {
                Ok(Some(self.str()?))
            }
        }

        pub fn opt_u64(&mut self) -> Result<Option<u64>> {
            if self.u8()? == 0 {
                Ok(None)
            } else {
                Ok(Some(self.u64()?))
            }
        }
    }
}
