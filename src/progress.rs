//! Progress tracking
//!
//! Counters are plain atomics so chunk completions never contend. A tracker
//! may have a parent: every delta applied to a child is applied to each
//! ancestor exactly once. Persistence (the journal) sees a consistent
//! snapshot via the tracker's reader/writer lock; the user-visible handler
//! is debounced with an in-flight flag so at most one report runs at a time
//! and a burst of updates coalesces into at most one trailing report.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub bytes: u64,
    pub files_transferred: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
}

impl ProgressSnapshot {
    /// Total of terminal file outcomes.
    pub fn files_total(&self) -> u64 {
        self.files_transferred + self.files_skipped + self.files_failed
    }
}

/// User-facing progress callback.
pub trait ProgressHandler: Send + Sync {
    fn report(&self, snapshot: &ProgressSnapshot);
}

impl<F> ProgressHandler for F
where
    F: Fn(&ProgressSnapshot) + Send + Sync,
{
    fn report(&self, snapshot: &ProgressSnapshot) {
        self(snapshot)
    }
}

/// Where a tracker persists itself on every change. The journal installs a
/// sink pointing at the tracker's pre-reserved progress area.
pub trait ProgressSink: Send + Sync {
    fn persist(&self, snapshot: &ProgressSnapshot);
}

const REPORT_IDLE: u8 = 0;
const REPORT_RUNNING: u8 = 1;
const REPORT_QUEUED: u8 = 2;

#[derive(Default)]
struct TrackerInner {
    bytes: AtomicU64,
    files_transferred: AtomicU64,
    files_skipped: AtomicU64,
    files_failed: AtomicU64,
    parent: Option<Arc<TrackerInner>>,
    handler: Mutex<Option<Arc<dyn ProgressHandler>>>,
    sink: Mutex<Option<Arc<dyn ProgressSink>>>,
    // Counter writers take read(); snapshotting takes write().
    snapshot_lock: RwLock<()>,
    report_state: AtomicU8,
}

#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Delta {
    bytes: u64,
    transferred: u64,
    skipped: u64,
    failed: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker whose deltas also aggregate into `self`.
    pub fn child(&self) -> ProgressTracker {
        ProgressTracker {
            inner: Arc::new(TrackerInner {
                parent: Some(Arc::clone(&self.inner)),
                ..TrackerInner::default()
            }),
        }
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn ProgressHandler>>) {
        *self.inner.handler.lock() = handler;
    }

    pub fn set_sink(&self, sink: Option<Arc<dyn ProgressSink>>) {
        *self.inner.sink.lock() = sink;
    }

    pub fn add_bytes(&self, n: u64) {
        if n > 0 {
            self.apply(Delta {
                bytes: n,
                ..Delta::default()
            });
        }
    }

    pub fn add_file_transferred(&self) {
        self.apply(Delta {
            transferred: 1,
            ..Delta::default()
        });
    }

    pub fn add_file_skipped(&self) {
        self.apply(Delta {
            skipped: 1,
            ..Delta::default()
        });
    }

    pub fn add_file_failed(&self) {
        self.apply(Delta {
            failed: 1,
            ..Delta::default()
        });
    }

    /// Consistent snapshot of the counters.
    pub fn snapshot(&self) -> ProgressSnapshot {
        Self::snapshot_inner(&self.inner)
    }

    /// Reinstate counters recovered from a journal. Does not propagate to
    /// the parent: ancestors are restored from their own journal areas.
    pub fn restore(&self, snapshot: &ProgressSnapshot) {
        let _guard = self.inner.snapshot_lock.write();
        self.inner.bytes.store(snapshot.bytes, Ordering::Release);
        self.inner
            .files_transferred
            .store(snapshot.files_transferred, Ordering::Release);
        self.inner
            .files_skipped
            .store(snapshot.files_skipped, Ordering::Release);
        self.inner
            .files_failed
            .store(snapshot.files_failed, Ordering::Release);
    }

    fn apply(&self, delta: Delta) {
        let mut level = Some(&self.inner);
        while let Some(inner) = level {
            {
                let _guard = inner.snapshot_lock.read();
                inner.bytes.fetch_add(delta.bytes, Ordering::AcqRel);
                inner
                    .files_transferred
                    .fetch_add(delta.transferred, Ordering::AcqRel);
                inner.files_skipped.fetch_add(delta.skipped, Ordering::AcqRel);
                inner.files_failed.fetch_add(delta.failed, Ordering::AcqRel);
            }
            Self::persist_inner(inner);
            Self::trigger_report(inner);
            level = inner.parent.as_ref();
        }
    }

    fn snapshot_inner(inner: &TrackerInner) -> ProgressSnapshot {
        let _guard = inner.snapshot_lock.write();
        ProgressSnapshot {
            bytes: inner.bytes.load(Ordering::Acquire),
            files_transferred: inner.files_transferred.load(Ordering::Acquire),
            files_skipped: inner.files_skipped.load(Ordering::Acquire),
            files_failed: inner.files_failed.load(Ordering::Acquire),
        }
    }

    fn persist_inner(inner: &TrackerInner) {
        let sink = inner.sink.lock().clone();
        if let Some(sink) = sink {
            sink.persist(&Self::snapshot_inner(inner));
        }
    }

    // At most one reporter at a time; updates landing mid-report fold into
    // a single trailing report.
    fn trigger_report(inner: &TrackerInner) {
        if inner
            .report_state
            .compare_exchange(REPORT_IDLE, REPORT_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let _ = inner.report_state.compare_exchange(
                REPORT_RUNNING,
                REPORT_QUEUED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return;
        }
        loop {
            let handler = inner.handler.lock().clone();
            if let Some(handler) = handler {
                handler.report(&Self::snapshot_inner(inner));
            }
            if inner
                .report_state
                .compare_exchange(REPORT_QUEUED, REPORT_RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                continue;
            }
            if inner
                .report_state
                .compare_exchange(REPORT_RUNNING, REPORT_IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();
        f.debug_struct("ProgressTracker")
            .field("bytes", &s.bytes)
            .field("files_transferred", &s.files_transferred)
            .field("files_skipped", &s.files_skipped)
            .field("files_failed", &s.files_failed)
            .finish()
    }
}
