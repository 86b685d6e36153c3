//! Checkpoints: the containers transfers live in
//!
//! `TransferCollection` is the concurrent `(source, dest)`-keyed map with an
//! aggregate progress tracker; every member's tracker is a child of the
//! aggregate. `TransferCheckpoint` is the user-visible container: either a
//! collection in memory, or backed by a stream journal for resume.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, TransferError};
use crate::journal::{JournalOpen, JournalSlot, JournalStream, StreamJournal};
use crate::progress::ProgressTracker;
use crate::transfer::{Transfer, TransferKey};

/// Concurrent map of transfers plus the aggregate progress tracker that
/// parents each member's tracker.
#[derive(Clone)]
pub struct TransferCollection {
    progress: ProgressTracker,
    map: Arc<Mutex<HashMap<TransferKey, Arc<Transfer>>>>,
}

impl TransferCollection {
    pub fn new() -> Self {
        Self::with_progress(ProgressTracker::new())
    }

    pub fn with_progress(progress: ProgressTracker) -> Self {
        TransferCollection {
            progress,
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Insert; a second transfer with the same key fails.
    pub fn try_insert(&self, transfer: Arc<Transfer>) -> Result<()> {
        let key = transfer.key();
        let mut map = self.map.lock();
        if map.contains_key(&key) {
            return Err(TransferError::TransferAlreadyExists {
                src: key.source,
                dest: key.dest,
            });
        }
        map.insert(key, transfer);
        Ok(())
    }

    pub fn contains(&self, key: &TransferKey) -> bool {
        self.map.lock().contains_key(key)
    }

    pub fn get(&self, key: &TransferKey) -> Option<Arc<Transfer>> {
        self.map.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &TransferKey) -> Option<Arc<Transfer>> {
        self.map.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn snapshot_members(&self) -> Vec<Arc<Transfer>> {
        self.map.lock().values().cloned().collect()
    }
}

impl Default for TransferCollection {
    fn default() -> Self {
        Self::new()
    }
}

enum Backing {
    Memory(TransferCollection),
    Journal {
        journal: StreamJournal,
        root: Mutex<Option<Arc<Transfer>>>,
    },
}

/// Created empty (or deserialized) at process start, mutated only by the
/// manager as transfers come and go, dropped by the caller when done.
pub struct TransferCheckpoint {
    backing: Backing,
}

impl TransferCheckpoint {
    pub fn in_memory() -> Self {
        TransferCheckpoint {
            backing: Backing::Memory(TransferCollection::new()),
        }
    }

    /// Open (or initialize) a journal-backed checkpoint. A resumed journal
    /// yields its root transfer with restored progress.
    pub fn open_journal(stream: Box<dyn JournalStream>, validate_version: bool) -> Result<Self> {
        match StreamJournal::open(stream, validate_version)? {
            JournalOpen::Fresh(journal) => Ok(TransferCheckpoint {
                backing: Backing::Journal {
                    journal,
                    root: Mutex::new(None),
                },
            }),
            JournalOpen::Resumed {
                journal,
                base,
                base_progress,
            } => {
                let root = match base {
                    Some(payload) => {
                        let transfer = Transfer::deserialize(&payload)?;
                        transfer.progress.restore(&base_progress);
                        transfer.bind_journal(journal.clone(), JournalSlot::Base);
                        Some(Arc::new(transfer))
                    }
                    None => None,
                };
                Ok(TransferCheckpoint {
                    backing: Backing::Journal {
                        journal,
                        root: Mutex::new(root),
                    },
                })
            }
        }
    }

    pub fn journal(&self) -> Option<StreamJournal> {
        match &self.backing {
            Backing::Journal { journal, .. } => Some(journal.clone()),
            Backing::Memory(_) => None,
        }
    }

    /// The resumed root transfer, when this checkpoint carries one.
    pub fn resumed_root(&self) -> Option<Arc<Transfer>> {
        match &self.backing {
            Backing::Journal { root, .. } => root.lock().clone(),
            Backing::Memory(_) => None,
        }
    }

    /// The existing transfer for `key` when resuming, else a fresh one
    /// built by `build` and recorded here.
    pub fn get_transfer(
        &self,
        key: &TransferKey,
        build: impl FnOnce() -> Transfer,
    ) -> Result<Arc<Transfer>> {
        match &self.backing {
            Backing::Memory(collection) => {
                if let Some(existing) = collection.get(key) {
                    return Ok(existing);
                }
                let fresh = Arc::new(build());
                collection.try_insert(Arc::clone(&fresh))?;
                Ok(fresh)
            }
            Backing::Journal { journal, root } => {
                let mut slot = root.lock();
                if let Some(existing) = slot.as_ref() {
                    if existing.key() == *key {
                        return Ok(Arc::clone(existing));
                    }
                    return Err(TransferError::Uncategorized(format!(
                        "journal already tracks {}, not {key}",
                        existing.key()
                    )));
                }
                let fresh = Arc::new(build());
                fresh.bind_journal(journal.clone(), JournalSlot::Base);
                fresh.persist()?;
                *slot = Some(Arc::clone(&fresh));
                Ok(fresh)
            }
        }
    }

    /// Swap fresh credentials into the resumed root without relocating it.
    /// Only meaningful before the transfer re-executes: the root is round-
    /// tripped through its serialized form with the new credentials
    /// applied, keeping progress and journal binding intact.
    pub fn refresh_root_credentials(
        &self,
        source: Option<crate::location::Credentials>,
        destination: Option<crate::location::Credentials>,
    ) -> Result<()> {
        let Backing::Journal { journal, root } = &self.backing else {
            return Ok(());
        };
        let mut slot = root.lock();
        let Some(current) = slot.as_ref() else {
            return Ok(());
        };
        if source.is_none() && destination.is_none() {
            return Ok(());
        }
        let payload = current.serialize()?;
        let progress = current.progress.snapshot();
        let mut rebuilt = Transfer::deserialize(&payload)?;
        if let Some(creds) = source {
            rebuilt.source.update_credentials(creds);
        }
        if let Some(creds) = destination {
            rebuilt.destination.update_credentials(creds);
        }
        rebuilt.progress.restore(&progress);
        rebuilt.bind_journal(journal.clone(), JournalSlot::Base);
        rebuilt.persist()?;
        *slot = Some(Arc::new(rebuilt));
        Ok(())
    }

    /// Forget a transfer once the manager is done with it. The journal
    /// retains its bytes; only the in-memory handle is dropped.
    pub fn release(&self, key: &TransferKey) {
        match &self.backing {
            Backing::Memory(collection) => {
                collection.remove(key);
            }
            Backing::Journal { root, .. } => {
                let mut slot = root.lock();
                if slot.as_ref().is_some_and(|t| t.key() == *key) {
                    *slot = None;
                }
            }
        }
    }
}
