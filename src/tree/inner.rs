// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    chunk::ChunkId,
    config::TreeConfig,
    metadata::{MetaRecord, MetadataStore},
    roster::Roster,
    stats::TreeStats,
    store::SchemaService,
    worker::{WorkSignal, WorkerSet},
    Error, Result,
};
use rustc_hash::FxHashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, RwLock,
};

/// Identifies one live reader (cursor) of a tree
pub type ReaderId = u64;

/// Shared state behind a [`crate::Tree`] handle
pub struct TreeInner {
    /// Tree URI (`lsm:<filename>`)
    pub name: String,

    /// Base name for chunk and Bloom store URIs
    pub filename: String,

    /// Tree configuration
    pub config: TreeConfig,

    /// Schema service managing the backing stores
    pub(crate) schema: Arc<dyn SchemaService>,

    /// Metadata catalog
    pub(crate) meta: Arc<dyn MetadataStore>,

    /// The chunk lists; the single tree lock
    pub(crate) roster: RwLock<Roster>,

    /// Tree-wide epoch, bumped on every visible roster change.
    /// Written only under the tree lock, read lock-free by cursors.
    dsk_gen: AtomicU64,

    /// Last allocated chunk ID, never reused
    last: AtomicU64,

    /// Number of users of the tree (registry + cursors)
    refcnt: AtomicU32,

    /// Sticky invariant-violation marker
    failed: AtomicBool,

    /// Cleared to ask the workers to finish and exit
    pub(crate) working: WorkSignal,

    /// Background thread handles
    pub(crate) workers: Mutex<WorkerSet>,

    /// Snapshot epochs of live readers, for old-chunk reclamation
    readers: Mutex<FxHashMap<ReaderId, u64>>,

    next_reader_id: AtomicU64,

    /// Statistics; also the sink for background errors
    pub stats: TreeStats,
}

impl TreeInner {
    pub(crate) fn new(
        name: &str,
        filename: &str,
        config: TreeConfig,
        last: ChunkId,
        schema: Arc<dyn SchemaService>,
        meta: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            filename: filename.to_owned(),
            config,
            schema,
            meta,
            roster: RwLock::new(Roster::default()),
            dsk_gen: AtomicU64::new(0),
            last: AtomicU64::new(last),
            refcnt: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            working: WorkSignal::default(),
            workers: Mutex::new(WorkerSet::default()),
            readers: Mutex::new(FxHashMap::default()),
            next_reader_id: AtomicU64::new(0),
            stats: TreeStats::default(),
        }
    }

    /// Current tree epoch.
    #[must_use]
    pub fn dsk_gen(&self) -> u64 {
        self.dsk_gen.load(Ordering::Acquire)
    }

    /// Bumps the epoch. Caller must hold the tree lock exclusively.
    pub(crate) fn bump_dsk_gen(&self) -> u64 {
        self.dsk_gen.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn set_dsk_gen(&self, gen: u64) {
        self.dsk_gen.store(gen, Ordering::Release);
    }

    /// Last allocated chunk ID.
    #[must_use]
    pub fn last_chunk_id(&self) -> ChunkId {
        self.last.load(Ordering::Acquire)
    }

    /// Allocates the next chunk ID.
    pub(crate) fn next_chunk_id(&self) -> ChunkId {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of users of the tree.
    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_ref(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_ref(&self) {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "refcnt underflow");
    }

    /// Returns `true` once an invariant violation marked the tree
    /// unusable.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_failed(&self) -> Error {
        self.failed.store(true, Ordering::Release);
        log::error!("{}: invariant violation, tree is now unusable", self.name);
        Error::Failed
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.is_failed() {
            Err(Error::Failed)
        } else {
            Ok(())
        }
    }

    /// Registers a reader snapshot; the returned ID must be
    /// unregistered when the cursor dies.
    pub(crate) fn register_reader(&self, dsk_gen: u64) -> ReaderId {
        let id = self.next_reader_id.fetch_add(1, Ordering::AcqRel);

        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        self.readers
            .lock()
            .expect("lock is poisoned")
            .insert(id, dsk_gen);

        id
    }

    pub(crate) fn update_reader(&self, id: ReaderId, dsk_gen: u64) {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        self.readers
            .lock()
            .expect("lock is poisoned")
            .insert(id, dsk_gen);
    }

    pub(crate) fn unregister_reader(&self, id: ReaderId) {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        self.readers.lock().expect("lock is poisoned").remove(&id);
    }

    /// The oldest snapshot any live reader may still observe.
    pub(crate) fn min_reader_gen(&self) -> u64 {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let readers = self.readers.lock().expect("lock is poisoned");
        readers.values().copied().min().unwrap_or(u64::MAX)
    }

    /// Rewrites the tree's metadata record from the given roster state.
    /// Caller must hold the tree lock.
    pub(crate) fn write_meta_locked(&self, roster: &Roster) -> Result<()> {
        let record = MetaRecord {
            config: self.config.clone(),
            last: self.last_chunk_id(),
            chunks: roster.active_metas(),
            old_chunks: roster.old_metas(),
        };

        self.meta.write(&self.name, &record.encode())
    }

    /// Verifies the primary-slot invariant, poisoning the tree on
    /// violation.
    pub(crate) fn check_roster(&self, roster: &Roster) -> Result<()> {
        if roster.is_well_formed() {
            Ok(())
        } else {
            Err(self.mark_failed())
        }
    }
}

impl Drop for TreeInner {
    fn drop(&mut self) {
        log::trace!("{}: dropping tree handle", self.name);
        self.working.stop();
    }
}
