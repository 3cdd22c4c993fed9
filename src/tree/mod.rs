// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod inner;

use crate::{
    bloom::BloomFilter,
    chunk::{bloom_store_uri, chunk_store_uri, Chunk, ChunkId},
    coding::Encode,
    cursor::LsmCursor,
    metadata::{ChunkMeta, MetaRecord, MetadataStore},
    roster::Roster,
    stats::TreeStats,
    store::SchemaService,
    Error, InternalValue, Result, Slice, UserKey, UserValue,
};
use inner::TreeInner;
use std::sync::{Arc, RwLockWriteGuard};

/// Key of the single record holding a chunk's encoded Bloom filter
/// inside its filter store
const BLOOM_RECORD_KEY: &[u8] = b"bloom";

/// URI scheme of LSM trees
pub const URI_PREFIX: &str = "lsm:";

/// An LSM tree handle
///
/// Behaves like a single ordered key/value store; internally it is a
/// stack of immutable on-disk chunks plus at most one primary chunk
/// accepting writes.
#[derive(Clone)]
pub struct Tree(pub(crate) Arc<TreeInner>);

impl std::ops::Deref for Tree {
    type Target = TreeInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub(crate) enum ChunkHit {
    Found(UserValue),
    Tombstone,
    Absent,
}

/// Point lookup inside one chunk, consulting its Bloom filter first.
pub(crate) fn search_chunk(chunk: &Chunk, key: &[u8], stats: &TreeStats) -> Result<ChunkHit> {
    if let Some(filter) = chunk.bloom_filter() {
        if !filter.contains(key) {
            TreeStats::incr(&stats.bloom_misses);
            return Ok(ChunkHit::Absent);
        }
        TreeStats::incr(&stats.bloom_hits);

        return Ok(match chunk.store().get(key)? {
            Some(item) if item.is_tombstone() => ChunkHit::Tombstone,
            Some(item) => ChunkHit::Found(item.value),
            None => {
                TreeStats::incr(&stats.bloom_false_positives);
                ChunkHit::Absent
            }
        });
    }

    Ok(match chunk.store().get(key)? {
        Some(item) if item.is_tombstone() => ChunkHit::Tombstone,
        Some(item) => ChunkHit::Found(item.value),
        None => ChunkHit::Absent,
    })
}

impl Tree {
    /// Opens a tree from its metadata record.
    ///
    /// Fails with `NotFound` if no record exists, with `Invalid` if the
    /// connection cache cannot sustain the configuration. Workers are
    /// not started here; the registry does that once the handle is
    /// published.
    pub(crate) fn open(
        name: &str,
        schema: &Arc<dyn SchemaService>,
        meta: &Arc<dyn MetadataStore>,
        cache_size: u64,
    ) -> Result<Self> {
        let Some(filename) = name.strip_prefix(URI_PREFIX) else {
            return Err(Error::Invalid(format!("not an LSM tree URI: {name}")));
        };

        let Some(text) = meta.read(name)? else {
            return Err(Error::NotFound(name.to_owned()));
        };
        let record = MetaRecord::decode(&text)?;

        // Sanity check now; this is the first time we have the
        // tree configuration
        let required = record.config.required_cache_size();
        if cache_size < required {
            return Err(Error::Invalid(format!(
                "the LSM configuration requires a cache size of at least {required}, \
                 configured size is {cache_size}"
            )));
        }

        let tree = Self(Arc::new(TreeInner::new(
            name,
            filename,
            record.config,
            record.last,
            schema.clone(),
            meta.clone(),
        )));

        {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let mut roster = tree.roster.write().expect("lock is poisoned");

            for meta_chunk in &record.chunks {
                roster.push_active(tree.load_chunk(meta_chunk)?);
            }
            for meta_chunk in &record.old_chunks {
                // Anything already superseded at the last shutdown is
                // immediately eligible for reclamation
                let chunk = tree.load_chunk(meta_chunk)?;
                chunk.mark_retired(0);
                roster.push_old(chunk);
            }

            if roster.active().is_empty() {
                tree.switch_locked(&mut roster, false)?;
            }
        }

        // Cursors open their snapshots on first use
        tree.set_dsk_gen(tree.dsk_gen().max(1));

        Ok(tree)
    }

    /// Materializes one chunk from its metadata snapshot.
    fn load_chunk(&self, meta_chunk: &ChunkMeta) -> Result<Arc<Chunk>> {
        let store = self.schema.open(&meta_chunk.uri)?;

        let chunk = Arc::new(Chunk::new(
            meta_chunk.id,
            meta_chunk.uri.clone(),
            meta_chunk.bloom_uri.clone(),
            meta_chunk.generation,
            store,
        ));
        // The record's count lags behind for the primary, whose
        // metadata was written at creation time
        chunk.set_count(meta_chunk.count.max(chunk.store().len_approx()));

        if meta_chunk.on_disk {
            chunk.mark_on_disk();
        }

        if meta_chunk.has_bloom {
            if let Some(bloom_uri) = &chunk.bloom_uri {
                chunk.attach_bloom(Arc::new(self.read_bloom(bloom_uri)?));
            }
        }

        Ok(chunk)
    }

    fn read_bloom(&self, bloom_uri: &str) -> Result<BloomFilter> {
        use crate::coding::{Decode, DecodeError};

        let store = self.schema.open(bloom_uri)?;

        let Some(record) = store.get(BLOOM_RECORD_KEY)? else {
            return Err(Error::Corrupted(DecodeError::InvalidHeader("BloomFilter")));
        };

        Ok(BloomFilter::decode_from(&mut &record.value[..])?)
    }

    /// Creates the file (and optionally Bloom) pair for a new chunk.
    pub(crate) fn setup_chunk(
        &self,
        id: ChunkId,
        generation: u32,
        with_bloom: bool,
    ) -> Result<Arc<Chunk>> {
        let uri = chunk_store_uri(&self.filename, id);

        // There may be content hanging over from an aborted merge;
        // the very first chunk cannot be, and is created mid-create
        if id > 1 {
            self.schema.drop_store(&uri, true)?;
        }
        let store = self.schema.create(&uri, &self.config.file_config)?;

        let bloom_uri = with_bloom.then(|| bloom_store_uri(&self.filename, id));
        if let Some(bloom_uri) = &bloom_uri {
            if id > 1 {
                self.schema.drop_store(bloom_uri, true)?;
            }
        }

        Ok(Arc::new(Chunk::new(id, uri, bloom_uri, generation, store)))
    }

    /// Builds the chunk's Bloom filter from its store contents and
    /// persists it. No-op for chunks without an assigned filter URI.
    pub(crate) fn build_bloom(&self, chunk: &Chunk) -> Result<()> {
        let Some(bloom_uri) = &chunk.bloom_uri else {
            return Ok(());
        };

        #[allow(clippy::cast_possible_truncation)]
        let n = chunk.store().len_approx().max(1) as usize;
        let mut filter = BloomFilter::with_params(
            n,
            self.config.bloom_bit_count,
            self.config.bloom_hash_count,
        );

        let mut cursor = chunk.store().clone().cursor();
        while let Some(item) = cursor.next()? {
            // Tombstones are entries too: the filter answers
            // "does the chunk contain a record for this key"
            filter.insert(&item.key);
        }

        self.schema.drop_store(bloom_uri, true)?;
        let store = self.schema.create(bloom_uri, &self.config.bloom_config)?;
        store.put(InternalValue::new(
            Slice::from(BLOOM_RECORD_KEY),
            filter.encode_into_vec()?,
        ))?;
        self.schema.checkpoint(bloom_uri)?;

        chunk.attach_bloom(Arc::new(filter));
        log::trace!("{}: built bloom filter {bloom_uri}", self.name);

        Ok(())
    }

    /// Seals a primary chunk: checkpoint it durable, build its filter
    /// if one was assigned, and flag it on-disk.
    fn seal_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.schema.checkpoint(&chunk.uri)?;
        self.build_bloom(chunk)?;
        chunk.mark_on_disk();
        Ok(())
    }

    /// Seals the current primary and installs a fresh one.
    ///
    /// A switch while the primary is still empty is a successful no-op.
    pub fn switch(&self) -> Result<()> {
        self.ensure_usable()?;

        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut roster = self.roster.write().expect("lock is poisoned");
        self.switch_locked(&mut roster, false)
    }

    pub(crate) fn switch_locked(
        &self,
        roster: &mut RwLockWriteGuard<'_, Roster>,
        only_if_full: bool,
    ) -> Result<()> {
        if let Some(primary) = roster.primary() {
            if primary.count() == 0 {
                return Ok(());
            }
            // A writer that raced us here may find the switch already done
            if only_if_full && primary.store().size_bytes() < self.config.chunk_size {
                return Ok(());
            }

            let primary = primary.clone();
            self.seal_chunk(&primary)?;
        }

        self.check_roster(roster)?;

        let id = self.next_chunk_id();
        log::debug!("{}: switching to chunk {id}", self.name);

        let chunk = self.setup_chunk(id, 0, self.config.bloom.newest)?;
        roster.push_active(chunk);

        self.bump_dsk_gen();
        self.write_meta_locked(roster)?;
        TreeStats::incr(&self.stats.switches);

        Ok(())
    }

    /// Inserts a record.
    pub fn insert<K: Into<UserKey>, V: Into<UserValue>>(&self, key: K, value: V) -> Result<()> {
        self.write(InternalValue::new(key, value))
    }

    /// Writes a tombstone for a key.
    pub fn remove<K: Into<UserKey>>(&self, key: K) -> Result<()> {
        self.write(InternalValue::new_tombstone(key))
    }

    pub(crate) fn write(&self, item: InternalValue) -> Result<()> {
        self.ensure_usable()?;

        let full = {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let roster = self.roster.read().expect("lock is poisoned");

            let Some(primary) = roster.primary() else {
                return Err(self.mark_failed());
            };

            primary.store().put(item)?;
            primary.incr_count();

            primary.store().size_bytes() >= self.config.chunk_size
        };

        if full {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let mut roster = self.roster.write().expect("lock is poisoned");
            self.switch_locked(&mut roster, true)?;
        }

        Ok(())
    }

    /// Point lookup against the current chunk stack, newest first.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<UserValue>> {
        self.ensure_usable()?;

        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let roster = self.roster.read().expect("lock is poisoned");

        for chunk in roster.active().iter().rev() {
            match search_chunk(chunk, key.as_ref(), &self.stats)? {
                ChunkHit::Found(value) => return Ok(Some(value)),
                ChunkHit::Tombstone => return Ok(None),
                ChunkHit::Absent => {}
            }
        }

        Ok(None)
    }

    /// Opens a cursor over the tree.
    pub fn cursor(&self) -> Result<LsmCursor> {
        self.ensure_usable()?;
        Ok(LsmCursor::bind(self.clone()))
    }

    /// Opens a merge cursor over a fixed set of chunks (oldest first).
    pub(crate) fn merge_cursor(&self, chunks: &[Arc<Chunk>], minor: bool) -> LsmCursor {
        LsmCursor::bind_merge(self.clone(), chunks, minor)
    }

    /// Runs one merge pass; returns `true` if chunks were merged.
    pub fn merge_once(&self) -> Result<bool> {
        crate::worker::merge::merge_pass(self)
    }

    /// Checkpoints the primary chunk's backing store.
    pub fn checkpoint_primary(&self) -> Result<()> {
        crate::worker::checkpoint::checkpoint_pass(self)
    }

    /// Drops old chunks that no cursor can observe anymore.
    ///
    /// Returns the number of reclaimed chunks. Failures leave the
    /// affected chunks on the old list for the next pass.
    pub fn reclaim(&self) -> Result<usize> {
        self.ensure_usable()?;

        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut roster = self.roster.write().expect("lock is poisoned");

        let reclaimable = roster.take_reclaimable(self.min_reader_gen());
        if reclaimable.is_empty() {
            return Ok(0);
        }

        let mut first_error = None;
        let mut reclaimed = 0;

        for chunk in reclaimable {
            let result = self
                .schema
                .drop_store(&chunk.uri, true)
                .and_then(|()| match &chunk.bloom_uri {
                    Some(bloom_uri) => self.schema.drop_store(bloom_uri, true),
                    None => Ok(()),
                });

            match result {
                Ok(()) => {
                    reclaimed += 1;
                    TreeStats::incr(&self.stats.chunks_reclaimed);
                }
                Err(e) => {
                    log::warn!("{}: reclaiming {} failed: {e}", self.name, chunk.uri);
                    roster.push_old(chunk);
                    first_error.get_or_insert(e);
                }
            }
        }

        if reclaimed > 0 {
            self.bump_dsk_gen();
            self.write_meta_locked(&roster)?;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reclaimed),
        }
    }

    /// Snapshot of the active chunk list.
    #[must_use]
    pub fn active_metas(&self) -> Vec<ChunkMeta> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let roster = self.roster.read().expect("lock is poisoned");
        roster.active_metas()
    }

    /// Snapshot of the old chunk list.
    #[must_use]
    pub fn old_metas(&self) -> Vec<ChunkMeta> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let roster = self.roster.read().expect("lock is poisoned");
        roster.old_metas()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{MemoryMetadata, MetadataStore},
        store::{MemoryService, SchemaService},
    };
    use test_log::test;

    fn services() -> (Arc<dyn SchemaService>, Arc<dyn MetadataStore>) {
        (
            Arc::new(MemoryService::new()),
            Arc::new(MemoryMetadata::new()),
        )
    }

    fn seed_meta(meta: &Arc<dyn MetadataStore>, name: &str, config: &str) {
        let record = MetaRecord {
            config: crate::TreeConfig::parse(config).unwrap(),
            last: 0,
            chunks: vec![],
            old_chunks: vec![],
        };
        meta.write(name, &record.encode()).unwrap();
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tree_open_creates_first_primary() -> Result<()> {
        let (schema, meta) = services();
        seed_meta(&meta, "lsm:t", "lsm_chunk_size=1KB,leaf_page_max=1KB");

        let tree = Tree::open("lsm:t", &schema, &meta, u64::MAX)?;

        assert_eq!(1, tree.dsk_gen());
        assert_eq!(1, tree.last_chunk_id());

        let active = tree.active_metas();
        assert_eq!(1, active.len());
        assert_eq!("file:t-000001.lsm", active[0].uri);
        assert!(!active[0].on_disk);

        Ok(())
    }

    #[test]
    fn tree_open_unknown_is_not_found() {
        let (schema, meta) = services();
        assert!(matches!(
            Tree::open("lsm:nope", &schema, &meta, u64::MAX),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tree_open_rejects_small_cache() {
        let (schema, meta) = services();
        seed_meta(&meta, "lsm:t", "");

        assert!(matches!(
            Tree::open("lsm:t", &schema, &meta, 1_024),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tree_switch_on_empty_primary_is_noop() -> Result<()> {
        let (schema, meta) = services();
        seed_meta(&meta, "lsm:t", "lsm_chunk_size=1KB,leaf_page_max=1KB");

        let tree = Tree::open("lsm:t", &schema, &meta, u64::MAX)?;
        let gen_before = tree.dsk_gen();

        tree.switch()?;
        assert_eq!(gen_before, tree.dsk_gen());
        assert_eq!(1, tree.active_metas().len());

        tree.insert("a", "1")?;
        tree.switch()?;
        assert_eq!(gen_before + 1, tree.dsk_gen());
        assert_eq!(2, tree.active_metas().len());

        Ok(())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tree_checkpoint_primary_records_stats() -> Result<()> {
        let (schema, meta) = services();
        seed_meta(&meta, "lsm:t", "lsm_chunk_size=1KB,leaf_page_max=1KB");

        let tree = Tree::open("lsm:t", &schema, &meta, u64::MAX)?;
        tree.insert("a", "1")?;

        tree.checkpoint_primary()?;
        assert_eq!(1, TreeStats::get(&tree.stats.checkpoints));

        Ok(())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tree_read_your_writes_and_shadowing() -> Result<()> {
        let (schema, meta) = services();
        seed_meta(&meta, "lsm:t", "lsm_chunk_size=1KB,leaf_page_max=1KB");

        let tree = Tree::open("lsm:t", &schema, &meta, u64::MAX)?;

        tree.insert("k", "v1")?;
        assert_eq!(Some(Slice::from("v1")), tree.get("k")?);

        tree.switch()?;
        tree.insert("k", "v2")?;
        assert_eq!(Some(Slice::from("v2")), tree.get("k")?);

        tree.remove("k")?;
        assert_eq!(None, tree.get("k")?);

        Ok(())
    }
}
