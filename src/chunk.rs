// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{bloom::BloomFilter, store::Store};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, RwLock,
};

/// Chunk ID
///
/// Chunk IDs are allocated by `switch`, strictly monotonic per tree and
/// never reused, even across merges and truncates.
pub type ChunkId = u64;

/// Returns the URI of the backing store for a given chunk ID.
#[must_use]
pub fn chunk_store_uri(filename: &str, id: ChunkId) -> String {
    format!("file:{filename}-{id:06}.lsm")
}

/// Returns the URI of the Bloom filter store for a given chunk ID.
#[must_use]
pub fn bloom_store_uri(filename: &str, id: ChunkId) -> String {
    format!("file:{filename}-{id:06}.bf")
}

/// A single chunk of an LSM tree
///
/// A chunk is one single-file store at one level of the stack. The
/// newest chunk may still be accepting writes (the primary); all other
/// chunks are sealed and immutable.
pub struct Chunk {
    /// Chunk ID
    pub id: ChunkId,

    /// URI of the backing store
    pub uri: String,

    /// URI of the Bloom filter store, if the creation policy assigned one
    pub bloom_uri: Option<String>,

    /// Merge generation; zero for chunks born from a switch
    pub generation: u32,

    /// Approximate record count, not authoritative
    count: AtomicU64,

    /// Set once the chunk is sealed and checkpointed
    on_disk: AtomicBool,

    /// Set once a Bloom filter has been built and persisted
    has_bloom: AtomicBool,

    /// Number of live cursors that selected this chunk as their primary
    ncursor: AtomicU32,

    /// `dsk_gen` at the moment the chunk was pushed onto the old list;
    /// zero while the chunk is active
    retired_at: AtomicU64,

    /// Backing store handle
    pub(crate) store: Arc<dyn Store>,

    /// Loaded Bloom filter, present iff `has_bloom`
    pub(crate) bloom: RwLock<Option<Arc<BloomFilter>>>,
}

impl Chunk {
    pub(crate) fn new(
        id: ChunkId,
        uri: String,
        bloom_uri: Option<String>,
        generation: u32,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            id,
            uri,
            bloom_uri,
            generation,
            count: AtomicU64::new(0),
            on_disk: AtomicBool::new(false),
            has_bloom: AtomicBool::new(false),
            ncursor: AtomicU32::new(0),
            retired_at: AtomicU64::new(0),
            store,
            bloom: RwLock::new(None),
        }
    }

    /// Approximate record count.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn set_count(&self, count: u64) {
        self.count.store(count, Ordering::Release);
    }

    pub(crate) fn incr_count(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` once the chunk is sealed and checkpointed.
    #[must_use]
    pub fn is_on_disk(&self) -> bool {
        self.on_disk.load(Ordering::Acquire)
    }

    pub(crate) fn mark_on_disk(&self) {
        self.on_disk.store(true, Ordering::Release);
    }

    /// Returns `true` if a Bloom filter is attached.
    #[must_use]
    pub fn has_bloom(&self) -> bool {
        self.has_bloom.load(Ordering::Acquire)
    }

    pub(crate) fn attach_bloom(&self, filter: Arc<BloomFilter>) {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut bloom = self.bloom.write().expect("lock is poisoned");
        *bloom = Some(filter);
        drop(bloom);

        self.has_bloom.store(true, Ordering::Release);
    }

    /// Returns the attached Bloom filter, if any.
    #[must_use]
    pub fn bloom_filter(&self) -> Option<Arc<BloomFilter>> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let bloom = self.bloom.read().expect("lock is poisoned");
        bloom.clone()
    }

    /// Number of live cursors bound to this chunk as their primary.
    #[must_use]
    pub fn cursor_count(&self) -> u32 {
        self.ncursor.load(Ordering::Acquire)
    }

    pub(crate) fn pin_cursor(&self) {
        self.ncursor.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin_cursor(&self) {
        let prev = self.ncursor.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "cursor count underflow");
    }

    pub(crate) fn retired_at(&self) -> u64 {
        self.retired_at.load(Ordering::Acquire)
    }

    pub(crate) fn mark_retired(&self, dsk_gen: u64) {
        self.retired_at.store(dsk_gen, Ordering::Release);
    }

    /// Handle on the backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Descriptor copy under new URIs, carrying over the runtime state.
    /// Used by the rename path, which holds the tree exclusively.
    pub(crate) fn renamed(&self, uri: String, bloom_uri: Option<String>) -> Self {
        Self {
            id: self.id,
            uri,
            bloom_uri,
            generation: self.generation,
            count: AtomicU64::new(self.count()),
            on_disk: AtomicBool::new(self.is_on_disk()),
            has_bloom: AtomicBool::new(self.has_bloom()),
            ncursor: AtomicU32::new(0),
            retired_at: AtomicU64::new(self.retired_at()),
            store: self.store.clone(),
            bloom: RwLock::new(self.bloom_filter()),
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunk#{}@gen{}<{}>{}{}",
            self.id,
            self.generation,
            self.uri,
            if self.is_on_disk() { " ondisk" } else { "" },
            if self.has_bloom() { " bloom" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_naming() {
        assert_eq!("file:x-000001.lsm", chunk_store_uri("x", 1));
        assert_eq!("file:x-000009.bf", bloom_store_uri("x", 9));
        assert_eq!("file:tbl-001234.lsm", chunk_store_uri("tbl", 1_234));
    }
}
