// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{chunk::Chunk, metadata::ChunkMeta};
use std::sync::Arc;

/// Initial slot count of the active list
const MIN_CHUNK_SLOTS: usize = 10;

/// The pair of chunk lists owned by a tree handle.
///
/// `active` is ordered oldest to newest; its last entry is the primary
/// iff it has not been sealed to disk yet. `old` holds chunks
/// superseded by a merge, awaiting removal once no cursor observes
/// them. Both lists are only ever mutated under the tree lock.
#[derive(Default)]
pub struct Roster {
    active: Vec<Arc<Chunk>>,
    old: Vec<Arc<Chunk>>,
}

impl Roster {
    /// Active chunks, oldest to newest.
    #[must_use]
    pub fn active(&self) -> &[Arc<Chunk>] {
        &self.active
    }

    /// Chunks pending reclamation.
    #[must_use]
    pub fn old(&self) -> &[Arc<Chunk>] {
        &self.old
    }

    /// The writable chunk, if the newest chunk has not been sealed.
    #[must_use]
    pub fn primary(&self) -> Option<&Arc<Chunk>> {
        self.active.last().filter(|chunk| !chunk.is_on_disk())
    }

    /// Appends a freshly created chunk.
    ///
    /// Growth policy: capacity doubles, with a floor of
    /// [`MIN_CHUNK_SLOTS`] slots.
    pub fn push_active(&mut self, chunk: Arc<Chunk>) {
        if self.active.len() == self.active.capacity() {
            let target = (self.active.capacity() * 2).max(MIN_CHUNK_SLOTS);
            self.active
                .reserve_exact(target.saturating_sub(self.active.len()));
        }
        self.active.push(chunk);
    }

    /// Replaces the contiguous run `active[start..start+len]` with a
    /// single merge output and pushes the inputs onto the old list,
    /// stamped with the epoch of the mutation. An output of `None`
    /// removes the run outright (everything merged away).
    ///
    /// # Panics
    ///
    /// Panics if the run is out of bounds.
    pub fn replace_run(
        &mut self,
        start: usize,
        len: usize,
        output: Option<Arc<Chunk>>,
        dsk_gen: u64,
    ) {
        assert!(start + len <= self.active.len(), "merge run out of bounds");

        let retired = self
            .active
            .splice(start..start + len, output)
            .collect::<Vec<_>>();

        for chunk in retired {
            chunk.mark_retired(dsk_gen);
            self.old.push(chunk);
        }
    }

    /// Re-adds a chunk to the old list (open path, or a failed
    /// reclamation that will be retried).
    pub fn push_old(&mut self, chunk: Arc<Chunk>) {
        self.old.push(chunk);
    }

    /// Moves every active chunk onto the old list (truncate path).
    pub fn retire_all(&mut self, dsk_gen: u64) {
        for chunk in self.active.drain(..) {
            chunk.mark_retired(dsk_gen);
            self.old.push(chunk);
        }
    }

    /// Removes and returns old chunks that no cursor can observe
    /// anymore: no cursor holds them as primary, and they were retired
    /// no later than the oldest live reader's snapshot.
    pub fn take_reclaimable(&mut self, min_reader_gen: u64) -> Vec<Arc<Chunk>> {
        let mut reclaimed = vec![];

        self.old.retain(|chunk| {
            if chunk.cursor_count() == 0 && chunk.retired_at() <= min_reader_gen {
                reclaimed.push(chunk.clone());
                false
            } else {
                true
            }
        });

        reclaimed
    }

    /// Returns `false` if the primary invariant is broken: at most one
    /// active chunk may be in-memory, and only in the newest slot.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.active
            .iter()
            .rev()
            .skip(1)
            .all(|chunk| chunk.is_on_disk())
    }

    /// Snapshot of one list for the metadata record.
    fn metas(list: &[Arc<Chunk>]) -> Vec<ChunkMeta> {
        list.iter()
            .map(|chunk| ChunkMeta {
                id: chunk.id,
                uri: chunk.uri.clone(),
                bloom_uri: chunk.bloom_uri.clone(),
                generation: chunk.generation,
                count: chunk.count(),
                on_disk: chunk.is_on_disk(),
                has_bloom: chunk.has_bloom(),
            })
            .collect()
    }

    /// Snapshot of the active list for the metadata record.
    #[must_use]
    pub fn active_metas(&self) -> Vec<ChunkMeta> {
        Self::metas(&self.active)
    }

    /// Snapshot of the old list for the metadata record.
    #[must_use]
    pub fn old_metas(&self) -> Vec<ChunkMeta> {
        Self::metas(&self.old)
    }
}
