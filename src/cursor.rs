// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    bloom::BloomFilter,
    chunk::Chunk,
    merge::{BoxedIterator, ChunkMerger, StoreScanner},
    stats::TreeStats,
    store::StoreCursor,
    tree::{inner::ReaderId, Tree},
    Error, InternalValue, KvPair, Result, UserValue,
};
use std::sync::Arc;

/// Iteration direction of a cursor
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum IterState {
    /// Not iterating
    None,

    /// Forward iteration in progress
    Next,

    /// Backward iteration in progress
    Prev,
}

/// Internal merge-build stream, fixed chunk set, includes tombstones
struct MergeMode {
    merger: ChunkMerger<'static>,

    /// Minor merges keep tombstones because deeper chunks still exist
    minor: bool,
}

/// A cursor over an LSM tree.
///
/// At bind time the cursor snapshots the tree epoch, one sub-cursor
/// per chunk (newest first) and each chunk's Bloom filter. Every
/// operation first compares the tree's current epoch against the
/// snapshot and rebinds if the roster has changed underneath.
pub struct LsmCursor {
    tree: Tree,
    reader_id: ReaderId,

    /// Epoch at snapshot time
    dsk_gen: u64,

    /// Snapshot of the chunk stack, newest first
    chunks: Vec<Arc<Chunk>>,
    blooms: Vec<Option<Arc<BloomFilter>>>,
    subs: Vec<Box<dyn StoreCursor>>,

    /// Peeked head of every sub-cursor during iteration
    heads: Vec<Option<InternalValue>>,

    /// The chunk receiving this cursor's updates, pinned while bound
    primary: Option<Arc<Chunk>>,

    /// Anchor record, iteration continues relative to it
    current: Option<InternalValue>,

    iter_state: IterState,

    /// More than one sub-cursor held the current key; the newest won
    multiple: bool,

    /// The cursor has performed updates
    updated: bool,

    merge: Option<MergeMode>,
}

impl LsmCursor {
    /// Binds a cursor to the tree's current chunk stack.
    ///
    /// Cursors co-own the tree: exclusive acquisition through the
    /// registry fails while any cursor is live.
    pub(crate) fn bind(tree: Tree) -> Self {
        tree.acquire_ref();
        let reader_id = tree.register_reader(tree.dsk_gen());

        let mut cursor = Self {
            tree,
            reader_id,
            dsk_gen: 0,
            chunks: vec![],
            blooms: vec![],
            subs: vec![],
            heads: vec![],
            primary: None,
            current: None,
            iter_state: IterState::None,
            multiple: false,
            updated: false,
            merge: None,
        };
        cursor.rebind();
        cursor
    }

    /// Binds a merge cursor over a fixed set of chunks (oldest first).
    ///
    /// Merge cursors include tombstones, never update, and do not
    /// re-synchronise with the tree.
    // The worker already co-owns the tree through its thread handle,
    // so merge cursors take no extra reference
    pub(crate) fn bind_merge(tree: Tree, chunks: &[Arc<Chunk>], minor: bool) -> Self {
        let reader_id = tree.register_reader(tree.dsk_gen());

        let scanners = chunks
            .iter()
            .rev()
            .map(|chunk| {
                Box::new(StoreScanner(chunk.store().clone().cursor())) as BoxedIterator<'static>
            })
            .collect::<Vec<_>>();

        let merger = ChunkMerger::new(scanners).evict_tombstones(!minor);

        Self {
            dsk_gen: tree.dsk_gen(),
            tree,
            reader_id,
            chunks: chunks.iter().rev().cloned().collect(),
            blooms: vec![],
            subs: vec![],
            heads: vec![],
            primary: None,
            current: None,
            iter_state: IterState::Next,
            multiple: false,
            updated: false,
            merge: Some(MergeMode { merger, minor }),
        }
    }

    /// Re-snapshots the chunk stack. The anchor record survives, so an
    /// iteration in progress continues at the right position.
    fn rebind(&mut self) {
        if let Some(primary) = self.primary.take() {
            primary.unpin_cursor();
        }

        let (chunks, dsk_gen) = {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let roster = self.tree.roster.read().expect("lock is poisoned");

            let chunks = roster
                .active()
                .iter()
                .rev()
                .cloned()
                .collect::<Vec<_>>();

            (chunks, self.tree.dsk_gen())
        };

        self.blooms = chunks.iter().map(|chunk| chunk.bloom_filter()).collect();
        self.subs = chunks
            .iter()
            .map(|chunk| chunk.store().clone().cursor())
            .collect();
        self.heads = chunks.iter().map(|_| None).collect();

        self.primary = chunks
            .first()
            .filter(|chunk| !chunk.is_on_disk())
            .cloned();
        if let Some(primary) = &self.primary {
            primary.pin_cursor();
        }

        self.chunks = chunks;
        self.dsk_gen = dsk_gen;
        self.iter_state = IterState::None;
        self.multiple = false;

        self.tree.update_reader(self.reader_id, dsk_gen);

        log::trace!(
            "{}: cursor snapshot of {} chunks at epoch {dsk_gen}",
            self.tree.name,
            self.chunks.len(),
        );
    }

    /// Rebinds if the tree moved on since the snapshot.
    fn sync(&mut self) -> Result<()> {
        self.tree.ensure_usable()?;

        if self.merge.is_none() && self.tree.dsk_gen() != self.dsk_gen {
            self.rebind();
        }

        Ok(())
    }

    /// Seeds every sub-cursor head for a fresh direction, relative to
    /// the anchor record if there is one.
    fn start_iteration(&mut self, direction: IterState) -> Result<()> {
        for (sub, head) in self.subs.iter_mut().zip(self.heads.iter_mut()) {
            sub.reset();

            *head = match (&self.current, direction) {
                (None, IterState::Next) => sub.next()?,
                (None, IterState::Prev) => sub.prev()?,
                (Some(anchor), IterState::Next) => {
                    let mut item = sub.seek_ge(&anchor.key)?;
                    while item.as_ref().is_some_and(|item| item.key <= anchor.key) {
                        item = sub.next()?;
                    }
                    item
                }
                (Some(anchor), IterState::Prev) => {
                    let _ = sub.seek_ge(&anchor.key)?;
                    sub.prev()?
                }
                (_, IterState::None) => None,
            };
        }

        self.iter_state = direction;
        Ok(())
    }

    /// One k-way step. The winning key is the smallest (forward) or
    /// largest (backward) among the heads; among equal keys the newest
    /// chunk wins and the shadowed heads are advanced past the key.
    fn step(&mut self, direction: IterState) -> Result<Option<InternalValue>> {
        let forward = direction == IterState::Next;

        let winning_key = {
            let keys = self.heads.iter().flatten().map(|item| &item.key);
            if forward {
                keys.min()
            } else {
                keys.max()
            }
        };
        let Some(winning_key) = winning_key.cloned() else {
            return Ok(None);
        };

        let mut winner = None;
        let mut holders = 0;

        for (idx, head) in self.heads.iter_mut().enumerate() {
            if head
                .as_ref()
                .is_some_and(|item| item.key == winning_key)
            {
                holders += 1;

                let item = head.take();
                if winner.is_none() {
                    // Newest chunk first in the vector
                    winner = item;
                }

                *head = if forward {
                    self.subs.get_mut(idx).and_then(|sub| sub.next().transpose())
                } else {
                    self.subs.get_mut(idx).and_then(|sub| sub.prev().transpose())
                }
                .transpose()?;
            }
        }

        self.multiple = holders > 1;
        Ok(winner)
    }

    /// Raw iteration step, including tombstones in merge mode.
    pub(crate) fn next_record(&mut self) -> Result<Option<InternalValue>> {
        if let Some(mode) = &mut self.merge {
            return mode.merger.next().transpose();
        }

        self.sync()?;

        if self.iter_state != IterState::Next {
            self.start_iteration(IterState::Next)?;
        }

        while let Some(item) = self.step(IterState::Next)? {
            self.current = Some(item.clone());
            if !item.is_tombstone() {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }

    fn prev_record(&mut self) -> Result<Option<InternalValue>> {
        if self.merge.is_some() {
            return Err(Error::Invalid(
                "merge cursors only iterate forward".into(),
            ));
        }

        self.sync()?;

        if self.iter_state != IterState::Prev {
            self.start_iteration(IterState::Prev)?;
        }

        while let Some(item) = self.step(IterState::Prev)? {
            self.current = Some(item.clone());
            if !item.is_tombstone() {
                return Ok(Some(item));
            }
        }

        Ok(None)
    }

    /// Returns the next key/value pair, skipping deleted records.
    pub fn next(&mut self) -> Result<Option<KvPair>> {
        Ok(self.next_record()?.map(|item| (item.key, item.value)))
    }

    /// Returns the previous key/value pair, skipping deleted records.
    pub fn prev(&mut self) -> Result<Option<KvPair>> {
        Ok(self.prev_record()?.map(|item| (item.key, item.value)))
    }

    /// Point lookup through the snapshot, newest chunk first, skipping
    /// chunks whose Bloom filter reports the key definitely absent.
    pub fn search<K: AsRef<[u8]>>(&mut self, key: K) -> Result<Option<UserValue>> {
        if self.merge.is_some() {
            return Err(Error::Invalid("merge cursors cannot search".into()));
        }

        self.sync()?;

        let key = key.as_ref();
        let stats = &self.tree.stats;
        self.iter_state = IterState::None;
        self.multiple = false;

        for (chunk, bloom) in self.chunks.iter().zip(&self.blooms) {
            if let Some(filter) = bloom {
                if !filter.contains(key) {
                    TreeStats::incr(&stats.bloom_misses);
                    continue;
                }
                TreeStats::incr(&stats.bloom_hits);
            }

            match chunk.store().get(key)? {
                Some(item) if item.is_tombstone() => {
                    self.current = None;
                    return Ok(None);
                }
                Some(item) => {
                    self.current = Some(item.clone());
                    return Ok(Some(item.value));
                }
                None => {
                    if bloom.is_some() {
                        TreeStats::incr(&stats.bloom_false_positives);
                    }
                }
            }
        }

        self.current = None;
        Ok(None)
    }

    /// Inserts through the primary chunk.
    pub fn insert<K: Into<crate::UserKey>, V: Into<UserValue>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<()> {
        self.update(InternalValue::new(key, value))
    }

    /// Writes a tombstone through the primary chunk.
    pub fn remove<K: Into<crate::UserKey>>(&mut self, key: K) -> Result<()> {
        self.update(InternalValue::new_tombstone(key))
    }

    fn update(&mut self, item: InternalValue) -> Result<()> {
        if self.merge.is_some() {
            return Err(Error::Invalid("merge cursors cannot update".into()));
        }

        self.sync()?;
        self.tree.write(item)?;
        self.updated = true;
        Ok(())
    }

    /// `true` if more than one chunk held the current key.
    #[must_use]
    pub fn has_multiple(&self) -> bool {
        self.multiple
    }

    /// `true` once the cursor has performed updates.
    #[must_use]
    pub fn has_updated(&self) -> bool {
        self.updated
    }

    /// `true` for merge-mode cursors.
    #[must_use]
    pub fn is_merge(&self) -> bool {
        self.merge.is_some()
    }

    /// `true` for minor-merge cursors (tombstones included).
    #[must_use]
    pub fn is_minor_merge(&self) -> bool {
        self.merge.as_ref().is_some_and(|mode| mode.minor)
    }

    /// The epoch this cursor's snapshot was taken at.
    #[must_use]
    pub fn snapshot_gen(&self) -> u64 {
        self.dsk_gen
    }
}

impl Drop for LsmCursor {
    fn drop(&mut self) {
        if let Some(primary) = self.primary.take() {
            primary.unpin_cursor();
        }
        self.tree.unregister_reader(self.reader_id);

        if self.merge.is_none() {
            self.tree.release_ref();
        }
    }
}
