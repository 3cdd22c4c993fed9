// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{store::StoreCursor, InternalValue};
use interval_heap::IntervalHeap as Heap;

pub type BoxedIterator<'a> = Box<dyn Iterator<Item = crate::Result<InternalValue>> + 'a>;

/// Adapts a store cursor into a forward scan.
pub(crate) struct StoreScanner(pub Box<dyn StoreCursor>);

impl Iterator for StoreScanner {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().transpose()
    }
}

#[derive(Eq)]
struct HeapItem(usize, InternalValue);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.1.key, self.0).cmp(&(&other.1.key, other.0))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges multiple chunk scans into one ordered stream.
///
/// Iterators must be passed newest chunk first: for equal keys, the
/// lowest source index wins and the older records are discarded.
/// Tombstone eviction is used by major merges, which land at the root
/// of the stack and therefore cannot resurrect anything beneath them.
pub struct ChunkMerger<'a> {
    iterators: Vec<BoxedIterator<'a>>,
    heap: Heap<HeapItem>,
    initialized: bool,
    evict_tombstones: bool,
}

impl<'a> ChunkMerger<'a> {
    #[must_use]
    pub fn new(iterators: Vec<BoxedIterator<'a>>) -> Self {
        let heap = Heap::with_capacity(iterators.len());

        Self {
            iterators,
            heap,
            initialized: false,
            evict_tombstones: false,
        }
    }

    /// Drops tombstones from the output stream.
    #[must_use]
    pub fn evict_tombstones(mut self, evict: bool) -> Self {
        self.evict_tombstones = evict;
        self
    }

    fn advance(&mut self, idx: usize) -> crate::Result<()> {
        if let Some(item) = self.iterators.get_mut(idx).and_then(Iterator::next) {
            self.heap.push(HeapItem(idx, item?));
        }
        Ok(())
    }

    fn initialize(&mut self) -> crate::Result<()> {
        for idx in 0..self.iterators.len() {
            self.advance(idx)?;
        }
        self.initialized = true;
        Ok(())
    }
}

impl Iterator for ChunkMerger<'_> {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            fail_iter!(self.initialize());
        }

        loop {
            let head = self.heap.pop_min()?;
            fail_iter!(self.advance(head.0));

            // Equal keys in older sources are shadowed
            while let Some(shadowed) = self.heap.pop_min() {
                if shadowed.1.key == head.1.key {
                    fail_iter!(self.advance(shadowed.0));
                } else {
                    self.heap.push(shadowed);
                    break;
                }
            }

            if self.evict_tombstones && head.1.is_tombstone() {
                continue;
            }

            return Some(Ok(head.1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn source(items: Vec<InternalValue>) -> BoxedIterator<'static> {
        Box::new(items.into_iter().map(Ok))
    }

    #[test]
    fn merge_interleaves_sorted_sources() {
        let merger = ChunkMerger::new(vec![
            source(vec![
                InternalValue::new("b", "new"),
                InternalValue::new("d", "new"),
            ]),
            source(vec![
                InternalValue::new("a", "old"),
                InternalValue::new("c", "old"),
            ]),
        ]);

        let keys = merger
            .map(|item| item.map(|item| item.key.to_vec()))
            .collect::<crate::Result<Vec<_>>>()
            .unwrap();

        assert_eq!(
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()],
            keys
        );
    }

    #[test]
    fn merge_newest_source_shadows() {
        let merger = ChunkMerger::new(vec![
            source(vec![InternalValue::new("k", "newest")]),
            source(vec![InternalValue::new("k", "middle")]),
            source(vec![
                InternalValue::new("j", "only"),
                InternalValue::new("k", "oldest"),
            ]),
        ]);

        let items = merger.collect::<crate::Result<Vec<_>>>().unwrap();
        assert_eq!(2, items.len());
        assert_eq!(items[0].value, *b"only");
        assert_eq!(items[1].value, *b"newest");
    }

    #[test]
    fn merge_tombstone_eviction() {
        let sources = || {
            vec![
                source(vec![InternalValue::new_tombstone("a")]),
                source(vec![
                    InternalValue::new("a", "dead"),
                    InternalValue::new("b", "live"),
                ]),
            ]
        };

        // Minor merge keeps the tombstone so it still shadows deeper chunks
        let kept = ChunkMerger::new(sources())
            .collect::<crate::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(2, kept.len());
        assert!(kept[0].is_tombstone());

        // Major merge drops it
        let evicted = ChunkMerger::new(sources())
            .evict_tombstones(true)
            .collect::<crate::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(1, evicted.len());
        assert_eq!(evicted[0].key, *b"b");
    }
}
