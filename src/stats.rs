// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-tree statistics
///
/// Background failures are recorded here instead of propagating to
/// foreground paths; the counters are monotonic and lock-free.
#[derive(Debug, Default)]
pub struct TreeStats {
    /// Number of successful switches
    pub switches: AtomicU64,

    /// Number of completed merges
    pub merges: AtomicU64,

    /// Number of checkpoints of the primary chunk
    pub checkpoints: AtomicU64,

    /// Bloom filters that reported "maybe present"
    pub bloom_hits: AtomicU64,

    /// Bloom filters that allowed skipping a chunk
    pub bloom_misses: AtomicU64,

    /// Bloom "maybe" answers the chunk then refuted
    pub bloom_false_positives: AtomicU64,

    /// Old chunks whose backing stores were dropped
    pub chunks_reclaimed: AtomicU64,

    /// Errors swallowed by background workers
    pub worker_errors: AtomicU64,
}

impl TreeStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads a counter.
    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
