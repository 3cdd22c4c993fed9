// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::WorkSignal;
use crate::{chunk::Chunk, stats::TreeStats, Result, Tree};
use std::sync::Arc;

/// Items streamed between cancellation polls
const POLL_INTERVAL: u64 = 1_000;

/// A staged merge run: contiguous chunks, oldest first
struct MergeRun {
    start: usize,
    chunks: Vec<Arc<Chunk>>,
}

impl MergeRun {
    /// Tombstones may only be dropped when the output lands at the
    /// root of the stack; anywhere else they still shadow older data.
    fn is_major(&self) -> bool {
        self.start == 0
    }
}

/// Runs one merge pass: pick, build, install, reclaim.
///
/// Returns `true` if a merge was installed.
pub(crate) fn merge_pass(tree: &Tree) -> Result<bool> {
    merge_pass_inner(tree, None)
}

/// Worker entry point: polls `signal` at every natural boundary and
/// abandons the pass once it clears.
pub(crate) fn merge_pass_interruptible(tree: &Tree, signal: &WorkSignal) -> Result<bool> {
    merge_pass_inner(tree, Some(signal))
}

fn merge_pass_inner(tree: &Tree, signal: Option<&WorkSignal>) -> Result<bool> {
    tree.ensure_usable()?;

    let interrupted = || signal.is_some_and(|signal| !signal.is_working());

    // Stage the picked descriptors, then let go of the tree lock
    let Some(run) = pick_run(tree) else {
        return Ok(false);
    };

    if interrupted() {
        return Ok(false);
    }

    let generation = 1 + run
        .chunks
        .iter()
        .map(|chunk| chunk.generation)
        .max()
        .unwrap_or_default();

    let with_bloom =
        tree.config.bloom.merged || (tree.config.bloom.oldest && run.is_major());

    let id = tree.next_chunk_id();
    let output = tree.setup_chunk(id, generation, with_bloom)?;

    log::debug!(
        "{}: merging chunks {:?} into {} (generation {generation})",
        tree.name,
        run.chunks.iter().map(|chunk| chunk.id).collect::<Vec<_>>(),
        output.uri,
    );

    // A minor merge keeps tombstones: the oldest input is not at the
    // root level, so deeper chunks may still hold shadowed records
    let mut cursor = tree.merge_cursor(&run.chunks, !run.is_major());
    debug_assert!(cursor.is_merge());
    debug_assert_eq!(cursor.is_minor_merge(), !run.is_major());

    let mut count = 0u64;
    while let Some(item) = cursor.next_record()? {
        output.store().put(item)?;
        count += 1;

        if count % POLL_INTERVAL == 0 && interrupted() {
            log::debug!("{}: abandoning merge build of {}", tree.name, output.uri);
            return abandon_output(tree, &output).map(|()| false);
        }
    }
    drop(cursor);
    output.set_count(count);

    if count > 0 {
        tree.build_bloom(&output)?;
        tree.schema.checkpoint(&output.uri)?;
    }
    output.mark_on_disk();

    if interrupted() {
        return abandon_output(tree, &output).map(|()| false);
    }

    // Install: one critical section updates the roster and rewrites
    // the metadata record
    {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut roster = tree.roster.write().expect("lock is poisoned");

        if !run_is_intact(roster.active(), &run) {
            log::warn!(
                "{}: roster changed under merge, abandoning {}",
                tree.name,
                output.uri
            );
            drop(roster);
            return abandon_output(tree, &output).map(|()| false);
        }

        let dsk_gen = tree.bump_dsk_gen();
        roster.replace_run(
            run.start,
            run.chunks.len(),
            (count > 0).then(|| output.clone()),
            dsk_gen,
        );
        tree.write_meta_locked(&roster)?;
    }

    TreeStats::incr(&tree.stats.merges);

    // An all-tombstone merge installed nothing; its store pair is an
    // orphan and goes away right here
    if count == 0 {
        abandon_output(tree, &output)?;
    }

    // Old chunks whose readers are gone can go at once; the rest wait
    // for the next pass
    tree.reclaim()?;

    Ok(true)
}

/// Drops the half-built output pair again. The allocated chunk ID is
/// simply skipped; IDs are never reused.
fn abandon_output(tree: &Tree, output: &Chunk) -> Result<()> {
    tree.schema.drop_store(&output.uri, true)?;
    if let Some(bloom_uri) = &output.bloom_uri {
        tree.schema.drop_store(bloom_uri, true)?;
    }
    Ok(())
}

/// Verifies the staged run still sits contiguously in the roster.
fn run_is_intact(active: &[Arc<Chunk>], run: &MergeRun) -> bool {
    active
        .get(run.start..run.start + run.chunks.len())
        .is_some_and(|window| {
            window
                .iter()
                .zip(&run.chunks)
                .all(|(a, b)| a.id == b.id)
        })
}

/// Picks the longest contiguous run of roughly equal-sized chunks.
///
/// Size-tiered schedule: a chunk qualifies while its count stays below
/// `C * merge_max^generation`, with `C` the largest generation-0
/// on-disk count in the roster. Runs never include the primary, never
/// span a generation gap of more than one, and the oldest of several
/// longest runs wins.
#[allow(clippy::indexing_slicing)]
fn pick_run(tree: &Tree) -> Option<MergeRun> {
    #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
    let roster = tree.roster.read().expect("lock is poisoned");
    let active = roster.active();

    let merge_max = tree.config.merge_max as usize;

    let unit = active
        .iter()
        .filter(|chunk| chunk.is_on_disk() && chunk.generation == 0)
        .map(|chunk| chunk.count())
        .max()
        .unwrap_or(1)
        .max(1);

    let eligible = |chunk: &Chunk| {
        let tier = u64::from(tree.config.merge_max)
            .checked_pow(chunk.generation)
            .unwrap_or(u64::MAX);

        chunk.is_on_disk() && chunk.count() <= unit.saturating_mul(tier)
    };

    let mut best: Option<(usize, usize)> = None;

    for start in 0..active.len() {
        if !eligible(&active[start]) {
            continue;
        }

        let mut len = 1;
        while len < merge_max && start + len < active.len() {
            let prev = &active[start + len - 1];
            let next = &active[start + len];

            if !eligible(next) || prev.generation.abs_diff(next.generation) > 1 {
                break;
            }
            len += 1;
        }

        // Strictly longer only: equal-length candidates lose to the
        // older run found first
        if len >= 2 && best.is_none_or(|(_, best_len)| len > best_len) {
            best = Some((start, len));
        }
    }

    best.map(|(start, len)| MergeRun {
        start,
        chunks: active
            .get(start..start + len)
            .map(<[Arc<Chunk>]>::to_vec)
            .unwrap_or_default(),
    })
}
