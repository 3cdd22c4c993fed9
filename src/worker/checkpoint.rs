// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{stats::TreeStats, Result, Tree};

/// Checkpoints the current primary chunk's backing store.
///
/// This is the only mechanism by which the primary's contents become
/// crash-durable; the roster is never touched. The store I/O happens
/// outside the tree lock.
pub(crate) fn checkpoint_pass(tree: &Tree) -> Result<()> {
    tree.ensure_usable()?;

    let uri = {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let roster = tree.roster.read().expect("lock is poisoned");
        roster.primary().map(|chunk| chunk.uri.clone())
    };

    if let Some(uri) = uri {
        tree.schema.checkpoint(&uri)?;
        TreeStats::incr(&tree.stats.checkpoints);
        log::trace!("{}: checkpointed {uri}", tree.name);
    }

    Ok(())
}
