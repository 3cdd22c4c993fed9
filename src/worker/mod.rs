// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-tree background workers.
//!
//! Each open tree runs up to two dedicated threads: the merge worker
//! and the checkpoint worker. Both hold their own clone of the tree
//! handle (and through it, their own service handles), acquired when
//! the thread starts and released when it is joined.
//!
//! Workers poll the working flag at every natural boundary and exit
//! once it is cleared; close waits on completion, there is no forced
//! cancellation.

pub(crate) mod checkpoint;
pub(crate) mod merge;

use crate::{stats::TreeStats, Tree};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Delay between merge attempts that found nothing to do
const MERGE_TICK: Duration = Duration::from_millis(10);

/// Delay between checkpoints of the primary
const CHECKPOINT_TICK: Duration = Duration::from_millis(50);

/// Tree-side working flag.
///
/// Set while workers should run; clearing it asks them to finish their
/// current unit of work and exit.
#[derive(Debug, Default)]
pub struct WorkSignal(AtomicBool);

impl WorkSignal {
    pub fn start(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_working(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Join handles of a tree's background threads
#[derive(Default)]
pub struct WorkerSet {
    pub(crate) merge: Option<JoinHandle<()>>,
    pub(crate) checkpoint: Option<JoinHandle<()>>,
}

/// Starts the workers for a tree. The merge worker is subject to the
/// connection-wide merge toggle; the checkpoint worker always runs.
pub(crate) fn start_workers(tree: &Tree, merge_enabled: bool) -> crate::Result<()> {
    // The new threads rely on the working flag being visible
    tree.working.start();

    #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
    let mut workers = tree.workers.lock().expect("lock is poisoned");

    if merge_enabled && workers.merge.is_none() {
        let handle = tree.clone();
        workers.merge = Some(
            std::thread::Builder::new()
                .name(format!("lsm-merge({})", tree.name))
                .spawn(move || merge_loop(&handle))?,
        );
    }

    if workers.checkpoint.is_none() {
        let handle = tree.clone();
        workers.checkpoint = Some(
            std::thread::Builder::new()
                .name(format!("lsm-ckpt({})", tree.name))
                .spawn(move || checkpoint_loop(&handle))?,
        );
    }

    Ok(())
}

/// Clears the working flag and waits for both workers to exit.
///
/// Worker errors never propagate out of here; they were already
/// recorded in the tree statistics.
pub(crate) fn stop_workers(tree: &Tree) {
    tree.working.stop();

    let (merge, checkpoint) = {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut workers = tree.workers.lock().expect("lock is poisoned");
        (workers.merge.take(), workers.checkpoint.take())
    };

    for handle in [merge, checkpoint].into_iter().flatten() {
        if handle.join().is_err() {
            log::error!("{}: worker thread panicked", tree.name);
        }
    }
}

fn merge_loop(tree: &Tree) {
    log::debug!("{}: merge worker started", tree.name);

    while tree.working.is_working() {
        match merge::merge_pass_interruptible(tree, &tree.working) {
            // Immediately look for follow-up work
            Ok(true) => {}
            Ok(false) => std::thread::sleep(MERGE_TICK),
            Err(e) => {
                log::error!("{}: merge pass failed: {e}", tree.name);
                TreeStats::incr(&tree.stats.worker_errors);
                std::thread::sleep(MERGE_TICK);
            }
        }
    }

    log::debug!("{}: merge worker exiting", tree.name);
}

fn checkpoint_loop(tree: &Tree) {
    log::debug!("{}: checkpoint worker started", tree.name);

    while tree.working.is_working() {
        if let Err(e) = checkpoint::checkpoint_pass(tree) {
            log::error!("{}: checkpoint pass failed: {e}", tree.name);
            TreeStats::incr(&tree.stats.worker_errors);
        }

        std::thread::sleep(CHECKPOINT_TICK);
    }

    log::debug!("{}: checkpoint worker exiting", tree.name);
}
