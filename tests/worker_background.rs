mod common;

use lsm_stack::{MemoryMetadata, MemoryService, Registry, TreeStats};
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_log::test;

/// End-to-end smoke test with real background workers: the merge
/// worker compacts the stack on its own, the checkpoint worker makes
/// the primary durable, and close joins both.
#[test]
fn workers_run_and_join() -> lsm_stack::Result<()> {
    let schema = Arc::new(MemoryService::new());
    let meta = Arc::new(MemoryMetadata::new());
    let registry = Registry::new(schema.clone(), meta.clone());

    registry.create("lsm:x", "lsm_chunk_size=1KB,lsm_merge_max=3", false)?;
    let tree = registry.get("lsm:x", false)?;

    for i in 0..200u32 {
        tree.insert(format!("key-{i:04}").as_bytes(), vec![b'v'; 64])?;
    }

    // The merge worker needs a moment; don't wait forever on a slow box
    let deadline = Instant::now() + Duration::from_secs(10);
    while TreeStats::get(&tree.stats.merges) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(
        TreeStats::get(&tree.stats.merges) > 0,
        "merge worker never merged"
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while TreeStats::get(&tree.stats.checkpoints) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(TreeStats::get(&tree.stats.checkpoints) > 0);

    // Everything is still readable while the workers churn
    for i in 0..200u32 {
        assert!(tree.get(format!("key-{i:04}").as_bytes())?.is_some());
    }

    registry.release(&tree);
    registry.close_all();

    // After close the tree reopens cleanly from metadata
    let tree = registry.get("lsm:x", false)?;
    assert!(tree.get("key-0000")?.is_some());
    registry.release(&tree);
    registry.close_all();

    Ok(())
}
