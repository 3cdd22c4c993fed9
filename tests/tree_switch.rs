mod common;

use lsm_stack::TreeStats;
use test_log::test;

const CONFIG: &str = "lsm_chunk_size=1KB,lsm_merge_max=3";

#[test]
fn tree_switch_fills_stack() -> lsm_stack::Result<()> {
    let (registry, _, _) = common::registry();

    registry.create("lsm:x", CONFIG, false)?;
    let tree = registry.get("lsm:x", false)?;

    // 10 KiB of data against 1 KiB chunks
    for i in 0..160u32 {
        let key = format!("key-{i:04}");
        tree.insert(key.as_bytes(), vec![b'v'; 64])?;
    }

    assert!(
        TreeStats::get(&tree.stats.switches) >= 10,
        "expected at least 10 switches, got {}",
        TreeStats::get(&tree.stats.switches)
    );
    assert!(tree.dsk_gen() >= 11);

    // Exactly one primary, and it is the newest chunk
    let active = tree.active_metas();
    let in_memory = active.iter().filter(|chunk| !chunk.on_disk).count();
    assert_eq!(1, in_memory);
    assert!(!active.last().unwrap().on_disk);

    registry.release(&tree);
    registry.close_all();
    Ok(())
}

#[test]
fn tree_switch_only_primary_may_be_empty() -> lsm_stack::Result<()> {
    let (registry, _, _) = common::registry();

    registry.create("lsm:x", CONFIG, false)?;
    let tree = registry.get("lsm:x", false)?;

    common::fill_chunks(&tree, 3, "a")?;

    // Repeated switches on an empty primary change nothing
    let before = tree.active_metas().len();
    tree.switch()?;
    tree.switch()?;
    assert_eq!(before, tree.active_metas().len());

    let active = tree.active_metas();
    for chunk in &active[..active.len() - 1] {
        assert!(chunk.count > 0, "sealed chunk {} is empty", chunk.uri);
    }

    registry.release(&tree);
    Ok(())
}

#[test]
fn tree_chunk_ids_strictly_increase() -> lsm_stack::Result<()> {
    let (registry, _, _) = common::registry();

    registry.create("lsm:x", CONFIG, false)?;
    let tree = registry.get("lsm:x", false)?;

    common::fill_chunks(&tree, 4, "a")?;
    tree.merge_once()?;
    registry.release(&tree);

    registry.truncate("lsm:x")?;

    let tree = registry.get("lsm:x", false)?;
    common::fill_chunks(&tree, 2, "b")?;

    let mut ids = vec![];
    for chunk in tree.active_metas().iter().chain(tree.old_metas().iter()) {
        ids.push(chunk.id);
    }

    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), ids.len(), "chunk IDs were reused");

    // Active IDs ascend oldest to newest
    let active_ids = tree
        .active_metas()
        .iter()
        .map(|chunk| chunk.id)
        .collect::<Vec<_>>();
    let mut expected = active_ids.clone();
    expected.sort_unstable();
    assert_eq!(expected, active_ids);

    registry.release(&tree);
    Ok(())
}

#[test]
fn tree_dsk_gen_strictly_increases() -> lsm_stack::Result<()> {
    let (registry, _, _) = common::registry();

    registry.create("lsm:x", CONFIG, false)?;
    let tree = registry.get("lsm:x", false)?;

    let mut last = tree.dsk_gen();

    tree.insert("a", "1")?;
    tree.switch()?;
    assert!(tree.dsk_gen() > last);
    last = tree.dsk_gen();

    common::fill_chunks(&tree, 3, "b")?;
    assert!(tree.dsk_gen() > last);
    last = tree.dsk_gen();

    assert!(tree.merge_once()?);
    assert!(tree.dsk_gen() > last);

    registry.release(&tree);
    Ok(())
}
