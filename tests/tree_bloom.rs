mod common;

use lsm_stack::{Error, SchemaService, TreeStats};
use test_log::test;

#[test]
fn tree_bloom_policy_requires_bloom() {
    let (registry, _, _) = common::registry();

    assert!(matches!(
        registry.create("lsm:x", "lsm_bloom=0,lsm_bloom_newest=1", false),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(
        registry.create("lsm:x", "lsm_bloom=0,lsm_bloom_oldest=1", false),
        Err(Error::Invalid(_))
    ));

    // Plain bloom-off is fine
    registry.create("lsm:x", "lsm_bloom=0", false).expect("create");
}

#[test]
fn tree_bloom_newest_accelerates_lookups() -> lsm_stack::Result<()> {
    let (registry, schema, _) = common::registry();

    registry.create(
        "lsm:x",
        "lsm_chunk_size=1KB,lsm_merge_max=3,lsm_bloom_newest=1",
        false,
    )?;
    let tree = registry.get("lsm:x", false)?;

    common::fill_chunks(&tree, 3, "a")?;

    // Sealed chunks carry persisted filters
    let active_metas = tree.active_metas();
    let sealed = active_metas
        .iter()
        .filter(|chunk| chunk.on_disk)
        .collect::<Vec<_>>();
    assert!(!sealed.is_empty());
    for chunk in &sealed {
        assert!(chunk.has_bloom, "sealed chunk {} without filter", chunk.uri);
        let bloom_uri = chunk.bloom_uri.as_ref().expect("bloom uri");
        assert!(schema.exists(bloom_uri));
    }

    // Bloom soundness: present keys are always found
    for chunk in 0..3 {
        for i in 0..16 {
            let key = format!("a-{chunk:02}-{i:02}");
            assert!(tree.get(key.as_bytes())?.is_some(), "{key} lost");
        }
    }

    // Absent keys mostly skip chunks outright
    let misses_before = TreeStats::get(&tree.stats.bloom_misses);
    for i in 0..64 {
        let key = format!("absent-{i:03}");
        assert_eq!(None, tree.get(key.as_bytes())?);
    }
    assert!(
        TreeStats::get(&tree.stats.bloom_misses) > misses_before,
        "bloom filters never skipped a chunk"
    );

    registry.release(&tree);
    Ok(())
}

#[test]
fn tree_bloom_merged_output_carries_filter() -> lsm_stack::Result<()> {
    let (registry, schema, _) = common::registry();

    registry.create("lsm:x", "lsm_chunk_size=1KB,lsm_merge_max=3", false)?;
    let tree = registry.get("lsm:x", false)?;

    common::fill_chunks(&tree, 4, "a")?;

    // Default policy: filters on merge outputs only
    for chunk in tree.active_metas() {
        assert!(!chunk.has_bloom);
    }

    assert!(tree.merge_once()?);

    let output = &tree.active_metas()[0];
    assert_eq!(1, output.generation);
    assert!(output.has_bloom);
    assert!(schema.exists(output.bloom_uri.as_ref().expect("bloom uri")));

    registry.release(&tree);
    Ok(())
}

#[test]
fn tree_bloom_survives_reopen() -> lsm_stack::Result<()> {
    let (registry, _, _) = common::registry();

    registry.create(
        "lsm:x",
        "lsm_chunk_size=1KB,lsm_merge_max=3,lsm_bloom_newest=1",
        false,
    )?;
    let tree = registry.get("lsm:x", false)?;
    common::fill_chunks(&tree, 2, "a")?;
    registry.release(&tree);
    registry.close_all();

    // Filters reload from their stores at open
    let tree = registry.get("lsm:x", false)?;
    assert!(tree
        .active_metas()
        .iter()
        .filter(|chunk| chunk.on_disk)
        .all(|chunk| chunk.has_bloom));

    assert!(tree.get("a-00-00")?.is_some());
    assert_eq!(None, tree.get("never-written")?);

    registry.release(&tree);
    Ok(())
}
