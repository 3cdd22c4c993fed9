use lsm_stack::{MemoryMetadata, MemoryService, Registry};
use std::sync::Arc;

/// A registry over fresh in-memory services, background merging off so
/// tests drive merges deterministically.
#[allow(dead_code)]
pub fn registry() -> (Registry, Arc<MemoryService>, Arc<MemoryMetadata>) {
    let schema = Arc::new(MemoryService::new());
    let meta = Arc::new(MemoryMetadata::new());
    let registry = Registry::new(schema.clone(), meta.clone()).merge(false);
    (registry, schema, meta)
}

/// Fills the tree until it has `chunks` sealed chunks plus one empty
/// primary. Assumes a 1 KiB chunk size.
#[allow(dead_code)]
pub fn fill_chunks(tree: &lsm_stack::Tree, chunks: usize, tag: &str) -> lsm_stack::Result<()> {
    for chunk in 0..chunks {
        for i in 0..16 {
            let key = format!("{tag}-{chunk:02}-{i:02}");
            let value = vec![b'v'; 64];
            tree.insert(key.as_bytes(), value)?;
        }
        // 16 * (key + 64B value) crosses the 1 KiB threshold on its
        // own, but make sure
        tree.switch()?;
    }
    Ok(())
}
