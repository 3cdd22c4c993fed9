// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Process-wide set of open trees, plus the schema-level operations
//! (`create`, `drop`, `rename`, `truncate`) that manage their
//! lifecycle against the metadata catalog.

use crate::{
    chunk::{bloom_store_uri, chunk_store_uri},
    metadata::{MetaRecord, MetadataStore},
    roster::Roster,
    store::SchemaService,
    tree::{Tree, URI_PREFIX},
    worker, Error, Result, TreeConfig,
};
use std::sync::{Arc, Mutex};

/// Default connection cache size
const DEFAULT_CACHE_SIZE: u64 = 100 * 1_024 * 1_024;

/// Schema operation applied to each chunk of a tree
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkOp {
    /// Checkpoint each in-memory chunk's backing store
    Checkpoint,

    /// Verify each chunk's backing store
    Verify,
}

/// The handle registry: one per connection.
///
/// Owns the schema and metadata services, the connection cache size,
/// the merge-worker toggle, and the insertion-ordered list of open
/// trees. Lookup, open and close are serialized by the registry lock
/// (the schema lock of the surrounding connection).
pub struct Registry {
    schema: Arc<dyn SchemaService>,
    meta: Arc<dyn MetadataStore>,
    cache_size: u64,
    merge_enabled: bool,
    trees: Mutex<Vec<Tree>>,
}

impl Registry {
    /// Creates a registry on top of the given services.
    #[must_use]
    pub fn new(schema: Arc<dyn SchemaService>, meta: Arc<dyn MetadataStore>) -> Self {
        Self {
            schema,
            meta,
            cache_size: DEFAULT_CACHE_SIZE,
            merge_enabled: true,
            trees: Mutex::new(vec![]),
        }
    }

    /// Sets the connection cache size, checked against every tree
    /// configuration at open.
    #[must_use]
    pub fn cache_size(mut self, bytes: u64) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Disables or enables the background merge workers.
    #[must_use]
    pub fn merge(mut self, enabled: bool) -> Self {
        self.merge_enabled = enabled;
        self
    }

    /// Gets a handle for the given name, opening the tree if needed.
    ///
    /// With `exclusive`, fails with `Busy` while anyone else holds a
    /// reference. The returned handle must be passed to [`Self::release`].
    pub fn get(&self, uri: &str, exclusive: bool) -> Result<Tree> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut trees = self.trees.lock().expect("lock is poisoned");

        if let Some(tree) = trees.iter().find(|tree| tree.name == uri) {
            if exclusive && tree.refcnt() > 0 {
                return Err(Error::Busy(uri.to_owned()));
            }
            tree.acquire_ref();
            return Ok(tree.clone());
        }

        let tree = Tree::open(uri, &self.schema, &self.meta, self.cache_size)?;
        tree.acquire_ref();
        trees.push(tree.clone());

        worker::start_workers(&tree, self.merge_enabled)?;

        Ok(tree)
    }

    /// Releases a handle obtained from [`Self::get`]. Never frees; the
    /// registry keeps the tree open until [`Self::close_all`].
    pub fn release(&self, tree: &Tree) {
        tree.release_ref();
    }

    /// Creates an LSM tree for the given name.
    ///
    /// Creating an existing tree is a no-op unless `exclusive` is set,
    /// in which case it fails with `Exists`.
    pub fn create(&self, uri: &str, config: &str, exclusive: bool) -> Result<()> {
        if !uri.starts_with(URI_PREFIX) {
            return Err(Error::Invalid(format!("not an LSM tree URI: {uri}")));
        }

        // If the tree is open, it already exists
        {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let trees = self.trees.lock().expect("lock is poisoned");
            if trees.iter().any(|tree| tree.name == uri) {
                return if exclusive {
                    Err(Error::Exists(uri.to_owned()))
                } else {
                    Ok(())
                };
            }
        }

        // If the tree has metadata, it already exists
        if self.meta.read(uri)?.is_some() {
            return if exclusive {
                Err(Error::Exists(uri.to_owned()))
            } else {
                Ok(())
            };
        }

        let record = MetaRecord {
            config: TreeConfig::parse(config)?,
            last: 0,
            chunks: vec![],
            old_chunks: vec![],
        };
        self.meta.write(uri, &record.encode())?;

        // Re-open to install the runtime state; the first chunk is
        // created on that path. A failed open leaves no half-registered
        // entry behind.
        match self.get(uri, false) {
            Ok(tree) => {
                self.release(&tree);
                Ok(())
            }
            Err(e) => {
                let _ = self.meta.remove(uri);
                Err(e)
            }
        }
    }

    /// Drops an LSM tree: every chunk store, every Bloom store, and
    /// the metadata record.
    ///
    /// Stops at the first schema error; the metadata record is only
    /// removed once all chunks are gone.
    pub fn drop_tree(&self, uri: &str) -> Result<()> {
        let tree = self.get(uri, true)?;
        worker::stop_workers(&tree);

        let result = (|| {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let roster = tree.roster.write().expect("lock is poisoned");

            for chunk in roster.active().iter().chain(roster.old().iter()) {
                self.schema.drop_store(&chunk.uri, false)?;
                if chunk.has_bloom() {
                    if let Some(bloom_uri) = &chunk.bloom_uri {
                        self.schema.drop_store(bloom_uri, false)?;
                    }
                }
            }

            self.meta.remove(uri)
        })();

        self.discard(&tree);
        result
    }

    /// Renames an LSM tree, moving every chunk and Bloom store to the
    /// new name. The handle is discarded either way; recovery after a
    /// failure is a metadata re-read.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let Some(new_filename) = new.strip_prefix(URI_PREFIX) else {
            return Err(Error::Invalid(format!("not an LSM tree URI: {new}")));
        };

        let tree = self.get(old, true)?;
        worker::stop_workers(&tree);

        let result = (|| {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let mut roster = tree.roster.write().expect("lock is poisoned");

            let mut renamed = Roster::default();

            for (chunks, active) in [(roster.active(), true), (roster.old(), false)] {
                for chunk in chunks {
                    let uri = chunk_store_uri(new_filename, chunk.id);
                    self.schema.rename(&chunk.uri, &uri)?;

                    let bloom_uri = chunk
                        .bloom_uri
                        .as_ref()
                        .map(|_| bloom_store_uri(new_filename, chunk.id));
                    if let Some(bloom_uri) = &bloom_uri {
                        if chunk.has_bloom() {
                            // Filter stores exist only once built
                            if let Some(old_bloom) = &chunk.bloom_uri {
                                self.schema.rename(old_bloom, bloom_uri)?;
                            }
                        }
                    }

                    let chunk = Arc::new(chunk.renamed(uri, bloom_uri));
                    if active {
                        renamed.push_active(chunk);
                    } else {
                        renamed.push_old(chunk);
                    }
                }
            }

            *roster = renamed;

            let record = MetaRecord {
                config: tree.config.clone(),
                last: tree.last_chunk_id(),
                chunks: roster.active_metas(),
                old_chunks: roster.old_metas(),
            };
            self.meta.write(new, &record.encode())?;
            self.meta.remove(old)
        })();

        self.discard(&tree);
        result
    }

    /// Empties an LSM tree: every chunk moves to the old list under a
    /// single epoch bump and a fresh primary is installed.
    pub fn truncate(&self, uri: &str) -> Result<()> {
        let tree = self.get(uri, true)?;
        worker::stop_workers(&tree);

        let result = (|| {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let mut roster = tree.roster.write().expect("lock is poisoned");

            let dsk_gen = tree.bump_dsk_gen();
            roster.retire_all(dsk_gen);

            tree.switch_locked(&mut roster, false)
        })();

        let restarted = worker::start_workers(&tree, self.merge_enabled);
        self.release(&tree);

        result.and(restarted)
    }

    /// Applies a schema operation to each active chunk of a tree.
    /// Checkpoint skips chunks that are already on disk.
    pub fn worker_apply(&self, uri: &str, op: ChunkOp, exclusive: bool) -> Result<()> {
        let tree = self.get(uri, exclusive)?;

        let result = (|| {
            let chunks = {
                #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
                let roster = tree.roster.read().expect("lock is poisoned");
                roster.active().to_vec()
            };

            for chunk in chunks {
                match op {
                    ChunkOp::Checkpoint => {
                        if chunk.is_on_disk() {
                            continue;
                        }
                        self.schema.checkpoint(&chunk.uri)?;
                    }
                    ChunkOp::Verify => self.schema.verify(&chunk.uri)?,
                }
            }

            Ok(())
        })();

        self.release(&tree);
        result
    }

    /// Closes every open tree: stop the workers, then drop the
    /// handles. Worker errors were recorded in statistics and never
    /// surface here; closing an empty registry is a no-op.
    pub fn close_all(&self) {
        let trees = {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let mut trees = self.trees.lock().expect("lock is poisoned");
            std::mem::take(&mut *trees)
        };

        for tree in trees {
            log::debug!("{}: closing", tree.name);
            worker::stop_workers(&tree);
        }
    }

    /// Number of open trees.
    #[must_use]
    pub fn open_count(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let trees = self.trees.lock().expect("lock is poisoned");
        trees.len()
    }

    /// Removes a handle from the registry and drops our reference.
    fn discard(&self, tree: &Tree) {
        {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let mut trees = self.trees.lock().expect("lock is poisoned");
            trees.retain(|entry| !Arc::ptr_eq(&entry.0, &tree.0));
        }
        tree.release_ref();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.close_all();
    }
}
