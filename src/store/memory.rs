// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{SchemaService, Store, StoreCursor};
use crate::{Error, InternalValue, Result, Slice, UserKey, UserValue, ValueType};
use crossbeam_skiplist::SkipMap;
use rustc_hash::FxHashMap;
use std::ops::Bound;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

/// An in-memory single-file store, backed by a lock-free skiplist.
///
/// Serves as the default [`Store`] implementation and as the harness
/// the test suite runs against.
pub struct MemoryStore {
    items: SkipMap<UserKey, (ValueType, UserValue)>,

    /// Approximate payload size; overwrites are not subtracted
    approximate_size: AtomicU64,

    /// Number of checkpoints taken against this store
    checkpoints: AtomicU64,
}

impl MemoryStore {
    fn new() -> Self {
        Self {
            items: SkipMap::new(),
            approximate_size: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
        }
    }

    fn checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of checkpoints taken against this store.
    #[must_use]
    pub fn checkpoint_count(&self) -> u64 {
        self.checkpoints.load(Ordering::Acquire)
    }
}

impl Store for MemoryStore {
    fn put(&self, item: InternalValue) -> Result<()> {
        self.approximate_size
            .fetch_add(item.weight(), Ordering::AcqRel);
        self.items.insert(item.key, (item.value_type, item.value));
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<InternalValue>> {
        Ok(self.items.get(key).map(|entry| InternalValue {
            key: entry.key().clone(),
            value: entry.value().1.clone(),
            value_type: entry.value().0,
        }))
    }

    fn cursor(self: Arc<Self>) -> Box<dyn StoreCursor> {
        Box::new(MemoryCursor {
            store: self,
            pos: None,
        })
    }

    fn len_approx(&self) -> u64 {
        self.items.len() as u64
    }

    fn size_bytes(&self) -> u64 {
        self.approximate_size.load(Ordering::Acquire)
    }
}

/// Cursor over a [`MemoryStore`]
///
/// Remembers the last returned key and re-seeks relative to it, so it
/// never holds a borrow into the skiplist between steps.
struct MemoryCursor {
    store: Arc<MemoryStore>,
    pos: Option<UserKey>,
}

impl MemoryCursor {
    fn materialize(entry: &crossbeam_skiplist::map::Entry<'_, UserKey, (ValueType, UserValue)>) -> InternalValue {
        InternalValue {
            key: entry.key().clone(),
            value: entry.value().1.clone(),
            value_type: entry.value().0,
        }
    }
}

impl StoreCursor for MemoryCursor {
    fn seek_ge(&mut self, key: &[u8]) -> Result<Option<InternalValue>> {
        let entry = self.store.items.lower_bound(Bound::Included(key));

        // A miss still positions the cursor, so a following `prev`
        // lands just before the requested key
        self.pos = Some(Slice::from(key));

        Ok(entry.map(|entry| {
            self.pos = Some(entry.key().clone());
            Self::materialize(&entry)
        }))
    }

    fn next(&mut self) -> Result<Option<InternalValue>> {
        let entry = match &self.pos {
            Some(pos) => self
                .store
                .items
                .lower_bound(Bound::Excluded(pos.as_ref())),
            None => self.store.items.front(),
        };

        Ok(entry.map(|entry| {
            self.pos = Some(entry.key().clone());
            Self::materialize(&entry)
        }))
    }

    fn prev(&mut self) -> Result<Option<InternalValue>> {
        let entry = match &self.pos {
            Some(pos) => self
                .store
                .items
                .upper_bound(Bound::Excluded(pos.as_ref())),
            None => self.store.items.back(),
        };

        Ok(entry.map(|entry| {
            self.pos = Some(entry.key().clone());
            Self::materialize(&entry)
        }))
    }

    fn reset(&mut self) {
        self.pos = None;
    }
}

/// An in-memory schema service
#[derive(Default)]
pub struct MemoryService {
    stores: RwLock<FxHashMap<String, Arc<MemoryStore>>>,
}

impl MemoryService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: direct handle on a store.
    #[must_use]
    pub fn get_memory(&self, uri: &str) -> Option<Arc<MemoryStore>> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let stores = self.stores.read().expect("lock is poisoned");
        stores.get(uri).cloned()
    }

    /// All store URIs, sorted.
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut uris = self
            .stores
            .read()
            .expect("lock is poisoned")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        uris.sort();
        uris
    }
}

impl SchemaService for MemoryService {
    fn create(&self, uri: &str, _config: &str) -> Result<Arc<dyn Store>> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut stores = self.stores.write().expect("lock is poisoned");

        if stores.contains_key(uri) {
            return Err(Error::Exists(uri.to_owned()));
        }

        let store = Arc::new(MemoryStore::new());
        stores.insert(uri.to_owned(), store.clone());

        Ok(store)
    }

    fn open(&self, uri: &str) -> Result<Arc<dyn Store>> {
        self.get_memory(uri)
            .map(|store| store as Arc<dyn Store>)
            .ok_or_else(|| Error::NotFound(uri.to_owned()))
    }

    fn exists(&self, uri: &str) -> bool {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let stores = self.stores.read().expect("lock is poisoned");
        stores.contains_key(uri)
    }

    fn drop_store(&self, uri: &str, force: bool) -> Result<()> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut stores = self.stores.write().expect("lock is poisoned");

        if stores.remove(uri).is_none() && !force {
            return Err(Error::NotFound(uri.to_owned()));
        }
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut stores = self.stores.write().expect("lock is poisoned");

        if stores.contains_key(new) {
            return Err(Error::Exists(new.to_owned()));
        }

        let store = stores
            .remove(old)
            .ok_or_else(|| Error::NotFound(old.to_owned()))?;
        stores.insert(new.to_owned(), store);

        Ok(())
    }

    fn checkpoint(&self, uri: &str) -> Result<()> {
        self.get_memory(uri)
            .map(|store| store.checkpoint())
            .ok_or_else(|| Error::NotFound(uri.to_owned()))
    }

    fn verify(&self, uri: &str) -> Result<()> {
        if self.exists(uri) {
            Ok(())
        } else {
            Err(Error::NotFound(uri.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn fixture() -> Arc<MemoryStore> {
        let service = MemoryService::new();
        let _ = service.create("file:t-000001.lsm", "").unwrap();
        service.get_memory("file:t-000001.lsm").unwrap()
    }

    #[test]
    fn memory_store_put_get() -> Result<()> {
        let store = fixture();
        store.put(InternalValue::new("a", "1"))?;
        store.put(InternalValue::new("a", "2"))?;

        let item = store.get(b"a")?.unwrap();
        assert_eq!(item.value, *b"2");
        assert_eq!(1, store.len_approx());
        Ok(())
    }

    #[test]
    fn memory_cursor_forward_backward() -> Result<()> {
        let store = fixture();
        for key in ["b", "d", "f"] {
            store.put(InternalValue::new(key, "x"))?;
        }

        let mut cursor = (store.clone() as Arc<dyn Store>).cursor();
        assert_eq!(cursor.next()?.unwrap().key, *b"b");
        assert_eq!(cursor.next()?.unwrap().key, *b"d");
        assert_eq!(cursor.next()?.unwrap().key, *b"f");
        assert!(cursor.next()?.is_none());

        cursor.reset();
        assert_eq!(cursor.prev()?.unwrap().key, *b"f");
        assert_eq!(cursor.prev()?.unwrap().key, *b"d");

        assert_eq!(cursor.seek_ge(b"c")?.unwrap().key, *b"d");
        assert_eq!(cursor.next()?.unwrap().key, *b"f");
        Ok(())
    }

    #[test]
    fn memory_service_rename_and_drop() -> Result<()> {
        let service = MemoryService::new();
        let _ = service.create("file:a-000001.lsm", "")?;

        assert!(matches!(
            service.create("file:a-000001.lsm", ""),
            Err(Error::Exists(_))
        ));

        service.rename("file:a-000001.lsm", "file:b-000001.lsm")?;
        assert!(!service.exists("file:a-000001.lsm"));
        assert!(service.exists("file:b-000001.lsm"));

        assert!(matches!(
            service.drop_store("file:a-000001.lsm", false),
            Err(Error::NotFound(_))
        ));
        service.drop_store("file:a-000001.lsm", true)?;
        service.drop_store("file:b-000001.lsm", false)?;
        assert!(service.uris().is_empty());
        Ok(())
    }
}
