// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Contracts of the external collaborators backing each chunk.
//!
//! The LSM layer never touches storage directly. Every chunk and every
//! Bloom filter is one *single-file store* named by URI, managed through
//! a [`SchemaService`]. The crate ships an in-memory implementation
//! ([`MemoryService`]) which the test suite runs against; a real
//! deployment plugs in its B-tree here.

pub mod memory;

pub use memory::{MemoryService, MemoryStore};

use crate::{InternalValue, Result};
use std::sync::Arc;

/// A positioned traversal over one store.
///
/// A cursor remembers the key it last returned and steps relative to
/// it, so it stays valid across concurrent writes to the store.
pub trait StoreCursor: Send {
    /// Positions the cursor at the first record with key `>= key` and
    /// returns it.
    fn seek_ge(&mut self, key: &[u8]) -> Result<Option<InternalValue>>;

    /// Returns the record after the current position, or the first
    /// record if unpositioned.
    fn next(&mut self) -> Result<Option<InternalValue>>;

    /// Returns the record before the current position, or the last
    /// record if unpositioned.
    fn prev(&mut self) -> Result<Option<InternalValue>>;

    /// Clears the position.
    fn reset(&mut self);
}

/// One single-file ordered KV store (the external B-tree).
///
/// Stores keep at most one record per key; tombstones are first-class
/// records so deletions shadow older chunks.
pub trait Store: Send + Sync {
    /// Inserts or overwrites a record.
    fn put(&self, item: InternalValue) -> Result<()>;

    /// Point lookup.
    fn get(&self, key: &[u8]) -> Result<Option<InternalValue>>;

    /// Opens a traversal cursor.
    fn cursor(self: Arc<Self>) -> Box<dyn StoreCursor>;

    /// Approximate record count.
    fn len_approx(&self) -> u64;

    /// Approximate payload size in bytes, used for switch accounting.
    fn size_bytes(&self) -> u64;
}

/// Catalog of single-file stores, keyed by URI.
///
/// All operations are serialized by the caller's schema lock.
pub trait SchemaService: Send + Sync {
    /// Creates a store. Fails with `Exists` if the URI is taken.
    fn create(&self, uri: &str, config: &str) -> Result<Arc<dyn Store>>;

    /// Opens an existing store.
    fn open(&self, uri: &str) -> Result<Arc<dyn Store>>;

    /// Returns `true` if the URI names a store.
    fn exists(&self, uri: &str) -> bool;

    /// Drops a store. With `force`, a missing URI is not an error.
    fn drop_store(&self, uri: &str, force: bool) -> Result<()>;

    /// Renames a store.
    fn rename(&self, old: &str, new: &str) -> Result<()>;

    /// Makes the store's current contents crash-durable.
    fn checkpoint(&self, uri: &str) -> Result<()>;

    /// Verifies the store's integrity.
    fn verify(&self, uri: &str) -> Result<()>;
}
