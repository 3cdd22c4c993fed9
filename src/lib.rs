// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A chunk-stacked log-structured merge layer over external
//! single-file ordered stores.
//!
//! ##### NOTE
//!
//! > This crate only provides the LSM coordination layer, not a full
//! > storage engine. The stores backing each chunk (and each Bloom
//! > filter) live behind the [`SchemaService`] trait; an in-memory
//! > implementation ships with the crate.
//!
//! ##### About
//!
//! A [`Tree`] behaves like a single ordered key/value store.
//! Internally it is a stack of immutable on-disk *chunks* plus at most
//! one *primary* chunk accepting writes, each optionally paired with a
//! Bloom filter. Writes go to the primary chunk's backing store; once
//! it exceeds the configured chunk size, a *switch* seals it and
//! installs a fresh primary. Background workers coalesce older chunks
//! (*merge*) and make the primary durable (*checkpoint*). Every
//! visible roster change bumps a tree-wide epoch, so cursors know to
//! refresh their snapshots.
//!
//! Trees are managed through a [`Registry`], one per connection, which
//! owns the schema and metadata services and the schema-level
//! operations (`create`, `drop`, `rename`, `truncate`).
//!
//! # Example usage
//!
//! ```
//! use lsm_stack::{MemoryMetadata, MemoryService, Registry, Slice};
//! use std::sync::Arc;
//!
//! let registry = Registry::new(
//!     Arc::new(MemoryService::new()),
//!     Arc::new(MemoryMetadata::new()),
//! )
//! .merge(false);
//!
//! registry.create("lsm:demo", "lsm_chunk_size=1MB", false)?;
//!
//! let tree = registry.get("lsm:demo", false)?;
//! tree.insert("my_key", "my_value")?;
//!
//! assert_eq!(Some(Slice::from("my_value")), tree.get("my_key")?);
//!
//! // Cursors iterate the whole chunk stack, newest data winning
//! let mut cursor = tree.cursor()?;
//! while let Some((_key, _value)) = cursor.next()? {
//!     // ...
//! }
//! drop(cursor);
//!
//! registry.release(&tree);
//! registry.close_all();
//! #
//! # Ok::<(), lsm_stack::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

#[doc(hidden)]
pub mod bloom;

mod chunk;

#[doc(hidden)]
pub mod coding;

mod config;
mod cursor;
mod error;

#[doc(hidden)]
pub mod merge;

mod metadata;

pub mod pack;
pub mod projection;

mod registry;
mod roster;
mod slice;
mod stats;

pub mod store;

mod tree;
mod value;
mod worker;

/// KV-tuple, typically returned by an iterator
pub type KvPair = (UserKey, UserValue);

#[doc(hidden)]
pub use {merge::BoxedIterator, tree::inner::TreeInner};

pub use {
    chunk::{bloom_store_uri, chunk_store_uri, Chunk, ChunkId},
    config::{BloomPolicy, TreeConfig},
    cursor::LsmCursor,
    error::{Error, Result},
    metadata::{ChunkMeta, MemoryMetadata, MetaRecord, MetadataStore},
    registry::{ChunkOp, Registry},
    slice::Slice,
    stats::TreeStats,
    store::{MemoryService, MemoryStore, SchemaService, Store, StoreCursor},
    tree::{Tree, URI_PREFIX},
    value::{InternalValue, UserKey, UserValue, ValueType},
};
