// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The metadata catalog and the tree's persistent record.
//!
//! Each tree owns exactly one record in the catalog, keyed by its URI.
//! The record is an opaque, deterministic text blob: the configuration
//! plus both chunk lists. It is re-read at open and rewritten inside
//! every roster-mutating critical section, so the catalog and the
//! in-memory roster never disagree across a crash.

use crate::{
    chunk::ChunkId,
    coding::DecodeError,
    config::{split_config_list, TreeConfig},
    Error, Result,
};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::RwLock;

/// A single key/value catalog read and written as opaque text.
pub trait MetadataStore: Send + Sync {
    /// Reads a record.
    fn read(&self, key: &str) -> Result<Option<String>>;

    /// Writes (or overwrites) a record.
    fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Removes a record; unknown keys are an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// All record keys, in deterministic order.
    fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory metadata catalog
#[derive(Default)]
pub struct MemoryMetadata {
    records: RwLock<BTreeMap<String, String>>,
}

impl MemoryMetadata {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadata {
    fn read(&self, key: &str) -> Result<Option<String>> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let records = self.records.read().expect("lock is poisoned");
        Ok(records.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        self.records
            .write()
            .expect("lock is poisoned")
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut records = self.records.write().expect("lock is poisoned");
        records
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    fn keys(&self) -> Result<Vec<String>> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let records = self.records.read().expect("lock is poisoned");
        Ok(records.keys().cloned().collect())
    }
}

/// Snapshot of one chunk as it appears in the metadata record
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChunkMeta {
    pub id: ChunkId,
    pub uri: String,
    pub bloom_uri: Option<String>,
    pub generation: u32,
    pub count: u64,
    pub on_disk: bool,
    pub has_bloom: bool,
}

/// Decoded form of a tree's metadata record
#[derive(Clone, Debug)]
pub struct MetaRecord {
    pub config: TreeConfig,
    pub last: ChunkId,
    pub chunks: Vec<ChunkMeta>,
    pub old_chunks: Vec<ChunkMeta>,
}

impl MetaRecord {
    /// Encodes the record into its text form. Field order is fixed so
    /// identical state always produces identical text.
    #[must_use]
    pub fn encode(&self) -> String {
        let c = &self.config;

        let mut out = format!(
            "key_format={},value_format={},lsm_chunk_size={},lsm_merge_max={},\
             lsm_bloom={},lsm_bloom_newest={},lsm_bloom_oldest={},\
             lsm_bloom_bit_count={},lsm_bloom_hash_count={},lsm_bloom_config=({}),\
             leaf_page_max={},last={}",
            c.key_format,
            c.value_format,
            c.chunk_size,
            c.merge_max,
            u8::from(c.bloom.merged),
            u8::from(c.bloom.newest),
            u8::from(c.bloom.oldest),
            c.bloom_bit_count,
            c.bloom_hash_count,
            c.bloom_config,
            c.leaf_page_max,
            self.last,
        );

        for (name, list) in [("chunks", &self.chunks), ("old_chunks", &self.old_chunks)] {
            let _ = write!(out, ",{name}=(");
            for (i, chunk) in list.iter().enumerate() {
                let _ = write!(
                    out,
                    "{}{}",
                    if i > 0 { "," } else { "" },
                    encode_chunk(chunk)
                );
            }
            out.push(')');
        }

        out
    }

    /// Decodes a record from its text form.
    pub fn decode(text: &str) -> Result<Self> {
        let mut config = TreeConfig::default();
        let mut last = 0;
        let mut chunks = vec![];
        let mut old_chunks = vec![];

        for (key, value) in split_config_list(text)? {
            match key.as_str() {
                "last" => {
                    last = value.parse().map_err(|_| malformed("last", &value))?;
                }
                "chunks" => chunks = decode_chunk_list(&value)?,
                "old_chunks" => old_chunks = decode_chunk_list(&value)?,
                _ => config.apply(&format!("{key}={value}"))?,
            }
        }

        config.validate()?;
        config.rebuild_file_config();

        Ok(Self {
            config,
            last,
            chunks,
            old_chunks,
        })
    }

    /// Every URI the record references, chunk stores and Bloom stores
    /// alike.
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        let mut uris = vec![];
        for chunk in self.chunks.iter().chain(self.old_chunks.iter()) {
            uris.push(chunk.uri.clone());
            if let Some(bloom_uri) = &chunk.bloom_uri {
                uris.push(bloom_uri.clone());
            }
        }
        uris
    }
}

fn encode_chunk(chunk: &ChunkMeta) -> String {
    let mut flags = vec![];
    if chunk.on_disk {
        flags.push("on_disk");
    }
    if chunk.has_bloom {
        flags.push("bloom");
    }

    format!(
        "(id={},uri=\"{}\",bloom_uri=\"{}\",generation={},count={},flags=({}))",
        chunk.id,
        chunk.uri,
        chunk.bloom_uri.as_deref().unwrap_or(""),
        chunk.generation,
        chunk.count,
        flags.join(","),
    )
}

fn decode_chunk_list(group: &str) -> Result<Vec<ChunkMeta>> {
    let inner = strip_parens(group)?;

    split_config_list(inner)?
        .into_iter()
        .map(|(entry, _)| decode_chunk(&entry))
        .collect()
}

fn decode_chunk(entry: &str) -> Result<ChunkMeta> {
    let inner = strip_parens(entry)?;

    let mut chunk = ChunkMeta {
        id: 0,
        uri: String::new(),
        bloom_uri: None,
        generation: 0,
        count: 0,
        on_disk: false,
        has_bloom: false,
    };

    for (key, value) in split_config_list(inner)? {
        match key.as_str() {
            "id" => chunk.id = value.parse().map_err(|_| malformed("id", &value))?,
            "uri" => chunk.uri = value,
            "bloom_uri" => {
                if !value.is_empty() {
                    chunk.bloom_uri = Some(value);
                }
            }
            "generation" => {
                chunk.generation = value.parse().map_err(|_| malformed("generation", &value))?;
            }
            "count" => chunk.count = value.parse().map_err(|_| malformed("count", &value))?,
            "flags" => {
                let flags = strip_parens(&value)?;
                for (flag, _) in split_config_list(flags)? {
                    match flag.as_str() {
                        "on_disk" => chunk.on_disk = true,
                        "bloom" => chunk.has_bloom = true,
                        _ => return Err(malformed("flags", &flag)),
                    }
                }
            }
            _ => return Err(malformed("chunk entry", &key)),
        }
    }

    if chunk.uri.is_empty() {
        return Err(malformed("chunk entry", "missing uri"));
    }

    Ok(chunk)
}

fn strip_parens(group: &str) -> Result<&str> {
    group
        .strip_prefix('(')
        .and_then(|g| g.strip_suffix(')'))
        .ok_or_else(|| malformed("group", group))
}

fn malformed(what: &str, detail: &str) -> Error {
    Error::Corrupted(DecodeError::Malformed(format!("{what}: {detail}")))
}
