// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};

pub const DEFAULT_KEY_FORMAT: &str = "u";
pub const DEFAULT_VALUE_FORMAT: &str = "u";
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1_024 * 1_024;
pub const DEFAULT_MERGE_MAX: u32 = 15;
pub const DEFAULT_BLOOM_BIT_COUNT: u32 = 8;
pub const DEFAULT_BLOOM_HASH_COUNT: u32 = 4;
pub const DEFAULT_LEAF_PAGE_MAX: u64 = 1_024 * 1_024;

/// Bloom filter creation policy
///
/// `merged` covers merge outputs, `newest` additionally covers each
/// switched-out primary, `oldest` covers the tail chunk of the stack.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BloomPolicy {
    /// Build filters for merge output chunks
    pub merged: bool,

    /// Build a filter for each sealed primary
    pub newest: bool,

    /// Build a filter for the tail chunk of the stack
    pub oldest: bool,
}

impl BloomPolicy {
    /// Returns `true` if no filters are ever built.
    #[must_use]
    pub fn is_off(&self) -> bool {
        !self.merged && !self.newest && !self.oldest
    }
}

/// Tree configuration, parsed from a `key=value` configuration string
#[derive(Clone, Debug)]
pub struct TreeConfig {
    /// Row-store key format (must not be the column-store format `r`)
    pub key_format: String,

    /// Row-store value format
    pub value_format: String,

    /// Target bytes per chunk before a switch
    pub chunk_size: u64,

    /// Maximum inputs per merge and scheduler fan-out
    pub merge_max: u32,

    /// Bloom creation policy
    pub bloom: BloomPolicy,

    /// Bits per key in Bloom filters
    pub bloom_bit_count: u32,

    /// Hash functions per Bloom filter
    pub bloom_hash_count: u32,

    /// Opaque extra configuration handed to the Bloom builder
    pub bloom_config: String,

    /// Maximum leaf page size of the backing stores, used by the
    /// cache sanity check at open
    pub leaf_page_max: u64,

    /// Configuration string passed through to the schema service when
    /// chunk stores are created
    pub file_config: String,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            key_format: DEFAULT_KEY_FORMAT.into(),
            value_format: DEFAULT_VALUE_FORMAT.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            merge_max: DEFAULT_MERGE_MAX,
            bloom: BloomPolicy {
                merged: true,
                newest: false,
                oldest: false,
            },
            bloom_bit_count: DEFAULT_BLOOM_BIT_COUNT,
            bloom_hash_count: DEFAULT_BLOOM_HASH_COUNT,
            bloom_config: String::new(),
            leaf_page_max: DEFAULT_LEAF_PAGE_MAX,
            file_config: String::new(),
        }
    }
}

impl TreeConfig {
    /// Parses a configuration string on top of the defaults.
    ///
    /// Recognized keys are enumerated; anything else is rejected.
    pub fn parse(config: &str) -> Result<Self> {
        let mut parsed = Self::default();
        parsed.apply(config)?;
        parsed.validate()?;
        parsed.rebuild_file_config();

        Ok(parsed)
    }

    /// Derives the configuration handed to the schema service when
    /// chunk stores are created. Chunks always store raw bytes.
    pub(crate) fn rebuild_file_config(&mut self) {
        self.file_config = format!(
            "leaf_page_max={},key_format=u,value_format=u",
            self.leaf_page_max
        );
    }

    pub(crate) fn apply(&mut self, config: &str) -> Result<()> {
        for (key, value) in split_config_list(config)? {
            match key.as_str() {
                "key_format" => self.key_format = value,
                "value_format" => self.value_format = value,
                "lsm_chunk_size" => self.chunk_size = parse_byte_size(&key, &value)?,
                "lsm_merge_max" => {
                    self.merge_max = u32::try_from(parse_byte_size(&key, &value)?)
                        .map_err(|_| Error::Invalid(format!("{key} out of range")))?;
                }
                "lsm_bloom" => self.bloom.merged = parse_bool(&value),
                "lsm_bloom_newest" => self.bloom.newest = parse_bool(&value),
                "lsm_bloom_oldest" => self.bloom.oldest = parse_bool(&value),
                "lsm_bloom_bit_count" => {
                    self.bloom_bit_count = u32::try_from(parse_byte_size(&key, &value)?)
                        .map_err(|_| Error::Invalid(format!("{key} out of range")))?;
                }
                "lsm_bloom_hash_count" => {
                    self.bloom_hash_count = u32::try_from(parse_byte_size(&key, &value)?)
                        .map_err(|_| Error::Invalid(format!("{key} out of range")))?;
                }
                "lsm_bloom_config" => self.bloom_config = strip_group(&value).into(),
                "leaf_page_max" => self.leaf_page_max = parse_byte_size(&key, &value)?,
                _ => {
                    return Err(Error::Invalid(format!(
                        "unknown configuration key: {key}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.key_format == "r" {
            return Err(Error::Invalid(
                "LSM trees cannot be configured as column stores".into(),
            ));
        }

        if !self.bloom.merged && (self.bloom.newest || self.bloom.oldest) {
            return Err(Error::Invalid(
                "Bloom filters can only be created on newest and oldest chunks \
                 if bloom filters are enabled"
                    .into(),
            ));
        }

        if self.chunk_size == 0 {
            return Err(Error::Invalid("lsm_chunk_size may not be zero".into()));
        }
        if self.merge_max < 2 {
            return Err(Error::Invalid("lsm_merge_max must be at least 2".into()));
        }

        Ok(())
    }

    /// Minimum cache size this configuration requires: three chunks,
    /// plus one leaf page for each participant in a merge.
    #[must_use]
    pub fn required_cache_size(&self) -> u64 {
        3 * self.chunk_size + u64::from(self.merge_max) * self.leaf_page_max
    }
}

fn parse_bool(value: &str) -> bool {
    !matches!(value, "" | "0" | "false")
}

fn parse_byte_size(key: &str, value: &str) -> Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);

    let n: u64 = digits
        .parse()
        .map_err(|_| Error::Invalid(format!("{key}: expected a number, got {value:?}")))?;

    let multiplier = match suffix.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" | "kb" => 1_024,
        "m" | "mb" => 1_024 * 1_024,
        "g" | "gb" => 1_024 * 1_024 * 1_024,
        _ => {
            return Err(Error::Invalid(format!(
                "{key}: unknown size suffix {suffix:?}"
            )));
        }
    };

    Ok(n * multiplier)
}

fn strip_group(value: &str) -> &str {
    value
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .unwrap_or(value)
}

/// Splits a `key=value,key=(nested,list)` configuration string into
/// top-level pairs. Parentheses nest, double quotes protect commas.
pub(crate) fn split_config_list(config: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = vec![];
    let mut depth = 0u32;
    let mut in_quotes = false;
    let mut item = String::new();

    let mut flush = |item: &mut String| -> Result<()> {
        let entry = item.trim();
        if !entry.is_empty() {
            // Only a `=` before any nesting separates key from value;
            // a parenthesized group is an entry of its own
            let split = entry
                .find('=')
                .filter(|&i| entry.find('(').is_none_or(|p| i < p));

            let (key, value) = match split {
                Some(i) => {
                    let (k, v) = entry.split_at(i);
                    let v = v.strip_prefix('=').unwrap_or(v);
                    (k.trim().to_owned(), v.trim().trim_matches('"').to_owned())
                }
                // A bare key is boolean shorthand
                None => (entry.to_owned(), "true".to_owned()),
            };
            pairs.push((key, value));
        }
        item.clear();
        Ok(())
    };

    for c in config.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                item.push(c);
            }
            '(' if !in_quotes => {
                depth += 1;
                item.push(c);
            }
            ')' if !in_quotes => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::Invalid("unbalanced parentheses".into()))?;
                item.push(c);
            }
            ',' if depth == 0 && !in_quotes => flush(&mut item)?,
            _ => item.push(c),
        }
    }

    if depth != 0 || in_quotes {
        return Err(Error::Invalid("unbalanced configuration string".into()));
    }
    flush(&mut item)?;

    Ok(pairs)
}
