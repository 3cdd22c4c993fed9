// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
#[allow(clippy::module_name_repetitions)]
pub type UserValue = Slice;

/// Value type (regular value or tombstone)
///
/// There is no per-record sequence number: recency across chunks is
/// defined by chunk ID order, and within a chunk the backing store
/// keeps at most one record per key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum ValueType {
    /// Existing value
    Value,

    /// Deleted value
    Tombstone,
}

impl TryFrom<u8> for ValueType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Value),
            1 => Ok(Self::Tombstone),
            _ => Err(()),
        }
    }
}

impl From<ValueType> for u8 {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Value => 0,
            ValueType::Tombstone => 1,
        }
    }
}

/// Internal representation of KV pairs
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Eq, PartialEq)]
pub struct InternalValue {
    /// User-defined key - an arbitrary byte array
    pub key: UserKey,

    /// User-defined value - an arbitrary byte array
    pub value: UserValue,

    /// Tombstone marker
    pub value_type: ValueType,
}

impl InternalValue {
    /// Creates a new value.
    ///
    /// # Panics
    ///
    /// Panics if the key is empty.
    pub fn new<K: Into<UserKey>, V: Into<UserValue>>(key: K, value: V) -> Self {
        let key = key.into();
        assert!(!key.is_empty(), "key may not be empty");

        Self {
            key,
            value: value.into(),
            value_type: ValueType::Value,
        }
    }

    /// Creates a new tombstone.
    ///
    /// # Panics
    ///
    /// Panics if the key is empty.
    pub fn new_tombstone<K: Into<UserKey>>(key: K) -> Self {
        let key = key.into();
        assert!(!key.is_empty(), "key may not be empty");

        Self {
            key,
            value: UserValue::new(b""),
            value_type: ValueType::Tombstone,
        }
    }

    /// Returns `true` if the record is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value_type == ValueType::Tombstone
    }

    /// Approximate heap footprint of the record, used for
    /// chunk size accounting.
    #[must_use]
    pub fn weight(&self) -> u64 {
        (self.key.len() + self.value.len()) as u64
    }
}

impl std::fmt::Debug for InternalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{} => {:?}",
            self.key,
            match self.value_type {
                ValueType::Value => "V",
                ValueType::Tombstone => "T",
            },
            self.value,
        )
    }
}
