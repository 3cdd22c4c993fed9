// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod bit_array;

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use bit_array::BitArray;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Persistent filter header
const MAGIC_BYTES: [u8; 4] = *b"LSBF";

/// Two hashes that are used for double hashing
pub type CompositeHash = (u64, u64);

/// A standard bloom filter
///
/// A probabilistic absence oracle: `contains` may report false
/// positives, never false negatives. Bit count and hash function count
/// come straight from the tree configuration (`lsm_bloom_bit_count`,
/// `lsm_bloom_hash_count`).
///
/// The filter uses double hashing instead of `k` independent hash
/// functions.
#[derive(Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub struct BloomFilter {
    /// Raw bytes exposed as bit array
    inner: BitArray,

    /// Bit count
    m: usize,

    /// Number of hash functions
    k: usize,
}

impl Encode for BloomFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;
        writer.write_u64::<BigEndian>(self.m as u64)?;
        writer.write_u64::<BigEndian>(self.k as u64)?;
        writer.write_all(self.inner.bytes())?;
        Ok(())
    }
}

impl Decode for BloomFilter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("BloomFilter"));
        }

        #[allow(clippy::cast_possible_truncation)]
        let m = reader.read_u64::<BigEndian>()? as usize;
        #[allow(clippy::cast_possible_truncation)]
        let k = reader.read_u64::<BigEndian>()? as usize;

        let mut bytes = vec![0; m.div_ceil(8)];
        reader.read_exact(&mut bytes)?;

        Ok(Self {
            inner: BitArray::from_bytes(bytes.into_boxed_slice()),
            m,
            k,
        })
    }
}

impl BloomFilter {
    /// Constructs a bloom filter sized for `n` items with `bits_per_key`
    /// bits per key and `hash_count` hash functions per lookup.
    ///
    /// # Panics
    ///
    /// Panics if any parameter is zero.
    #[must_use]
    pub fn with_params(n: usize, bits_per_key: u32, hash_count: u32) -> Self {
        assert!(n > 0);
        assert!(bits_per_key > 0);
        assert!(hash_count > 0);

        let bytes = (n * bits_per_key as usize).div_ceil(8);

        Self {
            inner: BitArray::with_capacity(bytes),
            m: bytes * 8,
            k: hash_count as usize,
        }
    }

    /// Size of the filter in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the filter holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Amount of hashes used per lookup.
    #[must_use]
    pub fn hash_fn_count(&self) -> usize {
        self.k
    }

    /// Returns `true` if the hash may be contained.
    ///
    /// Will never have a false negative.
    #[must_use]
    pub fn contains_hash(&self, (mut h1, mut h2): CompositeHash) -> bool {
        for i in 0..(self.k as u64) {
            let idx = h1 % (self.m as u64);

            #[allow(clippy::cast_possible_truncation)]
            if !self.inner.get(idx as usize) {
                return false;
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_add(i);
        }

        true
    }

    /// Returns `true` if the item may be contained.
    ///
    /// Will never have a false negative.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.contains_hash(Self::get_hash(key))
    }

    /// Adds the key to the filter.
    pub fn insert(&mut self, key: &[u8]) {
        self.insert_hash(Self::get_hash(key));
    }

    /// Adds the key hash to the filter.
    pub fn insert_hash(&mut self, (mut h1, mut h2): CompositeHash) {
        for i in 0..(self.k as u64) {
            let idx = h1 % (self.m as u64);

            #[allow(clippy::cast_possible_truncation)]
            self.inner.enable(idx as usize);

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_add(i);
        }
    }

    /// Gets the hash of a key.
    #[must_use]
    pub fn get_hash(key: &[u8]) -> CompositeHash {
        let h0 = xxhash_rust::xxh3::xxh3_128(key);
        let h1 = (h0 >> 64) as u64;
        let h2 = h0 as u64;
        (h1, h2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::{Decode, Encode};
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn bloom_basic() {
        let mut filter = BloomFilter::with_params(10, 10, 4);

        for key in [
            b"item0" as &[u8],
            b"item1",
            b"item2",
            b"item3",
            b"item4",
            b"item5",
        ] {
            assert!(!filter.contains(key));
            filter.insert(key);
            assert!(filter.contains(key));

            assert!(!filter.contains(b"kjsdefsdlkfjdsfsdfk"));
        }
    }

    #[test]
    fn bloom_serde_round_trip() -> crate::Result<()> {
        let mut filter = BloomFilter::with_params(10, 8, 4);

        let keys: &[&[u8]] = &[
            b"item0", b"item1", b"item2", b"item3", b"item4", b"item5", b"item6", b"item7",
            b"item8", b"item9",
        ];

        for key in keys {
            filter.insert_hash(BloomFilter::get_hash(key));
        }

        let bytes = filter.encode_into_vec().map_err(|e| match e {
            crate::coding::EncodeError::Io(e) => crate::Error::Io(e),
        })?;
        let copy = BloomFilter::decode_from(&mut Cursor::new(bytes))?;

        assert_eq!(filter, copy);

        for key in keys {
            assert!(copy.contains(key));
        }
        assert!(!copy.contains(b"asdasads"));
        assert!(!copy.contains(b"item10"));
        assert!(!copy.contains(b"cxycxycxy"));

        Ok(())
    }

    #[test]
    fn bloom_decode_rejects_bad_magic() {
        let result = BloomFilter::decode_from(&mut Cursor::new(b"NOPE\0\0\0\0".to_vec()));
        assert!(result.is_err());
    }

    #[test]
    fn bloom_fpr_within_bounds() {
        let item_count = 10_000;

        // 10 bits per key with 4 hashes lands well below 2% false positives
        let mut filter = BloomFilter::with_params(item_count, 10, 4);

        for key in (0..item_count).map(|_| nanoid::nanoid!()) {
            let key = key.as_bytes();
            filter.insert_hash(BloomFilter::get_hash(key));
            assert!(filter.contains(key));
        }

        let mut false_positives = 0;

        for key in (0..item_count).map(|_| nanoid::nanoid!()) {
            if filter.contains(key.as_bytes()) {
                false_positives += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let fpr = false_positives as f32 / item_count as f32;
        assert!(fpr < 0.02, "fpr too high: {fpr}");
    }
}
