// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Variable-width column serialization (the packing service).
//!
//! A format string describes a sequence of typed columns, e.g. `"iiS"`
//! or `"2qu"`. Digits repeat the following type character. Signed and
//! unsigned integers are varint-encoded, strings are NUL-terminated,
//! and byte items carry a varint length prefix unless they sit in the
//! final column, where they run to the end of the buffer.

use crate::{Error, Result};
use varint_rs::{VarintReader, VarintWriter};

/// Column class of one format slot
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PackType {
    /// `b h i l q` - signed integer
    Int,

    /// `B H I L Q r t` - unsigned integer
    UInt,

    /// `S` - NUL-terminated string
    Str,

    /// `u` - raw byte item
    Item,
}

/// One packed column value
#[derive(Clone, Debug, PartialEq)]
pub enum PackValue {
    /// Signed integer
    Int(i64),

    /// Unsigned integer
    UInt(u64),

    /// String
    Str(String),

    /// Raw byte item
    Item(Vec<u8>),
}

impl PackValue {
    /// The typed zero value, appended when a projection skips over an
    /// exhausted buffer.
    #[must_use]
    pub fn zero(ty: PackType) -> Self {
        match ty {
            PackType::Int => Self::Int(0),
            PackType::UInt => Self::UInt(0),
            PackType::Str => Self::Str(String::new()),
            PackType::Item => Self::Item(vec![]),
        }
    }

    /// The slot class this value belongs to.
    #[must_use]
    pub fn pack_type(&self) -> PackType {
        match self {
            Self::Int(_) => PackType::Int,
            Self::UInt(_) => PackType::UInt,
            Self::Str(_) => PackType::Str,
            Self::Item(_) => PackType::Item,
        }
    }
}

/// Iterator over the column slots of a format string
pub struct Packer {
    slots: Vec<PackType>,
    idx: usize,
}

impl Packer {
    /// Parses a format string.
    pub fn new(format: &str) -> Result<Self> {
        let mut slots = vec![];
        let mut repeat = 0usize;

        for c in format.chars() {
            if let Some(digit) = c.to_digit(10) {
                repeat = repeat * 10 + digit as usize;
                continue;
            }

            let ty = match c {
                'b' | 'h' | 'i' | 'l' | 'q' => PackType::Int,
                'B' | 'H' | 'I' | 'L' | 'Q' | 'r' | 't' => PackType::UInt,
                'S' => PackType::Str,
                'u' => PackType::Item,
                _ => {
                    return Err(Error::Invalid(format!(
                        "unknown pack format character: {c}"
                    )));
                }
            };

            for _ in 0..repeat.max(1) {
                slots.push(ty);
            }
            repeat = 0;
        }

        if repeat != 0 {
            return Err(Error::Invalid(format!(
                "trailing repeat count in pack format: {format}"
            )));
        }

        Ok(Self { slots, idx: 0 })
    }

    /// Advances to the next column slot.
    pub fn pack_next(&mut self) -> Result<PackSlot> {
        let ty = self
            .slots
            .get(self.idx)
            .copied()
            .ok_or_else(|| Error::Invalid("pack format exhausted".into()))?;

        self.idx += 1;

        Ok(PackSlot {
            ty,
            last: self.idx == self.slots.len(),
        })
    }

    /// Number of slots in the format.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// `true` for an empty format.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// One column slot: its class, and whether it is the final column
/// (byte items in the final column run to the end of the buffer)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PackSlot {
    pub ty: PackType,
    pub last: bool,
}

/// Encoded size of a value in a given slot.
#[must_use]
pub fn pack_size(value: &PackValue, slot: PackSlot) -> usize {
    let mut buf = vec![];
    // Encoding into a scratch vector cannot fail
    let _ = pack_write(value, slot, &mut buf);
    buf.len()
}

/// Appends the encoded form of `value` to `out`.
pub fn pack_write(value: &PackValue, slot: PackSlot, out: &mut Vec<u8>) -> Result<()> {
    if value.pack_type() != slot.ty {
        return Err(Error::Invalid(format!(
            "pack type mismatch: {:?} into {:?} slot",
            value.pack_type(),
            slot.ty
        )));
    }

    match value {
        PackValue::Int(v) => out.write_i64_varint(*v)?,
        PackValue::UInt(v) => out.write_u64_varint(*v)?,
        PackValue::Str(s) => {
            if s.as_bytes().contains(&0) {
                return Err(Error::Invalid("string column contains NUL".into()));
            }
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        PackValue::Item(bytes) => {
            if !slot.last {
                out.write_u64_varint(bytes.len() as u64)?;
            }
            out.extend_from_slice(bytes);
        }
    }

    Ok(())
}

/// Reads one value from the front of `input`, advancing it.
pub fn unpack_read(slot: PackSlot, input: &mut &[u8]) -> Result<PackValue> {
    Ok(match slot.ty {
        PackType::Int => PackValue::Int(input.read_i64_varint()?),
        PackType::UInt => PackValue::UInt(input.read_u64_varint()?),
        PackType::Str => {
            let nul = input
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::Invalid("unterminated string column".into()))?;

            let (head, tail) = input.split_at(nul + 1);
            let s = std::str::from_utf8(head.get(..nul).unwrap_or_default())
                .map_err(|_| Error::Invalid("string column is not UTF-8".into()))?
                .to_owned();

            *input = tail;
            PackValue::Str(s)
        }
        PackType::Item => {
            let len = if slot.last {
                input.len()
            } else {
                #[allow(clippy::cast_possible_truncation)]
                let len = input.read_u64_varint()? as usize;
                len
            };

            if input.len() < len {
                return Err(Error::Invalid("byte item overruns buffer".into()));
            }

            let (head, tail) = input.split_at(len);
            let bytes = head.to_vec();
            *input = tail;
            PackValue::Item(bytes)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn roundtrip(format: &str, values: &[PackValue]) -> Vec<PackValue> {
        let mut packer = Packer::new(format).unwrap();
        let mut buf = vec![];

        for value in values {
            let slot = packer.pack_next().unwrap();
            pack_write(value, slot, &mut buf).unwrap();
        }

        let mut packer = Packer::new(format).unwrap();
        let mut input = &buf[..];
        let mut out = vec![];

        for _ in values {
            let slot = packer.pack_next().unwrap();
            out.push(unpack_read(slot, &mut input).unwrap());
        }
        assert!(input.is_empty());

        out
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn pack_mixed_columns() {
        let values = vec![
            PackValue::Int(-42),
            PackValue::UInt(7),
            PackValue::Str("hello".into()),
            PackValue::Item(b"raw \0 bytes".to_vec()),
        ];

        assert_eq!(values, roundtrip("iQSu", &values));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn pack_repeat_counts() {
        let mut packer = Packer::new("3iS").unwrap();
        assert_eq!(4, packer.len());

        assert_eq!(PackType::Int, packer.pack_next().unwrap().ty);
        assert_eq!(PackType::Int, packer.pack_next().unwrap().ty);
        assert_eq!(PackType::Int, packer.pack_next().unwrap().ty);

        let last = packer.pack_next().unwrap();
        assert_eq!(PackType::Str, last.ty);
        assert!(last.last);

        assert!(packer.pack_next().is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn pack_mid_buffer_item_is_length_prefixed() {
        let values = vec![
            PackValue::Item(b"first".to_vec()),
            PackValue::Item(b"second".to_vec()),
        ];

        assert_eq!(values, roundtrip("2u", &values));
    }

    #[test]
    fn pack_rejects_unknown_format() {
        assert!(Packer::new("iZ").is_err());
        assert!(Packer::new("3").is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn pack_type_mismatch() {
        let mut packer = Packer::new("i").unwrap();
        let slot = packer.pack_next().unwrap();

        let mut buf = vec![];
        assert!(pack_write(&PackValue::UInt(1), slot, &mut buf).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn pack_size_matches_write() {
        let mut packer = Packer::new("qS").unwrap();

        let slot = packer.pack_next().unwrap();
        let value = PackValue::Int(-123_456);
        let mut buf = vec![];
        pack_write(&value, slot, &mut buf).unwrap();
        assert_eq!(buf.len(), pack_size(&value, slot));

        let slot = packer.pack_next().unwrap();
        let value = PackValue::Str("ab".into());
        assert_eq!(3, pack_size(&value, slot));
    }
}
