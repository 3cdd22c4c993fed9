// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The projection layer: moves packed columns between an application
//! argument vector, a raw buffer, and a set of dependent cursors.
//!
//! A plan is a string of `(count, op)` pairs. `k`/`v` select a
//! cursor's key or value buffer (the count is the cursor index),
//! `n` consumes columns, `s` skips them, `r` reuses the most recent
//! column without consuming another argument; for these the count is
//! a repeat count defaulting to 1. Skipping past the end of a buffer
//! appends a typed zero value, so out-of-order plans still produce
//! well-formed rows.

use crate::{
    pack::{pack_write, unpack_read, PackSlot, PackType, PackValue, Packer},
    Error, Result,
};

/// One dependent cursor of a projection: a packed key and value
/// buffer, with their formats
#[derive(Debug, Default)]
pub struct ProjectionCursor {
    pub key_format: String,
    pub value_format: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl ProjectionCursor {
    /// Creates an empty cursor with the given formats.
    #[must_use]
    pub fn new(key_format: &str, value_format: &str) -> Self {
        Self {
            key_format: key_format.to_owned(),
            value_format: value_format.to_owned(),
            key: vec![],
            value: vec![],
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Part {
    Key,
    Value,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum PlanOp {
    /// Switch to a cursor's key buffer (operand: cursor index)
    Key(usize),

    /// Switch to a cursor's value buffer (operand: cursor index)
    Value(usize),

    /// Consume columns (operand: repeat count)
    Next(usize),

    /// Step over columns (operand: repeat count)
    Skip(usize),

    /// Rewrite using the most recent column (operand: repeat count)
    Reuse(usize),
}

fn parse_plan(plan: &str) -> Result<Vec<PlanOp>> {
    let mut ops = vec![];
    let mut arg = 0usize;
    let mut has_arg = false;

    for c in plan.chars() {
        if let Some(digit) = c.to_digit(10) {
            arg = arg * 10 + digit as usize;
            has_arg = true;
            continue;
        }

        // A missing count means a count of one
        let count = if has_arg { arg } else { 1 };

        ops.push(match c {
            'k' => PlanOp::Key(if has_arg { arg } else { 0 }),
            'v' => PlanOp::Value(if has_arg { arg } else { 0 }),
            'n' => PlanOp::Next(count),
            's' => PlanOp::Skip(count),
            'r' => PlanOp::Reuse(count),
            _ => {
                return Err(Error::Invalid(format!(
                    "unexpected projection plan: {c}"
                )));
            }
        });

        arg = 0;
        has_arg = false;
    }

    if has_arg {
        return Err(Error::Invalid("trailing count in projection plan".into()));
    }

    Ok(ops)
}

/// Position state while a plan walks one cursor buffer
struct Target {
    cursor: usize,
    part: Part,
    p: usize,
    packer: Packer,
}

impl Target {
    fn new(cursors: &[ProjectionCursor], cursor: usize, part: Part) -> Result<Self> {
        let entry = cursors
            .get(cursor)
            .ok_or_else(|| Error::Invalid(format!("projection cursor {cursor} out of range")))?;

        let format = match part {
            Part::Key => &entry.key_format,
            Part::Value => &entry.value_format,
        };

        Ok(Self {
            cursor,
            part,
            p: 0,
            packer: Packer::new(format)?,
        })
    }
}

/// The most recent column seen by the plan: slot and value. Survives
/// target switches, which is what lets `r` copy a column from one
/// cursor into another.
#[derive(Default)]
struct LastColumn {
    slot: Option<PackSlot>,
    value: Option<PackValue>,
}

impl LastColumn {
    fn set(&mut self, slot: PackSlot, value: PackValue) {
        self.slot = Some(slot);
        self.value = Some(value);
    }

    fn slot(&self) -> Result<PackSlot> {
        self.slot
            .ok_or_else(|| Error::Invalid("reuse before any column".into()))
    }

    fn value(&self) -> Result<PackValue> {
        self.value
            .clone()
            .ok_or_else(|| Error::Invalid("reuse before any column".into()))
    }
}

fn buf_mut<'a>(cursors: &'a mut [ProjectionCursor], target: &Target) -> Result<&'a mut Vec<u8>> {
    let entry = cursors.get_mut(target.cursor).ok_or_else(|| {
        Error::Invalid(format!("projection cursor {} out of range", target.cursor))
    })?;

    Ok(match target.part {
        Part::Key => &mut entry.key,
        Part::Value => &mut entry.value,
    })
}

fn buf_ref<'a>(cursors: &'a [ProjectionCursor], target: &Target) -> Result<&'a Vec<u8>> {
    let entry = cursors.get(target.cursor).ok_or_else(|| {
        Error::Invalid(format!("projection cursor {} out of range", target.cursor))
    })?;

    Ok(match target.part {
        Part::Key => &entry.key,
        Part::Value => &entry.value,
    })
}

/// Length of the encoded item at `buf[p..]`.
fn item_len(buf: &[u8], p: usize, slot: PackSlot) -> Result<usize> {
    let mut tail = buf.get(p..).unwrap_or_default();
    let before = tail.len();
    unpack_read(slot, &mut tail)?;
    Ok(before - tail.len())
}

/// Reads the item at the target position and advances past it.
fn take_item(
    cursors: &[ProjectionCursor],
    target: &mut Target,
    slot: PackSlot,
) -> Result<PackValue> {
    let buf = buf_ref(cursors, target)?;

    let mut tail = buf.get(target.p..).unwrap_or_default();
    let before = tail.len();
    let value = unpack_read(slot, &mut tail)?;
    target.p += before - tail.len();

    Ok(value)
}

/// Replaces the item at the target position with `value`, growing or
/// shrinking the buffer as needed, and advances past it.
fn overwrite(
    cursors: &mut [ProjectionCursor],
    target: &mut Target,
    slot: PackSlot,
    value: &PackValue,
) -> Result<()> {
    let buf = buf_mut(cursors, target)?;

    let old_len = if target.p < buf.len() {
        item_len(buf, target.p, slot)?
    } else {
        0
    };

    let mut encoded = vec![];
    pack_write(value, slot, &mut encoded)?;

    let new_len = encoded.len();
    buf.splice(target.p..target.p + old_len, encoded);
    target.p += new_len;

    Ok(())
}

/// Steps over the item at the target position; stepping over the end
/// of the buffer appends a typed zero value instead. Returns the
/// stepped-over value.
fn skip_item(
    cursors: &mut [ProjectionCursor],
    target: &mut Target,
    slot: PackSlot,
) -> Result<PackValue> {
    let len = buf_ref(cursors, target)?.len();

    if target.p >= len {
        // Inserting out-of-order reached the end of the data; append
        // so the buffer stays in the correct format
        let zero = PackValue::zero(slot.ty);
        let mut encoded = vec![];
        pack_write(&zero, slot, &mut encoded)?;

        let buf = buf_mut(cursors, target)?;
        buf.extend_from_slice(&encoded);
        target.p = buf.len();

        Ok(zero)
    } else {
        take_item(cursors, target, slot)
    }
}

/// Coerces a column value into another slot class. Numeric classes
/// convert into each other; everything else must match.
fn coerce(value: PackValue, ty: PackType) -> Result<PackValue> {
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    Ok(match (value, ty) {
        (v @ PackValue::Int(_), PackType::Int)
        | (v @ PackValue::UInt(_), PackType::UInt)
        | (v @ PackValue::Str(_), PackType::Str)
        | (v @ PackValue::Item(_), PackType::Item) => v,
        (PackValue::Int(v), PackType::UInt) => PackValue::UInt(v as u64),
        (PackValue::UInt(v), PackType::Int) => PackValue::Int(v as i64),
        (v, ty) => {
            return Err(Error::Invalid(format!(
                "cannot project {:?} column into {ty:?} slot",
                v.pack_type()
            )));
        }
    })
}

fn require<'a>(target: &'a mut Option<Target>) -> Result<&'a mut Target> {
    target
        .as_mut()
        .ok_or_else(|| Error::Invalid("projection op before k/v".into()))
}

/// Reads columns from the application argument vector into the
/// dependent cursors.
pub fn project_in(cursors: &mut [ProjectionCursor], plan: &str, args: &[PackValue]) -> Result<()> {
    let plan = parse_plan(plan)?;

    // Reset any of the buffers we will be setting
    for op in &plan {
        match *op {
            PlanOp::Key(i) => {
                if let Some(entry) = cursors.get_mut(i) {
                    entry.key.clear();
                }
            }
            PlanOp::Value(i) => {
                if let Some(entry) = cursors.get_mut(i) {
                    entry.value.clear();
                }
            }
            _ => {}
        }
    }

    let mut args = args.iter();
    let mut target: Option<Target> = None;
    let mut last = LastColumn::default();

    for op in plan {
        match op {
            PlanOp::Key(i) => target = Some(Target::new(cursors, i, Part::Key)?),
            PlanOp::Value(i) => target = Some(Target::new(cursors, i, Part::Value)?),

            PlanOp::Next(count) => {
                let target = require(&mut target)?;

                for _ in 0..count {
                    let slot = target.packer.pack_next()?;
                    let value = args
                        .next()
                        .ok_or_else(|| Error::Invalid("projection argument missing".into()))?;

                    overwrite(cursors, target, slot, value)?;
                    last.set(slot, value.clone());
                }
            }

            PlanOp::Skip(count) => {
                let target = require(&mut target)?;

                for _ in 0..count {
                    let slot = target.packer.pack_next()?;
                    let value = skip_item(cursors, target, slot)?;
                    last.set(slot, value);
                }
            }

            PlanOp::Reuse(count) => {
                let target = require(&mut target)?;

                for _ in 0..count {
                    let slot = last.slot()?;

                    // Read the item we're about to overwrite; at the
                    // end of the buffer the previous column is copied
                    // in instead
                    let at_end = target.p >= buf_ref(cursors, target)?.len();
                    let value = if at_end {
                        last.value()?
                    } else {
                        let mut peek = buf_ref(cursors, target)?
                            .get(target.p..)
                            .unwrap_or_default();
                        unpack_read(slot, &mut peek)?
                    };

                    overwrite(cursors, target, slot, &value)?;
                    last.set(slot, value);
                }
            }
        }
    }

    Ok(())
}

/// Reads columns from the dependent cursors and returns them to the
/// application.
pub fn project_out(cursors: &[ProjectionCursor], plan: &str) -> Result<Vec<PackValue>> {
    let plan = parse_plan(plan)?;

    let mut out = vec![];
    let mut target: Option<Target> = None;

    for op in plan {
        match op {
            PlanOp::Key(i) => target = Some(Target::new(cursors, i, Part::Key)?),
            PlanOp::Value(i) => target = Some(Target::new(cursors, i, Part::Value)?),

            PlanOp::Next(count) | PlanOp::Skip(count) => {
                let push = matches!(op, PlanOp::Next(_));
                let target = require(&mut target)?;

                for _ in 0..count {
                    let slot = target.packer.pack_next()?;
                    let value = take_item(cursors, target, slot)?;

                    if push {
                        out.push(value);
                    }
                }
            }

            // Don't copy out the same value twice
            PlanOp::Reuse(_) => {}
        }
    }

    Ok(out)
}

/// Reads columns from a raw packed buffer into the dependent cursors.
pub fn project_slice(
    cursors: &mut [ProjectionCursor],
    plan: &str,
    key_only: bool,
    value_format: &str,
    value: &[u8],
) -> Result<()> {
    let plan = parse_plan(plan)?;

    let mut vpack = Packer::new(value_format)?;
    let mut vp = value;

    // Reset any of the buffers we will be setting
    for op in &plan {
        match *op {
            PlanOp::Key(i) => {
                if let Some(entry) = cursors.get_mut(i) {
                    entry.key.clear();
                }
            }
            PlanOp::Value(i) if !key_only => {
                if let Some(entry) = cursors.get_mut(i) {
                    entry.value.clear();
                }
            }
            _ => {}
        }
    }

    let mut skip = key_only;
    let mut target: Option<Target> = None;
    let mut last = LastColumn::default();

    for op in plan {
        match op {
            PlanOp::Key(i) => {
                skip = false;
                target = Some(Target::new(cursors, i, Part::Key)?);
            }
            PlanOp::Value(i) => {
                skip = key_only;
                if !skip {
                    target = Some(Target::new(cursors, i, Part::Value)?);
                }
            }

            PlanOp::Next(count) => {
                for _ in 0..count {
                    // The source column is consumed either way
                    let vslot = vpack.pack_next()?;
                    let vpv = unpack_read(vslot, &mut vp)?;

                    if skip {
                        continue;
                    }

                    let target = require(&mut target)?;
                    let slot = target.packer.pack_next()?;

                    // The source format may not exactly match the
                    // cursor's column class
                    let value = coerce(vpv, slot.ty)?;
                    overwrite(cursors, target, slot, &value)?;
                    last.set(slot, value);
                }
            }

            PlanOp::Skip(count) => {
                if skip {
                    continue;
                }

                let target = require(&mut target)?;

                for _ in 0..count {
                    let slot = target.packer.pack_next()?;
                    let value = skip_item(cursors, target, slot)?;
                    last.set(slot, value);
                }
            }

            PlanOp::Reuse(count) => {
                if skip {
                    continue;
                }

                let target = require(&mut target)?;

                for _ in 0..count {
                    let slot = last.slot()?;
                    let value = coerce(last.value()?, slot.ty)?;
                    overwrite(cursors, target, slot, &value)?;
                }
            }
        }
    }

    Ok(())
}

/// Builds one packed buffer from the columns read off the dependent
/// cursors.
pub fn project_merge(
    cursors: &[ProjectionCursor],
    plan: &str,
    value_format: &str,
) -> Result<Vec<u8>> {
    let plan = parse_plan(plan)?;

    let mut vpack = Packer::new(value_format)?;
    let mut out = vec![];
    let mut target: Option<Target> = None;

    for op in plan {
        match op {
            PlanOp::Key(i) => target = Some(Target::new(cursors, i, Part::Key)?),
            PlanOp::Value(i) => target = Some(Target::new(cursors, i, Part::Value)?),

            PlanOp::Next(count) | PlanOp::Skip(count) => {
                let push = matches!(op, PlanOp::Next(_));
                let target = require(&mut target)?;

                for _ in 0..count {
                    let slot = target.packer.pack_next()?;
                    let value = take_item(cursors, target, slot)?;

                    if push {
                        let vslot = vpack.pack_next()?;
                        let value = coerce(value, vslot.ty)?;
                        pack_write(&value, vslot, &mut out)?;
                    }
                }
            }

            // Don't copy the same value twice
            PlanOp::Reuse(_) => {}
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    #[allow(clippy::unwrap_used, clippy::indexing_slicing)]
    fn projection_in_out_round_trip() {
        let mut cursors = vec![
            ProjectionCursor::new("S", "ii"),
            ProjectionCursor::new("S", "i"),
        ];

        let args = vec![
            PackValue::Str("row1".into()),
            PackValue::Int(7),
            PackValue::Int(8),
            PackValue::Int(9),
        ];

        // The key column lands in cursor 0 and is reused for cursor 1;
        // two value columns go to cursor 0, one to cursor 1
        project_in(&mut cursors, "0k1n1k1r0v2n1v1n", &args).unwrap();

        assert_eq!(cursors[0].key, cursors[1].key);

        let out = project_out(&cursors, "0v2n1v1n").unwrap();
        assert_eq!(
            vec![PackValue::Int(7), PackValue::Int(8), PackValue::Int(9)],
            out
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn projection_out_skip() {
        let mut cursors = vec![ProjectionCursor::new("S", "3i")];
        project_in(
            &mut cursors,
            "0k1n0v3n",
            &[
                PackValue::Str("k".into()),
                PackValue::Int(1),
                PackValue::Int(2),
                PackValue::Int(3),
            ],
        )
        .unwrap();

        let out = project_out(&cursors, "0v1s2n").unwrap();
        assert_eq!(vec![PackValue::Int(2), PackValue::Int(3)], out);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn projection_skip_past_end_appends_typed_zero() {
        let mut cursors = vec![ProjectionCursor::new("S", "Si")];

        // Only skip ops against an empty value buffer: both columns
        // materialize as typed zeros
        project_in(&mut cursors, "0v2s", &[]).unwrap();

        let out = project_out(&cursors, "0v2n").unwrap();
        assert_eq!(vec![PackValue::Str(String::new()), PackValue::Int(0)], out);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn projection_in_overwrites_in_place() {
        let mut cursors = vec![ProjectionCursor::new("S", "2i")];

        // Write [1, 2], then revisit the buffer and overwrite the
        // first column with a wider encoding
        project_in(
            &mut cursors,
            "0v2n0v1n",
            &[PackValue::Int(1), PackValue::Int(2), PackValue::Int(300)],
        )
        .unwrap();

        let out = project_out(&cursors, "0v2n").unwrap();
        assert_eq!(vec![PackValue::Int(300), PackValue::Int(2)], out);
    }

    #[test]
    fn projection_reuse_before_any_column_is_invalid() {
        let mut cursors = vec![ProjectionCursor::new("S", "i")];
        assert!(matches!(
            project_in(&mut cursors, "0v1r", &[]),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn projection_unknown_op_is_invalid() {
        let mut cursors = vec![ProjectionCursor::new("S", "i")];
        assert!(matches!(
            project_in(&mut cursors, "0k1x", &[]),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used, clippy::indexing_slicing)]
    fn projection_slice_distributes_columns() {
        // Pack a source row with three ints
        let mut src = vec![];
        let mut packer = Packer::new("3i").unwrap();
        for v in [10, 20, 30] {
            let slot = packer.pack_next().unwrap();
            pack_write(&PackValue::Int(v), slot, &mut src).unwrap();
        }

        let mut cursors = vec![
            ProjectionCursor::new("S", "2i"),
            ProjectionCursor::new("S", "i"),
        ];

        project_slice(&mut cursors, "0v2n1v1n", false, "3i", &src).unwrap();

        let out = project_out(&cursors, "0v2n").unwrap();
        assert_eq!(vec![PackValue::Int(10), PackValue::Int(20)], out);

        let out = project_out(&cursors, "1v1n").unwrap();
        assert_eq!(vec![PackValue::Int(30)], out);
    }

    #[test]
    #[allow(clippy::unwrap_used, clippy::indexing_slicing)]
    fn projection_slice_key_only_skips_values() {
        let mut src = vec![];
        let mut packer = Packer::new("i").unwrap();
        let slot = packer.pack_next().unwrap();
        pack_write(&PackValue::Int(5), slot, &mut src).unwrap();

        let mut cursors = vec![ProjectionCursor::new("S", "i")];
        cursors[0].value = vec![0xAA];

        project_slice(&mut cursors, "0v1n", true, "i", &src).unwrap();

        // Value buffer untouched in key-only mode
        assert_eq!(vec![0xAA], cursors[0].value);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn projection_merge_builds_buffer() {
        let mut cursors = vec![
            ProjectionCursor::new("S", "2i"),
            ProjectionCursor::new("S", "i"),
        ];

        project_in(
            &mut cursors,
            "0v2n1v1n",
            &[PackValue::Int(10), PackValue::Int(20), PackValue::Int(30)],
        )
        .unwrap();

        let merged = project_merge(&cursors, "0v2n1v1n", "3i").unwrap();

        // Round-trip through a plain unpack
        let mut packer = Packer::new("3i").unwrap();
        let mut input = &merged[..];
        let mut values = vec![];
        for _ in 0..3 {
            let slot = packer.pack_next().unwrap();
            values.push(unpack_read(slot, &mut input).unwrap());
        }
        assert_eq!(
            vec![PackValue::Int(10), PackValue::Int(20), PackValue::Int(30)],
            values
        );
    }
}
