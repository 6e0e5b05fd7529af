//! GCDesc decoding and reference enumeration.
//!
//! Every method table whose instances contain object references is preceded in memory by a
//! GC descriptor. The descriptor grows *downwards* from the method table: the word directly
//! before the method table holds a signed series count, and the series themselves are
//! stored below it.
//!
//! # Layout
//!
//! With `p` the pointer size and `n = |count|`, the descriptor occupies `(1 + 2n) * p` bytes
//! ending at the method table:
//!
//! - **Positive count** (regular types): `n` series of `(size, offset)` word pairs. The
//!   highest series sits directly below the count. A series covers `size + object_size`
//!   bytes of pointers starting at `offset`, so one descriptor serves every instance of a
//!   variable-length type.
//! - **Negative count** (arrays of value types): a start offset word below the count,
//!   followed by `n` repeating items. Each item packs `(pointers, skip)` into one word as
//!   two half-word fields. The item list is applied over and over from the start offset
//!   until the end of the object.
//!
//! A zero count describes a type with no reference fields.
//!
//! # Examples
//!
//! ```rust
//! use heapscope::heap::gcdesc::GcDesc;
//! use heapscope::target::PointerSize;
//!
//! // One series: 16 bytes of references at offset 8 of a 40-byte object.
//! let mut raw = Vec::new();
//! raw.extend_from_slice(&(-24i64).to_le_bytes()); // size relative to object size
//! raw.extend_from_slice(&8u64.to_le_bytes());     // offset
//! raw.extend_from_slice(&1i64.to_le_bytes());     // series count
//!
//! let desc = GcDesc::parse(&raw, PointerSize::Bit64)?;
//! assert_eq!(desc.series_count(), 1);
//! # Ok::<(), heapscope::Error>(())
//! ```

use crate::{
    target::{
        io::{read_iptr_at, read_le_at, read_ptr_at},
        reader::MemoryReader,
        PointerSize,
    },
    Result,
};

/// One run of contiguous references in a regular type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcSeries {
    /// Offset of the first reference from the object address.
    pub offset: u64,
    /// Length of the run minus the object size. Usually negative.
    pub size: i64,
}

/// One step of a repeating value-type array pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepeatItem {
    /// Number of consecutive reference slots.
    pub pointers: u32,
    /// Bytes to skip after the references.
    pub skip: u32,
}

/// Decoded descriptor shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GcDescLayout {
    /// The type holds no references.
    Empty,
    /// Series in walk order, highest first.
    Series(Vec<GcSeries>),
    /// Pattern applied repeatedly from `start_offset`.
    Repeating {
        /// Offset of the first element from the object address.
        start_offset: u64,
        /// Items in application order.
        items: Vec<RepeatItem>,
    },
}

/// A decoded GC descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcDesc {
    pointer_size: PointerSize,
    layout: GcDescLayout,
}

impl GcDesc {
    /// Decodes a descriptor from the raw words that end at the method table.
    ///
    /// `data` must contain at least the series count in its last word. Extra leading bytes
    /// are ignored, which lets callers pass any window ending at the method table.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `data` is too short for the count it carries
    /// or is not a whole number of words.
    pub fn parse(data: &[u8], pointer_size: PointerSize) -> Result<GcDesc> {
        let p = pointer_size.bytes();
        if data.len() < p || data.len() % p != 0 {
            return Err(malformed_error!(
                "GCDesc buffer of {} bytes is not a whole number of {}-byte words",
                data.len(),
                p
            ));
        }

        let len = data.len();
        let mut offset = len - p;
        let count = read_iptr_at(data, &mut offset, pointer_size)?;
        let n = usize::try_from(count.unsigned_abs()).unwrap_or(usize::MAX);

        let required = n
            .checked_mul(2)
            .and_then(|slots| slots.checked_add(1))
            .and_then(|slots| slots.checked_mul(p));
        match required {
            Some(required) if required <= len => {}
            _ => {
                return Err(malformed_error!(
                    "GCDesc with {} series needs more than the {} bytes available",
                    count,
                    len
                ))
            }
        }

        let layout = if count == 0 {
            GcDescLayout::Empty
        } else if count > 0 {
            let highest = len - 3 * p;
            let mut series = Vec::with_capacity(n);
            for index in 0..n {
                let mut cursor = highest - index * 2 * p;
                let size = read_iptr_at(data, &mut cursor, pointer_size)?;
                let offset = read_ptr_at(data, &mut cursor, pointer_size)?;
                series.push(GcSeries { offset, size });
            }
            GcDescLayout::Series(series)
        } else {
            let mut cursor = len - 2 * p;
            let start_offset = read_ptr_at(data, &mut cursor, pointer_size)?;

            let first = len - 3 * p;
            let mut items = Vec::with_capacity(n);
            for index in 0..n {
                let mut cursor = first - index * p;
                let item = match pointer_size {
                    PointerSize::Bit32 => RepeatItem {
                        pointers: u32::from(read_le_at::<u16>(data, &mut cursor)?),
                        skip: u32::from(read_le_at::<u16>(data, &mut cursor)?),
                    },
                    PointerSize::Bit64 => RepeatItem {
                        pointers: read_le_at::<u32>(data, &mut cursor)?,
                        skip: read_le_at::<u32>(data, &mut cursor)?,
                    },
                };
                items.push(item);
            }
            GcDescLayout::Repeating {
                start_offset,
                items,
            }
        };

        Ok(GcDesc {
            pointer_size,
            layout,
        })
    }

    /// Reads and decodes the descriptor in front of `method_table`.
    ///
    /// Returns `None` if the descriptor is unreadable, malformed, or claims more than
    /// `max_series` series.
    pub fn read(reader: &mut MemoryReader, method_table: u64, max_series: usize) -> Option<GcDesc> {
        let pointer_size = reader.pointer_size();
        let p = pointer_size.bytes_u64();

        let count_address = method_table.checked_sub(p)?;
        let raw_count = reader.read_pointer(count_address)?;
        let count = match pointer_size {
            PointerSize::Bit32 => i64::from(raw_count as u32 as i32),
            PointerSize::Bit64 => raw_count as i64,
        };

        let n = count.unsigned_abs();
        if n > max_series as u64 {
            log::debug!(
                "GCDesc for method table 0x{method_table:x} claims {count} series; treating as corrupt"
            );
            return None;
        }

        let len = n
            .checked_mul(2)
            .and_then(|slots| slots.checked_add(1))
            .and_then(|slots| slots.checked_mul(p))?;
        let start = method_table.checked_sub(len)?;
        let bytes = reader.read_bytes(start, usize::try_from(len).ok()?)?;

        match GcDesc::parse(&bytes, pointer_size) {
            Ok(desc) => Some(desc),
            Err(error) => {
                log::debug!("GCDesc for method table 0x{method_table:x} rejected: {error}");
                None
            }
        }
    }

    /// Pointer width the descriptor was decoded for.
    #[must_use]
    pub fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }

    /// Decoded shape.
    #[must_use]
    pub fn layout(&self) -> &GcDescLayout {
        &self.layout
    }

    /// Number of series or repeating items.
    #[must_use]
    pub fn series_count(&self) -> usize {
        match &self.layout {
            GcDescLayout::Empty => 0,
            GcDescLayout::Series(series) => series.len(),
            GcDescLayout::Repeating { items, .. } => items.len(),
        }
    }

    /// Whether this descriptor uses the repeating value-type array form.
    #[must_use]
    pub fn is_repeating(&self) -> bool {
        matches!(self.layout, GcDescLayout::Repeating { .. })
    }

    /// Invokes `callback(target, offset)` for every non-null reference of the object at
    /// `address` with total size `size`.
    ///
    /// Reads stay within the object. The walk of this object stops at the first slot that
    /// cannot be read.
    pub fn walk_object<F>(&self, address: u64, size: u64, reader: &mut MemoryReader, mut callback: F)
    where
        F: FnMut(u64, u64),
    {
        let p = self.pointer_size.bytes_u64();
        let Some(object_end) = address.checked_add(size) else {
            return;
        };

        match &self.layout {
            GcDescLayout::Empty => {}
            GcDescLayout::Series(series) => {
                for entry in series {
                    let Some(start) = address.checked_add(entry.offset) else {
                        return;
                    };
                    let run = i128::from(size) + i128::from(entry.size);
                    if run <= 0 {
                        continue;
                    }
                    let stop = u64::try_from(i128::from(start) + run)
                        .unwrap_or(u64::MAX)
                        .min(object_end);

                    let mut slot = start;
                    while slot < stop {
                        let Some(target) = reader.read_pointer(slot) else {
                            return;
                        };
                        if target != 0 {
                            callback(target, slot - address);
                        }
                        slot += p;
                    }
                }
            }
            GcDescLayout::Repeating {
                start_offset,
                items,
            } => {
                let end = object_end.saturating_sub(p);
                let Some(mut slot) = address.checked_add(*start_offset) else {
                    return;
                };

                while slot < end {
                    let pass_start = slot;
                    for item in items {
                        let stop = slot
                            .saturating_add(u64::from(item.pointers) * p)
                            .min(end);
                        while slot < stop {
                            let Some(target) = reader.read_pointer(slot) else {
                                return;
                            };
                            if target != 0 {
                                callback(target, slot - address);
                            }
                            slot += p;
                        }
                        slot = slot.saturating_add(u64::from(item.skip));
                        if slot >= end {
                            break;
                        }
                    }
                    if slot <= pass_start {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::target::{memory::InMemoryTarget, DataTarget};

    fn words64(values: &[i64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn reader_over(base: u64, data: Vec<u8>, pointer_size: PointerSize) -> MemoryReader {
        let mut target = InMemoryTarget::new(pointer_size);
        target.add_region(base, data).unwrap();
        let target: Arc<dyn DataTarget> = Arc::new(target);
        MemoryReader::new(target, 0x100)
    }

    #[test]
    fn parse_zero_series() {
        let desc = GcDesc::parse(&words64(&[0]), PointerSize::Bit64).unwrap();
        assert_eq!(desc.layout(), &GcDescLayout::Empty);
        assert_eq!(desc.series_count(), 0);
    }

    #[test]
    fn parse_series_highest_first() {
        // lowest series, highest series, count
        let raw = words64(&[-40, 48, -32, 16, 2]);
        let desc = GcDesc::parse(&raw, PointerSize::Bit64).unwrap();

        assert_eq!(
            desc.layout(),
            &GcDescLayout::Series(vec![
                GcSeries {
                    offset: 16,
                    size: -32
                },
                GcSeries {
                    offset: 48,
                    size: -40
                },
            ])
        );
    }

    #[test]
    fn parse_repeating_64() {
        // item word: pointers = 1 (low half), skip = 8 (high half)
        let item = 1i64 | (8i64 << 32);
        let raw = words64(&[item, 16, -1]);
        let desc = GcDesc::parse(&raw, PointerSize::Bit64).unwrap();

        assert!(desc.is_repeating());
        assert_eq!(
            desc.layout(),
            &GcDescLayout::Repeating {
                start_offset: 16,
                items: vec![RepeatItem {
                    pointers: 1,
                    skip: 8
                }],
            }
        );
    }

    #[test]
    fn parse_repeating_32() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&2u16.to_le_bytes());
        raw.extend_from_slice(&4u16.to_le_bytes());
        raw.extend_from_slice(&8u32.to_le_bytes());
        raw.extend_from_slice(&(-1i32).to_le_bytes());

        let desc = GcDesc::parse(&raw, PointerSize::Bit32).unwrap();
        assert_eq!(
            desc.layout(),
            &GcDescLayout::Repeating {
                start_offset: 8,
                items: vec![RepeatItem {
                    pointers: 2,
                    skip: 4
                }],
            }
        );
    }

    #[test]
    fn parse_rejects_truncated() {
        assert!(GcDesc::parse(&words64(&[-16, 3]), PointerSize::Bit64).is_err());
        assert!(GcDesc::parse(&[0u8; 5], PointerSize::Bit64).is_err());
        assert!(GcDesc::parse(&[], PointerSize::Bit32).is_err());
        assert!(GcDesc::parse(&words64(&[i64::MIN]), PointerSize::Bit64).is_err());
    }

    #[test]
    fn read_from_target_and_walk_series() {
        // [size, offset, count][mt] followed by the object at 0x1000
        let mt = 0x118u64;
        let mut image = vec![0u8; 0x1000];
        image[0x100..0x118].copy_from_slice(&words64(&[-48, 16, 1]));

        let mut object = vec![0u8; 64];
        object[0..8].copy_from_slice(&mt.to_le_bytes());
        object[16..24].copy_from_slice(&0x2000u64.to_le_bytes());
        object[24..32].copy_from_slice(&0x3000u64.to_le_bytes());
        image.extend_from_slice(&object);

        let mut reader = reader_over(0, image, PointerSize::Bit64);
        let desc = GcDesc::read(&mut reader, mt, 16).unwrap();

        let mut refs = Vec::new();
        desc.walk_object(0x1000, 64, &mut reader, |target, offset| refs.push((target, offset)));
        assert_eq!(refs, vec![(0x2000, 16), (0x3000, 24)]);
    }

    #[test]
    fn walk_skips_null_references() {
        let desc = GcDesc::parse(&words64(&[-48, 16, 1]), PointerSize::Bit64).unwrap();
        let mut object = vec![0u8; 64];
        object[24..32].copy_from_slice(&0x3000u64.to_le_bytes());
        let mut reader = reader_over(0x1000, object, PointerSize::Bit64);

        let mut refs = Vec::new();
        desc.walk_object(0x1000, 64, &mut reader, |target, offset| refs.push((target, offset)));
        assert_eq!(refs, vec![(0x3000, 24)]);
    }

    #[test]
    fn walk_repeating_pattern() {
        // 3 elements of { ref, i64 } starting at offset 16, object size 16 + 48 + 8
        let item = 1i64 | (8i64 << 32);
        let desc = GcDesc::parse(&words64(&[item, 16, -1]), PointerSize::Bit64).unwrap();

        let size = 72u64;
        let mut object = vec![0u8; size as usize];
        for (index, value) in [0xA000u64, 0, 0xC000].iter().enumerate() {
            let at = 16 + index * 16;
            object[at..at + 8].copy_from_slice(&value.to_le_bytes());
            object[at + 8..at + 16].copy_from_slice(&0xFFFF_FFFFu64.to_le_bytes());
        }
        let mut reader = reader_over(0x1000, object, PointerSize::Bit64);

        let mut refs = Vec::new();
        desc.walk_object(0x1000, size, &mut reader, |target, offset| refs.push((target, offset)));
        assert_eq!(refs, vec![(0xA000, 16), (0xC000, 48)]);
    }

    #[test]
    fn walk_repeating_without_progress_terminates() {
        let desc = GcDesc::parse(&words64(&[0, 16, -1]), PointerSize::Bit64).unwrap();
        let mut reader = reader_over(0x1000, vec![0xFFu8; 64], PointerSize::Bit64);

        let mut count = 0;
        desc.walk_object(0x1000, 64, &mut reader, |_, _| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn read_rejects_excessive_series() {
        let mut reader = reader_over(0, words64(&[1_000_000]), PointerSize::Bit64);
        assert!(GcDesc::read(&mut reader, 8, 16).is_none());
    }

    #[test]
    fn read_with_unbounded_cap_survives_huge_counts() {
        for count in [i64::MIN, i64::MAX / 2] {
            let mut reader = reader_over(0, words64(&[count]), PointerSize::Bit64);
            assert!(GcDesc::read(&mut reader, 8, usize::MAX).is_none());
        }
    }

    #[test]
    fn walk_stops_at_unreadable_slot() {
        let desc = GcDesc::parse(&words64(&[-16, 8, 1]), PointerSize::Bit64).unwrap();
        let mut object = vec![0u8; 16];
        object[8..16].copy_from_slice(&0x5000u64.to_le_bytes());
        let mut reader = reader_over(0x1000, object, PointerSize::Bit64);

        let mut refs = Vec::new();
        desc.walk_object(0x1000, 64, &mut reader, |target, offset| refs.push((target, offset)));
        assert_eq!(refs, vec![(0x5000, 8)]);
    }
}
