//! GC segments and generations.
//!
//! A [`Segment`] is one contiguous range of the managed heap. Small-object segments hold
//! generation 2 objects, except for the single ephemeral segment which additionally holds
//! generations 1 and 0 at its end. Large-object segments are a separate bucket with no
//! generational subdivision.
//!
//! Objects inside a segment are packed back to back: the next object starts where the
//! previous one ends, rounded up to pointer alignment. Walking a segment therefore needs
//! the size of every object, which in turn needs its type; see
//! [`Segment::next_object`].

use std::ops::Range;

use strum::{Display, EnumIter};

use crate::{
    heap::Heap,
    runtime::SegmentData,
    target::{reader::MemoryReader, PointerSize},
    Result,
};

/// Generation bucket of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
pub enum Generation {
    /// Youngest generation
    #[strum(serialize = "gen0")]
    Gen0,
    /// Objects that survived one collection
    #[strum(serialize = "gen1")]
    Gen1,
    /// Long-lived objects
    #[strum(serialize = "gen2")]
    Gen2,
    /// Large object heap
    #[strum(serialize = "loh")]
    Large,
}

impl Generation {
    /// Position of the generation in per-generation arrays.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Generation::Gen0 => 0,
            Generation::Gen1 => 1,
            Generation::Gen2 => 2,
            Generation::Large => 3,
        }
    }
}

/// One GC segment.
///
/// Immutable after construction. The generation ranges satisfy
/// `start <= gen2.start <= gen1.start <= gen0.start <= end <= reserved_end`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    start: u64,
    end: u64,
    reserved_end: u64,
    gen0: Range<u64>,
    gen1: Range<u64>,
    gen2: Range<u64>,
    is_large: bool,
    is_ephemeral: bool,
    heap_index: usize,
}

impl Segment {
    /// Builds a segment from raw runtime data.
    ///
    /// A reserved end below the committed end is raised to the committed end.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the committed range is inverted or the
    /// ephemeral generation boundaries are out of order.
    pub fn from_data(data: &SegmentData) -> Result<Segment> {
        if data.committed_end < data.start {
            return Err(malformed_error!(
                "Segment 0x{:x} ends before it starts (0x{:x})",
                data.start,
                data.committed_end
            ));
        }

        let end = data.committed_end;
        let reserved_end = data.reserved_end.max(end);

        let (gen2, gen1, gen0) = if data.is_large {
            (end..end, end..end, end..end)
        } else if data.is_ephemeral {
            let ordered = data.start <= data.gen1_start
                && data.gen1_start <= data.gen0_start
                && data.gen0_start <= end;
            if !ordered {
                return Err(malformed_error!(
                    "Ephemeral segment 0x{:x} has generation boundaries out of order (gen1 0x{:x}, gen0 0x{:x}, end 0x{:x})",
                    data.start,
                    data.gen1_start,
                    data.gen0_start,
                    end
                ));
            }
            (
                data.start..data.gen1_start,
                data.gen1_start..data.gen0_start,
                data.gen0_start..end,
            )
        } else {
            (data.start..end, end..end, end..end)
        };

        Ok(Segment {
            start: data.start,
            end,
            reserved_end,
            gen0,
            gen1,
            gen2,
            is_large: data.is_large,
            is_ephemeral: data.is_ephemeral && !data.is_large,
            heap_index: data.heap_index,
        })
    }

    /// First byte of the segment.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// End of committed memory; no object starts at or beyond it.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// End of reserved memory.
    #[must_use]
    pub fn reserved_end(&self) -> u64 {
        self.reserved_end
    }

    /// Committed length in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.end - self.start
    }

    /// Whether this is a large-object-heap segment.
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.is_large
    }

    /// Whether this segment holds generations 0 and 1.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.is_ephemeral
    }

    /// Index of the owning GC heap.
    #[must_use]
    pub fn heap_index(&self) -> usize {
        self.heap_index
    }

    /// Whether `address` is inside `[start, end)`.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    /// Address range of one generation within this segment.
    ///
    /// The range is empty if the segment holds no objects of that generation.
    #[must_use]
    pub fn generation_range(&self, generation: Generation) -> Range<u64> {
        match generation {
            Generation::Gen0 => self.gen0.clone(),
            Generation::Gen1 => self.gen1.clone(),
            Generation::Gen2 => self.gen2.clone(),
            Generation::Large if self.is_large => self.start..self.end,
            Generation::Large => self.end..self.end,
        }
    }

    /// Committed bytes per generation, indexed by [`Generation::index`].
    #[must_use]
    pub fn generation_sizes(&self) -> [u64; 4] {
        let len = |range: Range<u64>| range.end - range.start;
        [
            len(self.generation_range(Generation::Gen0)),
            len(self.generation_range(Generation::Gen1)),
            len(self.generation_range(Generation::Gen2)),
            len(self.generation_range(Generation::Large)),
        ]
    }

    /// Generation of an object at `address`, or `None` if it is outside the segment.
    #[must_use]
    pub fn generation_of(&self, address: u64) -> Option<Generation> {
        if !self.contains(address) {
            return None;
        }
        if self.is_large {
            return Some(Generation::Large);
        }
        if self.gen0.contains(&address) {
            Some(Generation::Gen0)
        } else if self.gen1.contains(&address) {
            Some(Generation::Gen1)
        } else {
            Some(Generation::Gen2)
        }
    }

    /// Rounds an object size up to this segment's allocation alignment.
    ///
    /// Objects on the large object heap are always 8-byte aligned, regardless of pointer
    /// width.
    #[must_use]
    pub fn align(&self, size: u64, pointer_size: PointerSize) -> u64 {
        if self.is_large {
            size.saturating_add(7) & !7
        } else {
            pointer_size.align_up(size)
        }
    }

    /// Address of the first object, or `None` for an empty segment.
    #[must_use]
    pub fn first_object(&self, heap: &Heap) -> Option<u64> {
        if self.start >= self.end {
            return None;
        }
        self.skip_allocation_contexts(heap, self.start)
    }

    /// Address of the object following the one at `address`.
    ///
    /// Returns `None` when the end of the segment is reached or when the object at
    /// `address` cannot be typed or sized. Objects already produced stay valid; the
    /// segment walk simply ends early.
    pub fn next_object(&self, heap: &Heap, reader: &mut MemoryReader, address: u64) -> Option<u64> {
        if address >= self.end {
            return None;
        }

        let pointer_size = heap.pointer_size();
        let ty = heap.object_type_with(reader, address)?;
        let size = ty.object_size(reader, address)?;
        let size = self.align(size.max(heap.min_object_size()), pointer_size);

        let next = address.checked_add(size)?;
        if next >= self.end {
            return None;
        }

        self.skip_allocation_contexts(heap, next)
    }

    /// Moves `address` past any allocation context that starts there.
    fn skip_allocation_contexts(&self, heap: &Heap, mut address: u64) -> Option<u64> {
        if self.is_large {
            return Some(address);
        }

        let min_size = self.align(heap.min_object_size(), heap.pointer_size());
        while let Some(limit) = heap.allocation_limit(address) {
            let resume = limit.checked_add(min_size)?;
            if resume <= address {
                log::warn!(
                    "allocation context at 0x{address:x} does not advance (limit 0x{limit:x}); stopping segment walk"
                );
                return None;
            }
            address = resume;
            if address >= self.end {
                return None;
            }
        }

        Some(address)
    }
}
