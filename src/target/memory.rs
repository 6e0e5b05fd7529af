//! Sparse in-memory data target.
//!
//! [`InMemoryTarget`] stores a set of non-overlapping address ranges in local buffers.
//! Everything outside those ranges is unmapped, which makes it a convenient stand-in for a
//! partial crash dump: tests can build a heap image with holes in it and check that the
//! walkers stop where a real dump would stop.

use std::collections::BTreeMap;

use super::{DataTarget, PointerSize};
use crate::{Error::OutOfBounds, Result};

/// Data target backed by local buffers keyed by their base address.
///
/// Reads that run off the end of one region continue into the next region only if it
/// starts exactly where the previous one ended; any gap terminates the read.
///
/// # Examples
///
/// ```rust
/// use heapscope::target::{DataTarget, InMemoryTarget, PointerSize};
///
/// let mut target = InMemoryTarget::new(PointerSize::Bit32);
/// target.add_region(0x100, vec![1, 2, 3, 4])?;
/// target.add_region(0x104, vec![5, 6])?;
///
/// let mut buffer = [0u8; 8];
/// assert_eq!(target.read_memory(0x102, &mut buffer), 4);
/// assert_eq!(&buffer[..4], &[3, 4, 5, 6]);
/// # Ok::<(), heapscope::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryTarget {
    pointer_size: PointerSize,
    regions: BTreeMap<u64, Vec<u8>>,
}

impl InMemoryTarget {
    /// Creates an empty target with the given pointer width.
    #[must_use]
    pub fn new(pointer_size: PointerSize) -> Self {
        InMemoryTarget {
            pointer_size,
            regions: BTreeMap::new(),
        }
    }

    /// Maps `data` at `address`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the new region would overlap an existing one
    /// or wrap the address space.
    pub fn add_region(&mut self, address: u64, data: Vec<u8>) -> Result<()> {
        let Some(end) = address.checked_add(data.len() as u64) else {
            return Err(malformed_error!(
                "Region at 0x{:x} wraps the address space",
                address
            ));
        };

        if let Some((&base, existing)) = self.regions.range(..end).next_back() {
            if base + existing.len() as u64 > address && !data.is_empty() {
                return Err(malformed_error!(
                    "Region 0x{:x}..0x{:x} overlaps region at 0x{:x}",
                    address,
                    end,
                    base
                ));
            }
        }

        self.regions.insert(address, data);
        Ok(())
    }

    /// Overwrites bytes inside an existing region.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the write is not fully contained in one
    /// region.
    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let Some((&base, region)) = self.regions.range_mut(..=address).next_back() else {
            return Err(OutOfBounds);
        };

        let offset = usize::try_from(address - base).map_err(|_| OutOfBounds)?;
        let Some(end) = offset.checked_add(data.len()) else {
            return Err(OutOfBounds);
        };
        if end > region.len() {
            return Err(OutOfBounds);
        }

        region[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Iterates over `(base_address, bytes)` for every mapped region in address order.
    pub fn regions(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.regions.iter().map(|(&base, data)| (base, data.as_slice()))
    }

    /// Total number of mapped bytes.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.regions.values().map(Vec::len).sum()
    }
}

impl DataTarget for InMemoryTarget {
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut current = address;

        while copied < buffer.len() {
            let Some((&base, region)) = self.regions.range(..=current).next_back() else {
                break;
            };

            let Ok(offset) = usize::try_from(current - base) else {
                break;
            };
            if offset >= region.len() {
                break;
            }

            let count = (region.len() - offset).min(buffer.len() - copied);
            buffer[copied..copied + count].copy_from_slice(&region[offset..offset + count]);
            copied += count;
            current += count as u64;
        }

        copied
    }

    fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn read_within_region() {
        let mut target = InMemoryTarget::new(PointerSize::Bit64);
        target.add_region(0x1000, vec![0xAA; 16]).unwrap();

        let mut buffer = [0u8; 8];
        assert_eq!(target.read_memory(0x1004, &mut buffer), 8);
        assert_eq!(buffer, [0xAA; 8]);
    }

    #[test]
    fn read_stops_at_gap() {
        let mut target = InMemoryTarget::new(PointerSize::Bit64);
        target.add_region(0x1000, vec![1; 8]).unwrap();
        target.add_region(0x1010, vec![2; 8]).unwrap();

        let mut buffer = [0u8; 16];
        assert_eq!(target.read_memory(0x1004, &mut buffer), 4);
        assert_eq!(target.read_memory(0x1008, &mut buffer), 0);
        assert_eq!(target.read_memory(0x0FFF, &mut buffer), 0);
    }

    #[test]
    fn read_across_adjacent_regions() {
        let mut target = InMemoryTarget::new(PointerSize::Bit64);
        target.add_region(0x1000, vec![1; 4]).unwrap();
        target.add_region(0x1004, vec![2; 4]).unwrap();

        let mut buffer = [0u8; 8];
        assert_eq!(target.read_memory(0x1000, &mut buffer), 8);
        assert_eq!(buffer, [1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn overlapping_region_rejected() {
        let mut target = InMemoryTarget::new(PointerSize::Bit64);
        target.add_region(0x1000, vec![0; 0x100]).unwrap();

        assert!(matches!(
            target.add_region(0x1080, vec![0; 0x10]),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            target.add_region(0x0F80, vec![0; 0x100]),
            Err(Error::Malformed { .. })
        ));
        assert!(target.add_region(0x1100, vec![0; 0x10]).is_ok());
        assert!(target.add_region(u64::MAX - 1, vec![0; 4]).is_err());
    }

    #[test]
    fn write_in_place() {
        let mut target = InMemoryTarget::new(PointerSize::Bit32);
        target.add_region(0x2000, vec![0; 8]).unwrap();
        target.write(0x2004, &[9, 9]).unwrap();

        assert_eq!(target.read_u32(0x2004), Some(0x0909));
        assert!(target.write(0x2007, &[1, 2]).is_err());
        assert!(target.write(0x1000, &[1]).is_err());
    }

    #[test]
    fn pointer_reads_respect_width() {
        let mut target = InMemoryTarget::new(PointerSize::Bit32);
        target
            .add_region(0x100, vec![0x78, 0x56, 0x34, 0x12, 0xFF, 0xFF, 0xFF, 0xFF])
            .unwrap();

        assert_eq!(target.read_pointer_sized(0x100), Some(0x1234_5678));
        assert_eq!(target.read_pointer_sized(0x106), None);
        assert_eq!(target.mapped_bytes(), 8);
    }
}
