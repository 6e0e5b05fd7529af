//! Memory-mapped image files as data targets.
//!
//! Crash-dump formats differ in how they describe memory, but once their headers are parsed
//! they all boil down to "this virtual address range lives at that file offset". Parsing the
//! dump container is not this crate's job; [`MappedTarget`] takes the already-resolved list
//! of [`MappedRegion`]s and serves reads straight from a read-only memory mapping, letting the
//! operating system page the image in on demand.

use std::{fs, path::Path};

use memmap2::Mmap;

use super::{DataTarget, PointerSize};
use crate::{Error::Error, Result};

/// One virtual address range stored contiguously in an image file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedRegion {
    /// Virtual address of the first byte in the target process
    pub address: u64,
    /// Offset of the first byte within the image file
    pub file_offset: u64,
    /// Number of bytes in the region
    pub size: u64,
}

impl MappedRegion {
    /// Creates a new region descriptor.
    #[must_use]
    pub fn new(address: u64, file_offset: u64, size: u64) -> Self {
        MappedRegion {
            address,
            file_offset,
            size,
        }
    }

    fn end(&self) -> u64 {
        self.address + self.size
    }
}

/// A data target backed by a memory-mapped image file.
///
/// # Examples
///
/// ```rust,no_run
/// use heapscope::target::{DataTarget, MappedRegion, MappedTarget, PointerSize};
///
/// let target = MappedTarget::new(
///     "core.heap",
///     vec![MappedRegion::new(0x7f00_0000_0000, 0, 0x10000)],
///     PointerSize::Bit64,
/// )?;
/// let first = target.read_pointer_sized(0x7f00_0000_0000);
/// # Ok::<(), heapscope::Error>(())
/// ```
#[derive(Debug)]
pub struct MappedTarget {
    /// Memory-mapped image data
    data: Mmap,
    /// Regions sorted by virtual address
    regions: Vec<MappedRegion>,
    pointer_size: PointerSize,
}

impl MappedTarget {
    /// Maps the image at `path` and serves the given regions from it.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened,
    /// [`crate::Error::Error`] if mapping fails, and [`crate::Error::Malformed`] if a region
    /// lies outside the file or two regions overlap in the address space.
    #[allow(unsafe_code)]
    pub fn new(
        path: impl AsRef<Path>,
        mut regions: Vec<MappedRegion>,
        pointer_size: PointerSize,
    ) -> Result<MappedTarget> {
        let file = fs::File::open(path)?;

        // The dump file must not be truncated while mapped.
        let data = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(error) => return Err(Error(error.to_string())),
        };

        regions.retain(|region| region.size > 0);
        regions.sort_by_key(|region| region.address);

        let file_len = data.len() as u64;
        for region in &regions {
            let in_file = region
                .file_offset
                .checked_add(region.size)
                .is_some_and(|end| end <= file_len);
            if !in_file || region.address.checked_add(region.size).is_none() {
                return Err(malformed_error!(
                    "Region at 0x{:x} ({} bytes at file offset 0x{:x}) is outside the image",
                    region.address,
                    region.size,
                    region.file_offset
                ));
            }
        }

        for pair in regions.windows(2) {
            if pair[0].end() > pair[1].address {
                return Err(malformed_error!(
                    "Regions at 0x{:x} and 0x{:x} overlap",
                    pair[0].address,
                    pair[1].address
                ));
            }
        }

        Ok(MappedTarget {
            data,
            regions,
            pointer_size,
        })
    }

    /// Maps a flat image whose first byte corresponds to `base_address`.
    ///
    /// # Errors
    /// See [`MappedTarget::new`].
    pub fn flat(
        path: impl AsRef<Path>,
        base_address: u64,
        pointer_size: PointerSize,
    ) -> Result<MappedTarget> {
        let len = fs::metadata(path.as_ref())?.len();
        MappedTarget::new(
            path,
            vec![MappedRegion::new(base_address, 0, len)],
            pointer_size,
        )
    }

    /// The regions served by this target, sorted by address.
    #[must_use]
    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }

    fn region_for(&self, address: u64) -> Option<&MappedRegion> {
        let index = self
            .regions
            .partition_point(|region| region.address <= address);
        let region = self.regions.get(index.checked_sub(1)?)?;
        (address < region.end()).then_some(region)
    }
}

impl DataTarget for MappedTarget {
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut current = address;

        while copied < buffer.len() {
            let Some(region) = self.region_for(current) else {
                break;
            };

            let available = region.end() - current;
            let count = usize::try_from(available)
                .unwrap_or(usize::MAX)
                .min(buffer.len() - copied);
            let Ok(start) = usize::try_from(region.file_offset + (current - region.address)) else {
                break;
            };

            buffer[copied..copied + count].copy_from_slice(&self.data[start..start + count]);
            copied += count;
            current += count as u64;
        }

        copied
    }

    fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }
}
