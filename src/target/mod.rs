//! Memory sources for heap inspection.
//!
//! A [`DataTarget`] is the only way this crate touches the inspected process. It hides
//! whether bytes come from a live process, a memory-mapped dump image or a synthetic
//! buffer built in a test. Reads are allowed to be partial: a target returns how many
//! bytes it could copy and the caller decides what a short read means. Heap walkers treat
//! any short read as "stop walking this object or segment", never as a fatal error.
//!
//! # Key Components
//!
//! - [`DataTarget`] - Trait implemented by every memory source
//! - [`PointerSize`] - Pointer width of the inspected process
//! - [`crate::target::memory::InMemoryTarget`] - Sparse regions held in local memory
//! - [`crate::target::mapped::MappedTarget`] - Regions of a memory-mapped image file
//! - [`crate::target::process::ProcessTarget`] - Live process memory (Linux only)
//! - [`crate::target::reader::MemoryReader`] - Paged read cache over any target
//! - [`crate::target::io`] - Little-endian primitive helpers
//!
//! # Thread Safety
//!
//! Targets are `Send + Sync` and are shared behind an `Arc`. The page cache in
//! [`crate::target::reader::MemoryReader`] is not; every thread walking a heap owns its
//! own reader.

pub mod io;
pub mod mapped;
pub mod memory;
pub mod process;
pub mod reader;

use strum::Display;

use crate::{
    target::io::{read_ptr_at, read_le},
    Error, Result,
};

pub use mapped::{MappedRegion, MappedTarget};
pub use memory::InMemoryTarget;
pub use process::ProcessTarget;
pub use reader::MemoryReader;

/// Pointer width of an inspected process.
///
/// Fixed for the lifetime of a snapshot; every offset computation in segment traversal and
/// GCDesc decoding depends on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum PointerSize {
    /// 4-byte pointers
    #[strum(serialize = "32-bit")]
    Bit32,
    /// 8-byte pointers
    #[strum(serialize = "64-bit")]
    Bit64,
}

impl PointerSize {
    /// Returns the pointer width of the host process.
    #[must_use]
    pub fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            PointerSize::Bit64
        } else {
            PointerSize::Bit32
        }
    }

    /// Creates a pointer size from a byte count.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidPointerSize`] for anything other than 4 or 8.
    pub fn from_bytes(bytes: usize) -> Result<Self> {
        match bytes {
            4 => Ok(PointerSize::Bit32),
            8 => Ok(PointerSize::Bit64),
            other => Err(Error::InvalidPointerSize(other)),
        }
    }

    /// Number of bytes in a pointer.
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            PointerSize::Bit32 => 4,
            PointerSize::Bit64 => 8,
        }
    }

    /// Number of bytes in a pointer as a `u64`, for address arithmetic.
    #[must_use]
    pub fn bytes_u64(self) -> u64 {
        self.bytes() as u64
    }

    /// Rounds `value` up to the next pointer-aligned boundary.
    #[must_use]
    pub fn align_up(self, value: u64) -> u64 {
        let mask = self.bytes_u64() - 1;
        value.saturating_add(mask) & !mask
    }
}

/// A source of target-process memory.
///
/// Implementations must behave uniformly regardless of backing: an unmapped or missing
/// range produces a short read, never a panic or an error.
///
/// # Examples
///
/// ```rust
/// use heapscope::target::{DataTarget, InMemoryTarget, PointerSize};
///
/// let mut target = InMemoryTarget::new(PointerSize::Bit64);
/// target.add_region(0x1000, 0x2000_u64.to_le_bytes().to_vec())?;
///
/// assert_eq!(target.read_pointer_sized(0x1000), Some(0x2000));
/// assert_eq!(target.read_pointer_sized(0x1004), None);
/// # Ok::<(), heapscope::Error>(())
/// ```
pub trait DataTarget: Send + Sync {
    /// Copies memory starting at `address` into `buffer`.
    ///
    /// Returns the number of bytes copied. A value smaller than `buffer.len()` means the
    /// memory after that point is unreadable.
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> usize;

    /// Pointer width of the target process.
    fn pointer_size(&self) -> PointerSize;

    /// Reads a full `buffer`, returning `false` on any short read.
    fn read_exact(&self, address: u64, buffer: &mut [u8]) -> bool {
        self.read_memory(address, buffer) == buffer.len()
    }

    /// Reads one pointer-sized word.
    fn read_pointer_sized(&self, address: u64) -> Option<u64> {
        let pointer_size = self.pointer_size();
        let mut buffer = [0u8; 8];
        let buffer = &mut buffer[..pointer_size.bytes()];
        if !self.read_exact(address, buffer) {
            return None;
        }

        let mut offset = 0;
        read_ptr_at(buffer, &mut offset, pointer_size).ok()
    }

    /// Reads one little-endian `u32`.
    fn read_u32(&self, address: u64) -> Option<u32> {
        let mut buffer = [0u8; 4];
        if !self.read_exact(address, &mut buffer) {
            return None;
        }
        read_le::<u32>(&buffer).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_size_from_bytes() {
        assert_eq!(PointerSize::from_bytes(4).unwrap(), PointerSize::Bit32);
        assert_eq!(PointerSize::from_bytes(8).unwrap(), PointerSize::Bit64);
        assert!(matches!(
            PointerSize::from_bytes(2),
            Err(Error::InvalidPointerSize(2))
        ));
    }

    #[test]
    fn pointer_size_align() {
        assert_eq!(PointerSize::Bit64.align_up(0x1001), 0x1008);
        assert_eq!(PointerSize::Bit64.align_up(0x1008), 0x1008);
        assert_eq!(PointerSize::Bit32.align_up(0x1001), 0x1004);
        assert_eq!(PointerSize::Bit32.align_up(0), 0);
    }

    #[test]
    fn pointer_size_display() {
        assert_eq!(PointerSize::Bit32.to_string(), "32-bit");
        assert_eq!(PointerSize::Bit64.to_string(), "64-bit");
    }
}
