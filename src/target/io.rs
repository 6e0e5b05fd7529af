//! Little-endian primitive decoding and encoding for raw target memory.
//!
//! Everything the heap walker reads from a target arrives as plain bytes: method-table
//! words, GCDesc series, array lengths, object headers. This module provides the small
//! set of bounds-checked helpers used to turn those bytes into integers and back.
//!
//! # Key Components
//!
//! - [`crate::target::io::HeapIO`] - Trait describing a fixed-width little-endian primitive
//! - [`crate::target::io::read_le`] / [`crate::target::io::read_le_at`] - Decode primitives
//! - [`crate::target::io::read_ptr_at`] / [`crate::target::io::read_iptr_at`] - Decode
//!   pointer-sized words for a given [`crate::target::PointerSize`]
//! - [`crate::target::io::write_le_at`] / [`crate::target::io::write_ptr_at`] - Encode
//!   primitives, used when synthesizing heap images
//!
//! # Error Handling
//!
//! All functions return [`crate::Error::OutOfBounds`] if the buffer is too short. Callers in
//! the heap walker convert these into "stop walking" decisions; they are never surfaced to
//! users as hard failures.
//!
//! # Examples
//!
//! ```rust
//! use heapscope::target::{io::{read_le_at, read_ptr_at}, PointerSize};
//!
//! let data = [0x10, 0x00, 0x00, 0x00, 0x78, 0x56, 0x34, 0x12];
//! let mut offset = 0;
//! let first: u32 = read_le_at(&data, &mut offset)?;
//! assert_eq!(first, 0x10);
//!
//! let mut offset = 0;
//! let ptr = read_ptr_at(&data, &mut offset, PointerSize::Bit64)?;
//! assert_eq!(ptr, 0x1234_5678_0000_0010);
//! # Ok::<(), heapscope::Error>(())
//! ```

use crate::{target::PointerSize, Error::OutOfBounds, Result};

/// A fixed-width primitive that can be decoded from and encoded to little-endian bytes.
///
/// Implemented for the integer widths that appear in CLR heap structures.
pub trait HeapIO: Sized + Copy {
    /// Byte array holding the encoded value.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decode a value from its little-endian representation.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encode a value into its little-endian representation.
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_heap_io {
    ($($ty:ty),*) => {
        $(
            impl HeapIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_heap_io!(u8, u16, u32, u64, i16, i32, i64);

/// Decode a value from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `T`.
pub fn read_le<T: HeapIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Decode a value at `offset` and advance the offset past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit in `data`.
pub fn read_le_at<T: HeapIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Decode an unsigned pointer-sized word and advance the offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the word does not fit in `data`.
pub fn read_ptr_at(data: &[u8], offset: &mut usize, pointer_size: PointerSize) -> Result<u64> {
    match pointer_size {
        PointerSize::Bit32 => Ok(u64::from(read_le_at::<u32>(data, offset)?)),
        PointerSize::Bit64 => read_le_at::<u64>(data, offset),
    }
}

/// Decode a signed pointer-sized word (sign extended to 64 bits) and advance the offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the word does not fit in `data`.
pub fn read_iptr_at(data: &[u8], offset: &mut usize, pointer_size: PointerSize) -> Result<i64> {
    match pointer_size {
        PointerSize::Bit32 => Ok(i64::from(read_le_at::<i32>(data, offset)?)),
        PointerSize::Bit64 => read_le_at::<i64>(data, offset),
    }
}

/// Encode `value` at `offset` and advance the offset past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit in `data`.
pub fn write_le_at<T: HeapIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let Some(end) = offset.checked_add(bytes.len()) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    Ok(())
}

/// Encode a pointer-sized word at `offset` and advance the offset.
///
/// On 32-bit targets only the low 32 bits of `value` are written.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the word does not fit in `data`.
#[allow(clippy::cast_possible_truncation)] // 32-bit targets store truncated words
pub fn write_ptr_at(
    data: &mut [u8],
    offset: &mut usize,
    value: u64,
    pointer_size: PointerSize,
) -> Result<()> {
    match pointer_size {
        PointerSize::Bit32 => write_le_at(data, offset, value as u32),
        PointerSize::Bit64 => write_le_at(data, offset, value),
    }
}
