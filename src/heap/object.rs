//! Heap objects paired with their resolved type.

use std::{fmt, sync::Arc};

use widestring::U16Str;

use crate::{
    heap::{ClrTypeRc, Generation, Heap},
    Result,
};

/// One outgoing reference of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    /// Address of the referenced object
    pub target: u64,
    /// Offset of the referencing slot from the source object's address
    pub offset: u64,
}

/// An object on the managed heap.
#[derive(Clone)]
pub struct ClrObject<'heap> {
    heap: &'heap Heap,
    address: u64,
    ty: ClrTypeRc,
}

impl<'heap> ClrObject<'heap> {
    pub(crate) fn new(heap: &'heap Heap, address: u64, ty: ClrTypeRc) -> Self {
        ClrObject { heap, address, ty }
    }

    /// Address of the object (its method table slot).
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Resolved type.
    #[must_use]
    pub fn ty(&self) -> &ClrTypeRc {
        &self.ty
    }

    /// The heap the object lives on.
    #[must_use]
    pub fn heap(&self) -> &'heap Heap {
        self.heap
    }

    /// Whether this is a free filler object.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.ty.is_free()
    }

    /// Whether this is an array.
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.ty.is_array()
    }

    /// Whether this is a string.
    #[must_use]
    pub fn is_string(&self) -> bool {
        self.ty.is_string()
    }

    /// Generation holding the object.
    #[must_use]
    pub fn generation(&self) -> Option<Generation> {
        self.heap.generation_of(self.address)
    }

    /// Size of the object before alignment.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        let mut reader = self.heap.object_reader();
        self.ty.object_size(&mut reader, self.address)
    }

    /// Number of elements, for arrays.
    #[must_use]
    pub fn array_length(&self) -> Option<u32> {
        if !self.is_array() {
            return None;
        }
        let mut reader = self.heap.object_reader();
        self.ty.component_count(&mut reader, self.address)
    }

    /// Contents of a `System.String`.
    ///
    /// Returns `None` for other types, unreadable characters, or strings longer than
    /// the configured maximum. Invalid UTF-16 is replaced lossily.
    #[must_use]
    pub fn as_string(&self) -> Option<String> {
        if !self.is_string() {
            return None;
        }

        let mut reader = self.heap.object_reader();
        let length_slot = self
            .address
            .checked_add(self.heap.pointer_size().bytes_u64())?;
        let length = reader.read_u32(length_slot)?;
        if length > self.heap.config().max_string_length {
            log::debug!(
                "string at 0x{:x} claims {length} characters; not decoding",
                self.address
            );
            return None;
        }

        let bytes = reader.read_bytes(length_slot + 4, length as usize * 2)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Some(U16Str::from_slice(&units).to_string_lossy())
    }

    /// Outgoing references in layout order.
    ///
    /// # Errors
    /// Returns [`crate::Error::StaleSnapshot`] if the runtime has been flushed.
    pub fn references(&self, carefully: bool) -> Result<Vec<ObjectReference>> {
        let mut references = Vec::new();
        self.walk_references(carefully, |target, offset| {
            references.push(ObjectReference { target, offset });
        })?;
        Ok(references)
    }

    /// Invokes `callback(target, offset)` for every outgoing reference.
    ///
    /// # Errors
    /// Returns [`crate::Error::StaleSnapshot`] if the runtime has been flushed.
    pub fn walk_references<F>(&self, carefully: bool, callback: F) -> Result<()>
    where
        F: FnMut(u64, u64),
    {
        self.heap.check_revision()?;
        let mut reader = self.heap.object_reader();
        self.heap
            .walk_object_references(&mut reader, self.address, &self.ty, carefully, callback);
        Ok(())
    }
}

impl PartialEq for ClrObject<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && Arc::ptr_eq(&self.ty, &other.ty)
    }
}

impl Eq for ClrObject<'_> {}

impl fmt::Debug for ClrObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClrObject")
            .field("address", &format_args!("0x{:x}", self.address))
            .field("method_table", &format_args!("0x{:x}", self.ty.method_table()))
            .field("type", &self.ty.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        runtime::{
            snapshot::{HeapImageBuilder, TypeSpec},
            SegmentData,
        },
        target::PointerSize,
        HeapConfig,
    };

    #[test]
    fn strings_decode() {
        let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
        let segment = builder.segment(SegmentData::gen2(0x1000, 0x2000));
        let hello = builder.string(segment, "héllo");
        let empty = builder.string(segment, "");
        let runtime = builder.build().unwrap().into_runtime().unwrap();
        let heap = runtime.heap().unwrap();

        let object = heap.get_object(hello).unwrap();
        assert!(object.is_string());
        assert_eq!(object.as_string().as_deref(), Some("héllo"));
        assert_eq!(object.size(), Some(22 + 10));
        assert_eq!(heap.get_object(empty).unwrap().as_string().as_deref(), Some(""));
    }

    #[test]
    fn overlong_string_not_decoded() {
        let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
        let segment = builder.segment(SegmentData::gen2(0x1000, 0x2000));
        let text = builder.string(segment, "abcdef");
        let runtime = builder
            .build()
            .unwrap()
            .into_runtime_with(HeapConfig::new().with_max_string_length(4))
            .unwrap();
        let heap = runtime.heap().unwrap();

        assert!(heap.get_object(text).unwrap().as_string().is_none());
    }

    #[test]
    fn arrays_and_generations() {
        let mut builder = HeapImageBuilder::new(PointerSize::Bit32);
        let node = builder.method_table(TypeSpec::class("Node", 12));
        let segment = builder.segment(SegmentData::ephemeral(0x1000, 0x1000, 0x1000, 0x1800));
        let first = builder.object(segment, node);
        let array = builder.reference_array(segment, node, &[first, 0, first]);
        let runtime = builder.build().unwrap().into_runtime().unwrap();
        let heap = runtime.heap().unwrap();

        let object = heap.get_object(array).unwrap();
        assert!(object.is_array());
        assert_eq!(object.array_length(), Some(3));
        assert_eq!(object.generation(), Some(crate::heap::Generation::Gen0));
        assert_eq!(object.ty().name(), Some("Node[]"));

        let refs = object.references(false).unwrap();
        let targets: Vec<(u64, u64)> = refs.iter().map(|r| (r.target, r.offset)).collect();
        assert_eq!(targets, vec![(first, 12), (first, 20)]);
        assert!(heap.get_object(first).unwrap().array_length().is_none());
    }
}
