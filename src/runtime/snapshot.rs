//! Table-driven runtime provider and synthetic heap images.
//!
//! [`SnapshotRuntime`] answers every [`RuntimeProvider`] query from plain tables instead of
//! a live runtime. It is what offline tooling uses after capturing runtime metadata once,
//! and what the test suite, benchmarks and fuzzers use to describe heaps precisely.
//!
//! [`HeapImageBuilder`] produces a matching pair of target memory and provider. It lays
//! out method tables with correctly encoded GCDescs in front of them, places objects back
//! to back in segments exactly the way the allocator would, and records allocation
//! contexts. The result is a heap that the walker treats no differently from a real one.
//!
//! # Examples
//!
//! ```rust
//! use heapscope::prelude::*;
//!
//! let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
//! let pair = builder.method_table(TypeSpec::class("Pair", 40).with_references(&[8, 16]));
//! let segment = builder.segment(SegmentData::ephemeral(0x1000, 0x1000, 0x1000, 0x2000));
//! let text = builder.string(segment, "hello");
//! let object = builder.object(segment, pair);
//! builder.set_pointer(object + 8, text);
//!
//! let image = builder.build()?;
//! let runtime = image.into_runtime()?;
//! let heap = runtime.heap()?;
//! assert_eq!(heap.enumerate_objects()?.count(), 2);
//! # Ok::<(), heapscope::Error>(())
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    config::HeapConfig,
    heap::ElementKind,
    metadata::token::Token,
    runtime::{
        AllocationContext, ClrRuntime, HeapLayout, MethodTableData, RuntimeProvider, SegmentData,
    },
    target::{
        io::{write_le_at, write_ptr_at},
        memory::InMemoryTarget,
        DataTarget, PointerSize,
    },
    Result,
};

/// Where the builder places method tables.
pub const TYPE_AREA: u64 = 0x7F00_0000;

/// Module address assigned to every type the builder creates.
pub const DEFAULT_MODULE: u64 = 0x6000_0000;

/// Everything the provider knows about one method table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodTableRecord {
    /// Sizing and identity
    pub data: MethodTableData,
    /// Owning module, if known
    pub module: Option<u64>,
    /// Display name
    pub name: Option<String>,
}

/// A [`RuntimeProvider`] answering from in-memory tables.
#[derive(Debug)]
pub struct SnapshotRuntime {
    pointer_size: PointerSize,
    layout: HeapLayout,
    method_tables: HashMap<u64, MethodTableRecord>,
    free_method_table: u64,
    array_method_table: u64,
    revision: AtomicU32,
}

impl SnapshotRuntime {
    /// Creates a provider with an empty heap and no known method tables.
    #[must_use]
    pub fn new(pointer_size: PointerSize) -> Self {
        SnapshotRuntime {
            pointer_size,
            layout: HeapLayout::default(),
            method_tables: HashMap::new(),
            free_method_table: 0,
            array_method_table: 0,
            revision: AtomicU32::new(0),
        }
    }

    /// Sets the heap layout.
    #[must_use]
    pub fn with_layout(mut self, layout: HeapLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Registers a method table.
    #[must_use]
    pub fn with_method_table(mut self, method_table: u64, record: MethodTableRecord) -> Self {
        self.method_tables.insert(method_table, record);
        self
    }

    /// Sets the method table of free objects.
    #[must_use]
    pub fn with_free_method_table(mut self, method_table: u64) -> Self {
        self.free_method_table = method_table;
        self
    }

    /// Sets the method table shared by reference arrays.
    #[must_use]
    pub fn with_array_method_table(mut self, method_table: u64) -> Self {
        self.array_method_table = method_table;
        self
    }

    /// Method table of free objects.
    #[must_use]
    pub fn free_method_table_address(&self) -> u64 {
        self.free_method_table
    }

    /// Method table shared by reference arrays.
    #[must_use]
    pub fn array_method_table_address(&self) -> u64 {
        self.array_method_table
    }

    /// Registered method table record.
    #[must_use]
    pub fn method_table_record(&self, method_table: u64) -> Option<&MethodTableRecord> {
        self.method_tables.get(&method_table)
    }

    /// Number of registered method tables.
    #[must_use]
    pub fn method_table_count(&self) -> usize {
        self.method_tables.len()
    }
}

impl RuntimeProvider for SnapshotRuntime {
    fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }

    fn revision(&self) -> u32 {
        self.revision.load(Ordering::Acquire)
    }

    fn flush(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    fn heap_layout(&self) -> Result<HeapLayout> {
        Ok(self.layout.clone())
    }

    fn method_table_data(&self, method_table: u64) -> Option<MethodTableData> {
        self.method_tables
            .get(&method_table)
            .map(|record| record.data.clone())
    }

    fn module_for_method_table(&self, method_table: u64) -> Option<u64> {
        self.method_tables.get(&method_table)?.module
    }

    fn free_method_table(&self) -> u64 {
        self.free_method_table
    }

    fn array_method_table(&self) -> u64 {
        self.array_method_table
    }

    fn type_name(&self, method_table: u64) -> Option<String> {
        self.method_tables.get(&method_table)?.name.clone()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum GcShape {
    None,
    /// Offsets of reference fields.
    Fields(Vec<u64>),
    /// Raw series for shared reference arrays: `(offset, size relative to object size)`.
    Series(u64, i64),
    /// Element layout of a value-type array: element size and reference offsets.
    Elements(u32, Vec<u64>),
}

/// Description of a type to register with [`HeapImageBuilder::method_table`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeSpec {
    name: Option<String>,
    kind: ElementKind,
    base_size: u32,
    component_size: u32,
    gc: GcShape,
    token: Option<Token>,
    module: bool,
    parent: u64,
}

impl TypeSpec {
    fn new(name: Option<&str>, kind: ElementKind, base_size: u32, component_size: u32) -> Self {
        TypeSpec {
            name: name.map(str::to_string),
            kind,
            base_size,
            component_size,
            gc: GcShape::None,
            token: None,
            module: true,
            parent: 0,
        }
    }

    /// A fixed-size reference type. `base_size` includes the object header.
    #[must_use]
    pub fn class(name: &str, base_size: u32) -> Self {
        Self::new(Some(name), ElementKind::Object, base_size, 0)
    }

    /// An array of value types whose elements are `element_size` bytes and hold
    /// references at `element_references` (offsets within one element).
    #[must_use]
    pub fn value_array(name: &str, element_size: u32, element_references: &[u64]) -> Self {
        let mut spec = Self::new(Some(name), ElementKind::Array, 0, element_size);
        if !element_references.is_empty() {
            spec.gc = GcShape::Elements(element_size, element_references.to_vec());
        }
        spec
    }

    /// Sets the reference field offsets of a class.
    #[must_use]
    pub fn with_references(mut self, offsets: &[u64]) -> Self {
        self.gc = if offsets.is_empty() {
            GcShape::None
        } else {
            GcShape::Fields(offsets.to_vec())
        };
        self
    }

    /// Overrides the element kind.
    #[must_use]
    pub fn with_kind(mut self, kind: ElementKind) -> Self {
        self.kind = kind;
        self
    }

    /// Overrides the automatically assigned `TypeDef` token.
    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    /// Sets the parent method table.
    #[must_use]
    pub fn with_parent(mut self, parent: u64) -> Self {
        self.parent = parent;
        self
    }

    /// Registers the type without an owning module.
    #[must_use]
    pub fn without_module(mut self) -> Self {
        self.module = false;
        self
    }
}

/// A finished synthetic heap image.
pub struct HeapImage {
    /// Memory of the image
    pub target: Arc<InMemoryTarget>,
    /// Provider describing the image
    pub runtime: Arc<SnapshotRuntime>,
}

impl HeapImage {
    /// Wraps the image in a [`ClrRuntime`] with default configuration.
    ///
    /// # Errors
    /// Propagates [`ClrRuntime::new`] errors.
    pub fn into_runtime(self) -> Result<ClrRuntime> {
        self.into_runtime_with(HeapConfig::default())
    }

    /// Wraps the image in a [`ClrRuntime`] with the given configuration.
    ///
    /// # Errors
    /// Propagates [`ClrRuntime::new`] errors.
    pub fn into_runtime_with(self, config: HeapConfig) -> Result<ClrRuntime> {
        ClrRuntime::with_config(
            self.target as Arc<dyn DataTarget>,
            self.runtime as Arc<dyn RuntimeProvider>,
            config,
        )
    }
}

struct BuilderSegment {
    data: SegmentData,
    cursor: u64,
    readable: Option<u64>,
}

/// Builds synthetic heap images.
///
/// Placement methods return the address they used even when they fail; the first failure
/// (an object not fitting its segment, a write to unmapped memory, an unknown method
/// table) is reported by [`HeapImageBuilder::build`].
pub struct HeapImageBuilder {
    pointer_size: PointerSize,
    type_area: Vec<u8>,
    regions: BTreeMap<u64, Vec<u8>>,
    segments: Vec<BuilderSegment>,
    layout: HeapLayout,
    records: HashMap<u64, MethodTableRecord>,
    next_row: u32,
    free_method_table: u64,
    array_method_table: u64,
    string_method_table: u64,
    errors: Vec<String>,
}

impl HeapImageBuilder {
    /// Creates a builder with the runtime's built-in free, string and shared array types
    /// already registered.
    #[must_use]
    pub fn new(pointer_size: PointerSize) -> Self {
        let mut builder = HeapImageBuilder {
            pointer_size,
            type_area: Vec::new(),
            regions: BTreeMap::new(),
            segments: Vec::new(),
            layout: HeapLayout::default(),
            records: HashMap::new(),
            next_row: 1,
            free_method_table: 0,
            array_method_table: 0,
            string_method_table: 0,
            errors: Vec::new(),
        };

        let p = pointer_size.bytes_u64() as u32;
        builder.free_method_table = builder.method_table(
            TypeSpec::new(None, ElementKind::Free, 3 * p, 1).with_token(Token::new(0)),
        );
        builder.string_method_table = builder.method_table(TypeSpec::new(
            Some("System.String"),
            ElementKind::String,
            2 * p + 6,
            2,
        ));

        let mut shared = TypeSpec::new(None, ElementKind::Array, 4 * p, p)
            .with_token(Token::new(0));
        shared.gc = GcShape::Series(3 * u64::from(p), -4 * i64::from(p));
        builder.array_method_table = builder.method_table(shared);
        builder
    }

    /// Pointer width of the image.
    #[must_use]
    pub fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }

    /// Method table of free objects.
    #[must_use]
    pub fn free_method_table(&self) -> u64 {
        self.free_method_table
    }

    /// Method table of `System.String`.
    #[must_use]
    pub fn string_method_table(&self) -> u64 {
        self.string_method_table
    }

    /// Method table shared by reference arrays.
    #[must_use]
    pub fn array_method_table(&self) -> u64 {
        self.array_method_table
    }

    /// Reports the heap as using server GC.
    #[must_use]
    pub fn with_server_gc(mut self, server_gc: bool) -> Self {
        self.layout.server_gc = server_gc;
        self
    }

    /// Registers a type and returns its method table address.
    ///
    /// The GCDesc is encoded directly in front of the method table.
    pub fn method_table(&mut self, spec: TypeSpec) -> u64 {
        let p = self.pointer_size.bytes_u64();
        let base_size = if spec.kind == ElementKind::Array && spec.base_size == 0 {
            3 * p as u32
        } else {
            spec.base_size
        };

        let slots = self.encode_gc_desc(&spec.gc, base_size);
        let desc_start = self.type_area.len();
        self.type_area.resize(desc_start + slots.len() * p as usize, 0);
        let mut offset = desc_start;
        for slot in &slots {
            if write_ptr_at(&mut self.type_area, &mut offset, *slot, self.pointer_size).is_err() {
                self.errors.push("failed to encode GCDesc".to_string());
            }
        }

        let method_table = TYPE_AREA + self.type_area.len() as u64;
        // method table body: flags word and base size, padded to 4 pointers
        let mut body = vec![0u8; 4 * p as usize];
        let mut cursor = 4;
        if write_le_at(&mut body, &mut cursor, base_size).is_err() {
            self.errors.push("failed to encode method table".to_string());
        }
        self.type_area.extend_from_slice(&body);

        let token = spec.token.unwrap_or_else(|| {
            let token = Token::type_def(self.next_row);
            self.next_row += 1;
            token
        });

        self.records.insert(
            method_table,
            MethodTableRecord {
                data: MethodTableData {
                    base_size,
                    component_size: spec.component_size,
                    contains_pointers: spec.gc != GcShape::None,
                    token,
                    parent: spec.parent,
                    kind: spec.kind,
                },
                module: spec.module.then_some(DEFAULT_MODULE),
                name: spec.name,
            },
        );
        method_table
    }

    /// Words of the GCDesc from lowest address to the series count.
    fn encode_gc_desc(&self, shape: &GcShape, base_size: u32) -> Vec<u64> {
        let p = self.pointer_size.bytes_u64();
        let signed = |value: i64| value as u64;

        match shape {
            GcShape::None => vec![0],
            GcShape::Series(offset, size) => vec![signed(*size), *offset, 1],
            GcShape::Fields(offsets) => {
                let runs = pointer_runs(offsets, p);
                let mut words = Vec::with_capacity(runs.len() * 2 + 1);
                // lowest address holds the last series
                for (start, count) in runs.iter().rev() {
                    words.push(signed(i64::try_from(count * p).unwrap_or(0) - i64::from(base_size)));
                    words.push(*start);
                }
                words.push(runs.len() as u64);
                words
            }
            GcShape::Elements(element_size, references) => {
                let runs = pointer_runs(references, p);
                let element_size = u64::from(*element_size);
                let half = |pointers: u64, skip: u64| match self.pointer_size {
                    PointerSize::Bit32 => (pointers & 0xFFFF) | ((skip & 0xFFFF) << 16),
                    PointerSize::Bit64 => (pointers & 0xFFFF_FFFF) | ((skip & 0xFFFF_FFFF) << 32),
                };

                let mut items = Vec::with_capacity(runs.len());
                for (index, (start, count)) in runs.iter().enumerate() {
                    let next_start = runs
                        .get(index + 1)
                        .map_or(runs[0].0 + element_size, |(next, _)| *next);
                    let skip = next_start.saturating_sub(start + count * p);
                    items.push(half(*count, skip));
                }

                let mut words: Vec<u64> = items.iter().rev().copied().collect();
                words.push(2 * p + runs[0].0);
                words.push(signed(-(runs.len() as i64)));
                // pad to the advertised (1 + 2n) words
                let pad = (1 + 2 * runs.len()).saturating_sub(words.len());
                let mut padded = vec![0; pad];
                padded.extend(words);
                padded
            }
        }
    }

    /// Adds a segment to the layout and maps its committed memory. Returns its index.
    pub fn segment(&mut self, data: SegmentData) -> usize {
        let length = data.committed_end.saturating_sub(data.start);
        self.map(data.start, vec![0; length as usize]);
        self.layout.segments.push(data);
        self.segments.push(BuilderSegment {
            data,
            cursor: data.start,
            readable: None,
        });
        self.segments.len() - 1
    }

    /// Adds a segment to the layout without mapping memory or placing objects.
    pub fn layout_segment(&mut self, data: SegmentData) {
        self.layout.segments.push(data);
    }

    /// Leaves only the first `readable` bytes of a segment mapped.
    pub fn truncate_segment(&mut self, segment: usize, readable: u64) {
        match self.segments.get_mut(segment) {
            Some(entry) => entry.readable = Some(readable),
            None => self.errors.push(format!("no segment {segment}")),
        }
    }

    /// Places a fixed-size object of `method_table` at the end of `segment`.
    pub fn object(&mut self, segment: usize, method_table: u64) -> u64 {
        let size = self.base_size(method_table);
        let address = self.place(segment, size);
        self.set_pointer(address, method_table);
        address
    }

    /// Writes an object header for `method_table` at an arbitrary address, mapping memory
    /// for it if needed. The object is not part of any segment walk.
    pub fn object_at(&mut self, address: u64, method_table: u64) -> u64 {
        if self.region_for(address, 1).is_none() {
            let size = self.base_size(method_table);
            self.map(address, vec![0; size as usize]);
        }
        self.set_pointer(address, method_table);
        address
    }

    /// Places an array of a registered value-array type.
    pub fn value_array(&mut self, segment: usize, method_table: u64, length: u32) -> u64 {
        let record = self.records.get(&method_table).map(|r| r.data.clone());
        let Some(data) = record else {
            self.errors
                .push(format!("unknown method table 0x{method_table:x}"));
            return 0;
        };

        let size = u64::from(data.base_size) + u64::from(data.component_size) * u64::from(length);
        let address = self.place(segment, size);
        self.set_pointer(address, method_table);
        self.write_u32(address + self.pointer_size.bytes_u64(), length);
        address
    }

    /// Places an array of references to `element_method_table` using the shared array
    /// method table.
    pub fn reference_array(&mut self, segment: usize, element_method_table: u64, elements: &[u64]) -> u64 {
        let p = self.pointer_size.bytes_u64();
        let size = 4 * p + elements.len() as u64 * p;
        let address = self.place(segment, size);

        self.set_pointer(address, self.array_method_table);
        self.write_u32(address + p, elements.len() as u32);
        self.set_pointer(address + 2 * p, element_method_table);
        for (index, element) in elements.iter().enumerate() {
            self.set_pointer(address + 3 * p + index as u64 * p, *element);
        }
        address
    }

    /// Places a `System.String`.
    pub fn string(&mut self, segment: usize, text: &str) -> u64 {
        let p = self.pointer_size.bytes_u64();
        let units: Vec<u16> = text.encode_utf16().collect();
        let size = 2 * p + 6 + 2 * units.len() as u64;
        let address = self.place(segment, size);

        self.set_pointer(address, self.string_method_table);
        self.write_u32(address + p, units.len() as u32);
        let bytes: Vec<u8> = units.iter().flat_map(|unit| unit.to_le_bytes()).collect();
        self.write(address + p + 4, &bytes);
        address
    }

    /// Places a free object covering `size` bytes.
    pub fn free(&mut self, segment: usize, size: u64) -> u64 {
        let p = self.pointer_size.bytes_u64();
        let size = size.max(3 * p);
        let address = self.place(segment, size);

        self.set_pointer(address, self.free_method_table);
        self.write_u32(address + p, (size - 3 * p) as u32);
        address
    }

    /// Reserves `length` bytes at the end of `segment` as an allocation context.
    ///
    /// The allocator keeps a minimum-size gap after the limit, which is skipped as well.
    pub fn allocation_context(&mut self, segment: usize, length: u64) -> u64 {
        let min_object = self.pointer_size.align_up(3 * self.pointer_size.bytes_u64());
        let Some(entry) = self.segments.get_mut(segment) else {
            self.errors.push(format!("no segment {segment}"));
            return 0;
        };

        let pointer = entry.cursor;
        let limit = pointer + length;
        entry.cursor = limit + min_object;
        self.layout.allocation_contexts.push(AllocationContext { pointer, limit });
        pointer
    }

    /// Records an allocation context verbatim.
    pub fn raw_allocation_context(&mut self, context: AllocationContext) {
        self.layout.allocation_contexts.push(context);
    }

    /// Writes a pointer-sized value.
    pub fn set_pointer(&mut self, address: u64, value: u64) {
        let mut bytes = vec![0u8; self.pointer_size.bytes()];
        let mut offset = 0;
        if write_ptr_at(&mut bytes, &mut offset, value, self.pointer_size).is_ok() {
            self.write(address, &bytes);
        }
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write(address, &value.to_le_bytes());
    }

    /// Writes raw bytes into mapped memory.
    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        let Some(base) = self.region_for(address, bytes.len() as u64) else {
            self.errors.push(format!(
                "write of {} bytes at 0x{address:x} is outside mapped memory",
                bytes.len()
            ));
            return;
        };
        if let Some(region) = self.regions.get_mut(&base) {
            let offset = (address - base) as usize;
            region[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Finishes the image.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] describing the first placement or write that
    /// failed, or if mapped regions overlap.
    pub fn build(self) -> Result<HeapImage> {
        if let Some(error) = self.errors.first() {
            return Err(malformed_error!("Invalid heap image - {}", error));
        }

        let mut target = InMemoryTarget::new(self.pointer_size);
        target.add_region(TYPE_AREA, self.type_area)?;

        let truncated: HashMap<u64, u64> = self
            .segments
            .iter()
            .filter_map(|segment| segment.readable.map(|readable| (segment.data.start, readable)))
            .collect();
        for (address, mut data) in self.regions {
            if let Some(readable) = truncated.get(&address) {
                data.truncate(*readable as usize);
            }
            if !data.is_empty() {
                target.add_region(address, data)?;
            }
        }

        let mut runtime = SnapshotRuntime::new(self.pointer_size)
            .with_layout(self.layout)
            .with_free_method_table(self.free_method_table)
            .with_array_method_table(self.array_method_table);
        for (method_table, record) in self.records {
            runtime = runtime.with_method_table(method_table, record);
        }

        Ok(HeapImage {
            target: Arc::new(target),
            runtime: Arc::new(runtime),
        })
    }

    fn base_size(&mut self, method_table: u64) -> u64 {
        match self.records.get(&method_table) {
            Some(record) => u64::from(record.data.base_size),
            None => {
                self.errors
                    .push(format!("unknown method table 0x{method_table:x}"));
                3 * self.pointer_size.bytes_u64()
            }
        }
    }

    /// Reserves `size` bytes at the segment cursor with the allocator's alignment.
    fn place(&mut self, segment: usize, size: u64) -> u64 {
        let p = self.pointer_size;
        let Some(entry) = self.segments.get_mut(segment) else {
            self.errors.push(format!("no segment {segment}"));
            return 0;
        };

        let size = size.max(3 * p.bytes_u64());
        let aligned = if entry.data.is_large {
            (size + 7) & !7
        } else {
            p.align_up(size)
        };

        let address = entry.cursor;
        entry.cursor += aligned;
        if entry.cursor > entry.data.committed_end {
            self.errors.push(format!(
                "object of {size} bytes at 0x{address:x} does not fit segment 0x{:x}",
                entry.data.start
            ));
        }
        address
    }

    fn map(&mut self, address: u64, data: Vec<u8>) {
        let end = address + data.len() as u64;
        let overlaps = self
            .regions
            .range(..end)
            .next_back()
            .is_some_and(|(start, existing)| start + existing.len() as u64 > address);
        if overlaps || (address < TYPE_AREA + (1 << 24) && end > TYPE_AREA) {
            self.errors
                .push(format!("region at 0x{address:x} overlaps mapped memory"));
            return;
        }
        self.regions.insert(address, data);
    }

    fn region_for(&self, address: u64, len: u64) -> Option<u64> {
        let (start, data) = self.regions.range(..=address).next_back()?;
        (address + len <= start + data.len() as u64).then_some(*start)
    }
}

/// Groups sorted reference offsets into `(start, pointer count)` runs.
fn pointer_runs(offsets: &[u64], pointer: u64) -> Vec<(u64, u64)> {
    let mut sorted = offsets.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<(u64, u64)> = Vec::new();
    for offset in sorted {
        match runs.last_mut() {
            Some((start, count)) if *start + *count * pointer == offset => *count += 1,
            _ => runs.push((offset, 1)),
        }
    }
    runs
}
