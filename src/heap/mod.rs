//! The managed heap of one runtime snapshot.
//!
//! [`Heap`] ties together the pieces needed to walk a CLR heap: the segment list reported
//! by the runtime, the type cache, the allocation contexts that punch holes into the
//! ephemeral segment and, optionally, an in-memory copy of every segment built by
//! [`Heap::cache_heap`].
//!
//! A heap is bound to the runtime revision it was built from. Once the runtime is flushed
//! every operation on the old heap fails with [`crate::Error::StaleSnapshot`] instead of
//! silently mixing data from two points in time.
//!
//! # Key Components
//!
//! - [`Heap`] - Segment lookup, object enumeration, type resolution and reference walks
//! - [`segment::Segment`] / [`segment::Generation`] - Segment layout and generations
//! - [`types::ClrType`] / [`types::TypeCache`] - Resolved types and their cache
//! - [`gcdesc::GcDesc`] - Reference layout of a type
//! - [`object::ClrObject`] - An object paired with its type
//! - [`cache::HeapCache`] - Cached copy of all segments
//! - [`walk::ReachableObjects`] - Transitive walk over the object graph
//!
//! # Examples
//!
//! ```rust
//! use heapscope::prelude::*;
//!
//! let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
//! let node = builder.method_table(TypeSpec::class("Node", 32).with_references(&[8]));
//! let segment = builder.segment(SegmentData::gen2(0x10_0000, 0x10_1000));
//! let first = builder.object(segment, node);
//! let second = builder.object(segment, node);
//! builder.set_pointer(first + 8, second);
//!
//! let runtime = builder.build()?.into_runtime()?;
//! let heap = runtime.heap()?;
//!
//! let addresses: Vec<u64> = heap.enumerate_objects()?.map(|o| o.address()).collect();
//! assert_eq!(addresses, vec![first, second]);
//!
//! let refs = heap.references(first, false)?;
//! assert_eq!(refs[0].target, second);
//! # Ok::<(), heapscope::Error>(())
//! ```

pub mod cache;
pub mod gcdesc;
pub mod object;
pub mod segment;
pub mod types;
pub mod walk;

pub use cache::{CancellationToken, HeapCache};
pub use object::{ClrObject, ObjectReference};
pub use segment::{Generation, Segment};
pub use types::{ClrType, ClrTypeRc, ElementKind, TypeCache, TypeFlags};
pub use walk::ReachableObjects;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
};

use crate::{
    config::HeapConfig,
    runtime::RuntimeProvider,
    target::{reader::MemoryReader, DataTarget, PointerSize},
    Error, Result,
};

/// The managed heap of one runtime revision.
pub struct Heap {
    target: Arc<dyn DataTarget>,
    provider: Arc<dyn RuntimeProvider>,
    config: HeapConfig,
    pointer_size: PointerSize,
    revision: u32,
    server_gc: bool,
    segments: Vec<Segment>,
    min_address: u64,
    max_address: u64,
    generation_sizes: [u64; 4],
    allocation_contexts: HashMap<u64, u64>,
    types: TypeCache,
    /// Segment that answered the previous lookup. A hint; any value is safe.
    last_segment: AtomicUsize,
    /// Object resolved by the previous type lookup. A hint; skipped when contended.
    last_object: Mutex<Option<(u64, ClrTypeRc)>>,
    cache: RwLock<Option<Arc<HeapCache>>>,
}

impl Heap {
    /// Builds the heap from the provider's current layout.
    ///
    /// Segments that are malformed or overlap an earlier segment are skipped with a
    /// warning; the rest of the heap stays usable.
    ///
    /// # Errors
    /// Returns [`Error::PointerSizeMismatch`] if the target and the provider disagree on the
    /// pointer width, or any error the provider reports while describing its heap.
    pub fn new(
        target: Arc<dyn DataTarget>,
        provider: Arc<dyn RuntimeProvider>,
        config: HeapConfig,
    ) -> Result<Heap> {
        let pointer_size = provider.pointer_size();
        if target.pointer_size() != pointer_size {
            return Err(Error::PointerSizeMismatch {
                target: target.pointer_size().bytes(),
                runtime: pointer_size.bytes(),
            });
        }

        let revision = provider.revision();
        let layout = provider.heap_layout()?;

        let mut parsed = Vec::with_capacity(layout.segments.len());
        for data in &layout.segments {
            match Segment::from_data(data) {
                Ok(segment) => parsed.push(segment),
                Err(error) => log::warn!("skipping segment at 0x{:x}: {error}", data.start),
            }
        }
        parsed.sort_by_key(Segment::start);

        let mut segments: Vec<Segment> = Vec::with_capacity(parsed.len());
        for segment in parsed {
            if let Some(previous) = segments.last() {
                if segment.start() < previous.end() {
                    log::warn!(
                        "skipping segment [0x{:x}, 0x{:x}) overlapping [0x{:x}, 0x{:x})",
                        segment.start(),
                        segment.end(),
                        previous.start(),
                        previous.end()
                    );
                    continue;
                }
            }
            segments.push(segment);
        }

        let min_address = segments.first().map_or(0, Segment::start);
        let max_address = segments.iter().map(Segment::end).max().unwrap_or(0);

        let mut generation_sizes = [0u64; 4];
        for segment in &segments {
            for (total, size) in generation_sizes.iter_mut().zip(segment.generation_sizes()) {
                *total += size;
            }
        }

        let allocation_contexts = layout
            .allocation_contexts
            .iter()
            .filter(|context| context.pointer != 0)
            .map(|context| (context.pointer, context.limit))
            .collect();

        let types = TypeCache::new(
            pointer_size,
            provider.free_method_table(),
            provider.array_method_table(),
        );

        log::debug!(
            "heap at revision {revision}: {} segments, {} bytes, server gc: {}",
            segments.len(),
            generation_sizes.iter().sum::<u64>(),
            layout.server_gc
        );

        Ok(Heap {
            target,
            provider,
            config,
            pointer_size,
            revision,
            server_gc: layout.server_gc,
            segments,
            min_address,
            max_address,
            generation_sizes,
            allocation_contexts,
            types,
            last_segment: AtomicUsize::new(0),
            last_object: Mutex::new(None),
            cache: RwLock::new(None),
        })
    }

    /// Runtime revision this heap was built from.
    #[must_use]
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Fails if the runtime has been flushed since this heap was built.
    ///
    /// # Errors
    /// Returns [`Error::StaleSnapshot`] on a revision mismatch.
    pub fn check_revision(&self) -> Result<()> {
        let actual = self.provider.revision();
        if actual != self.revision {
            return Err(Error::StaleSnapshot {
                expected: self.revision,
                actual,
            });
        }
        Ok(())
    }

    /// Pointer width of the target.
    #[must_use]
    pub fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }

    /// Configuration the heap was built with.
    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The runtime provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn RuntimeProvider> {
        &self.provider
    }

    /// Whether the runtime uses server GC.
    #[must_use]
    pub fn server_gc(&self) -> bool {
        self.server_gc
    }

    /// Segments sorted by start address, pairwise disjoint.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Lowest segment start.
    #[must_use]
    pub fn min_address(&self) -> u64 {
        self.min_address
    }

    /// Highest segment end.
    #[must_use]
    pub fn max_address(&self) -> u64 {
        self.max_address
    }

    /// Committed bytes across all segments.
    #[must_use]
    pub fn total_heap_size(&self) -> u64 {
        self.generation_sizes.iter().sum()
    }

    /// Committed bytes belonging to one generation.
    #[must_use]
    pub fn size_by_generation(&self, generation: Generation) -> u64 {
        self.generation_sizes[generation.index()]
    }

    /// Smallest possible object: header, method table and one slot.
    #[must_use]
    pub fn min_object_size(&self) -> u64 {
        3 * self.pointer_size.bytes_u64()
    }

    /// End of the allocation context starting at `address`, if any.
    #[must_use]
    pub fn allocation_limit(&self, address: u64) -> Option<u64> {
        self.allocation_contexts.get(&address).copied()
    }

    /// Finds the segment containing `address`.
    ///
    /// The segment that answered the previous lookup is probed first, then the others in
    /// circular order.
    #[must_use]
    pub fn segment_for_address(&self, address: u64) -> Option<&Segment> {
        self.segment_index(address).map(|index| &self.segments[index])
    }

    fn segment_index(&self, address: u64) -> Option<usize> {
        if address < self.min_address || address >= self.max_address {
            return None;
        }

        let count = self.segments.len();
        let hint = self.last_segment.load(Ordering::Relaxed) % count.max(1);
        for step in 0..count {
            let index = (hint + step) % count;
            if self.segments[index].contains(address) {
                self.last_segment.store(index, Ordering::Relaxed);
                return Some(index);
            }
        }
        None
    }

    /// Generation of the object at `address`.
    #[must_use]
    pub fn generation_of(&self, address: u64) -> Option<Generation> {
        self.segment_for_address(address)?.generation_of(address)
    }

    /// Memory the heap reads objects from: the cached segments if present, else the target.
    #[must_use]
    pub fn memory(&self) -> Arc<dyn DataTarget> {
        match self.heap_cache() {
            Some(cache) => cache.target(),
            None => Arc::clone(&self.target),
        }
    }

    /// The underlying target, bypassing any heap cache.
    #[must_use]
    pub fn target(&self) -> &Arc<dyn DataTarget> {
        &self.target
    }

    /// Reader sized for sequential heap scans.
    #[must_use]
    pub fn heap_reader(&self) -> MemoryReader {
        MemoryReader::new(self.memory(), self.config.heap_page_size)
    }

    /// Reader sized for scattered single-object reads.
    #[must_use]
    pub fn object_reader(&self) -> MemoryReader {
        MemoryReader::new(self.memory(), self.config.runtime_page_size)
    }

    /// Resolves the type of the object at `address`.
    #[must_use]
    pub fn object_type(&self, address: u64) -> Option<ClrTypeRc> {
        let mut reader = self.object_reader();
        self.object_type_with(&mut reader, address)
    }

    /// Resolves the type of the object at `address` using an existing reader.
    ///
    /// Reads the method table pointer (masking the two low tag bits) and, for shared
    /// reference arrays, the element method table stored at `address + 2 * pointer`.
    pub fn object_type_with(&self, reader: &mut MemoryReader, address: u64) -> Option<ClrTypeRc> {
        if let Ok(last) = self.last_object.try_lock() {
            if let Some((cached, ty)) = last.as_ref() {
                if *cached == address {
                    return Some(Arc::clone(ty));
                }
            }
        }

        let method_table = Self::read_method_table(reader, address)?;

        let component_method_table = if method_table == self.types.array_method_table() {
            let slot = address.checked_add(2 * self.pointer_size.bytes_u64())?;
            Self::read_method_table(reader, slot)?
        } else {
            0
        };

        let ty = self
            .types
            .get_or_create(method_table, component_method_table, self.provider.as_ref())?;

        if let Ok(mut last) = self.last_object.try_lock() {
            *last = Some((address, Arc::clone(&ty)));
        }
        Some(ty)
    }

    /// Reads a method table pointer, masking the two low tag bits the GC uses for marking.
    fn read_method_table(reader: &mut MemoryReader, address: u64) -> Option<u64> {
        let method_table = reader.read_pointer(address)? & !3;
        (method_table != 0).then_some(method_table)
    }

    /// Size of the object at `address`, before alignment.
    #[must_use]
    pub fn object_size(&self, address: u64) -> Option<u64> {
        let mut reader = self.object_reader();
        let ty = self.object_type_with(&mut reader, address)?;
        ty.object_size(&mut reader, address)
    }

    /// The object at `address`, if its type resolves.
    #[must_use]
    pub fn get_object(&self, address: u64) -> Option<ClrObject<'_>> {
        self.object_type(address)
            .map(|ty| ClrObject::new(self, address, ty))
    }

    /// The free filler type.
    #[must_use]
    pub fn free_type(&self) -> Option<ClrTypeRc> {
        self.types
            .get_or_create(self.types.free_method_table(), 0, self.provider.as_ref())
    }

    /// Every type resolved so far.
    #[must_use]
    pub fn types(&self) -> Vec<ClrTypeRc> {
        self.types.types()
    }

    /// The type cache.
    #[must_use]
    pub fn type_cache(&self) -> &TypeCache {
        &self.types
    }

    /// Enumerates every object in segment order, then address order within a segment.
    ///
    /// A segment whose walk hits an untypeable object ends early; enumeration resumes with
    /// the next segment. Served from the heap cache when one is present.
    ///
    /// # Errors
    /// Returns [`Error::StaleSnapshot`] if the runtime has been flushed.
    pub fn enumerate_objects(&self) -> Result<HeapObjects<'_>> {
        self.check_revision()?;
        Ok(match self.heap_cache() {
            Some(cache) => HeapObjects::cached(self, cache),
            None => HeapObjects::live(self, self.heap_reader(), 0, self.segments.len()),
        })
    }

    /// Enumerates the objects of a single segment.
    ///
    /// # Errors
    /// Returns [`Error::StaleSnapshot`] if the runtime has been flushed, or
    /// [`Error::OutOfBounds`] for an invalid segment index.
    pub fn segment_objects(&self, index: usize) -> Result<HeapObjects<'_>> {
        self.check_revision()?;
        if index >= self.segments.len() {
            return Err(Error::OutOfBounds);
        }
        Ok(HeapObjects::live(self, self.heap_reader(), index, index + 1))
    }

    pub(crate) fn objects_in(&self, memory: Arc<dyn DataTarget>) -> HeapObjects<'_> {
        let reader = MemoryReader::new(memory, self.config.heap_page_size);
        HeapObjects::live(self, reader, 0, self.segments.len())
    }

    /// Invokes `callback(target, offset)` for each non-null reference held by the object
    /// at `address`.
    ///
    /// With `carefully` set, objects that extend past their segment, lie outside every
    /// segment, or are implausibly large for a small-object segment yield no references.
    /// An object whose type cannot be resolved also yields none.
    ///
    /// # Errors
    /// Returns [`Error::StaleSnapshot`] if the runtime has been flushed.
    pub fn walk_references<F>(&self, address: u64, carefully: bool, callback: F) -> Result<()>
    where
        F: FnMut(u64, u64),
    {
        self.check_revision()?;
        let mut reader = self.object_reader();
        if let Some(ty) = self.object_type_with(&mut reader, address) {
            self.walk_object_references(&mut reader, address, &ty, carefully, callback);
        }
        Ok(())
    }

    /// Collects the references held by the object at `address`, in layout order.
    ///
    /// # Errors
    /// Returns [`Error::StaleSnapshot`] if the runtime has been flushed.
    pub fn references(&self, address: u64, carefully: bool) -> Result<Vec<ObjectReference>> {
        let mut references = Vec::new();
        self.walk_references(address, carefully, |target, offset| {
            references.push(ObjectReference { target, offset });
        })?;
        Ok(references)
    }

    pub(crate) fn walk_object_references<F>(
        &self,
        reader: &mut MemoryReader,
        address: u64,
        ty: &ClrType,
        carefully: bool,
        callback: F,
    ) where
        F: FnMut(u64, u64),
    {
        if !ty.contains_pointers() {
            return;
        }
        let Some(size) = ty.object_size(reader, address) else {
            return;
        };

        if carefully {
            let Some(segment) = self.segment_for_address(address) else {
                return;
            };
            if address.saturating_add(size) > segment.end() {
                return;
            }
            if !segment.is_large() && size > self.config.large_object_threshold {
                return;
            }
        }

        if let Some(desc) = ty.gc_desc(reader, self.config.max_gcdesc_series) {
            desc.walk_object(address, size, reader, callback);
        }
    }

    /// Walks everything transitively reachable from `roots`.
    ///
    /// # Errors
    /// Returns [`Error::StaleSnapshot`] if the runtime has been flushed.
    pub fn reachable_from<I>(&self, roots: I, carefully: bool) -> Result<ReachableObjects<'_>>
    where
        I: IntoIterator<Item = u64>,
    {
        self.check_revision()?;
        Ok(ReachableObjects::new(self, roots, carefully))
    }

    /// Copies every segment into memory and indexes its objects.
    ///
    /// Nothing is published unless the whole build completes. Calling this on an already
    /// cached heap rebuilds the cache.
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] if `token` is cancelled during the build,
    /// [`Error::StaleSnapshot`] if the runtime has been flushed, or [`Error::LockError`] if
    /// the cache lock is poisoned.
    pub fn cache_heap(&self, token: &CancellationToken) -> Result<()> {
        self.check_revision()?;
        let cache = HeapCache::build(self, token)?;
        log::debug!(
            "cached {} bytes of heap with {} objects",
            cache.cached_bytes(),
            cache.object_count()
        );

        let mut slot = self.cache.write().map_err(|_| Error::LockError)?;
        *slot = Some(Arc::new(cache));
        Ok(())
    }

    /// Whether a heap cache is present.
    #[must_use]
    pub fn is_heap_cached(&self) -> bool {
        self.heap_cache().is_some()
    }

    /// Drops the heap cache.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the cache lock is poisoned.
    pub fn clear_heap_cache(&self) -> Result<()> {
        let mut slot = self.cache.write().map_err(|_| Error::LockError)?;
        *slot = None;
        Ok(())
    }

    /// The heap cache, if one is present.
    #[must_use]
    pub fn heap_cache(&self) -> Option<Arc<HeapCache>> {
        self.cache.read().ok().and_then(|slot| slot.clone())
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("pointer_size", &self.pointer_size)
            .field("revision", &self.revision)
            .field("segments", &self.segments.len())
            .field("total_heap_size", &self.total_heap_size())
            .field("cached", &self.is_heap_cached())
            .finish_non_exhaustive()
    }
}

/// Iterator over heap objects, returned by [`Heap::enumerate_objects`].
pub struct HeapObjects<'heap> {
    heap: &'heap Heap,
    source: ObjectSource,
}

enum ObjectSource {
    Cached {
        cache: Arc<HeapCache>,
        index: usize,
    },
    Live {
        reader: MemoryReader,
        segment: usize,
        end_segment: usize,
        cursor: Option<u64>,
        entered: bool,
    },
}

impl<'heap> HeapObjects<'heap> {
    fn cached(heap: &'heap Heap, cache: Arc<HeapCache>) -> Self {
        HeapObjects {
            heap,
            source: ObjectSource::Cached { cache, index: 0 },
        }
    }

    fn live(heap: &'heap Heap, reader: MemoryReader, segment: usize, end_segment: usize) -> Self {
        HeapObjects {
            heap,
            source: ObjectSource::Live {
                reader,
                segment,
                end_segment,
                cursor: None,
                entered: false,
            },
        }
    }
}

impl<'heap> Iterator for HeapObjects<'heap> {
    type Item = ClrObject<'heap>;

    fn next(&mut self) -> Option<Self::Item> {
        let heap = self.heap;
        match &mut self.source {
            ObjectSource::Cached { cache, index } => {
                let (address, ty) = cache.objects().get(*index)?;
                *index += 1;
                Some(ClrObject::new(heap, *address, Arc::clone(ty)))
            }
            ObjectSource::Live {
                reader,
                segment,
                end_segment,
                cursor,
                entered,
            } => loop {
                if *segment >= *end_segment {
                    return None;
                }
                let current = &heap.segments[*segment];

                let address = match cursor.take() {
                    Some(address) => Some(address),
                    None if !*entered => {
                        *entered = true;
                        current.first_object(heap)
                    }
                    None => None,
                };

                if let Some(address) = address {
                    if let Some(ty) = heap.object_type_with(reader, address) {
                        *cursor = current.next_object(heap, reader, address);
                        return Some(ClrObject::new(heap, address, ty));
                    }
                    log::debug!(
                        "no type for object at 0x{address:x}; ending walk of segment 0x{:x}",
                        current.start()
                    );
                }

                *segment += 1;
                *entered = false;
                *cursor = None;
            },
        }
    }
}
