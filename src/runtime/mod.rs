//! Runtime metadata providers.
//!
//! The heap walker does not understand runtime internals on its own. Everything it needs to
//! know about a particular CLR build, such as where the GC segments are, how large an
//! instance of a method table is, and which module owns a type, comes from a
//! [`RuntimeProvider`]. In production the provider is backed by the Data Access Component
//! shipped with the runtime; offline tooling and tests use
//! [`crate::runtime::snapshot::SnapshotRuntime`].
//!
//! Providers are selected once per attach. The heap, segment and type code is written
//! against `dyn RuntimeProvider` only and never branches on the runtime flavor.
//!
//! # Key Components
//!
//! - [`RuntimeProvider`] - Query interface implemented per runtime flavor
//! - [`HeapLayout`], [`SegmentData`], [`AllocationContext`] - Heap layout description
//! - [`MethodTableData`] - Per-type sizing and identity information
//! - [`crate::runtime::ClrRuntime`] - Owner of a target/provider pair and its heap
//! - [`crate::runtime::snapshot`] - Table-driven provider and synthetic image builder

mod clr;
pub mod snapshot;

pub use clr::ClrRuntime;

use crate::{
    heap::ElementKind,
    metadata::token::Token,
    target::PointerSize,
    Result,
};

/// Raw description of one GC segment as reported by the runtime.
///
/// Generation boundaries are only meaningful for the ephemeral segment. For every other
/// small-object segment the whole committed range belongs to generation 2, and large
/// segments form their own bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentData {
    /// First byte of the segment (also the first object)
    pub start: u64,
    /// End of committed memory
    pub committed_end: u64,
    /// End of reserved memory
    pub reserved_end: u64,
    /// Start of generation 1 (ephemeral segment only)
    pub gen1_start: u64,
    /// Start of generation 0 (ephemeral segment only)
    pub gen0_start: u64,
    /// Whether the segment holds generations 0 and 1
    pub is_ephemeral: bool,
    /// Whether the segment belongs to the large object heap
    pub is_large: bool,
    /// Index of the owning GC heap (server GC has one per core)
    pub heap_index: usize,
}

impl SegmentData {
    /// Describes a generation-2 small-object segment.
    #[must_use]
    pub fn gen2(start: u64, committed_end: u64) -> Self {
        SegmentData {
            start,
            committed_end,
            reserved_end: committed_end,
            gen1_start: committed_end,
            gen0_start: committed_end,
            is_ephemeral: false,
            is_large: false,
            heap_index: 0,
        }
    }

    /// Describes the ephemeral segment with its generation 1 and 0 boundaries.
    #[must_use]
    pub fn ephemeral(start: u64, gen1_start: u64, gen0_start: u64, committed_end: u64) -> Self {
        SegmentData {
            start,
            committed_end,
            reserved_end: committed_end,
            gen1_start,
            gen0_start,
            is_ephemeral: true,
            is_large: false,
            heap_index: 0,
        }
    }

    /// Describes a large-object-heap segment.
    #[must_use]
    pub fn large(start: u64, committed_end: u64) -> Self {
        SegmentData {
            is_large: true,
            ..SegmentData::gen2(start, committed_end)
        }
    }

    /// Sets the reserved end.
    #[must_use]
    pub fn with_reserved_end(mut self, reserved_end: u64) -> Self {
        self.reserved_end = reserved_end;
        self
    }

    /// Sets the owning heap index.
    #[must_use]
    pub fn with_heap_index(mut self, heap_index: usize) -> Self {
        self.heap_index = heap_index;
        self
    }
}

/// A thread's allocation context: `[pointer, limit)` is reserved but holds no objects yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationContext {
    /// Current allocation pointer
    pub pointer: u64,
    /// End of the reserved allocation window
    pub limit: u64,
}

/// Complete description of the GC heap at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapLayout {
    /// Whether the runtime uses server GC (multiple logical heaps)
    pub server_gc: bool,
    /// All segments, in any order
    pub segments: Vec<SegmentData>,
    /// Active allocation contexts
    pub allocation_contexts: Vec<AllocationContext>,
}

/// Sizing and identity information for one method table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodTableData {
    /// Instance size including the object header
    pub base_size: u32,
    /// Size of one array element or string character, zero for fixed-size types
    pub component_size: u32,
    /// Whether instances contain object references (and thus carry a GCDesc)
    pub contains_pointers: bool,
    /// Metadata token of the type definition
    pub token: Token,
    /// Parent method table, zero for `System.Object`
    pub parent: u64,
    /// Category of the type
    pub kind: ElementKind,
}

/// Query interface over one runtime flavor's internals.
///
/// All lookups are fallible in the soft sense: `None` means the runtime does not recognize
/// the address, which is routine for corrupted dumps and must not be treated as an error.
pub trait RuntimeProvider: Send + Sync {
    /// Pointer width of the runtime.
    fn pointer_size(&self) -> PointerSize;

    /// Monotonic counter that changes every time the provider is flushed.
    fn revision(&self) -> u32;

    /// Discards cached runtime state and bumps [`RuntimeProvider::revision`].
    fn flush(&self);

    /// Reports the current heap layout.
    ///
    /// # Errors
    /// Returns an error if the runtime cannot describe its heap at all.
    fn heap_layout(&self) -> Result<HeapLayout>;

    /// Looks up sizing and identity information for a method table.
    fn method_table_data(&self, method_table: u64) -> Option<MethodTableData>;

    /// Returns the module that defines `method_table`.
    fn module_for_method_table(&self, method_table: u64) -> Option<u64>;

    /// Method table used for free (filler) objects.
    fn free_method_table(&self) -> u64;

    /// Method table shared by arrays of reference types, whose element type is stored in
    /// each array instance.
    fn array_method_table(&self) -> u64;

    /// Human-readable type name, if available.
    fn type_name(&self, method_table: u64) -> Option<String> {
        let _ = method_table;
        None
    }
}
