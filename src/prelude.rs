//! # heapscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the heapscope library. Import this module to get quick access to the essential
//! types for heap inspection.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all heapscope operations
pub use crate::Error;

/// The result type used throughout heapscope
pub use crate::Result;

/// Heap walking tunables
pub use crate::HeapConfig;

// ================================================================================================
// Memory Targets
// ================================================================================================

/// Memory source abstraction and pointer width
pub use crate::target::{DataTarget, PointerSize};

/// Concrete memory sources
pub use crate::target::{InMemoryTarget, MappedRegion, MappedTarget, ProcessTarget};

/// Paged reader over a target
pub use crate::target::MemoryReader;

// ================================================================================================
// Runtime
// ================================================================================================

/// Attached runtime and its provider interface
pub use crate::runtime::{ClrRuntime, RuntimeProvider};

/// Heap layout description reported by providers
pub use crate::runtime::{AllocationContext, HeapLayout, MethodTableData, SegmentData};

/// Table-driven provider and synthetic heap images
pub use crate::runtime::snapshot::{HeapImage, HeapImageBuilder, SnapshotRuntime, TypeSpec};

// ================================================================================================
// Heap
// ================================================================================================

/// The heap and its objects
pub use crate::heap::{ClrObject, Heap, ObjectReference};

/// Segments and generations
pub use crate::heap::{Generation, Segment};

/// Resolved types
pub use crate::heap::{ClrType, ClrTypeRc, ElementKind, TypeFlags};

/// GC descriptors
pub use crate::heap::gcdesc::GcDesc;

/// Heap caching
pub use crate::heap::{CancellationToken, HeapCache};

/// Metadata token type identifying a type definition
pub use crate::metadata::token::Token;
