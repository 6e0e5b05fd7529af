//! Heap inspection configuration.
//!
//! [`HeapConfig`] groups the tunables of the heap walker: cache window sizes, the
//! plausibility limits used by careful reference walks and the chunking of heap cache
//! builds. The defaults match what the CLR itself uses where a runtime constant exists
//! (for example the 85000 byte large object threshold).
//!
//! # Example
//!
//! ```rust
//! use heapscope::HeapConfig;
//!
//! // Use a preset
//! let config = HeapConfig::careful();
//! assert!(config.careful_walks);
//!
//! // Or customize
//! let config = HeapConfig::new()
//!     .with_heap_page_size(0x4000)
//!     .with_large_object_threshold(100_000);
//! assert_eq!(config.heap_page_size, 0x4000);
//! ```

use crate::target::reader::{HEAP_PAGE_SIZE, RUNTIME_PAGE_SIZE};

/// Objects at least this large are allocated on the large object heap by the CLR.
pub const LARGE_OBJECT_THRESHOLD: u64 = 85_000;

/// Tunables for heap walking.
///
/// # Default Configuration
///
/// - 64 KiB reader window for heap scans, 4 KiB for runtime structure reads
/// - 85000 byte large object threshold for careful walks
/// - 1 MiB chunks when caching the heap
/// - Careful walks disabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Reader window used while enumerating objects and walking references.
    pub heap_page_size: usize,

    /// Reader window used for scattered reads such as method tables and GCDescs.
    pub runtime_page_size: usize,

    /// Largest plausible object outside the large object heap. Careful walks skip objects
    /// in small-object segments that claim to be bigger than this.
    pub large_object_threshold: u64,

    /// Whether reference walks validate object bounds unless told otherwise.
    pub careful_walks: bool,

    /// Bytes copied per step when caching the heap; cancellation is checked between chunks.
    pub cache_chunk_size: usize,

    /// Maximum number of GCDesc series accepted before a descriptor is treated as corrupt.
    pub max_gcdesc_series: usize,

    /// Longest string, in UTF-16 units, that [`crate::heap::ClrObject::as_string`] decodes.
    pub max_string_length: u32,
}

impl HeapConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for badly damaged dumps: every reference walk validates its source
    /// object and the reader windows are kept small.
    #[must_use]
    pub fn careful() -> Self {
        HeapConfig {
            careful_walks: true,
            heap_page_size: 0x4000,
            ..Self::default()
        }
    }

    /// Sets the heap scanning window.
    #[must_use]
    pub fn with_heap_page_size(mut self, size: usize) -> Self {
        self.heap_page_size = size;
        self
    }

    /// Sets the runtime read window.
    #[must_use]
    pub fn with_runtime_page_size(mut self, size: usize) -> Self {
        self.runtime_page_size = size;
        self
    }

    /// Sets the large object threshold used by careful walks.
    #[must_use]
    pub fn with_large_object_threshold(mut self, threshold: u64) -> Self {
        self.large_object_threshold = threshold;
        self
    }

    /// Enables or disables careful reference walks by default.
    #[must_use]
    pub fn with_careful_walks(mut self, careful: bool) -> Self {
        self.careful_walks = careful;
        self
    }

    /// Sets the heap cache chunk size. Zero is treated as one byte.
    #[must_use]
    pub fn with_cache_chunk_size(mut self, size: usize) -> Self {
        self.cache_chunk_size = size.max(1);
        self
    }

    /// Sets the GCDesc series limit.
    #[must_use]
    pub fn with_max_gcdesc_series(mut self, max: usize) -> Self {
        self.max_gcdesc_series = max;
        self
    }

    /// Sets the longest decoded string.
    #[must_use]
    pub fn with_max_string_length(mut self, max: u32) -> Self {
        self.max_string_length = max;
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            heap_page_size: HEAP_PAGE_SIZE,
            runtime_page_size: RUNTIME_PAGE_SIZE,
            large_object_threshold: LARGE_OBJECT_THRESHOLD,
            careful_walks: false,
            cache_chunk_size: 0x10_0000,
            max_gcdesc_series: 0x1_0000,
            max_string_length: 0x10_0000,
        }
    }
}
