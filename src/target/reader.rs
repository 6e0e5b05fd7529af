//! Paged read cache over a data target.
//!
//! Walking a heap issues millions of tiny reads: a method-table word here, an array length
//! there, one pointer per reference field. Sending each of them to a dump file or to
//! `/proc/<pid>/mem` would dominate the cost of a walk. [`MemoryReader`] keeps a single
//! window of target memory in a local buffer and serves reads from it until a read falls
//! outside the window, at which point the window is moved to the page containing the
//! missed address.
//!
//! Because heap walks are overwhelmingly sequential, one window is enough; the reader never
//! tries to keep several pages alive.
//!
//! # Failure Semantics
//!
//! All reads return `Option`. A `None` means the memory could not be read and the caller
//! should stop whatever sub-walk it is performing. The reader itself never errors.
//!
//! # Thread Safety
//!
//! A reader mutates its window on every miss and is therefore `Send` but not meant to be
//! shared. Create one per thread with [`crate::heap::Heap::heap_reader`].

use std::sync::Arc;

use super::{
    io::{read_le, read_ptr_at},
    DataTarget, PointerSize,
};

/// Default window size for heap scanning.
pub const HEAP_PAGE_SIZE: usize = 0x10000;

/// Default window size for scattered runtime structure reads.
pub const RUNTIME_PAGE_SIZE: usize = 0x1000;

/// A single-window read cache over a [`DataTarget`].
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use heapscope::target::{InMemoryTarget, MemoryReader, PointerSize};
///
/// let mut memory = InMemoryTarget::new(PointerSize::Bit64);
/// memory.add_region(0x1000, (0u64..16).flat_map(u64::to_le_bytes).collect())?;
///
/// let mut reader = MemoryReader::new(Arc::new(memory), 0x40);
/// assert_eq!(reader.read_pointer(0x1008), Some(1));
/// assert!(reader.contains(0x1010));
/// assert_eq!(reader.read_pointer(0x1078), Some(15));
/// assert_eq!(reader.read_pointer(0x1080), None);
/// # Ok::<(), heapscope::Error>(())
/// ```
pub struct MemoryReader {
    target: Arc<dyn DataTarget>,
    pointer_size: PointerSize,
    /// Address of the first cached byte
    page_start: u64,
    /// Number of valid bytes in `page`
    page_len: usize,
    page: Vec<u8>,
}

impl MemoryReader {
    /// Creates a reader with a window of `page_size` bytes.
    ///
    /// A `page_size` of zero is bumped to one pointer.
    #[must_use]
    pub fn new(target: Arc<dyn DataTarget>, page_size: usize) -> Self {
        let pointer_size = target.pointer_size();
        let page_size = page_size.max(pointer_size.bytes());
        MemoryReader {
            target,
            pointer_size,
            page_start: 0,
            page_len: 0,
            page: vec![0; page_size],
        }
    }

    /// Pointer width of the underlying target.
    #[must_use]
    pub fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }

    /// Capacity of the cached window in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page.len()
    }

    /// The target this reader caches.
    #[must_use]
    pub fn target(&self) -> &Arc<dyn DataTarget> {
        &self.target
    }

    /// Returns `true` if `address` lies inside the currently cached window.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.page_start && address - self.page_start < self.page_len as u64
    }

    /// Drops the cached window so the next read goes to the target.
    pub fn clear(&mut self) {
        self.page_start = 0;
        self.page_len = 0;
    }

    /// Reads a pointer-sized word.
    pub fn read_pointer(&mut self, address: u64) -> Option<u64> {
        let pointer_size = self.pointer_size;
        let bytes = self.cached(address, pointer_size.bytes())?;
        let mut offset = 0;
        read_ptr_at(bytes, &mut offset, pointer_size).ok()
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self, address: u64) -> Option<u32> {
        let bytes = self.cached(address, 4)?;
        read_le::<u32>(bytes).ok()
    }

    /// Reads `len` bytes.
    ///
    /// Returns `None` unless every byte could be read.
    pub fn read_bytes(&mut self, address: u64, len: usize) -> Option<Vec<u8>> {
        if let Some(bytes) = self.cached(address, len) {
            return Some(bytes.to_vec());
        }

        let mut buffer = vec![0; len];
        self.target
            .read_exact(address, &mut buffer)
            .then_some(buffer)
    }

    /// Returns `len` bytes from the window, moving it if needed.
    ///
    /// Reads larger than the window, or straddling the end of a short window, are served
    /// by a direct read into a scratch buffer instead.
    fn cached(&mut self, address: u64, len: usize) -> Option<&[u8]> {
        if !self.window_holds(address, len) {
            if len > self.page.len() {
                return None;
            }
            self.move_to(address, len);
            if !self.window_holds(address, len) {
                return None;
            }
        }

        let offset = usize::try_from(address - self.page_start).ok()?;
        Some(&self.page[offset..offset + len])
    }

    fn window_holds(&self, address: u64, len: usize) -> bool {
        self.contains(address)
            && (address - self.page_start)
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.page_len as u64)
    }

    /// Loads the page-aligned window around `address`. When the aligned window cannot
    /// serve the read (unmapped memory before `address`, or a read straddling the page
    /// end) the window starts at `address` instead.
    fn move_to(&mut self, address: u64, len: usize) {
        let aligned = address - address % self.page.len() as u64;
        self.load(aligned);
        if aligned != address && !self.window_holds(address, len) {
            self.load(address);
        }
    }

    fn load(&mut self, start: u64) {
        self.page_start = start;
        self.page_len = self.target.read_memory(start, &mut self.page);
    }
}

impl std::fmt::Debug for MemoryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReader")
            .field("pointer_size", &self.pointer_size)
            .field("page_start", &format_args!("0x{:x}", self.page_start))
            .field("page_len", &self.page_len)
            .field("page_size", &self.page.len())
            .finish()
    }
}
