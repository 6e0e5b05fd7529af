//! In-memory copy of the heap.
//!
//! Walking a heap touches every segment byte at least once, and repeated walks over a slow
//! target (a live process, a compressed dump) pay for that every time. [`HeapCache`] copies
//! all segments once and records the object list, so later enumerations and reference
//! walks never touch the target for heap memory.
//!
//! The build is cancellable through a [`CancellationToken`] and is published atomically:
//! a cancelled or failed build leaves the heap exactly as it was.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    heap::{ClrTypeRc, Heap},
    target::{DataTarget, PointerSize},
    Error, Result,
};

/// Shared cancellation flag.
///
/// Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

struct CachedSegment {
    start: u64,
    data: Vec<u8>,
}

/// Copied segment memory layered over the original target.
///
/// Reads inside a cached segment are served from the copy; everything else, including
/// the unreadable tail of a truncated segment, goes to the inner target.
struct CachedMemory {
    segments: Vec<CachedSegment>,
    inner: Arc<dyn DataTarget>,
}

impl CachedMemory {
    fn segment_for(&self, address: u64) -> Option<&CachedSegment> {
        let index = self
            .segments
            .partition_point(|segment| segment.start <= address)
            .checked_sub(1)?;
        let segment = &self.segments[index];
        (address - segment.start < segment.data.len() as u64).then_some(segment)
    }
}

impl DataTarget for CachedMemory {
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buffer.len() {
            let Some(current) = address.checked_add(copied as u64) else {
                break;
            };
            let read = match self.segment_for(current) {
                Some(segment) => {
                    let offset = (current - segment.start) as usize;
                    let available = &segment.data[offset..];
                    let len = available.len().min(buffer.len() - copied);
                    buffer[copied..copied + len].copy_from_slice(&available[..len]);
                    len
                }
                None => {
                    let next_cached = self
                        .segments
                        .iter()
                        .map(|segment| segment.start)
                        .find(|start| *start > current)
                        .map_or(buffer.len() - copied, |start| {
                            ((start - current) as usize).min(buffer.len() - copied)
                        });
                    let read = self
                        .inner
                        .read_memory(current, &mut buffer[copied..copied + next_cached]);
                    if read < next_cached {
                        return copied + read;
                    }
                    read
                }
            };
            if read == 0 {
                break;
            }
            copied += read;
        }
        copied
    }

    fn pointer_size(&self) -> PointerSize {
        self.inner.pointer_size()
    }
}

/// Cached segment memory and object index of one heap.
pub struct HeapCache {
    memory: Arc<CachedMemory>,
    objects: Vec<(u64, ClrTypeRc)>,
    cached_bytes: usize,
}

impl HeapCache {
    pub(crate) fn build(heap: &Heap, token: &CancellationToken) -> Result<HeapCache> {
        let chunk_size = heap.config().cache_chunk_size.max(1);
        let target = heap.target();

        let mut segments = Vec::with_capacity(heap.segments().len());
        let mut cached_bytes = 0;
        for segment in heap.segments() {
            // the reported length is untrusted; memory is only reserved as reads succeed
            let length = usize::try_from(segment.length()).unwrap_or(usize::MAX);
            let mut data = Vec::with_capacity(chunk_size.min(length));
            let mut chunk = vec![0u8; chunk_size.min(length)];

            while data.len() < length {
                token.check()?;
                let want = chunk.len().min(length - data.len());
                let address = segment.start() + data.len() as u64;
                let read = target.read_memory(address, &mut chunk[..want]);
                data.extend_from_slice(&chunk[..read]);
                if read < want {
                    log::debug!(
                        "segment 0x{:x} unreadable from 0x{:x}; caching {} of {} bytes",
                        segment.start(),
                        address + read as u64,
                        data.len(),
                        length
                    );
                    break;
                }
            }

            cached_bytes += data.len();
            segments.push(CachedSegment {
                start: segment.start(),
                data,
            });
        }

        let memory = Arc::new(CachedMemory {
            segments,
            inner: Arc::clone(target),
        });

        let mut objects = Vec::new();
        for object in heap.objects_in(Arc::clone(&memory) as Arc<dyn DataTarget>) {
            token.check()?;
            objects.push((object.address(), Arc::clone(object.ty())));
        }

        Ok(HeapCache {
            memory,
            objects,
            cached_bytes,
        })
    }

    /// Target serving reads from the cached segments.
    #[must_use]
    pub fn target(&self) -> Arc<dyn DataTarget> {
        Arc::clone(&self.memory) as Arc<dyn DataTarget>
    }

    /// Objects in enumeration order.
    #[must_use]
    pub fn objects(&self) -> &[(u64, ClrTypeRc)] {
        &self.objects
    }

    /// Number of indexed objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Bytes of segment memory held.
    #[must_use]
    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }
}

impl std::fmt::Debug for HeapCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapCache")
            .field("segments", &self.memory.segments.len())
            .field("objects", &self.objects.len())
            .field("cached_bytes", &self.cached_bytes)
            .finish()
    }
}
