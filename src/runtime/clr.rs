//! The attached runtime.
//!
//! [`ClrRuntime`] pairs a memory target with the provider that describes the runtime
//! living in it, and hands out the [`Heap`] for the provider's current revision.

use std::sync::{Arc, RwLock};

use crate::{
    config::HeapConfig,
    heap::Heap,
    runtime::RuntimeProvider,
    target::{reader::MemoryReader, DataTarget},
    Error, Result,
};

/// One attached CLR instance: a memory target, the provider describing its runtime, and
/// the lazily built heap for the current revision.
///
/// # Examples
///
/// ```rust
/// use heapscope::prelude::*;
///
/// let image = HeapImageBuilder::new(PointerSize::Bit64).build()?;
/// let runtime = image.into_runtime()?;
///
/// let heap = runtime.heap()?;
/// runtime.flush();
/// assert!(heap.check_revision().is_err());
/// assert!(runtime.heap()?.check_revision().is_ok());
/// # Ok::<(), heapscope::Error>(())
/// ```
pub struct ClrRuntime {
    target: Arc<dyn DataTarget>,
    provider: Arc<dyn RuntimeProvider>,
    config: HeapConfig,
    heap: RwLock<Option<Arc<Heap>>>,
}

impl ClrRuntime {
    /// Attaches to a runtime with the default configuration.
    ///
    /// # Errors
    /// Returns [`Error::PointerSizeMismatch`] if the target and the provider disagree on the
    /// pointer width.
    pub fn new(target: Arc<dyn DataTarget>, provider: Arc<dyn RuntimeProvider>) -> Result<Self> {
        Self::with_config(target, provider, HeapConfig::default())
    }

    /// Attaches to a runtime with an explicit configuration.
    ///
    /// # Errors
    /// Returns [`Error::PointerSizeMismatch`] if the target and the provider disagree on the
    /// pointer width.
    pub fn with_config(
        target: Arc<dyn DataTarget>,
        provider: Arc<dyn RuntimeProvider>,
        config: HeapConfig,
    ) -> Result<Self> {
        if target.pointer_size() != provider.pointer_size() {
            return Err(Error::PointerSizeMismatch {
                target: target.pointer_size().bytes(),
                runtime: provider.pointer_size().bytes(),
            });
        }

        Ok(ClrRuntime {
            target,
            provider,
            config,
            heap: RwLock::new(None),
        })
    }

    /// The memory target.
    #[must_use]
    pub fn target(&self) -> &Arc<dyn DataTarget> {
        &self.target
    }

    /// The runtime provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn RuntimeProvider> {
        &self.provider
    }

    /// Heap configuration.
    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Current runtime revision.
    #[must_use]
    pub fn revision(&self) -> u32 {
        self.provider.revision()
    }

    /// Reader for scattered runtime structure reads.
    #[must_use]
    pub fn reader(&self) -> MemoryReader {
        MemoryReader::new(Arc::clone(&self.target), self.config.runtime_page_size)
    }

    /// Returns the heap for the current revision, building it on first use.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the heap slot is poisoned, or any error raised while
    /// building the heap.
    pub fn heap(&self) -> Result<Arc<Heap>> {
        let revision = self.provider.revision();
        {
            let slot = self.heap.read().map_err(|_| Error::LockError)?;
            if let Some(heap) = slot.as_ref().filter(|heap| heap.revision() == revision) {
                return Ok(Arc::clone(heap));
            }
        }

        let mut slot = self.heap.write().map_err(|_| Error::LockError)?;
        if let Some(heap) = slot.as_ref().filter(|heap| heap.revision() == revision) {
            return Ok(Arc::clone(heap));
        }

        let heap = Arc::new(Heap::new(
            Arc::clone(&self.target),
            Arc::clone(&self.provider),
            self.config.clone(),
        )?);
        *slot = Some(Arc::clone(&heap));
        Ok(heap)
    }

    /// Discards cached runtime state.
    ///
    /// Heaps obtained earlier stay alive but report [`Error::StaleSnapshot`] from then on;
    /// the next [`ClrRuntime::heap`] call builds a fresh one.
    pub fn flush(&self) {
        self.provider.flush();
        if let Ok(mut slot) = self.heap.write() {
            *slot = None;
        }
        log::debug!("runtime flushed, now at revision {}", self.provider.revision());
    }
}

impl std::fmt::Debug for ClrRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClrRuntime")
            .field("pointer_size", &self.target.pointer_size())
            .field("revision", &self.provider.revision())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        runtime::snapshot::{HeapImageBuilder, SnapshotRuntime},
        target::{memory::InMemoryTarget, PointerSize},
    };

    #[test]
    fn pointer_size_mismatch_rejected() {
        let target: Arc<dyn DataTarget> = Arc::new(InMemoryTarget::new(PointerSize::Bit32));
        let provider: Arc<dyn RuntimeProvider> = Arc::new(SnapshotRuntime::new(PointerSize::Bit64));

        match ClrRuntime::new(target, provider) {
            Err(Error::PointerSizeMismatch { target, runtime }) => {
                assert_eq!(target, 4);
                assert_eq!(runtime, 8);
            }
            other => panic!("expected pointer size mismatch, got {other:?}"),
        }
    }

    #[test]
    fn heap_is_shared_until_flush() {
        let runtime = HeapImageBuilder::new(PointerSize::Bit64)
            .build()
            .unwrap()
            .into_runtime()
            .unwrap();

        let first = runtime.heap().unwrap();
        let second = runtime.heap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        runtime.flush();
        assert_eq!(runtime.revision(), 1);
        let third = runtime.heap().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(matches!(
            first.check_revision(),
            Err(Error::StaleSnapshot { expected: 0, actual: 1 })
        ));
    }
}
