// Copyright 2025 The heapscope Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # heapscope
//!
//! Managed heap inspection for .NET processes and memory dumps, in pure Rust.
//!
//! `heapscope` reads the CLR garbage-collected heap out of a raw memory image: it finds
//! the GC segments, walks every object in them, resolves each object's type from its
//! method table and enumerates the references each object holds using the runtime's own
//! GC descriptors. The result is the object graph a garbage collector would see.
//!
//! ## Features
//!
//! - **Any memory source** - memory-mapped dump files, live Linux processes, or in-memory images
//! - **Paged reads** - a single-window read cache keeps sequential heap scans cheap
//! - **Exact reference maps** - GCDesc decoding for regular types and value-type arrays
//! - **Damage tolerant** - malformed segments, unknown method tables and unreadable memory end a walk early instead of failing it
//! - **Snapshot consistent** - heaps are bound to a runtime revision and refuse to mix data across flushes
//! - **Heap caching** - optional, cancellable in-memory copy of all segments for repeated walks
//!
//! ## Quick Start
//!
//! ```rust
//! use heapscope::prelude::*;
//!
//! // Describe a tiny heap: one segment holding a string and an object pointing at it.
//! let mut builder = HeapImageBuilder::new(PointerSize::Bit64);
//! let holder = builder.method_table(TypeSpec::class("Holder", 24).with_references(&[8]));
//! let segment = builder.segment(SegmentData::gen2(0x1_0000, 0x1_1000));
//! let object = builder.object(segment, holder);
//! let text = builder.string(segment, "hi");
//! builder.set_pointer(object + 8, text);
//!
//! let runtime = builder.build()?.into_runtime()?;
//! let heap = runtime.heap()?;
//!
//! for object in heap.enumerate_objects()? {
//!     println!("0x{:x} {:?}", object.address(), object.ty().name());
//! }
//!
//! let refs = heap.references(object, false)?;
//! assert_eq!(heap.get_object(refs[0].target).unwrap().as_string().as_deref(), Some("hi"));
//! # Ok::<(), heapscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`target`] - Memory sources ([`target::DataTarget`]) and the paged [`target::MemoryReader`]
//! - [`runtime`] - The [`runtime::RuntimeProvider`] interface, [`runtime::ClrRuntime`] and the
//!   table-driven [`runtime::snapshot`] provider
//! - [`heap`] - Segments, types, GCDescs, object enumeration, reference walks and the heap cache
//! - [`metadata`] - Type tokens
//! - [`config`] - [`HeapConfig`] tunables
//!
//! ## Error Handling
//!
//! Operations that can fail as a whole return [`Result`]. Damage inside the heap is not an
//! error: an unreadable word or an unknown method table produces `None` or ends the current
//! walk early, since real dumps are routinely incomplete.
//!
//! ## Logging
//!
//! Diagnostics are emitted through the [`log`] facade. Skipped segments are reported at
//! `warn`, early walk terminations and descriptor rejections at `debug`.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use heapscope::prelude::*;
///
/// let runtime = HeapImageBuilder::new(PointerSize::Bit32).build()?.into_runtime()?;
/// assert_eq!(runtime.heap()?.segments().len(), 0);
/// # Ok::<(), heapscope::Error>(())
/// ```
pub mod prelude;

pub mod config;
pub mod heap;
pub mod metadata;
pub mod runtime;
pub mod target;

/// `heapscope` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always
/// [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `heapscope` Error type
///
/// # Examples
///
/// ```rust
/// use heapscope::{Error, prelude::*};
///
/// let runtime = HeapImageBuilder::new(PointerSize::Bit64).build()?.into_runtime()?;
/// let heap = runtime.heap()?;
/// runtime.flush();
///
/// match heap.enumerate_objects() {
///     Err(Error::StaleSnapshot { expected, actual }) => assert_eq!((expected, actual), (0, 1)),
///     Err(e) => panic!("unexpected error {e}"),
///     Ok(_) => panic!("stale heap was enumerated"),
/// }
/// # Ok::<(), heapscope::Error>(())
/// ```
pub use error::Error;

pub use config::HeapConfig;
pub use heap::{ClrObject, ClrType, Heap};
pub use runtime::{ClrRuntime, RuntimeProvider};
pub use target::{DataTarget, MemoryReader, PointerSize};
