use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Most failures encountered while walking a heap are *not* reported through this type.
/// Unreadable memory, unknown method tables and damaged segments are expected in crash
/// dumps, so the walkers swallow them and simply stop the affected sub-walk. The variants
/// below are reserved for conditions where continuing would produce wrong answers, such as
/// using a heap after its runtime has been flushed, or for plain I/O problems when opening
/// a target.
///
/// # Error Categories
///
/// ## Contract Violations
/// - [`Error::StaleSnapshot`] - A heap was used after its runtime revision changed
/// - [`Error::PointerSizeMismatch`] - Target and runtime disagree on the pointer width
/// - [`Error::InvalidPointerSize`] - A pointer width other than 4 or 8 was requested
///
/// ## Target Errors
/// - [`Error::FileError`] - Filesystem I/O errors while opening a target
/// - [`Error::OutOfBounds`] - A read went past the end of a buffer
/// - [`Error::Malformed`] - Layout or image description is internally inconsistent
/// - [`Error::NotSupported`] - The operation is not available on this platform
///
/// ## Control Flow
/// - [`Error::Cancelled`] - A cancellable operation observed its cancellation token
///
/// # Examples
///
/// ```rust,no_run
/// use heapscope::{Error, runtime::ClrRuntime};
///
/// fn count(runtime: &ClrRuntime) -> heapscope::Result<usize> {
///     let heap = runtime.heap()?;
///     match heap.enumerate_objects() {
///         Ok(objects) => Ok(objects.count()),
///         Err(Error::StaleSnapshot { .. }) => {
///             runtime.flush();
///             Ok(runtime.heap()?.enumerate_objects()?.count())
///         }
///         Err(e) => Err(e),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The heap snapshot no longer matches the runtime it was built from.
    ///
    /// Raised when a [`crate::heap::Heap`] is used after the owning runtime was flushed.
    /// The caller must request a fresh heap.
    ///
    /// # Fields
    ///
    /// * `expected` - Revision the heap was built against
    /// * `actual` - Current revision reported by the runtime provider
    #[error("Heap snapshot is stale - built at revision {expected}, runtime is at {actual}")]
    StaleSnapshot {
        /// Revision the snapshot was built against
        expected: u32,
        /// Revision currently reported by the runtime
        actual: u32,
    },

    /// The data target and the runtime provider report different pointer sizes.
    #[error("Pointer size mismatch - target uses {target} bytes, runtime uses {runtime} bytes")]
    PointerSizeMismatch {
        /// Pointer size of the data target in bytes
        target: usize,
        /// Pointer size of the runtime provider in bytes
        runtime: usize,
    },

    /// A pointer size other than 4 or 8 bytes was requested.
    #[error("Invalid pointer size - {0}")]
    InvalidPointerSize(usize),

    /// A description of the target is internally inconsistent.
    ///
    /// The error includes the source location where the malformation was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while decoding a buffer.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The requested operation is not supported on this platform.
    #[error("This operation is not supported")]
    NotSupported,

    /// A cancellable operation was cancelled before it completed.
    ///
    /// No partial results are published when this is returned.
    #[error("Operation was cancelled")]
    Cancelled,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur while opening dump images or
    /// process memory.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
