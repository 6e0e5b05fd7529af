//! Live process memory as a data target.
//!
//! On Linux the memory of a process can be read through `/proc/<pid>/mem` without stopping
//! it, provided the caller is allowed to ptrace the process. Reads of unmapped pages fail
//! with `EIO`, which maps naturally onto the short-read contract of
//! [`crate::target::DataTarget`]. Other platforms return [`crate::Error::NotSupported`].
//!
//! The target assumes the inspected process has the same pointer width as the host.

#[cfg(target_os = "linux")]
use std::{fs, os::unix::fs::FileExt};

use super::{DataTarget, PointerSize};
use crate::Result;

/// Reads memory of a running process.
///
/// # Examples
///
/// ```rust,no_run
/// use heapscope::target::{DataTarget, ProcessTarget};
///
/// let target = ProcessTarget::attach(1234)?;
/// let word = target.read_pointer_sized(0x7fff_0000_1000);
/// # Ok::<(), heapscope::Error>(())
/// ```
#[derive(Debug)]
pub struct ProcessTarget {
    pid: u32,
    #[cfg(target_os = "linux")]
    mem: fs::File,
}

impl ProcessTarget {
    /// Opens the memory of process `pid` for reading.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the process memory cannot be opened, or
    /// [`crate::Error::NotSupported`] on platforms without `/proc`.
    #[cfg(target_os = "linux")]
    pub fn attach(pid: u32) -> Result<ProcessTarget> {
        let mem = fs::File::open(format!("/proc/{pid}/mem"))?;
        log::debug!("attached to process {pid}");
        Ok(ProcessTarget { pid, mem })
    }

    /// Opens the memory of process `pid` for reading.
    ///
    /// # Errors
    /// Always returns [`crate::Error::NotSupported`] on this platform.
    #[cfg(not(target_os = "linux"))]
    pub fn attach(pid: u32) -> Result<ProcessTarget> {
        let _ = pid;
        Err(crate::Error::NotSupported)
    }

    /// Process id of the attached process.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl DataTarget for ProcessTarget {
    #[cfg(target_os = "linux")]
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buffer.len() {
            match self
                .mem
                .read_at(&mut buffer[copied..], address + copied as u64)
            {
                Ok(0) | Err(_) => break,
                Ok(count) => copied += count,
            }
        }
        copied
    }

    #[cfg(not(target_os = "linux"))]
    fn read_memory(&self, _address: u64, _buffer: &mut [u8]) -> usize {
        0
    }

    fn pointer_size(&self) -> PointerSize {
        PointerSize::host()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn read_own_memory() {
        let data: Box<[u64; 4]> = Box::new([0x1111, 0x2222, 0x3333, 0x4444]);
        let address = data.as_ptr() as u64;

        let target = ProcessTarget::attach(std::process::id()).unwrap();
        assert_eq!(target.pid(), std::process::id());

        let mut buffer = [0u8; 16];
        assert_eq!(target.read_memory(address + 8, &mut buffer), 16);
        assert_eq!(&buffer[..8], &0x2222_u64.to_le_bytes());
        assert_eq!(&buffer[8..], &0x3333_u64.to_le_bytes());
    }

    #[test]
    fn unmapped_read_is_short() {
        let target = ProcessTarget::attach(std::process::id()).unwrap();
        let mut buffer = [0u8; 8];
        assert_eq!(target.read_memory(0, &mut buffer), 0);
    }
}
