//! Memory access through `/proc/<pid>/mem`.
//!
//! The file is opened once the threads are attached, since the kernel checks
//! ptrace access at open time. Reads are positional (`pread`) so a single
//! handle serves every caller without seeking.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use crate::error::{DumpError, Result};
use crate::types::ProcessId;

/// Open handle on a process's memory
#[derive(Debug)]
pub struct ProcMem
{
    file: File,
}

impl ProcMem
{
    /// Open `/proc/<pid>/mem` for reading.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: the process exited
    /// - `PermissionDenied`: the caller may not trace the process
    pub fn open(pid: ProcessId) -> Result<Self>
    {
        let path = format!("/proc/{pid}/mem");
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DumpError::ProcessNotFound(pid.0),
            io::ErrorKind::PermissionDenied => DumpError::PermissionDenied(format!("{path}: {e}")),
            _ => DumpError::Io(e),
        })?;
        Ok(Self { file })
    }

    /// Read up to `buffer.len()` bytes at `address`.
    ///
    /// Returns fewer bytes when the range runs into an unmapped page.
    ///
    /// ## Errors
    ///
    /// - `MemoryReadFailed`: nothing at `address` could be read
    pub fn read(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
    {
        if buffer.is_empty() {
            return Ok(0);
        }
        // pread takes a signed offset.
        if i64::try_from(address).is_err() {
            return Err(DumpError::MemoryReadFailed {
                address,
                size: buffer.len(),
                details: "address outside the user range".to_string(),
            });
        }

        loop {
            match self.file.read_at(buffer, address) {
                Ok(read) => return Ok(read),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(DumpError::MemoryReadFailed {
                        address,
                        size: buffer.len(),
                        details: e.to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_read_own_memory()
    {
        let mem = ProcMem::open(ProcessId(std::process::id())).unwrap();
        let value: u64 = 0x1122_3344_5566_7788;
        let mut buf = [0u8; 8];
        let read = mem.read(&value as *const u64 as u64, &mut buf).unwrap();
        assert_eq!(read, 8);
        assert_eq!(u64::from_ne_bytes(buf), value);
    }

    #[test]
    fn test_unmapped_address_fails()
    {
        let mem = ProcMem::open(ProcessId(std::process::id())).unwrap();
        let mut buf = [0u8; 8];
        let err = mem.read(0, &mut buf).unwrap_err();
        assert!(matches!(err, DumpError::MemoryReadFailed { address: 0, .. }));
    }
}
