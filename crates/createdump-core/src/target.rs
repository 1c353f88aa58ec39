//! # Dump Target Trait
//!
//! The interface between the orchestrator and a platform.
//!
//! Each platform reaches the target process through its own system APIs:
//!
//! - **Linux**: `ptrace` for suspension and registers, `/proc/<pid>/mem` for memory
//! - **macOS**: Mach task and thread ports
//!
//! The orchestrator in [`crash_info`](crate::crash_info) only talks to these
//! traits, so the whole pipeline runs unchanged against a mock target in tests.

use crate::error::{DumpError, Result};
use crate::identity::ProcessIdentity;
use crate::maps::ProcessMaps;
use crate::threads::ThreadSnapshot;
use crate::types::{Architecture, ProcessId, ThreadId};

/// Read access to the target's address space
pub trait ProcessMemory
{
    /// Read up to `buffer.len()` bytes starting at `address`.
    ///
    /// Returns the number of bytes read, which may be short when the range
    /// runs into an unmapped page.
    ///
    /// ## Errors
    ///
    /// - `MemoryReadFailed`: the first byte could not be read
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>;

    /// Read exactly `buffer.len()` bytes.
    ///
    /// ## Errors
    ///
    /// - `MemoryReadFailed`: the range is not fully readable
    fn read_exact(&self, address: u64, buffer: &mut [u8]) -> Result<()>
    {
        let mut done = 0;
        while done < buffer.len() {
            let at = address + done as u64;
            let read = self.read_memory(at, &mut buffer[done..])?;
            if read == 0 {
                return Err(DumpError::MemoryReadFailed {
                    address: at,
                    size: buffer.len() - done,
                    details: "short read".to_string(),
                });
            }
            done += read;
        }
        Ok(())
    }

    /// Read a native-endian `u64`.
    fn read_u64(&self, address: u64) -> Result<u64>
    {
        let mut word = [0u8; 8];
        self.read_exact(address, &mut word)?;
        Ok(u64::from_ne_bytes(word))
    }

    /// True when the byte at `address` can be read.
    fn is_readable(&self, address: u64) -> bool
    {
        let mut probe = [0u8; 1];
        matches!(self.read_memory(address, &mut probe), Ok(1))
    }

    /// Read a NUL-terminated string of at most `max` bytes.
    ///
    /// Stops early at the end of readable memory; invalid UTF-8 is replaced.
    ///
    /// ## Errors
    ///
    /// - `MemoryReadFailed`: nothing at `address` could be read
    fn read_c_string(&self, address: u64, max: usize) -> Result<String>
    {
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 256];
        while bytes.len() < max {
            let want = chunk.len().min(max - bytes.len());
            let read = match self.read_memory(address + bytes.len() as u64, &mut chunk[..want]) {
                Ok(read) => read,
                Err(e) if bytes.is_empty() => return Err(e),
                Err(_) => break,
            };
            if read == 0 {
                break;
            }
            if let Some(end) = chunk[..read].iter().position(|byte| *byte == 0) {
                bytes.extend_from_slice(&chunk[..end]);
                break;
            }
            bytes.extend_from_slice(&chunk[..read]);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A process that can be frozen and captured
///
/// ## Lifecycle
///
/// 1. Open a target: `LinuxTarget::attach(pid)` / `MacOSTarget::attach(pid)`
/// 2. [`suspend_threads`](DumpTarget::suspend_threads)
/// 3. [`capture_registers`](DumpTarget::capture_registers) for every thread,
///    [`identity`](DumpTarget::identity), [`discover_maps`](DumpTarget::discover_maps),
///    memory reads
/// 4. [`resume_threads`](DumpTarget::resume_threads)
///
/// ## Suspension bookkeeping
///
/// Implementations remember every thread they successfully suspended, even
/// when `suspend_threads` fails part-way, so that `resume_threads` can undo
/// exactly those suspensions. Calling `resume_threads` a second time does
/// nothing.
pub trait DumpTarget: ProcessMemory
{
    /// Process being dumped.
    fn pid(&self) -> ProcessId;

    /// Architecture of the target's register state.
    fn architecture(&self) -> Architecture;

    /// Page size of the target.
    fn page_size(&self) -> u64;

    /// Freeze every thread of the process and list them.
    ///
    /// ## Platform-specific behavior
    ///
    /// - **Linux**: `PTRACE_ATTACH` on every entry of `/proc/<pid>/task`,
    ///   followed by `waitpid(__WALL)`. Skipped when a companion debugger
    ///   already controls the process.
    /// - **macOS**: `thread_suspend` followed by `thread_abort_safely`
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: the process is gone
    /// - `PermissionDenied`: the caller may not trace it
    /// - `SuspendFailed`: a thread could not be frozen
    fn suspend_threads(&mut self) -> Result<Vec<ThreadId>>;

    /// Capture the registers of a suspended thread.
    ///
    /// A floating-point block the kernel does not provide is recorded as
    /// absent, not as an error.
    ///
    /// ## Errors
    ///
    /// - `ReadRegistersFailed`: the general-purpose block could not be read
    fn capture_registers(&mut self, tid: ThreadId) -> Result<ThreadSnapshot>;

    /// Undo every suspension made so far. Failures are logged, not returned.
    fn resume_threads(&mut self);

    /// Ids, credentials, name and auxiliary vector of the process.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: the process is gone
    /// - `Io`: the process information could not be read
    fn identity(&mut self) -> Result<ProcessIdentity>;

    /// Enumerate and classify the process's mappings.
    ///
    /// Includes the loader walk that records image headers. Implementations
    /// retry the loader walk with [`retry_transient`](crate::maps::retry_transient).
    ///
    /// ## Errors
    ///
    /// - `Timeout`: the module list never settled
    /// - `Io`: the mapping list could not be read
    fn discover_maps(&mut self, identity: &ProcessIdentity) -> Result<ProcessMaps>;
}

impl<T: ProcessMemory + ?Sized> ProcessMemory for &T
{
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
    {
        (**self).read_memory(address, buffer)
    }
}

impl<T: ProcessMemory + ?Sized> ProcessMemory for Box<T>
{
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
    {
        (**self).read_memory(address, buffer)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    /// Memory that is readable in 3-byte bursts over `[0x100, 0x110)`.
    struct Choppy;

    impl ProcessMemory for Choppy
    {
        fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
        {
            if !(0x100..0x110).contains(&address) {
                return Err(DumpError::MemoryReadFailed {
                    address,
                    size: buffer.len(),
                    details: "unmapped".to_string(),
                });
            }
            let n = buffer.len().min(3).min((0x110 - address) as usize);
            for (i, byte) in buffer[..n].iter_mut().enumerate() {
                *byte = (address as usize + i) as u8;
            }
            Ok(n)
        }
    }

    #[test]
    fn test_read_exact_assembles_short_reads()
    {
        let mut buf = [0u8; 8];
        Choppy.read_exact(0x100, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_read_exact_fails_past_mapping()
    {
        let mut buf = [0u8; 8];
        let err = Choppy.read_exact(0x10c, &mut buf).unwrap_err();
        assert!(matches!(err, DumpError::MemoryReadFailed { address: 0x110, .. }));
    }

    #[test]
    fn test_is_readable()
    {
        assert!(Choppy.is_readable(0x10f));
        assert!(!Choppy.is_readable(0x110));
    }
}
