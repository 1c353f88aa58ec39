//! # Data Access Component Bridge
//!
//! The runtime ships an introspection module (the data access component, or
//! DAC) that knows which parts of the managed heap, JIT tables and loader
//! structures a debugger will need. We load it, hand it a read-only view of
//! the target, and collect the ranges it reports.
//!
//! ## Flow
//!
//! 1. A [`DacLoader`] locates the module and resolves its entry point
//! 2. The resulting [`DacSession`] is asked to [`enumerate`](DacSession::enumerate) once
//! 3. The module reads target memory through a [`DataTarget`]; every page it
//!    touches is recorded by [`RecordingDataTarget`]
//! 4. Every range it reports goes through the same region insert used for
//!    everything else
//!
//! The native loader lives in [`module`]; tests substitute their own sessions.

pub mod module;

use std::cell::RefCell;

use tracing::trace;

use crate::error::{DumpError, Result};
use crate::maps::ProcessMaps;
use crate::regions::{MemoryRegion, RegionSet};
use crate::target::ProcessMemory;
use crate::threads::ThreadSnapshot;
use crate::types::{Architecture, ThreadId};

pub use module::{LibraryDacLoader, DAC_ENTRY_POINT, DAC_MODULE_NAME};

/// PE machine code for x86-64, as the data access component expects it
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
/// PE machine code for arm64
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

/// What the data access component may ask about the target
///
/// Everything is read-only; [`write_virtual`](DataTarget::write_virtual)
/// always fails.
pub trait DataTarget
{
    /// Read target memory, returning the number of bytes read.
    ///
    /// ## Errors
    ///
    /// - `MemoryReadFailed`: nothing could be read at `address`
    fn read_virtual(&self, address: u64, buffer: &mut [u8]) -> Result<usize>;

    /// Writing is never allowed.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: always
    fn write_virtual(&self, address: u64, _data: &[u8]) -> Result<()>
    {
        Err(DumpError::InvalidArgument(format!(
            "refusing to write target memory at 0x{address:x}"
        )))
    }

    /// General-purpose registers of `tid` as little-endian words in `elf_gregset_t` order.
    ///
    /// ## Errors
    ///
    /// - `ReadRegistersFailed`: the thread is unknown
    fn thread_context(&self, tid: ThreadId) -> Result<Vec<u8>>;

    /// Load address of the module called `name`.
    fn image_base(&self, name: &str) -> Option<u64>;

    /// PE machine code of the target.
    fn machine_type(&self) -> u16;

    /// Pointer size in bytes.
    fn pointer_size(&self) -> u32;
}

/// A loaded data access component, ready to enumerate once
pub trait DacSession
{
    /// Ask the component for every range a `kind` dump needs.
    ///
    /// `kind` is the minidump flag word of the dump kind. Each reported range
    /// is passed to `sink` as `(address, size)`.
    ///
    /// ## Errors
    ///
    /// - `DacFailed`: the component reported a failure
    fn enumerate(&mut self, kind: u32, target: &dyn DataTarget, sink: &mut dyn FnMut(u64, u64)) -> Result<()>;
}

/// Finds and loads a data access component
pub trait DacLoader
{
    /// Load the component.
    ///
    /// ## Errors
    ///
    /// - `DacMissing`: the module or its entry point could not be found
    fn load(&self) -> Result<Box<dyn DacSession>>;
}

/// PE machine code for `architecture`, or 0 when it has none.
pub fn machine_type_for(architecture: Architecture) -> u16
{
    match architecture {
        Architecture::X86_64 => IMAGE_FILE_MACHINE_AMD64,
        Architecture::Arm64 => IMAGE_FILE_MACHINE_ARM64,
        Architecture::Unknown(_) => 0,
    }
}

/// [`DataTarget`] over a suspended process that records every page read
///
/// The component reads far more memory than it reports; those reads are
/// exactly the bytes a debugger will need to repeat the same walk later, so
/// each successful read is added to the region set with the permissions of
/// the mapping it fell in.
pub struct RecordingDataTarget<'a>
{
    memory: &'a dyn ProcessMemory,
    architecture: Architecture,
    threads: &'a [ThreadSnapshot],
    maps: &'a ProcessMaps,
    regions: &'a RefCell<RegionSet>,
}

impl<'a> RecordingDataTarget<'a>
{
    /// Wrap a target's memory, captured threads and maps.
    pub fn new(
        memory: &'a dyn ProcessMemory,
        architecture: Architecture,
        threads: &'a [ThreadSnapshot],
        maps: &'a ProcessMaps,
        regions: &'a RefCell<RegionSet>,
    ) -> Self
    {
        Self {
            memory,
            architecture,
            threads,
            maps,
            regions,
        }
    }
}

impl DataTarget for RecordingDataTarget<'_>
{
    fn read_virtual(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
    {
        u64::try_from(buffer.len())
            .ok()
            .and_then(|length| address.checked_add(length))
            .ok_or_else(|| {
                DumpError::InvalidArgument(format!(
                    "read of {} bytes at 0x{address:x} wraps the address space",
                    buffer.len()
                ))
            })?;
        let read = self.memory.read_memory(address, buffer)?;
        if read > 0 {
            let region = MemoryRegion::new(address, address + read.min(buffer.len()) as u64, self.maps.flags_for(address));
            let added = self.regions.borrow_mut().insert_region(region, |_| true);
            if added > 0 {
                trace!("DAC read 0x{address:x}+{read} added {added} bytes");
            }
        }
        Ok(read)
    }

    fn thread_context(&self, tid: ThreadId) -> Result<Vec<u8>>
    {
        self.threads
            .iter()
            .find(|thread| thread.tid == tid)
            .map(ThreadSnapshot::register_bytes)
            .ok_or_else(|| DumpError::ReadRegistersFailed {
                operation: "thread context".to_string(),
                thread_id: Some(tid),
                details: "thread was not captured".to_string(),
            })
    }

    fn image_base(&self, name: &str) -> Option<u64>
    {
        self.maps.image_base(name)
    }

    fn machine_type(&self) -> u16
    {
        machine_type_for(self.architecture)
    }

    fn pointer_size(&self) -> u32
    {
        u32::from(self.architecture.pointer_size_bytes())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::regions::Permissions;

    struct Flat;

    impl ProcessMemory for Flat
    {
        fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
        {
            if address >= 0x10_0000 {
                return Err(DumpError::MemoryReadFailed {
                    address,
                    size: buffer.len(),
                    details: "unmapped".to_string(),
                });
            }
            buffer.fill(0xab);
            Ok(buffer.len())
        }
    }

    #[test]
    fn test_reads_are_recorded_with_mapping_permissions()
    {
        let maps = ProcessMaps {
            others: vec![MemoryRegion::new(0x8000, 0x10000, Permissions::from_maps_letters("rw-"))],
            ..ProcessMaps::default()
        };
        let regions = RefCell::new(RegionSet::new(0x1000));
        let target = RecordingDataTarget::new(&Flat, Architecture::X86_64, &[], &maps, &regions);

        let mut buf = [0u8; 0x20];
        assert_eq!(target.read_virtual(0x8ff0, &mut buf).unwrap(), 0x20);

        let regions = regions.borrow();
        let recorded = regions.find(0x8000).unwrap();
        assert_eq!((recorded.start, recorded.end), (0x8000, 0xa000));
        assert!(recorded.permissions.write);
    }

    #[test]
    fn test_failed_reads_record_nothing()
    {
        let maps = ProcessMaps::default();
        let regions = RefCell::new(RegionSet::new(0x1000));
        let target = RecordingDataTarget::new(&Flat, Architecture::Arm64, &[], &maps, &regions);

        let mut buf = [0u8; 8];
        assert!(target.read_virtual(0x20_0000, &mut buf).is_err());
        assert!(regions.borrow().is_empty());
        assert!(target.write_virtual(0x1000, &[1]).is_err());
        assert_eq!(target.machine_type(), IMAGE_FILE_MACHINE_ARM64);
        assert_eq!(target.pointer_size(), 8);
    }

    #[test]
    fn test_wrapping_read_is_rejected()
    {
        let maps = ProcessMaps::default();
        let regions = RefCell::new(RegionSet::new(0x1000));
        let target = RecordingDataTarget::new(&Flat, Architecture::X86_64, &[], &maps, &regions);

        let mut buf = [0u8; 0x10];
        let error = target.read_virtual(u64::MAX - 4, &mut buf).unwrap_err();
        assert!(matches!(error, DumpError::InvalidArgument(_)));
        assert!(regions.borrow().is_empty());
    }

    #[test]
    fn test_thread_context_of_unknown_thread()
    {
        let maps = ProcessMaps::default();
        let regions = RefCell::new(RegionSet::new(0x1000));
        let threads = vec![ThreadSnapshot::new(ThreadId(5), Architecture::X86_64, vec![7; 27])];
        let target = RecordingDataTarget::new(&Flat, Architecture::X86_64, &threads, &maps, &regions);

        assert_eq!(target.thread_context(ThreadId(5)).unwrap().len(), 27 * 8);
        assert!(target.thread_context(ThreadId(6)).is_err());
    }
}
