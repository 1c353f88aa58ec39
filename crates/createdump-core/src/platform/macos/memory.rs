//! # macOS Memory Operations
//!
//! Memory reading and region enumeration using Mach APIs.
//!
//! ## Mach Memory APIs
//!
//! - **mach_vm_read_overwrite()**: Copy target memory straight into our buffer
//! - **mach_vm_region_recurse()**: Enumerate memory regions, descending into submaps
//!
//! ## References
//!
//! - [mach_vm_read_overwrite(3)](https://developer.apple.com/documentation/kernel/1402127-mach_vm_read_overwrite)
//! - [mach_vm_region_recurse(3)](https://developer.apple.com/documentation/kernel/1402101-mach_vm_region_recurse)

use std::cmp::min;

use libc::{c_int, mach_port_t, vm_map_t};
use mach2::kern_return::KERN_SUCCESS;
use mach2::vm::{mach_vm_read_overwrite, mach_vm_region_recurse};
use mach2::vm_region::{vm_region_recurse_info_t, vm_region_submap_short_info_data_64_t, VM_REGION_SUBMAP_SHORT_INFO_COUNT_64};
use mach2::vm_statistics::{
    VM_MEMORY_MALLOC, VM_MEMORY_MALLOC_HUGE, VM_MEMORY_MALLOC_LARGE, VM_MEMORY_MALLOC_MEDIUM, VM_MEMORY_MALLOC_SMALL,
    VM_MEMORY_MALLOC_TINY, VM_MEMORY_STACK,
};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t, natural_t};
use tracing::trace;

use crate::error::{DumpError, Result};
use crate::platform::macos::constants;
use crate::platform::macos::error::MachError;
use crate::regions::{MemoryRegion, Permissions};

/// Read target memory directly into `dst`, in 64 KiB chunks.
///
/// Returns the number of bytes read, which is short when the range runs
/// into unmapped memory after the first chunk.
///
/// ## Errors
///
/// - `MemoryReadFailed`: the first chunk could not be read
pub fn read_memory_into(task: mach_port_t, address: u64, dst: &mut [u8]) -> Result<usize>
{
    if dst.is_empty() {
        return Ok(0);
    }

    let mut total = 0usize;
    let mut cursor = address;

    while total < dst.len() {
        let chunk_len = min(constants::MAX_VM_READ_CHUNK, dst.len() - total);
        let mut actual: mach_vm_size_t = 0;

        let result = unsafe {
            mach_vm_read_overwrite(
                task as vm_map_t,
                cursor,
                chunk_len as mach_vm_size_t,
                dst[total..].as_mut_ptr() as mach_vm_address_t,
                &mut actual,
            )
        };

        if result != KERN_SUCCESS {
            if total > 0 {
                break;
            }
            return Err(DumpError::MemoryReadFailed {
                address,
                size: dst.len(),
                details: format!("mach_vm_read_overwrite failed: {}", MachError::from(result)),
            });
        }

        if actual == 0 {
            break;
        }

        total += actual as usize;
        cursor += actual;
    }

    Ok(total)
}

/// Every mapped range of `task`, with protection flags.
///
/// Submaps (the shared cache in particular) are descended into, so the
/// result contains leaf regions only.
///
/// ## Errors
///
/// - `MachError`: `mach_vm_region_recurse()` failed for a reason other than
///   reaching the end of the address space
pub fn mapped_regions(task: mach_port_t) -> Result<Vec<MemoryRegion>>
{
    let mut regions = Vec::new();
    let mut address: mach_vm_address_t = 0;
    let mut depth: natural_t = 0;

    unsafe {
        loop {
            let mut size: mach_vm_size_t = 0;
            let mut info = vm_region_submap_short_info_data_64_t::default();
            let mut info_count = VM_REGION_SUBMAP_SHORT_INFO_COUNT_64;

            let result = mach_vm_region_recurse(
                task as vm_map_t,
                &mut address,
                &mut size,
                &mut depth,
                &mut info as *mut _ as vm_region_recurse_info_t,
                &mut info_count,
            );

            if result == libc::KERN_INVALID_ADDRESS {
                break;
            }
            if result != KERN_SUCCESS {
                return Err(DumpError::MachError(MachError::from(result)));
            }

            if info.is_submap != 0 {
                depth += 1;
                continue;
            }

            let mut region =
                MemoryRegion::new(address, address.saturating_add(size), protection_to_permissions(info.protection));
            if let Some(name) = region_name_from_user_tag(info.user_tag) {
                region.file_name = Some(name.to_string());
            }
            trace!("{region}");
            regions.push(region);

            // The next region starts right after this one ends
            address += size;
        }
    }

    Ok(regions)
}

/// Convert `VM_PROT_*` bits to region permissions.
pub fn protection_to_permissions(protection: c_int) -> Permissions
{
    Permissions {
        read: (protection & libc::VM_PROT_READ) != 0,
        write: (protection & libc::VM_PROT_WRITE) != 0,
        execute: (protection & libc::VM_PROT_EXECUTE) != 0,
    }
}

fn region_name_from_user_tag(tag: u32) -> Option<&'static str>
{
    match tag {
        VM_MEMORY_STACK => Some("[stack]"),
        VM_MEMORY_MALLOC
        | VM_MEMORY_MALLOC_SMALL
        | VM_MEMORY_MALLOC_MEDIUM
        | VM_MEMORY_MALLOC_LARGE
        | VM_MEMORY_MALLOC_HUGE
        | VM_MEMORY_MALLOC_TINY => Some("[heap]"),
        _ => None,
    }
}

#[cfg(test)]
mod tests
{
    use mach2::traps::mach_task_self;

    use super::*;

    #[test]
    fn test_read_own_memory()
    {
        let value: u64 = 0x0102_0304_0506_0708;
        let mut buf = [0u8; 8];
        let task = unsafe { mach_task_self() };
        let read = read_memory_into(task, &value as *const u64 as u64, &mut buf).unwrap();
        assert_eq!(read, 8);
        assert_eq!(u64::from_ne_bytes(buf), value);
    }

    #[test]
    fn test_own_regions_are_sorted_and_disjoint()
    {
        let task = unsafe { mach_task_self() };
        let regions = mapped_regions(task).unwrap();
        assert!(!regions.is_empty());
        assert!(regions.windows(2).all(|pair| pair[0].end <= pair[1].start));
    }

    #[test]
    fn test_protection_bits()
    {
        let perms = protection_to_permissions(libc::VM_PROT_READ | libc::VM_PROT_EXECUTE);
        assert!(perms.read && perms.execute && !perms.write);
    }
}
