//! # dyld Image List
//!
//! Finds every Mach-O image dyld has loaded, together with the memory its
//! segments occupy and the range of its load commands.
//!
//! `task_info(TASK_DYLD_INFO)` gives the address of the target's
//! `dyld_all_image_infos`. That structure holds a counted array of
//! `dyld_image_info` entries (load address and path pointer per image) and,
//! separately, the load address of dyld itself, which is not in the array.
//!
//! dyld clears `infoArray` while it rewrites the list. A null array is
//! reported as [`DumpError::ModuleListChanged`] so the caller can retry.
//!
//! ## References
//!
//! - [`<mach-o/dyld_images.h>`](https://github.com/apple-oss-distributions/dyld/blob/main/include/mach-o/dyld_images.h)
//! - [`<mach-o/loader.h>`](https://github.com/apple-oss-distributions/xnu/blob/main/EXTERNAL_HEADERS/mach-o/loader.h)

use libc::{integer_t, mach_port_t};
use mach2::kern_return::KERN_SUCCESS;
use object::endian::NativeEndian as NE;
use object::macho::{SegmentCommand64, LC_SEGMENT_64, MH_MAGIC_64};
use object::pod;
use tracing::{debug, trace};

use crate::error::{DumpError, Result};
use crate::platform::macos::error::MachError;
use crate::platform::macos::memory::protection_to_permissions;
use crate::platform::macos::{constants, ffi};
use crate::regions::{MemoryRegion, Permissions};
use crate::target::ProcessMemory;

// Offsets into the 64-bit `struct dyld_all_image_infos`.
const INFO_ARRAY_COUNT_OFFSET: u64 = 4;
const INFO_ARRAY_OFFSET: u64 = 8;
const DYLD_LOAD_ADDRESS_OFFSET: u64 = 32;

/// `sizeof(struct dyld_image_info)`: load address, path, modification date
const IMAGE_INFO_SIZE: u64 = 24;

/// `sizeof(struct mach_header_64)`
const MACH_HEADER_SIZE: u64 = 32;
const NCMDS_OFFSET: usize = 16;
const SIZEOFCMDS_OFFSET: usize = 20;

const MAX_IMAGES: u32 = 8192;
const MAX_LOAD_COMMANDS_SIZE: u32 = 1 << 20;
const MAX_PATH_LENGTH: usize = 1024;

const DYLD_PATH: &str = "/usr/lib/dyld";
const LINKEDIT_SEGMENT: &[u8] = b"__LINKEDIT";

/// `struct task_dyld_info`
#[repr(C)]
#[derive(Default)]
struct TaskDyldInfo
{
    all_image_info_addr: u64,
    all_image_info_size: u64,
    all_image_info_format: i32,
}

/// One Mach-O image in the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage
{
    /// Path dyld recorded for the image
    pub path: String,
    /// Address of the image's `mach_header_64`
    pub load_address: u64,
    /// Mapped segments, slid, named after the image
    pub segments: Vec<MemoryRegion>,
    /// The Mach header and load commands
    pub header: MemoryRegion,
}

/// Address of `dyld_all_image_infos` in `task`.
///
/// ## Errors
///
/// - `MachError`: `task_info(TASK_DYLD_INFO)` failed
pub fn all_image_infos_address(task: mach_port_t) -> Result<u64>
{
    let mut info = TaskDyldInfo::default();
    let mut count = constants::TASK_DYLD_INFO_COUNT;
    let result = unsafe {
        ffi::task_info(
            task,
            constants::TASK_DYLD_INFO,
            &mut info as *mut _ as *mut integer_t,
            &mut count,
        )
    };
    if result != KERN_SUCCESS {
        return Err(DumpError::MachError(MachError::from(result)));
    }
    trace!(
        "dyld_all_image_infos at {:#x} ({} bytes, format {})",
        info.all_image_info_addr,
        info.all_image_info_size,
        info.all_image_info_format
    );
    Ok(info.all_image_info_addr)
}

/// Every image dyld lists at `all_image_infos`, plus dyld itself.
///
/// Images whose header cannot be read or is not a 64-bit Mach-O header are
/// skipped with a debug message.
///
/// ## Errors
///
/// - `ModuleListChanged`: dyld is rewriting the list
/// - `MemoryReadFailed`: `dyld_all_image_infos` or the array is unreadable
pub fn loaded_images(memory: &dyn ProcessMemory, all_image_infos: u64) -> Result<Vec<LoadedImage>>
{
    let mut count_bytes = [0u8; 4];
    memory.read_exact(all_image_infos + INFO_ARRAY_COUNT_OFFSET, &mut count_bytes)?;
    let count = u32::from_ne_bytes(count_bytes);
    let array = memory.read_u64(all_image_infos + INFO_ARRAY_OFFSET)?;
    if array == 0 {
        return Err(DumpError::ModuleListChanged);
    }
    if count > MAX_IMAGES {
        debug!("dyld reports {count} images, treating the list as in flux");
        return Err(DumpError::ModuleListChanged);
    }

    let mut images = Vec::with_capacity(count as usize + 1);
    for index in 0..u64::from(count) {
        let entry = array + index * IMAGE_INFO_SIZE;
        let load_address = memory.read_u64(entry)?;
        let path_address = memory.read_u64(entry + 8)?;
        let path = if path_address == 0 {
            String::new()
        } else {
            memory.read_c_string(path_address, MAX_PATH_LENGTH).unwrap_or_default()
        };
        push_image(memory, &mut images, path, load_address);
    }

    let dyld_address = memory.read_u64(all_image_infos + DYLD_LOAD_ADDRESS_OFFSET)?;
    if dyld_address != 0 && !images.iter().any(|image| image.load_address == dyld_address) {
        push_image(memory, &mut images, DYLD_PATH.to_string(), dyld_address);
    }

    debug!("dyld lists {} images", images.len());
    Ok(images)
}

fn push_image(memory: &dyn ProcessMemory, images: &mut Vec<LoadedImage>, path: String, load_address: u64)
{
    match parse_image(memory, &path, load_address) {
        Ok(image) => images.push(image),
        Err(error) => debug!("skipping image {path:?} at {load_address:#x}: {error}"),
    }
}

/// Read the Mach header at `load_address` and collect its segments.
///
/// The slide is the difference between `load_address` and the `vmaddr` of
/// the segment mapped from file offset zero. `__LINKEDIT` and segments with
/// no initial protection (`__PAGEZERO`) are left out.
///
/// ## Errors
///
/// - `MemoryReadFailed`: the header or load commands are unreadable
/// - `InvalidArgument`: the magic is not `MH_MAGIC_64` or the commands are malformed
pub fn parse_image(memory: &dyn ProcessMemory, path: &str, load_address: u64) -> Result<LoadedImage>
{
    let mut header = [0u8; MACH_HEADER_SIZE as usize];
    memory.read_exact(load_address, &mut header)?;
    let field = |offset: usize| u32::from_ne_bytes([header[offset], header[offset + 1], header[offset + 2], header[offset + 3]]);
    if field(0) != MH_MAGIC_64 {
        return Err(DumpError::InvalidArgument(format!("no 64-bit Mach-O header at {load_address:#x}")));
    }
    let ncmds = field(NCMDS_OFFSET);
    let sizeofcmds = field(SIZEOFCMDS_OFFSET);
    if sizeofcmds > MAX_LOAD_COMMANDS_SIZE {
        return Err(DumpError::InvalidArgument(format!(
            "implausible load command size {sizeofcmds} at {load_address:#x}"
        )));
    }

    let mut commands = vec![0u8; sizeofcmds as usize];
    memory.read_exact(load_address + MACH_HEADER_SIZE, &mut commands)?;

    let mut raw_segments = Vec::new();
    let mut offset = 0usize;
    for _ in 0..ncmds {
        let Some(prefix) = commands.get(offset..offset + 8) else {
            break;
        };
        let cmd = u32::from_ne_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let cmdsize = u32::from_ne_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
        if cmdsize < 8 || offset + cmdsize > commands.len() {
            return Err(DumpError::InvalidArgument(format!(
                "malformed load command at offset {offset} in {path:?}"
            )));
        }
        if cmd == LC_SEGMENT_64 {
            let (segment, _) = pod::from_bytes::<SegmentCommand64<NE>>(&commands[offset..offset + cmdsize])
                .map_err(|()| DumpError::InvalidArgument(format!("short LC_SEGMENT_64 in {path:?}")))?;
            raw_segments.push(*segment);
        }
        offset += cmdsize;
    }

    let slide = raw_segments
        .iter()
        .find(|segment| segment.fileoff.get(NE) == 0 && segment.filesize.get(NE) != 0)
        .map(|text| load_address.wrapping_sub(text.vmaddr.get(NE)))
        .unwrap_or(0);

    let segments = raw_segments
        .iter()
        .filter(|segment| segment.initprot.get(NE) != 0 && segment_name(segment) != LINKEDIT_SEGMENT)
        .filter(|segment| segment.vmsize.get(NE) != 0)
        .map(|segment| {
            let start = segment.vmaddr.get(NE).wrapping_add(slide);
            let permissions = protection_to_permissions(segment.initprot.get(NE) as i32);
            MemoryRegion::new(start, start.saturating_add(segment.vmsize.get(NE)), permissions)
                .with_file(path, segment.fileoff.get(NE))
        })
        .collect();

    let header = MemoryRegion::new(
        load_address,
        load_address + MACH_HEADER_SIZE + u64::from(sizeofcmds),
        Permissions::READ_ONLY,
    )
    .with_file(path, 0);

    Ok(LoadedImage {
        path: path.to_string(),
        load_address,
        segments,
        header,
    })
}

fn segment_name(segment: &SegmentCommand64<NE>) -> &[u8]
{
    let end = segment.segname.iter().position(|&b| b == 0).unwrap_or(segment.segname.len());
    &segment.segname[..end]
}

#[cfg(test)]
mod tests
{
    use std::collections::BTreeMap;

    use super::*;

    /// Sparse fake address space
    #[derive(Default)]
    struct Image
    {
        bytes: BTreeMap<u64, u8>,
    }

    impl Image
    {
        fn put(&mut self, address: u64, data: &[u8])
        {
            for (i, b) in data.iter().enumerate() {
                self.bytes.insert(address + i as u64, *b);
            }
        }

        fn put_u32(&mut self, address: u64, value: u32)
        {
            self.put(address, &value.to_ne_bytes());
        }

        fn put_u64(&mut self, address: u64, value: u64)
        {
            self.put(address, &value.to_ne_bytes());
        }

        fn put_segment(&mut self, address: u64, name: &str, vmaddr: u64, vmsize: u64, fileoff: u64, initprot: u32)
        {
            self.put_u32(address, LC_SEGMENT_64);
            self.put_u32(address + 4, 72);
            let mut segname = [0u8; 16];
            segname[..name.len()].copy_from_slice(name.as_bytes());
            self.put(address + 8, &segname);
            self.put_u64(address + 24, vmaddr);
            self.put_u64(address + 32, vmsize);
            self.put_u64(address + 40, fileoff);
            self.put_u64(address + 48, if name == "__PAGEZERO" { 0 } else { vmsize });
            self.put_u32(address + 56, 7);
            self.put_u32(address + 60, initprot);
            self.put_u32(address + 64, 0);
            self.put_u32(address + 68, 0);
        }

        /// A dylib linked at 0 with __PAGEZERO, __TEXT, __DATA and __LINKEDIT
        fn put_macho(&mut self, load: u64)
        {
            self.put_u32(load, MH_MAGIC_64);
            self.put_u32(load + 16, 4);
            self.put_u32(load + 20, 4 * 72);
            let commands = load + 32;
            self.put_segment(commands, "__PAGEZERO", 0, 0x1000, 0, 0);
            self.put_segment(commands + 72, "__TEXT", 0x1000, 0x4000, 0, 5);
            self.put_segment(commands + 144, "__DATA", 0x5000, 0x1000, 0x4000, 3);
            self.put_segment(commands + 216, "__LINKEDIT", 0x6000, 0x2000, 0x5000, 1);
        }
    }

    impl ProcessMemory for Image
    {
        fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
        {
            for (i, slot) in buffer.iter_mut().enumerate() {
                match self.bytes.get(&(address + i as u64)) {
                    Some(b) => *slot = *b,
                    None if i == 0 => {
                        return Err(DumpError::MemoryReadFailed {
                            address,
                            size: buffer.len(),
                            details: "unmapped".to_string(),
                        })
                    }
                    None => return Ok(i),
                }
            }
            Ok(buffer.len())
        }
    }

    #[test]
    fn test_parse_image_slides_segments()
    {
        let mut memory = Image::default();
        memory.put_macho(0x10_0000_1000);

        let image = parse_image(&memory, "/usr/lib/libfoo.dylib", 0x10_0000_1000).unwrap();
        let spans: Vec<(u64, u64)> = image.segments.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(spans, vec![(0x10_0000_1000, 0x10_0000_5000), (0x10_0000_5000, 0x10_0000_6000)]);
        assert!(image.segments[0].permissions.execute);
        assert!(image.segments[1].permissions.write);
        assert_eq!(image.header.size(), 32 + 4 * 72);
    }

    #[test]
    fn test_loaded_images_includes_dyld()
    {
        let mut memory = Image::default();
        let infos = 0x7000_0000;
        let array = 0x7000_1000;
        memory.put_u32(infos + 4, 1);
        memory.put_u64(infos + 8, array);
        memory.put_u64(infos + 32, 0x20_0000_0000);
        memory.put_u64(array, 0x10_0000_1000);
        memory.put_u64(array + 8, 0x7000_2000);
        memory.put(0x7000_2000, b"/usr/lib/libfoo.dylib\0");
        memory.put_macho(0x10_0000_1000);
        memory.put_macho(0x20_0000_0000);

        let images = loaded_images(&memory, infos).unwrap();
        let paths: Vec<&str> = images.iter().map(|image| image.path.as_str()).collect();
        assert_eq!(paths, vec!["/usr/lib/libfoo.dylib", DYLD_PATH]);
    }

    #[test]
    fn test_null_array_means_list_in_flux()
    {
        let mut memory = Image::default();
        memory.put_u32(0x7000_0004, 3);
        memory.put_u64(0x7000_0008, 0);
        memory.put_u64(0x7000_0020, 0);
        assert!(matches!(loaded_images(&memory, 0x7000_0000), Err(DumpError::ModuleListChanged)));
    }
}
