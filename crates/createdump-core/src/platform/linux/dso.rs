//! # Loaded-Image Walk
//!
//! Finds the headers of every ELF image the dynamic loader has mapped, so the
//! dump keeps build ids, dynamic sections and unwind tables even when the
//! dump kind leaves module memory out.
//!
//! The route is the one debuggers take:
//!
//! 1. `AT_PHDR`/`AT_PHNUM` locate the main program's program headers.
//! 2. Its `PT_DYNAMIC` holds `DT_DEBUG`, which the loader points at `r_debug`.
//! 3. `r_debug.r_map` heads the `link_map` list: one entry per image with its
//!    load bias and path.
//!
//! `r_debug.r_state` is `RT_CONSISTENT` only while the list is stable; any
//! other value means a `dlopen`/`dlclose` is in flight and the walk reports
//! [`DumpError::ModuleListChanged`] so the caller can retry.
//!
//! ## References
//!
//! - [`<link.h>`](https://sourceware.org/git/?p=glibc.git;a=blob;f=elf/link.h)
//! - [System V ABI, Dynamic Section](https://refspecs.linuxfoundation.org/elf/gabi4+/ch5.dynamic.html)

use object::elf::{
    Dyn64, FileHeader64, ProgramHeader64, DT_DEBUG, DT_NULL, ELFMAG, PT_DYNAMIC, PT_GNU_EH_FRAME, PT_NOTE, PT_PHDR,
};
use object::endian::NativeEndian as NE;
use object::pod;
use tracing::{debug, trace};

use crate::error::{DumpError, Result};
use crate::identity::{ProcessIdentity, AT_PHDR, AT_PHNUM};
use crate::maps::ProcessMaps;
use crate::regions::{MemoryRegion, Permissions};
use crate::target::ProcessMemory;

/// `r_debug.r_state` while the list is stable
const RT_CONSISTENT: u32 = 0;

// Offsets into the 64-bit `struct r_debug` and `struct link_map`.
const R_MAP_OFFSET: u64 = 8;
const R_STATE_OFFSET: u64 = 24;
const L_ADDR_OFFSET: u64 = 0;
const L_NAME_OFFSET: u64 = 8;
const L_NEXT_OFFSET: u64 = 24;

/// More entries than this means the list was rewritten under us
const MAX_LINK_MAP_ENTRIES: usize = 4096;
const MAX_PATH_LENGTH: usize = 4096;
const MAX_DYNAMIC_ENTRIES: usize = 1024;
/// `PN_XNUM`; a real header table is never longer
const MAX_PROGRAM_HEADERS: usize = 0xffff;

const ELF_HEADER_SIZE: usize = std::mem::size_of::<FileHeader64<NE>>();
const PROGRAM_HEADER_SIZE: usize = std::mem::size_of::<ProgramHeader64<NE>>();
const DYN_SIZE: usize = std::mem::size_of::<Dyn64<NE>>();

/// One `link_map` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage
{
    /// Path as the loader recorded it; empty for the main program
    pub name: String,
    /// Difference between run-time and link-time addresses
    pub bias: u64,
}

/// A program header reduced to what the walk needs
#[derive(Debug, Clone, Copy)]
struct Segment
{
    kind: u32,
    vaddr: u64,
    memsz: u64,
}

/// Header regions of every loaded image.
///
/// Returns an empty list for processes without auxv program-header entries
/// and only the main program's headers for static executables.
///
/// ## Errors
///
/// - `ModuleListChanged`: the loader was updating the list
/// - `MemoryReadFailed`: a loader structure could not be read
pub fn image_headers(
    memory: &dyn ProcessMemory,
    identity: &ProcessIdentity,
    maps: &ProcessMaps,
) -> Result<Vec<MemoryRegion>>
{
    let (Some(phdr), Some(phnum)) = (identity.auxv_value(AT_PHDR), identity.auxv_value(AT_PHNUM)) else {
        debug!("No AT_PHDR/AT_PHNUM in auxv, skipping image headers");
        return Ok(Vec::new());
    };

    let phnum = usize::try_from(phnum).map_err(|_| table_too_large(phnum))?;
    let program = read_segments(memory, phdr, phnum)?;
    let bias = program
        .iter()
        .find(|segment| segment.kind == PT_PHDR)
        .map_or(0, |segment| phdr.wrapping_sub(segment.vaddr));

    let mut regions = vec![header_region(phdr, program_table_size(phnum)?)];
    let main_base = maps
        .mapping_containing(phdr)
        .and_then(|mapping| mapping.file_name.as_deref())
        .and_then(|name| maps.image_base(name));

    let images = match find_r_debug(memory, &program, bias)? {
        Some(r_debug) => walk_link_map(memory, r_debug)?,
        None => {
            debug!("No DT_DEBUG entry; treating the process as statically linked");
            Vec::new()
        }
    };

    if let Some(base) = main_base {
        add_image(memory, base, bias, &mut regions)?;
    }
    for image in images.iter().filter(|image| !image.name.is_empty()) {
        match maps.image_base(&image.name) {
            Some(base) => add_image(memory, base, image.bias, &mut regions)?,
            None => trace!("{}: not file backed, skipped", image.name),
        }
    }

    debug!("{} images, {} header regions", images.len(), regions.len());
    Ok(regions)
}

/// Walk the loader's `link_map` list starting from `r_debug`.
///
/// ## Errors
///
/// - `ModuleListChanged`: `r_state` was not `RT_CONSISTENT`, or changed during the walk
/// - `MemoryReadFailed`: an entry could not be read
pub fn walk_link_map(memory: &dyn ProcessMemory, r_debug: u64) -> Result<Vec<LoadedImage>>
{
    if read_state(memory, r_debug)? != RT_CONSISTENT {
        return Err(DumpError::ModuleListChanged);
    }

    let mut images = Vec::new();
    let mut entry = memory.read_u64(r_debug + R_MAP_OFFSET)?;
    while entry != 0 {
        if images.len() == MAX_LINK_MAP_ENTRIES {
            return Err(DumpError::ModuleListChanged);
        }
        let bias = memory.read_u64(entry + L_ADDR_OFFSET)?;
        let name_address = memory.read_u64(entry + L_NAME_OFFSET)?;
        let name = if name_address == 0 {
            String::new()
        } else {
            memory.read_c_string(name_address, MAX_PATH_LENGTH)?
        };
        trace!("link_map 0x{entry:x}: {name:?} bias 0x{bias:x}");
        images.push(LoadedImage { name, bias });
        entry = memory.read_u64(entry + L_NEXT_OFFSET)?;
    }

    if read_state(memory, r_debug)? != RT_CONSISTENT {
        return Err(DumpError::ModuleListChanged);
    }
    Ok(images)
}

fn read_state(memory: &dyn ProcessMemory, r_debug: u64) -> Result<u32>
{
    let mut state = [0u8; 4];
    memory.read_exact(r_debug + R_STATE_OFFSET, &mut state)?;
    Ok(u32::from_ne_bytes(state))
}

fn find_r_debug(memory: &dyn ProcessMemory, program: &[Segment], bias: u64) -> Result<Option<u64>>
{
    let Some(dynamic) = program.iter().find(|segment| segment.kind == PT_DYNAMIC) else {
        return Ok(None);
    };

    let count = (dynamic.memsz as usize / DYN_SIZE).min(MAX_DYNAMIC_ENTRIES);
    let mut bytes = vec![0u8; count * DYN_SIZE];
    memory.read_exact(bias.wrapping_add(dynamic.vaddr), &mut bytes)?;
    let (entries, _) = pod::slice_from_bytes::<Dyn64<NE>>(&bytes, count).map_err(|()| malformed("dynamic section"))?;

    for entry in entries {
        match entry.d_tag.get(NE) {
            tag if tag == u64::from(DT_NULL) => break,
            tag if tag == u64::from(DT_DEBUG) => {
                let value = entry.d_val.get(NE);
                return Ok((value != 0).then_some(value));
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Record the ELF header, program header table and metadata segments of the
/// image whose first mapping starts at `base`.
fn add_image(memory: &dyn ProcessMemory, base: u64, bias: u64, regions: &mut Vec<MemoryRegion>) -> Result<()>
{
    let mut bytes = [0u8; ELF_HEADER_SIZE];
    memory.read_exact(base, &mut bytes)?;
    let (header, _) = pod::from_bytes::<FileHeader64<NE>>(&bytes).map_err(|()| malformed("ELF header"))?;
    if header.e_ident.magic != ELFMAG {
        trace!("0x{base:x}: no ELF header");
        return Ok(());
    }

    regions.push(header_region(base, usize::from(header.e_ehsize.get(NE))));

    let phnum = usize::from(header.e_phnum.get(NE));
    let table = base.wrapping_add(header.e_phoff.get(NE));
    regions.push(header_region(table, program_table_size(phnum)?));

    for segment in read_segments(memory, table, phnum)? {
        if matches!(segment.kind, PT_DYNAMIC | PT_NOTE | PT_GNU_EH_FRAME) && segment.memsz > 0 {
            regions.push(MemoryRegion::new(
                bias.wrapping_add(segment.vaddr),
                bias.wrapping_add(segment.vaddr).saturating_add(segment.memsz),
                Permissions::READ_ONLY,
            ));
        }
    }
    Ok(())
}

fn read_segments(memory: &dyn ProcessMemory, address: u64, count: usize) -> Result<Vec<Segment>>
{
    let mut bytes = vec![0u8; program_table_size(count)?];
    memory.read_exact(address, &mut bytes)?;
    let (headers, _) =
        pod::slice_from_bytes::<ProgramHeader64<NE>>(&bytes, count).map_err(|()| malformed("program headers"))?;

    Ok(headers
        .iter()
        .map(|header| Segment {
            kind: header.p_type.get(NE),
            vaddr: header.p_vaddr.get(NE),
            memsz: header.p_memsz.get(NE),
        })
        .collect())
}

/// Bytes taken by `count` program headers.
///
/// `count` comes from target memory; anything past `PN_XNUM` is garbage.
fn program_table_size(count: usize) -> Result<usize>
{
    if count > MAX_PROGRAM_HEADERS {
        return Err(table_too_large(count));
    }
    count
        .checked_mul(PROGRAM_HEADER_SIZE)
        .ok_or_else(|| table_too_large(count))
}

fn table_too_large(count: impl std::fmt::Display) -> DumpError
{
    DumpError::InvalidArgument(format!("{count} program headers in target memory"))
}

fn header_region(address: u64, size: usize) -> MemoryRegion
{
    MemoryRegion::new(address, address.saturating_add(size as u64), Permissions::READ_ONLY)
}

fn malformed(what: &str) -> DumpError
{
    DumpError::InvalidArgument(format!("malformed {what} in target memory"))
}

#[cfg(test)]
mod tests
{
    use std::collections::BTreeMap;

    use super::*;

    /// Sparse little address space of aligned words and byte strings
    #[derive(Default)]
    struct Image
    {
        bytes: BTreeMap<u64, u8>,
    }

    impl Image
    {
        fn put(&mut self, address: u64, data: &[u8])
        {
            for (i, byte) in data.iter().enumerate() {
                self.bytes.insert(address + i as u64, *byte);
            }
        }

        fn put_u64(&mut self, address: u64, value: u64)
        {
            self.put(address, &value.to_ne_bytes());
        }

        fn put_u32(&mut self, address: u64, value: u32)
        {
            self.put(address, &value.to_ne_bytes());
        }
    }

    impl ProcessMemory for Image
    {
        fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
        {
            let mut read = 0;
            for (i, slot) in buffer.iter_mut().enumerate() {
                match self.bytes.get(&(address + i as u64)) {
                    Some(byte) => {
                        *slot = *byte;
                        read += 1;
                    }
                    None => break,
                }
            }
            if read == 0 {
                return Err(DumpError::MemoryReadFailed {
                    address,
                    size: buffer.len(),
                    details: "unmapped".to_string(),
                });
            }
            Ok(read)
        }
    }

    const R_DEBUG: u64 = 0x5000;

    fn link_map(image: &mut Image)
    {
        image.put_u32(R_DEBUG, 1);
        image.put_u64(R_DEBUG + R_MAP_OFFSET, 0x6000);
        image.put_u32(R_DEBUG + R_STATE_OFFSET, RT_CONSISTENT);

        image.put_u64(0x6000 + L_ADDR_OFFSET, 0);
        image.put_u64(0x6000 + L_NAME_OFFSET, 0x7000);
        image.put_u64(0x6000 + L_NEXT_OFFSET, 0x6100);
        image.put(0x7000, b"\0");

        image.put_u64(0x6100 + L_ADDR_OFFSET, 0x7f00_0000_0000);
        image.put_u64(0x6100 + L_NAME_OFFSET, 0x7100);
        image.put_u64(0x6100 + L_NEXT_OFFSET, 0);
        image.put(0x7100, b"/usr/lib/libcoreclr.so\0");
    }

    #[test]
    fn test_walk_reads_every_entry()
    {
        let mut image = Image::default();
        link_map(&mut image);

        let images = walk_link_map(&image, R_DEBUG).unwrap();
        assert_eq!(
            images,
            vec![
                LoadedImage {
                    name: String::new(),
                    bias: 0,
                },
                LoadedImage {
                    name: "/usr/lib/libcoreclr.so".to_string(),
                    bias: 0x7f00_0000_0000,
                },
            ]
        );
    }

    #[test]
    fn test_inconsistent_list_is_transient()
    {
        let mut image = Image::default();
        link_map(&mut image);
        image.put_u32(R_DEBUG + R_STATE_OFFSET, 1);

        assert!(matches!(walk_link_map(&image, R_DEBUG), Err(DumpError::ModuleListChanged)));
    }

    #[test]
    fn test_cyclic_list_is_transient()
    {
        let mut image = Image::default();
        link_map(&mut image);
        image.put_u64(0x6100 + L_NEXT_OFFSET, 0x6000);

        assert!(matches!(walk_link_map(&image, R_DEBUG), Err(DumpError::ModuleListChanged)));
    }

    #[test]
    fn test_absurd_header_count_is_rejected()
    {
        let mut auxv = Vec::new();
        for (key, value) in [(AT_PHDR, 0x1000), (AT_PHNUM, u64::MAX), (0, 0)] {
            auxv.extend_from_slice(&u64::to_ne_bytes(key));
            auxv.extend_from_slice(&u64::to_ne_bytes(value));
        }
        let mut identity = ProcessIdentity::default();
        identity.apply_auxv(auxv);

        let mut image = Image::default();
        image.put(0x1000, &[0u8; 64]);
        let error = image_headers(&image, &identity, &ProcessMaps::default()).unwrap_err();
        assert!(matches!(error, DumpError::InvalidArgument(_)));
        assert!(matches!(read_segments(&image, 0x1000, usize::MAX / 8), Err(DumpError::InvalidArgument(_))));
        assert_eq!(program_table_size(2).unwrap(), 2 * PROGRAM_HEADER_SIZE);
    }

    #[test]
    fn test_no_auxv_means_no_headers()
    {
        let identity = ProcessIdentity::default();
        let regions = image_headers(&Image::default(), &identity, &ProcessMaps::default()).unwrap();
        assert!(regions.is_empty());
    }
}
