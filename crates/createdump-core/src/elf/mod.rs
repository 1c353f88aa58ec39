//! # ELF Core Writer
//!
//! Renders a gathered snapshot as one ELF64 little-endian `ET_CORE` file:
//!
//! ```text
//! +-------------------+  0
//! | ELF header        |
//! +-------------------+  64
//! | PT_NOTE           |
//! | PT_LOAD x regions |
//! +-------------------+
//! | section header    |  only when the header count overflows e_phnum
//! +-------------------+
//! | notes             |
//! +-------------------+  page aligned
//! | region bytes      |  in region order
//! +-------------------+
//! ```
//!
//! The file is written strictly front to back, so any `Write` works as the
//! sink (a pipe included). Every offset is computed before the first byte
//! goes out.

pub mod notes;

use std::io::Write;

use object::elf::{
    FileHeader64, Ident, ProgramHeader64, SectionHeader64, ELFCLASS64, ELFDATA2LSB, ELFMAG, ELFOSABI_NONE, ET_CORE,
    EV_CURRENT, PT_LOAD, PT_NOTE, SHT_NULL,
};
use object::endian::{LittleEndian as LE, U16, U32, U64};
use object::pod::bytes_of;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, info};

use crate::error::{DumpError, Result};
use crate::regions::{MemoryRegion, RegionSet};
use crate::target::ProcessMemory;
use crate::types::Architecture;
use notes::{build_notes, round_up, Note, NoteSources};

/// `e_phnum` value meaning "the real count is in section header 0"
pub const PN_XNUM: u16 = 0xffff;

/// Bytes copied from the target per read
pub const COPY_CHUNK_SIZE: usize = 0x10000;

const ELF_HEADER_SIZE: u64 = 64;
const PROGRAM_HEADER_SIZE: u64 = 56;
const SECTION_HEADER_SIZE: u64 = 64;
const NOTE_SEGMENT_ALIGN: u64 = 4;

/// Wraps a `Write` and counts what went through it
struct ElfCoreWriter<W: Write>
{
    writer: W,
    written: u64,
}

impl<W: Write> Write for ElfCoreWriter<W>
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>
    {
        let written = self.writer.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()>
    {
        self.writer.flush()
    }
}

impl<W: Write> ElfCoreWriter<W>
{
    fn new(writer: W) -> Self
    {
        Self { writer, written: 0 }
    }

    fn write_padding(&mut self, bytes: u64) -> std::io::Result<()>
    {
        let buf: SmallVec<[u8; 64]> = smallvec![0; bytes as usize];
        self.write_all(&buf)
    }

    fn pad_to(&mut self, offset: u64) -> std::io::Result<()>
    {
        debug_assert!(offset >= self.written);
        self.write_padding(offset - self.written)
    }
}

/// File offsets of every part of a core file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreLayout
{
    /// Program headers including `PT_NOTE`
    pub program_headers: u64,
    /// True when `e_phnum` overflows into a section header
    pub extended_numbering: bool,
    /// Offset of the section header, 0 when there is none
    pub section_header_offset: u64,
    /// Offset of the first note
    pub notes_offset: u64,
    /// Total size of all notes
    pub notes_size: u64,
    /// Offset of the first region's bytes
    pub data_offset: u64,
    /// Size of the whole file
    pub file_size: u64,
}

/// A core file ready to be written
pub struct CoreFile<'a>
{
    architecture: Architecture,
    page_size: u64,
    regions: &'a RegionSet,
    notes: Vec<Note>,
}

impl<'a> CoreFile<'a>
{
    /// Assemble notes and regions.
    pub fn new(architecture: Architecture, regions: &'a RegionSet, sources: &NoteSources<'_>) -> Self
    {
        Self {
            architecture,
            page_size: regions.page_size(),
            regions,
            notes: build_notes(sources),
        }
    }

    /// Notes in file order.
    pub fn notes(&self) -> &[Note]
    {
        &self.notes
    }

    /// Compute every offset.
    pub fn layout(&self) -> CoreLayout
    {
        let program_headers = 1 + self.regions.len() as u64;
        let extended_numbering = program_headers >= u64::from(PN_XNUM);

        let headers_end = ELF_HEADER_SIZE + program_headers * PROGRAM_HEADER_SIZE;
        let (section_header_offset, notes_offset) = if extended_numbering {
            (headers_end, headers_end + SECTION_HEADER_SIZE)
        } else {
            (0, headers_end)
        };

        let notes_size: u64 = self.notes.iter().map(|note| note.encoded_size() as u64).sum();
        let data_offset = round_up((notes_offset + notes_size) as usize, self.page_size as usize) as u64;

        CoreLayout {
            program_headers,
            extended_numbering,
            section_header_offset,
            notes_offset,
            notes_size,
            data_offset,
            file_size: data_offset + self.regions.total_size(),
        }
    }

    /// Stream the file to `out`, reading region contents from `memory`.
    ///
    /// Returns the number of bytes written.
    ///
    /// ## Errors
    ///
    /// - `UnsupportedArchitecture`: no `e_machine` for the target
    /// - `MemoryReadFailed`: a region could not be read completely
    /// - `Io`: the sink failed
    pub fn write<W: Write>(&self, out: W, memory: &dyn ProcessMemory) -> Result<u64>
    {
        let machine = self.architecture.elf_machine()?;
        let layout = self.layout();
        let mut writer = ElfCoreWriter::new(out);

        info!(
            "Writing core: {} notes, {} segments, {} bytes",
            self.notes.len(),
            self.regions.len(),
            layout.file_size
        );

        writer.write_all(bytes_of(&file_header(machine, &layout)))?;

        let notes_header = ProgramHeader64::<LE> {
            p_type: U32::new(LE, PT_NOTE),
            p_flags: U32::new(LE, 0),
            p_offset: U64::new(LE, layout.notes_offset),
            p_vaddr: U64::new(LE, 0),
            p_paddr: U64::new(LE, 0),
            p_filesz: U64::new(LE, layout.notes_size),
            p_memsz: U64::new(LE, 0),
            p_align: U64::new(LE, NOTE_SEGMENT_ALIGN),
        };
        writer.write_all(bytes_of(&notes_header))?;

        let mut offset = layout.data_offset;
        for region in self.regions.iter() {
            writer.write_all(bytes_of(&load_header(region, offset, self.page_size)))?;
            offset += region.size();
        }

        if layout.extended_numbering {
            debug!("Program header count {} overflows e_phnum", layout.program_headers);
            writer.write_all(bytes_of(&extended_numbering_header(layout.program_headers)))?;
        }

        debug_assert_eq!(writer.written, layout.notes_offset);
        for note in &self.notes {
            note.write_to(&mut writer)?;
        }

        writer.pad_to(layout.data_offset)?;

        let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
        for region in self.regions.iter() {
            copy_region(&mut writer, memory, region, &mut buffer)?;
        }

        writer.flush()?;
        let written = writer.written;
        info!("Wrote {written} bytes");
        Ok(written)
    }
}

fn file_header(machine: u16, layout: &CoreLayout) -> FileHeader64<LE>
{
    let phnum = if layout.extended_numbering {
        PN_XNUM
    } else {
        layout.program_headers as u16
    };
    let (shentsize, shnum) = if layout.extended_numbering {
        (SECTION_HEADER_SIZE as u16, 1)
    } else {
        (0, 0)
    };

    FileHeader64 {
        e_ident: Ident {
            magic: ELFMAG,
            class: ELFCLASS64,
            data: ELFDATA2LSB,
            version: EV_CURRENT,
            os_abi: ELFOSABI_NONE,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: U16::new(LE, ET_CORE),
        e_machine: U16::new(LE, machine),
        e_version: U32::new(LE, u32::from(EV_CURRENT)),
        e_entry: U64::new(LE, 0),
        e_phoff: U64::new(LE, ELF_HEADER_SIZE),
        e_shoff: U64::new(LE, layout.section_header_offset),
        e_flags: U32::new(LE, 0),
        e_ehsize: U16::new(LE, ELF_HEADER_SIZE as u16),
        e_phentsize: U16::new(LE, PROGRAM_HEADER_SIZE as u16),
        e_phnum: U16::new(LE, phnum),
        e_shentsize: U16::new(LE, shentsize),
        e_shnum: U16::new(LE, shnum),
        e_shstrndx: U16::new(LE, 0),
    }
}

fn load_header(region: &MemoryRegion, offset: u64, page_size: u64) -> ProgramHeader64<LE>
{
    ProgramHeader64 {
        p_type: U32::new(LE, PT_LOAD),
        p_flags: U32::new(LE, region.permissions.elf_flags()),
        p_offset: U64::new(LE, offset),
        p_vaddr: U64::new(LE, region.start),
        p_paddr: U64::new(LE, 0),
        p_filesz: U64::new(LE, region.size()),
        p_memsz: U64::new(LE, region.size()),
        p_align: U64::new(LE, page_size),
    }
}

/// Section header 0 carrying the real program header count.
fn extended_numbering_header(count: u64) -> SectionHeader64<LE>
{
    SectionHeader64 {
        sh_name: U32::new(LE, 0),
        sh_type: U32::new(LE, SHT_NULL),
        sh_flags: U64::new(LE, 0),
        sh_addr: U64::new(LE, 0),
        sh_offset: U64::new(LE, 0),
        sh_size: U64::new(LE, 0),
        sh_link: U32::new(LE, 0),
        sh_info: U32::new(LE, count as u32),
        sh_addralign: U64::new(LE, 0),
        sh_entsize: U64::new(LE, 0),
    }
}

fn copy_region<W: Write>(
    writer: &mut ElfCoreWriter<W>,
    memory: &dyn ProcessMemory,
    region: &MemoryRegion,
    buffer: &mut [u8],
) -> Result<()>
{
    let mut address = region.start;
    while address < region.end {
        let len = ((region.end - address) as usize).min(buffer.len());
        let chunk = &mut buffer[..len];
        memory.read_exact(address, chunk).map_err(|e| match e {
            DumpError::MemoryReadFailed { .. } => e,
            other => DumpError::MemoryReadFailed {
                address,
                size: len,
                details: other.to_string(),
            },
        })?;
        writer.write_all(chunk)?;
        address += len as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use object::read::elf::{ElfFile64, ProgramHeader as _};
    use object::{Object, ObjectSegment};

    use super::*;
    use crate::identity::ProcessIdentity;
    use crate::regions::Permissions;
    use crate::threads::ThreadSnapshot;
    use crate::types::ThreadId;

    /// Every byte reads as the low byte of its address.
    struct Pattern;

    impl ProcessMemory for Pattern
    {
        fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
        {
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = (address + i as u64) as u8;
            }
            Ok(buffer.len())
        }
    }

    struct Broken;

    impl ProcessMemory for Broken
    {
        fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
        {
            Err(DumpError::MemoryReadFailed {
                address,
                size: buffer.len(),
                details: "gone".to_string(),
            })
        }
    }

    fn sample_regions() -> RegionSet
    {
        let mut regions = RegionSet::new(0x1000);
        regions.insert_region(MemoryRegion::new(0x10000, 0x12000, Permissions::from_maps_letters("r-x")), |_| true);
        regions.insert_region(MemoryRegion::new(0x20000, 0x21000, Permissions::from_maps_letters("rw-")), |_| true);
        regions
    }

    #[test]
    fn test_core_parses_with_object()
    {
        let regions = sample_regions();
        let identity = ProcessIdentity {
            pid: 42,
            name: "app".to_string(),
            ..ProcessIdentity::default()
        };
        let threads = vec![ThreadSnapshot::new(ThreadId(42), Architecture::X86_64, vec![0; 27])];
        let sources = NoteSources {
            identity: &identity,
            threads: &threads,
            file_mappings: &[],
            page_size: 0x1000,
            crash_thread: None,
            signal: None,
        };
        let core = CoreFile::new(Architecture::X86_64, &regions, &sources);

        let mut bytes = Vec::new();
        let written = core.write(&mut bytes, &Pattern).unwrap();
        assert_eq!(written as usize, bytes.len());
        assert_eq!(written, core.layout().file_size);

        let file = ElfFile64::<LE>::parse(bytes.as_slice()).unwrap();
        assert_eq!(file.elf_header().e_type.get(LE), ET_CORE);
        assert_eq!(file.elf_header().e_machine.get(LE), object::elf::EM_X86_64);

        let headers = file.elf_program_headers();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].p_type(LE), PT_NOTE);
        assert_eq!(headers[1].p_flags(LE), object::elf::PF_R | object::elf::PF_X);
        assert_eq!(headers[1].p_offset(LE) % 0x1000, 0);
        assert_eq!(headers[2].p_offset(LE), headers[1].p_offset(LE) + 0x2000);

        let segment = file.segments().find(|s| s.address() == 0x20000).unwrap();
        let data = segment.data().unwrap();
        assert_eq!(data.len(), 0x1000);
        assert_eq!(data[0x34], 0x34);
    }

    #[test]
    fn test_read_failure_aborts_write()
    {
        let regions = sample_regions();
        let identity = ProcessIdentity::default();
        let sources = NoteSources {
            identity: &identity,
            threads: &[],
            file_mappings: &[],
            page_size: 0x1000,
            crash_thread: None,
            signal: None,
        };
        let core = CoreFile::new(Architecture::Arm64, &regions, &sources);
        let err = core.write(Vec::new(), &Broken).unwrap_err();
        assert!(matches!(err, DumpError::MemoryReadFailed { address: 0x10000, .. }));
    }

    #[test]
    fn test_unknown_architecture_is_rejected()
    {
        let regions = RegionSet::new(0x1000);
        let identity = ProcessIdentity::default();
        let sources = NoteSources {
            identity: &identity,
            threads: &[],
            file_mappings: &[],
            page_size: 0x1000,
            crash_thread: None,
            signal: None,
        };
        let core = CoreFile::new(Architecture::Unknown("riscv64"), &regions, &sources);
        assert!(matches!(
            core.write(Vec::new(), &Pattern),
            Err(DumpError::UnsupportedArchitecture(_))
        ));
    }

    #[test]
    fn test_extended_numbering_header()
    {
        let header = extended_numbering_header(70_000);
        assert_eq!(header.sh_info.get(LE), 70_000);

        let layout = CoreLayout {
            program_headers: 70_000,
            extended_numbering: true,
            section_header_offset: 64 + 70_000 * 56,
            notes_offset: 64 + 70_000 * 56 + 64,
            notes_size: 0,
            data_offset: 0,
            file_size: 0,
        };
        let ehdr = file_header(object::elf::EM_AARCH64, &layout);
        assert_eq!(ehdr.e_phnum.get(LE), PN_XNUM);
        assert_eq!(ehdr.e_shnum.get(LE), 1);
        assert_eq!(ehdr.e_shoff.get(LE), 64 + 70_000 * 56);
    }
}
