//! # Core Notes
//!
//! The metadata records of a core file: process info, auxiliary vector,
//! file mappings and per-thread register state.
//!
//! Notes are built in memory before anything is written, because their total
//! size decides where the memory segments start.
//!
//! ## Layout references
//!
//! - [`elf_prpsinfo` / `elf_prstatus`](https://elixir.bootlin.com/linux/latest/source/include/linux/elfcore.h)
//! - [`NT_FILE`](https://elixir.bootlin.com/linux/latest/source/fs/binfmt_elf.c) (`fill_files_note`)

use std::io::Write;

use object::pod::{bytes_of, Pod};

use crate::identity::ProcessIdentity;
use crate::regions::MemoryRegion;
use crate::threads::ThreadSnapshot;
use crate::types::ThreadId;

/// Process status, one per thread
pub const NT_PRSTATUS: u32 = 1;
/// Floating-point registers
pub const NT_PRFPREG: u32 = 2;
/// Process info
pub const NT_PRPSINFO: u32 = 3;
/// Auxiliary vector
pub const NT_AUXV: u32 = 6;
/// Signal that stopped the process
pub const NT_SIGINFO: u32 = 0x5349_4749;
/// Files mapped into the address space
pub const NT_FILE: u32 = 0x4649_4c45;
/// x86 `XSAVE` area
pub const NT_X86_XSTATE: u32 = 0x202;

/// Owner name of standard notes
pub const NOTE_NAME_CORE: &str = "CORE";
/// Owner name of Linux-specific register notes
pub const NOTE_NAME_LINUX: &str = "LINUX";

const NOTE_ALIGN: usize = 4;
const NOTE_HEADER_SIZE: usize = 12;
const SIGINFO_SIZE: usize = 128;

/// `struct elf_prpsinfo` (136 bytes)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PrPsInfo
{
    pub pr_state: i8,
    pub pr_sname: u8,
    pub pr_zomb: u8,
    pub pr_nice: i8,
    pub pad: [u8; 4],
    pub pr_flag: u64,
    pub pr_uid: u32,
    pub pr_gid: u32,
    pub pr_pid: i32,
    pub pr_ppid: i32,
    pub pr_pgrp: i32,
    pub pr_sid: i32,
    pub pr_fname: [u8; 16],
    pub pr_psargs: [u8; 80],
}

// SAFETY: repr(C), only integer fields and arrays, no implicit padding.
unsafe impl Pod for PrPsInfo {}

/// `struct elf_prstatus` up to (not including) `pr_reg` (112 bytes)
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PrStatusHead
{
    /// `si_signo`, `si_code`, `si_errno`
    pub pr_info: [i32; 3],
    pub pr_cursig: i16,
    pub pad: [u8; 2],
    pub pr_sigpend: u64,
    pub pr_sighold: u64,
    pub pr_pid: i32,
    pub pr_ppid: i32,
    pub pr_pgrp: i32,
    pub pr_sid: i32,
    /// user, system, children's user and children's system time as `timeval`s
    pub pr_times: [u64; 8],
}

// SAFETY: repr(C), only integer fields and arrays, no implicit padding.
unsafe impl Pod for PrStatusHead {}

/// One ELF note
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note
{
    /// Owner name, written NUL-terminated
    pub name: &'static str,
    /// `n_type`
    pub note_type: u32,
    /// Payload
    pub desc: Vec<u8>,
}

impl Note
{
    /// Note owned by `CORE`.
    pub fn core(note_type: u32, desc: Vec<u8>) -> Self
    {
        Self {
            name: NOTE_NAME_CORE,
            note_type,
            desc,
        }
    }

    /// Note owned by `LINUX`.
    pub fn linux(note_type: u32, desc: Vec<u8>) -> Self
    {
        Self {
            name: NOTE_NAME_LINUX,
            note_type,
            desc,
        }
    }

    /// Bytes this note occupies in the file, padding included.
    pub fn encoded_size(&self) -> usize
    {
        NOTE_HEADER_SIZE + round_up(self.name.len() + 1, NOTE_ALIGN) + round_up(self.desc.len(), NOTE_ALIGN)
    }

    /// Write header, name and payload with 4-byte padding.
    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()>
    {
        let namesz = self.name.len() + 1;
        out.write_all(&(namesz as u32).to_le_bytes())?;
        out.write_all(&(self.desc.len() as u32).to_le_bytes())?;
        out.write_all(&self.note_type.to_le_bytes())?;

        let zeros = [0u8; NOTE_ALIGN];
        out.write_all(self.name.as_bytes())?;
        out.write_all(&zeros[..round_up(namesz, NOTE_ALIGN) - self.name.len()])?;
        out.write_all(&self.desc)?;
        out.write_all(&zeros[..round_up(self.desc.len(), NOTE_ALIGN) - self.desc.len()])?;
        Ok(())
    }
}

pub(crate) fn round_up(value: usize, alignment: usize) -> usize
{
    value.div_ceil(alignment) * alignment
}

/// Everything the notes are built from
pub struct NoteSources<'a>
{
    pub identity: &'a ProcessIdentity,
    pub threads: &'a [ThreadSnapshot],
    pub file_mappings: &'a [&'a MemoryRegion],
    pub page_size: u64,
    pub crash_thread: Option<ThreadId>,
    pub signal: Option<i32>,
}

/// Build every note in file order.
///
/// 1. `NT_PRPSINFO`
/// 2. `NT_AUXV`, when the auxiliary vector is known
/// 3. `NT_FILE`
/// 4. per thread, crash thread first: `NT_PRSTATUS`, `NT_SIGINFO` (crash
///    thread with a signal only), `NT_PRFPREG`, extended blocks
pub fn build_notes(sources: &NoteSources<'_>) -> Vec<Note>
{
    let mut notes = vec![Note::core(NT_PRPSINFO, bytes_of(&prpsinfo(sources.identity)).to_vec())];

    if !sources.identity.raw_auxv.is_empty() {
        notes.push(Note::core(NT_AUXV, sources.identity.raw_auxv.clone()));
    }

    notes.push(Note::core(NT_FILE, file_note(sources.file_mappings, sources.page_size)));

    let crash = crash_thread_id(sources);
    for thread in ordered_threads(sources.threads, crash) {
        let signal = if Some(thread.tid) == crash { sources.signal } else { None };

        notes.push(Note::core(NT_PRSTATUS, prstatus(thread, sources.identity, signal)));
        if let Some(signo) = signal {
            notes.push(Note::core(NT_SIGINFO, siginfo(signo)));
        }
        if let Some(fp) = &thread.fp_registers {
            notes.push(Note::core(NT_PRFPREG, fp.clone()));
        }
        for block in &thread.extended {
            notes.push(Note::linux(block.note_type, block.data.clone()));
        }
    }

    notes
}

/// The requested crash thread if it was captured, else the main thread, else the first one.
fn crash_thread_id(sources: &NoteSources<'_>) -> Option<ThreadId>
{
    let captured = |tid: ThreadId| sources.threads.iter().any(|thread| thread.tid == tid);
    sources
        .crash_thread
        .filter(|tid| captured(*tid))
        .or_else(|| Some(ThreadId(u64::from(sources.identity.pid))).filter(|tid| captured(*tid)))
        .or_else(|| sources.threads.first().map(|thread| thread.tid))
}

fn ordered_threads(threads: &[ThreadSnapshot], crash: Option<ThreadId>) -> Vec<&ThreadSnapshot>
{
    let mut ordered: Vec<&ThreadSnapshot> = threads.iter().collect();
    ordered.sort_by_key(|thread| (Some(thread.tid) != crash, thread.tid));
    ordered
}

fn prpsinfo(identity: &ProcessIdentity) -> PrPsInfo
{
    const STATES: &[u8] = b"RSDTZW";

    let (state, sname) = match STATES.iter().position(|s| *s == identity.state) {
        Some(index) => (index as i8, identity.state),
        None => (0, if identity.state == 0 { b'R' } else { identity.state }),
    };

    let mut info = PrPsInfo {
        pr_state: state,
        pr_sname: sname,
        pr_zomb: u8::from(sname == b'Z'),
        pr_nice: identity.nice,
        pad: [0; 4],
        pr_flag: 0,
        pr_uid: identity.uid,
        pr_gid: identity.gid,
        pr_pid: identity.pid as i32,
        pr_ppid: identity.ppid as i32,
        pr_pgrp: identity.pgrp as i32,
        pr_sid: identity.sid as i32,
        pr_fname: [0; 16],
        pr_psargs: [0; 80],
    };
    copy_truncated(&mut info.pr_fname, identity.name.as_bytes());
    copy_truncated(&mut info.pr_psargs, identity.arguments.as_bytes());
    info
}

/// Copy leaving at least one trailing NUL.
fn copy_truncated(dest: &mut [u8], src: &[u8])
{
    let len = src.len().min(dest.len() - 1);
    dest[..len].copy_from_slice(&src[..len]);
}

fn prstatus(thread: &ThreadSnapshot, identity: &ProcessIdentity, signal: Option<i32>) -> Vec<u8>
{
    let signo = signal.unwrap_or(0);
    let ppid = if thread.ppid != 0 { thread.ppid } else { identity.ppid };
    let head = PrStatusHead {
        pr_info: [signo, 0, 0],
        pr_cursig: signo as i16,
        pr_pid: thread.tid.as_note_pid() as i32,
        pr_ppid: ppid as i32,
        pr_pgrp: identity.pgrp as i32,
        pr_sid: identity.sid as i32,
        ..PrStatusHead::default()
    };

    let mut desc = bytes_of(&head).to_vec();
    desc.extend_from_slice(&thread.register_bytes());
    let fpvalid = i32::from(thread.fp_registers.is_some());
    desc.extend_from_slice(&fpvalid.to_le_bytes());
    desc.extend_from_slice(&[0; 4]);
    desc
}

fn siginfo(signo: i32) -> Vec<u8>
{
    // si_signo, si_errno, si_code (SI_USER); the rest of siginfo_t stays zero
    let mut desc = vec![0u8; SIGINFO_SIZE];
    desc[..4].copy_from_slice(&signo.to_le_bytes());
    desc
}

fn file_note(mappings: &[&MemoryRegion], page_size: u64) -> Vec<u8>
{
    let mut desc = Vec::new();
    desc.extend_from_slice(&(mappings.len() as u64).to_le_bytes());
    desc.extend_from_slice(&page_size.to_le_bytes());
    for region in mappings {
        desc.extend_from_slice(&region.start.to_le_bytes());
        desc.extend_from_slice(&region.end.to_le_bytes());
        desc.extend_from_slice(&(region.offset / page_size).to_le_bytes());
    }
    for region in mappings {
        desc.extend_from_slice(region.file_name.as_deref().unwrap_or_default().as_bytes());
        desc.push(0);
    }
    desc
}
