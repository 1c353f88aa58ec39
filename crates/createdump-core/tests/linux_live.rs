//! Dumps a real child process end to end
//!
//! These tests require:
//! - Running on Linux (`#[cfg(target_os = "linux")]`)
//! - Permission to ptrace a child (`/proc/sys/kernel/yama/ptrace_scope` <= 1,
//!   and no seccomp policy blocking `ptrace`)
//!
//! When attaching is refused the test prints why and passes.

#![cfg(target_os = "linux")]

use std::fs;
use std::process::{Child, Command};

use createdump_core::config::{DumpConfig, DumpKind};
use createdump_core::dac::{DacLoader, DacSession, DataTarget};
use createdump_core::dump::create_dump_with;
use createdump_core::error::{DumpError, Result};
use createdump_core::platform::linux::LinuxTarget;
use createdump_core::target::DumpTarget;
use createdump_core::types::{Architecture, ProcessId};
use object::elf::{ET_CORE, PT_LOAD, PT_NOTE};
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;

/// Reports no ranges
struct QuietDac;

impl DacSession for QuietDac
{
    fn enumerate(&mut self, _kind: u32, _target: &dyn DataTarget, _sink: &mut dyn FnMut(u64, u64)) -> Result<()>
    {
        Ok(())
    }
}

impl DacLoader for QuietDac
{
    fn load(&self) -> Result<Box<dyn DacSession>>
    {
        Ok(Box::new(QuietDac))
    }
}

/// Kills the child however the test ends
struct Sleeper(Child);

impl Drop for Sleeper
{
    fn drop(&mut self)
    {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_sleeper() -> Sleeper
{
    Sleeper(Command::new("sleep").arg("30").spawn().expect("spawn sleep"))
}

#[test]
fn test_single_thread_process_dump()
{
    if matches!(Architecture::current(), Architecture::Unknown(_)) {
        eprintln!("skipping: no core layout for this architecture");
        return;
    }

    let child = spawn_sleeper();
    let pid = ProcessId(child.0.id());
    let dir = tempfile::tempdir().unwrap();

    let mut config = DumpConfig::new(pid);
    config.kind = DumpKind::Normal;
    config.name_template = Some(dir.path().join("core.%e.%p").to_string_lossy().into_owned());

    let mut target = LinuxTarget::attach(pid).unwrap();
    let (summary, path) = match create_dump_with(&mut target, &QuietDac, &config) {
        Ok(done) => done,
        Err(DumpError::PermissionDenied(reason)) => {
            eprintln!("skipping: ptrace not permitted ({reason})");
            return;
        }
        Err(e) => panic!("dump failed: {e}"),
    };

    assert!(target.attached_threads().is_empty(), "every thread detached");
    assert_eq!(summary.threads, 1);
    assert!(path.file_name().unwrap().to_string_lossy().ends_with(&format!(".{pid}")));
    let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1, "no partial file left behind");

    let data = fs::read(&path).unwrap();
    assert_eq!(data.len() as u64, summary.bytes_written);
    let header = object::elf::FileHeader64::<Endianness>::parse(&*data).unwrap();
    let endian = header.endian().unwrap();
    assert_eq!(header.e_type(endian), ET_CORE);
    assert_eq!(header.e_machine(endian), Architecture::current().elf_machine().unwrap());

    let phdrs = header.program_headers(endian, &*data).unwrap();
    assert!(phdrs.iter().any(|phdr| phdr.p_type(endian) == PT_NOTE));
    assert!(phdrs.iter().any(|phdr| phdr.p_type(endian) == PT_LOAD));
}

#[test]
fn test_missing_process()
{
    let error = LinuxTarget::attach(ProcessId(u32::MAX)).err().unwrap();
    assert!(matches!(error, DumpError::ProcessNotFound(_)));
}

#[test]
fn test_target_resumes_on_drop()
{
    let child = spawn_sleeper();
    let pid = ProcessId(child.0.id());

    let mut target = LinuxTarget::attach(pid).unwrap();
    match target.suspend_threads() {
        Ok(tids) => assert!(!tids.is_empty()),
        Err(DumpError::PermissionDenied(reason)) => {
            eprintln!("skipping: ptrace not permitted ({reason})");
            return;
        }
        Err(e) => panic!("suspend failed: {e}"),
    }
    drop(target);

    // Detached again: a fresh target can suspend the same threads
    let mut again = LinuxTarget::attach(pid).unwrap();
    assert!(again.suspend_threads().is_ok());
    again.resume_threads();
}
