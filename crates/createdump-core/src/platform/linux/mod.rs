//! # Linux Dump Target
//!
//! Linux-specific [`DumpTarget`] built on `ptrace` and procfs.
//!
//! - **Suspension**: every thread listed under `/proc/<pid>/task` is attached
//!   with `PTRACE_ATTACH`; detaching resumes it.
//! - **Registers**: `PTRACE_GETREGSET` with `NT_PRSTATUS`, `NT_PRFPREG` and,
//!   on x86-64, `NT_X86_XSTATE`. The kernel hands these out in exactly the
//!   layout the core-file notes use.
//! - **Memory**: positional reads of `/proc/<pid>/mem`.
//! - **Identity and maps**: `/proc/<pid>/{stat,status,cmdline,auxv,maps}`.
//!
//! ## Companion mode
//!
//! When a debugger inside the runtime already controls the process, a target
//! built with [`LinuxTarget::with_companion`] never attaches. Registers and
//! memory come from the companion's [`DataTarget`] instead.
//!
//! ## References
//!
//! - [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - [proc(5) man page](https://man7.org/linux/man-pages/man5/proc.5.html)

pub mod dso;
pub mod memory;
pub mod ptrace;

use std::fs;
use std::io;

use tracing::{debug, info, warn};

use crate::dac::DataTarget;
use crate::elf::notes::{NT_PRFPREG, NT_PRSTATUS, NT_X86_XSTATE};
use crate::error::{DumpError, Result};
use crate::identity::{ProcessIdentity, AT_SYSINFO_EHDR};
use crate::maps::{retry_transient, ProcessMaps};
use crate::regions::system_page_size;
use crate::target::{DumpTarget, ProcessMemory};
use crate::threads::{ExtendedRegisters, ThreadSnapshot};
use crate::types::{Architecture, ProcessId, ThreadId};
pub use memory::ProcMem;

/// `struct user_fpregs_struct` on x86-64
#[cfg(not(target_arch = "aarch64"))]
const FP_REGSET_SIZE: usize = 512;
/// `struct user_fpsimd_state` on arm64
#[cfg(target_arch = "aarch64")]
const FP_REGSET_SIZE: usize = 528;

/// Upper bound for the XSAVE area; the kernel reports the real length
const XSTATE_BUFFER_SIZE: usize = 16 * 1024;

/// A live Linux process
pub struct LinuxTarget
{
    pid: ProcessId,
    architecture: Architecture,
    page_size: u64,
    memory: Option<ProcMem>,
    attached: Vec<ThreadId>,
    companion: Option<Box<dyn DataTarget>>,
}

impl LinuxTarget
{
    /// Prepare to dump `pid`.
    ///
    /// Nothing is attached until [`DumpTarget::suspend_threads`].
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: `/proc/<pid>` does not exist
    pub fn attach(pid: ProcessId) -> Result<Self>
    {
        if fs::metadata(format!("/proc/{pid}")).is_err() {
            return Err(DumpError::ProcessNotFound(pid.0));
        }
        Ok(Self {
            pid,
            architecture: Architecture::current(),
            page_size: system_page_size(),
            memory: None,
            attached: Vec::new(),
            companion: None,
        })
    }

    /// Dump `pid` through a debugger that already controls it.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: `/proc/<pid>` does not exist
    pub fn with_companion(pid: ProcessId, companion: Box<dyn DataTarget>) -> Result<Self>
    {
        let mut target = Self::attach(pid)?;
        target.companion = Some(companion);
        Ok(target)
    }

    /// Threads currently attached.
    pub fn attached_threads(&self) -> &[ThreadId]
    {
        &self.attached
    }

    fn proc_path(&self, file: &str) -> String
    {
        format!("/proc/{}/{file}", self.pid)
    }

    fn read_proc(&self, file: &str) -> Result<Vec<u8>>
    {
        fs::read(self.proc_path(file)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DumpError::ProcessNotFound(self.pid.0),
            io::ErrorKind::PermissionDenied => DumpError::PermissionDenied(format!("{}: {e}", self.proc_path(file))),
            _ => DumpError::Io(e),
        })
    }

    fn read_proc_text(&self, file: &str) -> Result<String>
    {
        Ok(String::from_utf8_lossy(&self.read_proc(file)?).into_owned())
    }

    fn capture_from_companion(&self, companion: &dyn DataTarget, tid: ThreadId) -> Result<ThreadSnapshot>
    {
        let context = companion.thread_context(tid)?;
        let registers = ThreadSnapshot::registers_from_bytes(&context);
        let mut snapshot = ThreadSnapshot::new(tid, self.architecture, registers);
        snapshot.tgid = self.pid.0;
        Ok(snapshot)
    }
}

impl ProcessMemory for LinuxTarget
{
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
    {
        if let Some(companion) = &self.companion {
            return companion.read_virtual(address, buffer);
        }
        match &self.memory {
            Some(memory) => memory.read(address, buffer),
            None => Err(DumpError::MemoryReadFailed {
                address,
                size: buffer.len(),
                details: "process memory is not open until the threads are suspended".to_string(),
            }),
        }
    }
}

impl DumpTarget for LinuxTarget
{
    fn pid(&self) -> ProcessId
    {
        self.pid
    }

    fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    fn page_size(&self) -> u64
    {
        self.page_size
    }

    fn suspend_threads(&mut self) -> Result<Vec<ThreadId>>
    {
        let tids = ptrace::list_threads(self.pid)?;
        if self.companion.is_some() {
            info!("Process {} is controlled by a companion debugger; not attaching", self.pid);
            return Ok(tids);
        }

        for &tid in &tids {
            ptrace::attach_thread(tid)?;
            self.attached.push(tid);
        }
        self.memory = Some(ProcMem::open(self.pid)?);
        info!("Suspended {} threads of process {}", tids.len(), self.pid);
        Ok(tids)
    }

    fn capture_registers(&mut self, tid: ThreadId) -> Result<ThreadSnapshot>
    {
        if let Some(companion) = self.companion.as_deref() {
            return self.capture_from_companion(companion, tid);
        }

        let mut general = vec![0u8; self.architecture.general_register_count() * 8];
        let length = ptrace::get_regset(tid, NT_PRSTATUS, &mut general).map_err(|e| DumpError::ReadRegistersFailed {
            operation: "PTRACE_GETREGSET(NT_PRSTATUS)".to_string(),
            thread_id: Some(tid),
            details: e.to_string(),
        })?;
        general.truncate(length);
        let mut snapshot = ThreadSnapshot::new(tid, self.architecture, ThreadSnapshot::registers_from_bytes(&general));
        snapshot.tgid = self.pid.0;

        let mut fp = vec![0u8; FP_REGSET_SIZE];
        match ptrace::get_regset(tid, NT_PRFPREG, &mut fp) {
            Ok(length) => {
                fp.truncate(length);
                snapshot.fp_registers = Some(fp);
            }
            Err(e) => warn!("Thread {tid}: floating-point registers unavailable: {e}"),
        }

        if self.architecture == Architecture::X86_64 {
            let mut xstate = vec![0u8; XSTATE_BUFFER_SIZE];
            match ptrace::get_regset(tid, NT_X86_XSTATE, &mut xstate) {
                Ok(length) => {
                    xstate.truncate(length);
                    snapshot.extended.push(ExtendedRegisters {
                        note_type: NT_X86_XSTATE,
                        data: xstate,
                    });
                }
                Err(e) => debug!("Thread {tid}: no XSAVE state: {e}"),
            }
        }

        Ok(snapshot)
    }

    fn resume_threads(&mut self)
    {
        let count = self.attached.len();
        for tid in self.attached.drain(..) {
            if let Err(e) = ptrace::detach_thread(tid) {
                warn!("{e}");
            }
        }
        self.memory = None;
        if count > 0 {
            info!("Resumed {count} threads of process {}", self.pid);
        }
    }

    fn identity(&mut self) -> Result<ProcessIdentity>
    {
        let mut identity = ProcessIdentity::new(self.pid);
        identity.apply_stat(&self.read_proc_text("stat")?)?;
        identity.apply_status(&self.read_proc_text("status")?);
        identity.apply_cmdline(&self.read_proc("cmdline")?);
        identity.apply_auxv(self.read_proc("auxv")?);
        Ok(identity)
    }

    fn discover_maps(&mut self, identity: &ProcessIdentity) -> Result<ProcessMaps>
    {
        let text = self.read_proc_text("maps")?;
        let mut maps = ProcessMaps::from_proc_maps(&text, identity.auxv_value(AT_SYSINFO_EHDR));
        debug!(
            "{} module mappings, {} other mappings, {} kernel pages",
            maps.modules.len(),
            maps.others.len(),
            maps.kernel_pages.len()
        );

        let target: &Self = self;
        let walked = retry_transient("link_map walk", || dso::image_headers(target, identity, &maps));
        match walked {
            Ok(headers) => maps.image_headers = headers,
            Err(e @ DumpError::Timeout(_)) => return Err(e),
            Err(e) => warn!("Loaded-image headers unavailable: {e}"),
        }
        Ok(maps)
    }
}

impl Drop for LinuxTarget
{
    fn drop(&mut self)
    {
        // Best effort resume - detach whatever is still attached
        self.resume_threads();
    }
}
