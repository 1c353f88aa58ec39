//! # macOS Dump Target
//!
//! [`DumpTarget`] for a Mach task.
//!
//! On macOS, a **task** represents a process, and a **thread** represents
//! a thread within that process. To dump a process, we:
//!
//! 1. Get a Mach port to the task (using `task_for_pid()`)
//! 2. Enumerate and suspend its threads (using `task_threads()` and `thread_suspend()`)
//! 3. Read thread state, memory and the dyld image list
//! 4. Resume the threads and release every port
//!
//! ## Mach Ports
//!
//! Mach ports are communication channels to kernel objects (tasks, threads, etc.).
//! They're like file descriptors, but for kernel objects. Every port handed to
//! us carries a send right that has to be released with `mach_port_deallocate()`.
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - [XNU Kernel Source](https://github.com/apple-oss-distributions/xnu) (for `task_for_pid` and `task_threads` implementation)

use std::{io, mem, ptr};

use libc::{c_int, mach_port_t, thread_act_t};
use libproc::libproc::bsd_info::BSDInfo;
use libproc::libproc::proc_pid::{pidinfo, pidpath};
use mach2::kern_return::KERN_SUCCESS;
use mach2::traps::mach_task_self;
use tracing::{debug, info, warn};

use crate::error::{DumpError, Result};
use crate::identity::ProcessIdentity;
use crate::maps::{retry_transient, uncovered_ranges, ProcessMaps};
use crate::platform::macos::error::MachError;
use crate::platform::macos::{dyld, ffi, memory, registers, threads};
use crate::regions::{system_page_size, MemoryRegion};
use crate::target::{DumpTarget, ProcessMemory};
use crate::threads::ThreadSnapshot;
use crate::types::{Architecture, ProcessId, ThreadId};

// `p_stat` values from <sys/proc.h>
const SIDL: u32 = 1;
const SRUN: u32 = 2;
const SSLEEP: u32 = 3;
const SSTOP: u32 = 4;
const SZOMB: u32 = 5;

/// A live Mach task
///
/// ## Lifecycle
///
/// 1. Create: `MacOSTarget::attach(pid)` - gets the task port
/// 2. Stop: `suspend_threads()` - suspends and aborts every thread
/// 3. Use: `capture_registers()`, `read_memory()`, `discover_maps()`
/// 4. Resume: `resume_threads()` (or just drop the struct)
///
/// ## Thread Safety
///
/// Not thread-safe. Use from a single thread or wrap in `Mutex`.
pub struct MacOSTarget
{
    /// Mach port to the target process (task)
    task: mach_port_t,
    pid: ProcessId,
    architecture: Architecture,
    page_size: u64,
    /// Thread ports we hold a send right for, by system thread id
    ports: Vec<(ThreadId, thread_act_t)>,
    /// Ports whose suspend count we raised
    suspended: Vec<thread_act_t>,
}

impl MacOSTarget
{
    /// Get the task port for `pid`.
    ///
    /// ## Errors
    ///
    /// - `PermissionDenied`: the process exists but `task_for_pid()` refused
    ///   (needs root or the debugger entitlement)
    /// - `MachError`: any other `task_for_pid()` failure
    pub fn attach(pid: ProcessId) -> Result<Self>
    {
        let mut task: mach_port_t = 0;
        let result = unsafe { ffi::task_for_pid(mach_task_self(), pid.0 as c_int, &mut task) };

        if result != KERN_SUCCESS {
            // task_for_pid() reports KERN_FAILURE rather than KERN_PROTECTION_FAILURE
            // when permissions are denied. Signal 0 tells the two apart.
            if result == libc::KERN_FAILURE {
                let process_exists = unsafe { libc::kill(pid.0 as libc::pid_t, 0) } == 0;
                if process_exists {
                    return Err(DumpError::PermissionDenied(format!(
                        "task_for_pid() failed with KERN_FAILURE, but process {} exists. This usually means \
                         insufficient permissions. Try running with sudo.",
                        pid.0
                    )));
                }
                return Err(DumpError::ProcessNotFound(pid.0));
            }
            return Err(DumpError::MachError(MachError::from(result)));
        }

        debug!("task port {task} for pid {pid}");
        Ok(Self {
            task,
            pid,
            architecture: Architecture::current(),
            page_size: system_page_size(),
            ports: Vec::new(),
            suspended: Vec::new(),
        })
    }

    fn port_for(&self, tid: ThreadId) -> Option<thread_act_t>
    {
        self.ports.iter().find(|(id, _)| *id == tid).map(|(_, port)| *port)
    }

    fn release_ports(&mut self)
    {
        for (_, port) in self.ports.drain(..) {
            threads::release_port(port);
        }
    }
}

impl ProcessMemory for MacOSTarget
{
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>
    {
        memory::read_memory_into(self.task, address, buffer)
    }
}

impl DumpTarget for MacOSTarget
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
        self.release_ports();
        let ports = threads::thread_ports(self.task)?;
        for port in &ports {
            self.ports.push((threads::thread_id(*port), *port));
        }

        for (tid, port) in &self.ports {
            threads::suspend_thread(*port)?;
            self.suspended.push(*port);
            debug!("suspended thread {tid} (port {port})");
        }

        info!("suspended {} threads of {}", self.suspended.len(), self.pid);
        Ok(self.ports.iter().map(|(tid, _)| *tid).collect())
    }

    fn capture_registers(&mut self, tid: ThreadId) -> Result<ThreadSnapshot>
    {
        let port = self.port_for(tid).ok_or_else(|| DumpError::ReadRegistersFailed {
            operation: "find thread port".to_string(),
            thread_id: Some(tid),
            details: "thread was not enumerated at suspension".to_string(),
        })?;
        let mut snapshot = registers::capture_thread(port, tid)?;
        snapshot.tgid = self.pid.0;
        Ok(snapshot)
    }

    fn resume_threads(&mut self)
    {
        for port in self.suspended.drain(..) {
            // Best effort resume
            if let Err(error) = threads::resume_thread(port) {
                warn!("{error}");
            }
        }
    }

    fn identity(&mut self) -> Result<ProcessIdentity>
    {
        let pid = self.pid.0 as i32;
        let info = pidinfo::<BSDInfo>(pid, 0).map_err(|details| {
            if unsafe { libc::kill(pid, 0) } != 0 {
                DumpError::ProcessNotFound(self.pid.0)
            } else {
                DumpError::PermissionDenied(format!("proc_pidinfo(PROC_PIDTBSDINFO) failed for {}: {details}", self.pid))
            }
        })?;

        let mut identity = ProcessIdentity::new(self.pid);
        identity.ppid = info.pbi_ppid;
        identity.pgrp = info.pbi_pgid;
        identity.uid = info.pbi_uid;
        identity.gid = info.pbi_gid;
        identity.nice = info.pbi_nice.clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8;
        identity.state = match info.pbi_status {
            SRUN | SIDL => b'R',
            SSLEEP => b'S',
            SSTOP => b'T',
            SZOMB => b'Z',
            _ => b'S',
        };
        let sid = unsafe { libc::getsid(pid) };
        identity.sid = if sid < 0 { 0 } else { sid as u32 };

        let name = c_chars_to_string(&info.pbi_name);
        identity.name = if name.is_empty() {
            c_chars_to_string(&info.pbi_comm)
        } else {
            name
        };
        match process_arguments(pid) {
            Ok(raw) => {
                if let Err(error) = identity.apply_procargs2(&raw) {
                    debug!("argument list of {}: {error}", self.pid);
                }
            }
            Err(error) => debug!("KERN_PROCARGS2 for {} failed: {error}", self.pid),
        }
        if identity.arguments.is_empty() {
            identity.arguments = pidpath(pid).unwrap_or_else(|_| identity.name.clone());
        }
        Ok(identity)
    }

    fn discover_maps(&mut self, _identity: &ProcessIdentity) -> Result<ProcessMaps>
    {
        let raw = memory::mapped_regions(self.task)?;
        let all_image_infos = dyld::all_image_infos_address(self.task)?;

        let images = match retry_transient("dyld image list", || dyld::loaded_images(&*self, all_image_infos)) {
            Ok(images) => images,
            Err(error @ DumpError::Timeout(_)) => return Err(error),
            Err(error) => {
                warn!("dyld image list unavailable: {error}");
                Vec::new()
            }
        };

        let mut maps = ProcessMaps::default();
        for image in images {
            maps.modules.extend(image.segments);
            maps.image_headers.push(image.header);
        }
        maps.modules.sort_by_key(|region: &MemoryRegion| region.start);
        maps.others = uncovered_ranges(&raw, &maps.modules);
        debug!(
            "{} module segments, {} other regions, {} image headers",
            maps.modules.len(),
            maps.others.len(),
            maps.image_headers.len()
        );
        Ok(maps)
    }
}

impl Drop for MacOSTarget
{
    fn drop(&mut self)
    {
        self.resume_threads();
        self.release_ports();
        if self.task != 0 {
            unsafe {
                let _ = ffi::mach_port_deallocate(mach_task_self(), self.task);
            }
        }
    }
}

/// Raw `KERN_PROCARGS2` buffer of `pid`: argc, executable path, argv, environment.
fn process_arguments(pid: libc::pid_t) -> io::Result<Vec<u8>>
{
    let mut argmax: c_int = 0;
    let mut size = mem::size_of::<c_int>();
    let mut mib = [libc::CTL_KERN, libc::KERN_ARGMAX];
    let result = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            mib.len() as libc::c_uint,
            (&mut argmax as *mut c_int).cast(),
            &mut size,
            ptr::null_mut(),
            0,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut buffer = vec![0u8; usize::try_from(argmax).unwrap_or(0)];
    let mut size = buffer.len();
    let mut mib = [libc::CTL_KERN, libc::KERN_PROCARGS2, pid];
    let result = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            mib.len() as libc::c_uint,
            buffer.as_mut_ptr().cast(),
            &mut size,
            ptr::null_mut(),
            0,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    buffer.truncate(size);
    Ok(buffer)
}

fn c_chars_to_string(chars: &[libc::c_char]) -> String
{
    let bytes: Vec<u8> = chars.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
