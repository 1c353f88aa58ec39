//! Thin wrappers around the `ptrace` requests the dumper needs.
//!
//! Every thread of the target is attached individually: `PTRACE_ATTACH`
//! stops only the thread it names. The stop is asynchronous, so each attach
//! is followed by `waitpid(__WALL)` until the kernel reports it.

use std::fs;
use std::io;
use std::ptr;

use libc::{c_void, pid_t};
use tracing::{debug, trace};

use crate::error::{DumpError, Result};
use crate::types::{ProcessId, ThreadId};

/// Thread ids of `pid`, from `/proc/<pid>/task`, in ascending order.
///
/// ## Errors
///
/// - `ProcessNotFound`: the task directory is gone
/// - `Io`: it could not be listed
pub fn list_threads(pid: ProcessId) -> Result<Vec<ThreadId>>
{
    let dir = format!("/proc/{pid}/task");
    let entries = fs::read_dir(&dir).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => DumpError::ProcessNotFound(pid.0),
        _ => DumpError::Io(e),
    })?;

    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|name| name.parse::<u64>().ok()) {
            tids.push(ThreadId(tid));
        }
    }
    tids.sort_unstable();
    trace!("Process {pid}: threads {tids:?}");
    Ok(tids)
}

/// Attach to one thread and wait for it to stop.
///
/// ## Errors
///
/// - `PermissionDenied`: `EPERM` (see `/proc/sys/kernel/yama/ptrace_scope`)
/// - `AttachFailed`: any other failure, including the thread exiting
pub fn attach_thread(tid: ThreadId) -> Result<()>
{
    let raw = tid.0 as pid_t;
    let result = unsafe { libc::ptrace(libc::PTRACE_ATTACH, raw, ptr::null_mut::<c_void>(), ptr::null_mut::<c_void>()) };
    if result == -1 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EPERM) => DumpError::PermissionDenied(format!(
                "ptrace(PTRACE_ATTACH, {tid}) failed: {err}; check /proc/sys/kernel/yama/ptrace_scope"
            )),
            _ => DumpError::AttachFailed(format!("ptrace(PTRACE_ATTACH, {tid}) failed: {err}")),
        });
    }

    loop {
        let mut status = 0;
        let waited = unsafe { libc::waitpid(raw, &mut status, libc::__WALL) };
        if waited == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            let _ = detach_thread(tid);
            return Err(DumpError::AttachFailed(format!("waitpid({tid}) failed: {err}")));
        }
        if libc::WIFSTOPPED(status) {
            break;
        }
        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            return Err(DumpError::AttachFailed(format!("thread {tid} exited during attach")));
        }
    }

    debug!("Attached to thread {tid}");
    Ok(())
}

/// Detach from a thread, letting it run again.
///
/// ## Errors
///
/// - `ResumeFailed`: `PTRACE_DETACH` failed
pub fn detach_thread(tid: ThreadId) -> Result<()>
{
    let result = unsafe {
        libc::ptrace(
            libc::PTRACE_DETACH,
            tid.0 as pid_t,
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    if result == -1 {
        let err = io::Error::last_os_error();
        return Err(DumpError::ResumeFailed(format!("ptrace(PTRACE_DETACH, {tid}) failed: {err}")));
    }
    trace!("Detached from thread {tid}");
    Ok(())
}

/// Read one register set with `PTRACE_GETREGSET`.
///
/// `buffer` must be at least as large as the set; the number of bytes the
/// kernel filled in is returned.
pub fn get_regset(tid: ThreadId, note_type: u32, buffer: &mut [u8]) -> io::Result<usize>
{
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast::<c_void>(),
        iov_len: buffer.len(),
    };
    let result = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid.0 as pid_t,
            note_type as usize as *mut c_void,
            (&mut iov as *mut libc::iovec).cast::<c_void>(),
        )
    };
    if result == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(iov.iov_len)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_own_threads_include_main_thread()
    {
        let pid = std::process::id();
        let tids = list_threads(ProcessId(pid)).unwrap();
        assert!(tids.contains(&ThreadId(u64::from(pid))));
        assert!(tids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_missing_process()
    {
        // Above the kernel's pid_max ceiling.
        let err = list_threads(ProcessId(u32::MAX)).unwrap_err();
        assert!(matches!(err, DumpError::ProcessNotFound(_)));
    }
}
