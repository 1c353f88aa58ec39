//! # macOS Thread Management
//!
//! Thread enumeration and suspension for the macOS dump target.
//!
//! ## Mach APIs Used
//!
//! - **task_threads()**: Enumerate threads in a task
//! - **thread_suspend()** / **thread_resume()**: Adjust a thread's suspend count
//! - **thread_abort_safely()**: Knock a suspended thread out of a blocking kernel call
//! - **thread_info(THREAD_IDENTIFIER_INFO)**: System-wide thread id
//! - **mach_port_deallocate()**: Release thread ports
//! - **vm_deallocate()**: Free memory allocated by task_threads()
//!
//! ## Why abort?
//!
//! A thread suspended inside a kernel call finishes that call when it is
//! resumed, possibly after it has been observed. `thread_abort_safely()`
//! makes the call restart instead, so the captured state stays true. The
//! abort is refused at some points; the thread is then resumed briefly and
//! the pair retried.
//!
//! ## References
//!
//! - [task_threads(3) man page](https://developer.apple.com/documentation/kernel/1537751-task_threads/)
//! - [thread_suspend(3) man page](https://developer.apple.com/documentation/kernel/1418926-thread_suspend/)
//! - [thread_abort_safely(3) man page](https://developer.apple.com/documentation/kernel/1418491-thread_abort_safely/)

use std::mem;

use libc::{integer_t, mach_msg_type_number_t, mach_port_t, thread_act_t, vm_address_t, vm_size_t};
use mach2::kern_return::KERN_SUCCESS;
use mach2::task::task_threads;
use mach2::traps::mach_task_self;
use tracing::{debug, trace, warn};

use crate::error::{DumpError, Result};
use crate::platform::macos::{constants, ffi};
use crate::types::ThreadId;

/// `struct thread_identifier_info`
#[repr(C)]
#[derive(Default)]
struct ThreadIdentifierInfo
{
    thread_id: u64,
    thread_handle: u64,
    dispatch_qaddr: u64,
}

/// Thread ports of `task`.
///
/// The caller owns one send right per port and releases it with
/// [`release_port`].
///
/// ## Errors
///
/// - `SuspendFailed`: `task_threads()` failed
pub fn thread_ports(task: mach_port_t) -> Result<Vec<thread_act_t>>
{
    unsafe {
        let mut threads: *mut thread_act_t = std::ptr::null_mut();
        let mut thread_count: mach_msg_type_number_t = 0;
        let result = task_threads(task, &mut threads, &mut thread_count);
        if result != KERN_SUCCESS {
            return Err(DumpError::SuspendFailed(format!("Failed to enumerate threads: {}", result)));
        }

        let ports = if threads.is_null() {
            Vec::new()
        } else {
            std::slice::from_raw_parts(threads, thread_count as usize).to_vec()
        };
        deallocate_threads_array(threads, thread_count);
        Ok(ports)
    }
}

/// Free the array `task_threads()` allocated in our address space.
///
/// Safe to call with a null pointer or zero count.
fn deallocate_threads_array(threads: *mut thread_act_t, count: mach_msg_type_number_t)
{
    if threads.is_null() || count == 0 {
        return;
    }

    let size = (count as usize).saturating_mul(mem::size_of::<thread_act_t>()) as vm_size_t;
    unsafe {
        let _ = ffi::vm_deallocate(mach_task_self(), threads as vm_address_t, size);
    }
}

/// Release the send right for a thread port.
pub fn release_port(port: thread_act_t)
{
    unsafe {
        let _ = ffi::mach_port_deallocate(mach_task_self(), port);
    }
}

/// Suspend a thread and abort any kernel call it is blocked in.
///
/// After [`THREAD_ABORT_ATTEMPTS`](constants::THREAD_ABORT_ATTEMPTS)
/// refused aborts the thread is left suspended without the abort, which is
/// still a consistent stop.
///
/// ## Errors
///
/// - `SuspendFailed`: `thread_suspend()` failed; the thread is not suspended
pub fn suspend_thread(port: thread_act_t) -> Result<()>
{
    for attempt in 1..=constants::THREAD_ABORT_ATTEMPTS {
        let result = unsafe { ffi::thread_suspend(port) };
        if result != KERN_SUCCESS {
            return Err(DumpError::SuspendFailed(format!(
                "thread_suspend failed for thread port {port}: {result}"
            )));
        }

        let result = unsafe { ffi::thread_abort_safely(port) };
        if result == KERN_SUCCESS {
            return Ok(());
        }
        if attempt == constants::THREAD_ABORT_ATTEMPTS {
            warn!("thread_abort_safely failed {attempt} times for thread port {port}: {result}; leaving it suspended");
            return Ok(());
        }

        trace!("thread_abort_safely refused for thread port {port} ({result}), retrying");
        let result = unsafe { ffi::thread_resume(port) };
        if result != KERN_SUCCESS {
            return Err(DumpError::SuspendFailed(format!(
                "thread_resume failed for thread port {port} while retrying the abort: {result}"
            )));
        }
    }
    Ok(())
}

/// Resume a thread suspended by [`suspend_thread`].
///
/// ## Errors
///
/// - `ResumeFailed`: `thread_resume()` failed
pub fn resume_thread(port: thread_act_t) -> Result<()>
{
    let result = unsafe { ffi::thread_resume(port) };
    if result != KERN_SUCCESS {
        return Err(DumpError::ResumeFailed(format!(
            "thread_resume failed for thread port {port}: {result}"
        )));
    }
    Ok(())
}

/// System-wide id of a thread, falling back to the port name.
pub fn thread_id(port: thread_act_t) -> ThreadId
{
    let mut info = ThreadIdentifierInfo::default();
    let mut count = constants::THREAD_IDENTIFIER_INFO_COUNT;
    let result = unsafe {
        ffi::thread_info(
            port,
            constants::THREAD_IDENTIFIER_INFO,
            &mut info as *mut _ as *mut integer_t,
            &mut count,
        )
    };
    if result == KERN_SUCCESS {
        ThreadId(info.thread_id)
    } else {
        debug!("thread_info(THREAD_IDENTIFIER_INFO) failed for port {port}: {result}");
        ThreadId(u64::from(port))
    }
}
