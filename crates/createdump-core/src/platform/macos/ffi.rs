//! # macOS Mach API FFI Declarations
//!
//! Unsafe extern "C" declarations for the Mach calls the dumper makes that
//! the `mach2` crate does not expose (or exposes with inconvenient types).
//! They are wrapped in safe functions in the sibling modules.
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - [Mach System Calls](https://developer.apple.com/documentation/kernel)

// Allow doc comments in extern blocks - they're useful for developers even if rustdoc doesn't generate docs
#![allow(unused_doc_comments)]

use libc::{c_int, integer_t, kern_return_t, mach_msg_type_number_t, mach_port_t, natural_t, thread_act_t, vm_address_t, vm_size_t};

// Task and Process Management Functions
#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Get a Mach port to a process by PID
    ///
    /// Requires root or the `com.apple.security.cs.debugger` entitlement.
    pub fn task_for_pid(target_task: mach_port_t, pid: c_int, task: *mut mach_port_t) -> kern_return_t;

    /// Release a send right obtained from `task_for_pid()` or `task_threads()`
    pub fn mach_port_deallocate(target_task: mach_port_t, name: mach_port_t) -> kern_return_t;

    /// Query task information (`TASK_DYLD_INFO`)
    pub fn task_info(
        target_task: mach_port_t,
        flavor: c_int,
        task_info_out: *mut integer_t,
        task_info_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;
}

// Thread Functions
#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Read thread state (registers) from a thread
    pub fn thread_get_state(
        target_act: thread_act_t,
        flavor: c_int,
        old_state: *mut natural_t,
        old_state_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    /// Increment a thread's suspend count
    pub fn thread_suspend(target_act: thread_act_t) -> kern_return_t;

    /// Decrement a thread's suspend count
    pub fn thread_resume(target_act: thread_act_t) -> kern_return_t;

    /// Abort a blocking kernel call so it restarts after resume
    ///
    /// Fails rather than corrupting state when the thread is at a point
    /// where the abort cannot be done cleanly.
    pub fn thread_abort_safely(target_act: thread_act_t) -> kern_return_t;

    /// Query thread information (`THREAD_IDENTIFIER_INFO`)
    pub fn thread_info(
        target_act: thread_act_t,
        flavor: c_int,
        thread_info_out: *mut integer_t,
        thread_info_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;
}

// Virtual Memory Functions
#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Free memory the kernel allocated in our task (e.g. the `task_threads()` array)
    pub fn vm_deallocate(target_task: mach_port_t, address: vm_address_t, size: vm_size_t) -> kern_return_t;
}
