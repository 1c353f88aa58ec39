//! # macOS Dump Target
//!
//! macOS-specific [`DumpTarget`](crate::target::DumpTarget) using Mach APIs.
//!
//! macOS uses the Mach microkernel, which exposes process state through
//! Mach ports rather than `ptrace`:
//!
//! - **Mach tasks**: Represent a process
//! - **Mach threads**: Represent threads within a task
//! - **Mach ports**: Communication channels to tasks/threads
//!
//! ## Key Mach APIs Used
//!
//! - `task_for_pid()`: Get a Mach port to a process (declared ourselves - not in mach2)
//! - `task_threads()`: Enumerate threads in a task (from `mach2` crate)
//! - `thread_suspend()` / `thread_abort_safely()`: Stop threads at a consistent point
//! - `thread_get_state()`: Read thread registers (declared ourselves - not in mach2)
//! - `mach_vm_region_recurse()` / `mach_vm_read_overwrite()`: Address space and memory
//! - `task_info(TASK_DYLD_INFO)`: Locate dyld's image list
//!
//! ## Dependencies
//!
//! - **mach2 crate**: For well-maintained Mach APIs (`mach_task_self`, `task_threads`, `KERN_SUCCESS`)
//! - **libc crate**: For type definitions (`mach_port_t`, `thread_act_t`, etc.)
//! - **libproc crate**: For BSD process information (parent, group, credentials)
//! - **extern "C"**: For restricted functions not in mach2 (`task_for_pid`, `thread_get_state`)
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - [task_for_pid(3) man page](https://developer.apple.com/library/archive/documentation/Darwin/Reference/ManPages/man3/task_for_pid.3.html)
//! - [thread_get_state(3) man page](https://developer.apple.com/library/archive/documentation/Darwin/Reference/ManPages/man3/thread_get_state.3.html)

pub mod constants;
pub mod dyld;
pub mod error;
pub mod ffi;
pub mod memory;
pub mod registers;
pub mod task;
pub mod threads;

pub use task::MacOSTarget;
