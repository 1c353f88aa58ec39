//! # macOS Register Capture
//!
//! Reads a suspended thread's registers with `thread_get_state()` and lays
//! them out the way a Linux core file expects.
//!
//! Mach and Linux disagree on register order: Mach's `x86_thread_state64_t`
//! starts with `rax`, Linux's `user_regs_struct` starts with `r15`. Debuggers
//! reading the dump only understand the Linux layout, so each architecture
//! module converts as it captures.
//!
//! - **ARM64**: `ARM_THREAD_STATE64` (flavor 6) and `ARM_NEON_STATE64` (flavor 17)
//! - **x86-64**: `X86_THREAD_STATE64` (flavor 4) and `X86_FLOAT_STATE64` (flavor 5)
//!
//! ## References
//!
//! - [thread_get_state documentation](https://developer.apple.com/documentation/kernel/1418576-thread_get_state/)
//! - [ARM_THREAD_STATE64 structure](https://opensource.apple.com/source/xnu/xnu-4570.71.2/osfmk/mach/arm/_structs.h)
//! - [X86_THREAD_STATE64 structure](https://opensource.apple.com/source/xnu/xnu-4570.71.2/osfmk/mach/i386/_structs.h)

#[cfg(target_arch = "aarch64")]
pub mod arm64;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use arm64::capture_thread;
#[cfg(target_arch = "x86_64")]
pub use x86_64::capture_thread;
