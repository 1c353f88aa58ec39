//! # macOS Platform Constants
//!
//! Thread-state flavors, info flavors and limits used with the Mach APIs.
//!
//! Flavor counts are in `natural_t` (u32) units, the unit `thread_get_state()`
//! and `task_info()` measure their buffers in. A count larger than the kernel
//! needs is accepted; the kernel writes back the real count.

use libc::{c_int, mach_msg_type_number_t};

// ============================================================================
// Thread State Flavors
// ============================================================================

/// ARM64 thread state flavor (flavor 6)
///
/// X0-X28, FP, LR, SP, PC and CPSR.
#[cfg(target_arch = "aarch64")]
pub const ARM_THREAD_STATE64: c_int = 6;

/// ARM64 thread state count (68 u32 values)
///
/// Each 64-bit register is stored as two u32 values.
#[cfg(target_arch = "aarch64")]
pub const ARM_THREAD_STATE64_COUNT: mach_msg_type_number_t = 68;

/// ARM64 NEON state flavor (flavor 17)
///
/// V0-V31, FPSR and FPCR.
#[cfg(target_arch = "aarch64")]
pub const ARM_NEON_STATE64: c_int = 17;

/// ARM64 NEON state count (528 bytes with the 16-byte tail alignment)
#[cfg(target_arch = "aarch64")]
pub const ARM_NEON_STATE64_COUNT: mach_msg_type_number_t = 132;

/// x86-64 thread state flavor (flavor 4)
#[cfg(target_arch = "x86_64")]
pub const X86_THREAD_STATE64: c_int = 4;

/// x86-64 thread state count (42 u32 values)
#[cfg(target_arch = "x86_64")]
pub const X86_THREAD_STATE64_COUNT: mach_msg_type_number_t = 42;

/// x86-64 floating-point state flavor (flavor 5)
#[cfg(target_arch = "x86_64")]
pub const X86_FLOAT_STATE64: c_int = 5;

/// x86-64 floating-point state count (524 bytes)
#[cfg(target_arch = "x86_64")]
pub const X86_FLOAT_STATE64_COUNT: mach_msg_type_number_t = 131;

/// Bytes of reserved header in `x86_float_state64_t` before the FXSAVE image
#[cfg(target_arch = "x86_64")]
pub const X86_FLOAT_STATE64_FXSAVE_OFFSET: usize = 8;

// ============================================================================
// ARM64 Register Layout Indices
// ============================================================================

/// Index of SP in the ARM64 thread state, in 64-bit slots
#[cfg(target_arch = "aarch64")]
pub const ARM64_SP_INDEX: usize = 31;

/// Index of PC in the ARM64 thread state, in 64-bit slots
#[cfg(target_arch = "aarch64")]
pub const ARM64_PC_INDEX: usize = 32;

/// Index of CPSR in the ARM64 thread state, in u32 words
///
/// The second u32 at index 67 is padding.
#[cfg(target_arch = "aarch64")]
pub const ARM64_CPSR_INDEX: usize = 66;

// ============================================================================
// Info Flavors
// ============================================================================

/// `thread_info()` flavor returning `thread_identifier_info`
pub const THREAD_IDENTIFIER_INFO: c_int = 4;

/// `thread_identifier_info` count: thread id, handle and dispatch queue address
pub const THREAD_IDENTIFIER_INFO_COUNT: mach_msg_type_number_t = 6;

/// `task_info()` flavor returning `task_dyld_info`
pub const TASK_DYLD_INFO: c_int = 17;

/// `task_dyld_info` count: address, size and format of `dyld_all_image_infos`
pub const TASK_DYLD_INFO_COUNT: mach_msg_type_number_t = 5;

// ============================================================================
// Limits
// ============================================================================

/// Maximum chunk size for `mach_vm_read_overwrite()` (64 KB)
pub const MAX_VM_READ_CHUNK: usize = 64 * 1024;

/// Times a thread is suspended and aborted before giving up on the abort
///
/// `thread_abort_safely()` fails while the thread sits at a point where it
/// cannot be interrupted cleanly; resuming it briefly lets it move on.
pub const THREAD_ABORT_ATTEMPTS: u32 = 10;
