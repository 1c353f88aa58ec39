//! # ARM64 Register Capture
//!
//! ## Thread State Structure
//!
//! `arm_thread_state64_t` is 68 `u32` words: `x0-x28 fp lr sp pc` as
//! 64-bit pairs (low word first), then `cpsr` and a padding word. That is
//! already the order of Linux's `user_pt_regs` (`x0-x30 sp pc pstate`),
//! so capture only widens the words.
//!
//! `arm_neon_state64_t` (`v0-v31 fpsr fpcr`) matches Linux's
//! `user_fpsimd_state` up to its trailing reserved words.

use libc::{natural_t, thread_act_t};
use mach2::kern_return::{KERN_INVALID_ARGUMENT, KERN_SUCCESS};
use tracing::{debug, warn};

use crate::error::{DumpError, Result};
use crate::platform::macos::{constants, ffi};
use crate::threads::ThreadSnapshot;
use crate::types::{Architecture, ThreadId};

/// Size of `user_fpsimd_state` in `NT_PRFPREG`
const FPSIMD_SIZE: usize = 528;

/// Bytes of `arm_neon_state64_t` that carry data
const NEON_DATA_SIZE: usize = 32 * 16 + 8;

/// Capture the general-purpose and NEON registers of `thread`.
///
/// ## Errors
///
/// - `ReadRegistersFailed`: `thread_get_state(ARM_THREAD_STATE64)` failed
pub fn capture_thread(thread: thread_act_t, tid: ThreadId) -> Result<ThreadSnapshot>
{
    let mut state_words = [0 as natural_t; constants::ARM_THREAD_STATE64_COUNT as usize];
    let mut count = constants::ARM_THREAD_STATE64_COUNT;
    let result =
        unsafe { ffi::thread_get_state(thread, constants::ARM_THREAD_STATE64, state_words.as_mut_ptr(), &mut count) };
    if result != KERN_SUCCESS {
        return Err(DumpError::ReadRegistersFailed {
            operation: "read ARM64 thread state".to_string(),
            thread_id: Some(tid),
            details: format!("thread_get_state failed: {}", result),
        });
    }

    let mut snapshot = ThreadSnapshot::new(tid, Architecture::Arm64, linux_registers(&state_words));
    snapshot.fp_registers = fetch_neon_state(thread, tid);
    Ok(snapshot)
}

/// Widen Mach thread-state words into `user_pt_regs`.
pub fn linux_registers(state_words: &[natural_t]) -> Vec<u64>
{
    // Low 32 bits at index i * 2, high 32 bits at i * 2 + 1.
    let read_u64 = |idx: usize| -> u64 {
        let low = state_words.get(idx * 2).copied().unwrap_or(0);
        let high = state_words.get(idx * 2 + 1).copied().unwrap_or(0);
        u64::from(low) | (u64::from(high) << 32)
    };

    let mut regs: Vec<u64> = (0..=30).map(read_u64).collect();
    regs.push(read_u64(constants::ARM64_SP_INDEX));
    regs.push(read_u64(constants::ARM64_PC_INDEX));
    regs.push(u64::from(state_words.get(constants::ARM64_CPSR_INDEX).copied().unwrap_or(0)));
    regs
}

/// Copy NEON state words into a `user_fpsimd_state` image.
pub fn fpsimd_image(words: &[natural_t]) -> Vec<u8>
{
    let mut image: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).take(NEON_DATA_SIZE).collect();
    image.resize(FPSIMD_SIZE, 0);
    image
}

fn fetch_neon_state(thread: thread_act_t, tid: ThreadId) -> Option<Vec<u8>>
{
    let mut words = [0 as natural_t; constants::ARM_NEON_STATE64_COUNT as usize];
    let mut count = constants::ARM_NEON_STATE64_COUNT;
    let kr = unsafe { ffi::thread_get_state(thread, constants::ARM_NEON_STATE64, words.as_mut_ptr(), &mut count) };

    if kr == KERN_SUCCESS {
        Some(fpsimd_image(&words[..count as usize]))
    } else if kr == KERN_INVALID_ARGUMENT {
        debug!("ARM NEON state not available on this system");
        None
    } else {
        warn!("Thread {tid}: thread_get_state(ARM_NEON_STATE64) failed: {kr}");
        None
    }
}
