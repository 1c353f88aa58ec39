//! # x86-64 Register Capture
//!
//! ## Thread State Structure
//!
//! macOS stores x86-64 thread state as a C structure with 42 `u32` values:
//! `rax rbx rcx rdx rdi rsi rbp rsp r8-r15 rip rflags cs fs gs`.
//!
//! Linux's `user_regs_struct` holds 27 slots in a different order:
//! `r15 r14 r13 r12 rbp rbx r11 r10 r9 r8 rax rcx rdx rsi rdi orig_rax rip
//! cs eflags rsp ss fs_base gs_base ds es fs gs`.
//!
//! The floating-point state is an `FXSAVE` image behind 8 reserved bytes,
//! the same 512-byte image Linux stores in `NT_PRFPREG`.

use libc::{natural_t, thread_act_t};
use mach2::kern_return::{KERN_INVALID_ARGUMENT, KERN_SUCCESS};
use tracing::{debug, warn};

use crate::error::{DumpError, Result};
use crate::platform::macos::{constants, ffi};
use crate::threads::ThreadSnapshot;
use crate::types::{Architecture, ThreadId};

/// Size of the `FXSAVE` image in `NT_PRFPREG`
const FXSAVE_SIZE: usize = 512;

/// `orig_rax` for a thread that is not in a system call
const NO_SYSCALL: u64 = u64::MAX;

/// x86-64 thread state structure matching macOS `x86_thread_state64_t`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct X86ThreadState64
{
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

/// Capture the general-purpose and floating-point registers of `thread`.
///
/// ## Errors
///
/// - `ReadRegistersFailed`: `thread_get_state(X86_THREAD_STATE64)` failed
pub fn capture_thread(thread: thread_act_t, tid: ThreadId) -> Result<ThreadSnapshot>
{
    let mut state = X86ThreadState64::default();
    let mut count = constants::X86_THREAD_STATE64_COUNT;
    let result = unsafe {
        ffi::thread_get_state(
            thread,
            constants::X86_THREAD_STATE64,
            &mut state as *mut _ as *mut natural_t,
            &mut count,
        )
    };
    if result != KERN_SUCCESS {
        return Err(DumpError::ReadRegistersFailed {
            operation: "read x86-64 thread state".to_string(),
            thread_id: Some(tid),
            details: format!("thread_get_state failed: {}", result),
        });
    }

    let mut snapshot = ThreadSnapshot::new(tid, Architecture::X86_64, linux_registers(&state));
    snapshot.fp_registers = fetch_float_state(thread, tid);
    Ok(snapshot)
}

/// Reorder a Mach thread state into `user_regs_struct`.
pub fn linux_registers(state: &X86ThreadState64) -> Vec<u64>
{
    vec![
        state.r15,
        state.r14,
        state.r13,
        state.r12,
        state.rbp,
        state.rbx,
        state.r11,
        state.r10,
        state.r9,
        state.r8,
        state.rax,
        state.rcx,
        state.rdx,
        state.rsi,
        state.rdi,
        NO_SYSCALL,
        state.rip,
        state.cs,
        state.rflags,
        state.rsp,
        0, // ss
        0, // fs_base
        0, // gs_base
        0, // ds
        0, // es
        state.fs,
        state.gs,
    ]
}

/// Extract the `FXSAVE` image from raw `x86_float_state64_t` words.
pub fn fxsave_image(words: &[natural_t]) -> Vec<u8>
{
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    let start = constants::X86_FLOAT_STATE64_FXSAVE_OFFSET.min(bytes.len());
    let mut image = bytes[start..].to_vec();
    image.resize(FXSAVE_SIZE, 0);
    image
}

fn fetch_float_state(thread: thread_act_t, tid: ThreadId) -> Option<Vec<u8>>
{
    let mut words = [0 as natural_t; constants::X86_FLOAT_STATE64_COUNT as usize];
    let mut count = constants::X86_FLOAT_STATE64_COUNT;
    let kr = unsafe { ffi::thread_get_state(thread, constants::X86_FLOAT_STATE64, words.as_mut_ptr(), &mut count) };

    if kr == KERN_SUCCESS {
        Some(fxsave_image(&words[..count as usize]))
    } else if kr == KERN_INVALID_ARGUMENT {
        debug!("x86 FLOAT state not available on this system");
        None
    } else {
        warn!("Thread {tid}: thread_get_state(x86_FLOAT_STATE64) failed: {kr}");
        None
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_linux_order()
    {
        let state = X86ThreadState64 {
            rax: 1,
            r15: 15,
            rip: 0x1000,
            rsp: 0x7000,
            rflags: 0x246,
            ..Default::default()
        };
        let regs = linux_registers(&state);
        assert_eq!(regs.len(), Architecture::X86_64.general_register_count());
        assert_eq!(regs[0], 15);
        assert_eq!(regs[10], 1);
        assert_eq!(regs[16], 0x1000);
        assert_eq!(regs[18], 0x246);
        assert_eq!(regs[19], 0x7000);
    }

    #[test]
    fn test_fxsave_skips_reserved_words()
    {
        let mut words = vec![0 as natural_t; constants::X86_FLOAT_STATE64_COUNT as usize];
        words[2] = 0x037f; // fcw
        let image = fxsave_image(&words);
        assert_eq!(image.len(), FXSAVE_SIZE);
        assert_eq!(&image[..2], &[0x7f, 0x03]);
    }
}
