//! Process, thread, and architecture types.

use std::fmt;

use object::elf;

use crate::error::{DumpError, Result};

/// Process identifier (PID)
///
/// ## Example
///
/// ```rust
/// use createdump_core::types::ProcessId;
///
/// let pid = ProcessId::from(12345);
/// assert_eq!(u32::from(pid), 12345);
/// assert_eq!(pid.to_string(), "12345");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// - **Linux**: the kernel TID (as listed under `/proc/<pid>/task`)
/// - **macOS**: the system-wide thread id from `THREAD_IDENTIFIER_INFO`
///
/// Core-file notes only have room for 32 bits; see [`ThreadId::as_note_pid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    pub fn raw(&self) -> u64
    {
        self.0
    }

    /// The id as written into `pr_pid` of a status note.
    pub fn as_note_pid(&self) -> u32
    {
        // macOS thread ids exceed 32 bits; keep the low half like lldb does.
        (self.0 & 0xffff_ffff) as u32
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// CPU architecture of the dump target
///
/// The architecture decides the ELF machine type and the layout of the
/// general-purpose register block inside `NT_PRSTATUS`:
///
/// - **X86_64**: `struct user_regs_struct`, 27 registers, `rip` at 16, `rsp` at 19
/// - **Arm64**: `struct user_pt_regs`, `x0..x30`, `sp`, `pc`, `pstate`
///
/// ## References
///
/// - [Linux x86 `user_regs_struct`](https://elixir.bootlin.com/linux/latest/source/arch/x86/include/asm/user_64.h)
/// - [Linux arm64 `user_pt_regs`](https://elixir.bootlin.com/linux/latest/source/arch/arm64/include/uapi/asm/ptrace.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit ARM
    Arm64,
    /// 64-bit x86 (Intel/AMD)
    X86_64,
    /// Any other architecture; dumps cannot be written for it
    Unknown(&'static str),
}

impl Architecture
{
    /// Get the architecture of the running binary
    ///
    /// Targets are always dumped by a collector built for the same
    /// architecture, so this is also the target's architecture.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use createdump_core::types::Architecture;
    ///
    /// let arch = Architecture::current();
    /// // On Apple Silicon or arm64 Linux: Architecture::Arm64
    /// // On Intel/AMD: Architecture::X86_64
    /// ```
    pub const fn current() -> Self
    {
        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Arm64
        }

        #[cfg(target_arch = "x86_64")]
        {
            Architecture::X86_64
        }

        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
        {
            Architecture::Unknown(std::env::consts::ARCH)
        }
    }

    /// Size of a pointer in bytes for this architecture.
    #[must_use]
    pub const fn pointer_size_bytes(self) -> u8
    {
        match self {
            Architecture::Arm64 | Architecture::X86_64 => 8,
            Architecture::Unknown(_) => 8,
        }
    }

    /// `e_machine` value for the core file header.
    ///
    /// ## Errors
    ///
    /// - `UnsupportedArchitecture`: no core-file layout is known
    pub fn elf_machine(self) -> Result<u16>
    {
        match self {
            Architecture::X86_64 => Ok(elf::EM_X86_64),
            Architecture::Arm64 => Ok(elf::EM_AARCH64),
            Architecture::Unknown(name) => Err(DumpError::UnsupportedArchitecture(name.to_string())),
        }
    }

    /// Number of 64-bit slots in the general-purpose register block.
    pub const fn general_register_count(self) -> usize
    {
        match self {
            Architecture::X86_64 => 27,
            Architecture::Arm64 => 34,
            Architecture::Unknown(_) => 0,
        }
    }

    /// Index of the program counter within the register block.
    pub const fn pc_index(self) -> Option<usize>
    {
        match self {
            Architecture::X86_64 => Some(16),
            Architecture::Arm64 => Some(32),
            Architecture::Unknown(_) => None,
        }
    }

    /// Index of the stack pointer within the register block.
    pub const fn sp_index(self) -> Option<usize>
    {
        match self {
            Architecture::X86_64 => Some(19),
            Architecture::Arm64 => Some(31),
            Architecture::Unknown(_) => None,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::Arm64 => write!(f, "arm64"),
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Unknown(name) => write!(f, "{name}"),
        }
    }
}
