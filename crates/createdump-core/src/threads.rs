//! # Thread Snapshots
//!
//! Register state captured from one suspended thread.
//!
//! The general-purpose block is always stored in the order the Linux kernel
//! uses for `elf_gregset_t`, whatever platform it came from, because that is
//! what `NT_PRSTATUS` carries and what post-mortem debuggers expect. The Mach
//! variant converts its thread states into this order when it captures them.

use crate::types::{Architecture, ThreadId};

/// Extra register note for a thread (x86 `XSAVE` area, arm64 extensions)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRegisters
{
    /// ELF note type (e.g. `NT_X86_XSTATE`)
    pub note_type: u32,
    /// Raw note payload
    pub data: Vec<u8>,
}

/// Register state of one thread, immutable once captured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot
{
    /// Thread id
    pub tid: ThreadId,
    /// Thread-group (process) id
    pub tgid: u32,
    /// Parent process id
    pub ppid: u32,
    /// Architecture the register block is laid out for
    pub architecture: Architecture,
    /// General-purpose registers in `elf_gregset_t` order
    pub registers: Vec<u64>,
    /// Floating-point state (`NT_PRFPREG` payload); absent when the kernel did not provide it
    pub fp_registers: Option<Vec<u8>>,
    /// Platform-specific extended blocks
    pub extended: Vec<ExtendedRegisters>,
}

impl ThreadSnapshot
{
    /// Snapshot with only general-purpose registers.
    ///
    /// The register block is padded or truncated to the architecture's
    /// `elf_gregset_t` length.
    pub fn new(tid: ThreadId, architecture: Architecture, mut registers: Vec<u64>) -> Self
    {
        registers.resize(architecture.general_register_count(), 0);
        Self {
            tid,
            tgid: 0,
            ppid: 0,
            architecture,
            registers,
            fp_registers: None,
            extended: Vec::new(),
        }
    }

    /// Program counter, if the architecture is known.
    pub fn instruction_pointer(&self) -> Option<u64>
    {
        self.architecture.pc_index().and_then(|index| self.registers.get(index).copied())
    }

    /// Stack pointer, if the architecture is known.
    pub fn stack_pointer(&self) -> Option<u64>
    {
        self.architecture.sp_index().and_then(|index| self.registers.get(index).copied())
    }

    /// General registers as little-endian bytes, the layout of `pr_reg`.
    pub fn register_bytes(&self) -> Vec<u8>
    {
        self.registers.iter().flat_map(|value| value.to_le_bytes()).collect()
    }

    /// Rebuild the register block from little-endian bytes.
    ///
    /// Used when registers come from a companion data target instead of
    /// the kernel. Missing trailing registers read as zero.
    pub fn registers_from_bytes(bytes: &[u8]) -> Vec<u64>
    {
        bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_x86_64_pointer_slots()
    {
        let mut regs = vec![0u64; 27];
        regs[16] = 0x0040_1000;
        regs[19] = 0x7ffc_0000_1000;
        let snapshot = ThreadSnapshot::new(ThreadId(7), Architecture::X86_64, regs);
        assert_eq!(snapshot.instruction_pointer(), Some(0x0040_1000));
        assert_eq!(snapshot.stack_pointer(), Some(0x7ffc_0000_1000));
    }

    #[test]
    fn test_companion_context_bytes_decode_in_order()
    {
        let mut bytes = 0x1122_3344_5566_7788u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff; 4]);
        assert_eq!(ThreadSnapshot::registers_from_bytes(&bytes), vec![0x1122_3344_5566_7788]);
    }

    #[test]
    fn test_register_block_is_sized_for_architecture()
    {
        let snapshot = ThreadSnapshot::new(ThreadId(1), Architecture::Arm64, vec![1, 2, 3]);
        assert_eq!(snapshot.registers.len(), 34);
        assert_eq!(snapshot.register_bytes().len(), 34 * 8);
    }
}
