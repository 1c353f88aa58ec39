//! # createdump-core
//!
//! Writes consistent ELF core dumps of live .NET processes.
//!
//! This crate provides the dump pipeline behind the `createdump` tool:
//! - Suspending every thread of the target and capturing its registers
//! - Discovering the address space and the images the loader has mapped
//! - Asking the runtime's data access component which memory matters
//! - Serializing the result as an ELF core file with the usual notes
//!
//! ## Platform Support
//!
//! - **Linux**: `ptrace` for suspension and registers, procfs for memory and maps
//! - **macOS**: Mach APIs (`task_for_pid`, `thread_get_state`, etc.); the dump
//!   is still an ELF core so the same tools can read it
//!
//! ## Why unsafe code is needed
//!
//! This crate requires `unsafe` code because we're calling low-level system APIs
//! that interact directly with the kernel. These APIs are inherently unsafe
//! because they can:
//! - Access memory of other processes
//! - Stop and resume other processes' threads
//! - Call into a dynamically loaded data access library
//!
//! We wrap these unsafe calls in safe abstractions, but the underlying system
//! calls themselves must be `unsafe`.

#![allow(unsafe_code)] // Required for low-level system APIs (Mach, ptrace, dlopen)

pub mod config;
pub mod crash_info;
pub mod dac;
pub mod dump;
pub mod elf;
pub mod error;
pub mod identity;
pub mod maps;
pub mod platform;
pub mod regions;
pub mod target;
pub mod threads;
pub mod types;

// Re-export commonly used types
pub use config::{DumpConfig, DumpKind};
pub use crash_info::{CrashInfo, DumpSummary};
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use dump::{create_companion_dump, create_dump};
pub use dump::create_dump_with;
pub use error::{DumpError, ErrorCategory, Result};
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use platform::NativeTarget;
pub use regions::{MemoryRegion, Permissions, RegionSet};
pub use target::{DumpTarget, ProcessMemory};
pub use types::{Architecture, ProcessId, ThreadId};
