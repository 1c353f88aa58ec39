//! # Types
//!
//! Platform-agnostic identifiers used throughout the dump pipeline.
//!
//! These types abstract away platform-specific details, so the orchestrator
//! and the ELF writer can talk about "a thread" or "the architecture" without
//! knowing whether the target was reached through ptrace or Mach.

pub mod process;

// Re-export all public types
pub use process::{Architecture, ProcessId, ThreadId};
