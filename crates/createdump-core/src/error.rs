//! # Error Types
//!
//! Every fallible operation in the dump pipeline returns [`DumpError`].
//!
//! We use `thiserror` to generate the `Error` trait implementations and the
//! user-visible messages. [`DumpError::category`] folds the variants into the
//! coarse taxonomy the command line reports.

use std::fmt;

use thiserror::Error;

use crate::types::ThreadId;

/// Main error type for dump operations
///
/// ## Error Categories
///
/// 1. **Target unavailable**: ProcessNotFound, PermissionDenied, AttachFailed, SuspendFailed
/// 2. **Timeout**: a transient module-list race that never settled
/// 3. **Debug component missing**: DacMissing
/// 4. **I/O**: Io, MemoryReadFailed
/// 5. **Internal**: everything else
///
/// Register sets that a kernel does not provide are not errors at all; they
/// are recorded as absent on the thread snapshot.
#[derive(Error, Debug)]
pub enum DumpError
{
    /// The process with the given PID doesn't exist or has exited
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// Insufficient permissions to inspect the target process
    ///
    /// On Linux this is `EPERM` from `PTRACE_ATTACH` (see `/proc/sys/kernel/yama/ptrace_scope`).
    /// On macOS, `task_for_pid()` returned `KERN_PROTECTION_FAILURE` or the
    /// process exists but `KERN_FAILURE` was reported.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid argument passed to a dump function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failed to attach to one of the target's threads
    #[error("Failed to attach to process: {0}")]
    AttachFailed(String),

    /// Failed to suspend a thread of the target
    ///
    /// Dropping a thread from the snapshot would make it inconsistent, so this
    /// is always fatal.
    #[error("Failed to suspend process: {0}")]
    SuspendFailed(String),

    /// Failed to resume a thread of the target
    #[error("Failed to resume process: {0}")]
    ResumeFailed(String),

    /// Failed to read registers from a suspended thread
    #[error("Failed to read registers: {operation}")]
    ReadRegistersFailed
    {
        /// Description of the operation that failed
        operation: String,
        /// Thread ID if the operation was thread-specific
        thread_id: Option<ThreadId>,
        /// Additional error details
        details: String,
    },

    /// Target memory could not be read
    #[error("Failed to read {size} bytes at 0x{address:016x}: {details}")]
    MemoryReadFailed
    {
        /// First address of the failed read
        address: u64,
        /// Requested length
        size: usize,
        /// Additional error details
        details: String,
    },

    /// The live module list changed while it was being walked
    ///
    /// Only produced inside the module enumeration retry loop; callers see
    /// [`DumpError::Timeout`] once the attempts are exhausted.
    #[error("Module list changed during enumeration")]
    ModuleListChanged,

    /// A bounded retry loop gave up
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The data access component could not be located or resolved
    #[error("Debug component missing: {0}")]
    DacMissing(String),

    /// The data access component was loaded but reported a failure
    #[error("Debug component failed: {0}")]
    DacFailed(String),

    /// The target architecture has no core-file register layout
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// macOS-specific Mach API error
    ///
    /// See: [Mach Kernel Return Codes](https://developer.apple.com/documentation/kernel/kern_return_t)
    #[cfg(target_os = "macos")]
    #[error("Mach API error: {0}")]
    MachError(#[from] crate::platform::macos::error::MachError),

    /// I/O error (dump file, procfs)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`DumpError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory
{
    /// The process is gone or may not be inspected
    TargetUnavailable,
    /// A transient race never settled
    Timeout,
    /// The data access component is missing
    DebugComponentMissing,
    /// Reading the target or writing the dump failed
    Io,
    /// Anything else
    Internal,
}

impl fmt::Display for ErrorCategory
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let text = match self {
            ErrorCategory::TargetUnavailable => "target unavailable",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::DebugComponentMissing => "debug component missing",
            ErrorCategory::Io => "i/o",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(text)
    }
}

impl DumpError
{
    /// Classify this error.
    ///
    /// ```rust
    /// use createdump_core::error::{DumpError, ErrorCategory};
    ///
    /// let err = DumpError::DacMissing("libmscordaccore.so".to_string());
    /// assert_eq!(err.category(), ErrorCategory::DebugComponentMissing);
    /// ```
    pub fn category(&self) -> ErrorCategory
    {
        match self {
            DumpError::ProcessNotFound(_)
            | DumpError::PermissionDenied(_)
            | DumpError::AttachFailed(_)
            | DumpError::SuspendFailed(_) => ErrorCategory::TargetUnavailable,
            DumpError::Timeout(_) | DumpError::ModuleListChanged => ErrorCategory::Timeout,
            DumpError::DacMissing(_) => ErrorCategory::DebugComponentMissing,
            DumpError::Io(_) | DumpError::MemoryReadFailed { .. } => ErrorCategory::Io,
            #[cfg(target_os = "macos")]
            DumpError::MachError(_) => ErrorCategory::TargetUnavailable,
            DumpError::InvalidArgument(_)
            | DumpError::ResumeFailed(_)
            | DumpError::ReadRegistersFailed { .. }
            | DumpError::DacFailed(_)
            | DumpError::UnsupportedArchitecture(_) => ErrorCategory::Internal,
        }
    }
}

/// Convenience type alias for `Result<T, DumpError>`
///
/// ```rust
/// use createdump_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, DumpError>;
