//! # macOS Mach API Errors
//!
//! Error types for macOS Mach API operations.
//!
//! Mach APIs return `kern_return_t` values, which are integer error codes.
//! This module converts those codes into Rust error types with descriptive
//! messages; [`DumpError`](crate::error::DumpError) wraps them.

use thiserror::Error;

/// Not exported by `libc`
const KERN_TERMINATED: libc::kern_return_t = 37;

/// Mach kernel API error
///
/// Mach APIs return `kern_return_t` values. Common values:
///
/// - `KERN_SUCCESS` (0): Operation succeeded
/// - `KERN_PROTECTION_FAILURE` (5): Permission denied
/// - `KERN_INVALID_ARGUMENT` (4): Invalid argument
/// - `KERN_FAILURE` (14): General failure (often means process not found)
///
/// ## Why convert to an enum?
///
/// - **Type safety**: Can match on specific error types
/// - **Better error messages**: Descriptive strings instead of numbers
/// - **Error chaining**: Converts into `DumpError::MachError` with `?`
///
/// ## References
///
/// - [kern_return_t documentation](https://developer.apple.com/documentation/kernel/kern_return_t)
#[derive(Error, Debug)]
pub enum MachError
{
    /// `KERN_PROTECTION_FAILURE` (error code 5)
    ///
    /// This means the operation was blocked by macOS's security system.
    /// Common causes:
    /// - `task_for_pid()` requires special permissions
    /// - Need to run with `sudo` or grant debugging entitlements
    /// - System Integrity Protection (SIP) is blocking the operation
    ///
    /// See: [macOS Debugging Entitlements](https://developer.apple.com/documentation/bundleresources/entitlements/com.apple.security.cs.debugger)
    #[error("KERN_PROTECTION_FAILURE: Permission denied")]
    ProtectionFailure,

    /// `KERN_INVALID_ARGUMENT` (error code 4)
    ///
    /// One of the arguments passed to the Mach API was invalid.
    /// Examples:
    /// - Invalid PID (process doesn't exist)
    /// - Invalid thread state flavor or buffer count
    /// - Invalid memory address
    #[error("KERN_INVALID_ARGUMENT: Invalid PID or argument")]
    InvalidArgument,

    /// `KERN_FAILURE` (error code 14)
    ///
    /// A general failure occurred. Can mean:
    /// - Process not found (if process doesn't exist)
    /// - Permission denied (macOS quirk: sometimes returns KERN_FAILURE instead of KERN_PROTECTION_FAILURE)
    /// - Thread has exited
    /// - Task port is invalid
    ///
    /// **Note**: `MacOSTarget::attach()` checks if the process exists when it receives
    /// `KERN_FAILURE`. If the process exists, it reports `PermissionDenied` instead.
    #[error("KERN_FAILURE: Process not found")]
    ProcessNotFound,

    /// `KERN_INVALID_ADDRESS` (error code 1)
    ///
    /// A memory operation touched an unmapped address, or a region walk ran
    /// past the end of the address space.
    #[error("KERN_INVALID_ADDRESS: Address not mapped")]
    InvalidAddress,

    /// `KERN_TERMINATED` (error code 37)
    ///
    /// The task or thread exited while we were working with it.
    #[error("KERN_TERMINATED: Task or thread has exited")]
    Terminated,

    /// Unknown Mach error code
    ///
    /// We received an error code we don't recognize. This could be:
    /// - A new error code in a newer macOS version
    /// - An error code specific to a particular operation
    /// - A corrupted return value
    ///
    /// The integer value is preserved so you can look it up.
    #[error("Unknown Mach error: {0}")]
    Unknown(i32),
}

/// Convert a `kern_return_t` to a `MachError`
///
/// ```rust
/// use createdump_core::platform::macos::error::MachError;
///
/// assert!(matches!(MachError::from(libc::KERN_PROTECTION_FAILURE), MachError::ProtectionFailure));
/// assert!(matches!(MachError::from(9999), MachError::Unknown(9999)));
/// ```
///
impl From<libc::kern_return_t> for MachError
{
    fn from(code: libc::kern_return_t) -> Self
    {
        match code {
            libc::KERN_PROTECTION_FAILURE => MachError::ProtectionFailure,
            libc::KERN_INVALID_ARGUMENT => MachError::InvalidArgument,
            libc::KERN_FAILURE => MachError::ProcessNotFound,
            libc::KERN_INVALID_ADDRESS => MachError::InvalidAddress,
            KERN_TERMINATED => MachError::Terminated,
            _ => MachError::Unknown(code),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_known_codes()
    {
        assert!(matches!(MachError::from(libc::KERN_INVALID_ARGUMENT), MachError::InvalidArgument));
        assert!(matches!(MachError::from(libc::KERN_FAILURE), MachError::ProcessNotFound));
        assert!(matches!(MachError::from(libc::KERN_INVALID_ADDRESS), MachError::InvalidAddress));
        assert!(matches!(MachError::from(KERN_TERMINATED), MachError::Terminated));
    }

    #[test]
    fn test_unknown_code_keeps_value()
    {
        let err = MachError::from(-308);
        assert_eq!(err.to_string(), "Unknown Mach error: -308");
    }
}
