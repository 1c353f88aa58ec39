//! Tests for error messages and categories

use createdump_core::error::{DumpError, ErrorCategory, Result};
#[cfg(target_os = "macos")]
use createdump_core::platform::macos::error::MachError;
use createdump_core::types::ThreadId;

#[cfg(target_os = "macos")]
#[test]
fn test_mach_error_protection_failure()
{
    let error = MachError::ProtectionFailure;
    let message = format!("{}", error);
    assert!(message.contains("Permission denied"));
}

#[cfg(target_os = "macos")]
#[test]
fn test_mach_error_unknown()
{
    let error = MachError::Unknown(999);
    let message = format!("{}", error);
    assert!(message.contains("999"));
}

#[cfg(target_os = "macos")]
#[test]
fn test_mach_error_to_dump_error()
{
    let dump_err: DumpError = MachError::ProtectionFailure.into();

    match dump_err {
        DumpError::MachError(_) => assert_eq!(dump_err.category(), ErrorCategory::TargetUnavailable),
        _ => panic!("Expected MachError variant"),
    }
}

#[test]
fn test_process_not_found_display()
{
    let error = DumpError::ProcessNotFound(12345);
    let message = format!("{}", error);
    assert!(message.contains("12345"));
    assert!(message.contains("not found"));
}

#[test]
fn test_memory_read_failed_display()
{
    let error = DumpError::MemoryReadFailed {
        address: 0x7f00_dead_b000,
        size: 4096,
        details: "Input/output error".to_string(),
    };
    let message = format!("{}", error);
    assert!(message.contains("0x00007f00deadb000"));
    assert!(message.contains("4096"));
}

#[test]
fn test_target_unavailable_category()
{
    for error in [
        DumpError::ProcessNotFound(1),
        DumpError::PermissionDenied("ptrace_scope".to_string()),
        DumpError::AttachFailed("thread exited".to_string()),
        DumpError::SuspendFailed("no threads".to_string()),
    ] {
        assert_eq!(error.category(), ErrorCategory::TargetUnavailable, "{error}");
    }
}

#[test]
fn test_module_list_race_is_a_timeout()
{
    assert_eq!(DumpError::ModuleListChanged.category(), ErrorCategory::Timeout);
    assert_eq!(DumpError::Timeout("link_map walk".to_string()).category(), ErrorCategory::Timeout);
}

#[test]
fn test_missing_dac_category()
{
    let error = DumpError::DacMissing("libmscordaccore.so".to_string());
    assert_eq!(error.category(), ErrorCategory::DebugComponentMissing);
    assert_eq!(error.category().to_string(), "debug component missing");
    // A component that loads but fails is not "missing"
    assert_ne!(DumpError::DacFailed("E_FAIL".to_string()).category(), ErrorCategory::DebugComponentMissing);
}

#[test]
fn test_io_errors_convert()
{
    let io = std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full");
    let error: DumpError = io.into();
    assert!(matches!(error, DumpError::Io(_)));
    assert_eq!(error.category(), ErrorCategory::Io);
}

#[test]
fn test_register_error_names_operation()
{
    let error = DumpError::ReadRegistersFailed {
        operation: "PTRACE_GETREGSET(NT_PRSTATUS)".to_string(),
        thread_id: Some(ThreadId(77)),
        details: "No such process".to_string(),
    };
    assert!(format!("{}", error).contains("NT_PRSTATUS"));
}

#[test]
fn test_result_type()
{
    // Test that Result type is properly aliased
    let _result: Result<()> = Ok(());
    let _error_result: Result<()> = Err(DumpError::ProcessNotFound(12345));
}
