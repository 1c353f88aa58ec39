//! Integration tests for the macOS dump target
//!
//! These tests require:
//! - Running on macOS (`#[cfg(target_os = "macos")]`)
//! - Special permissions (sudo or debugging entitlements) for anything past
//!   `task_for_pid()`
//!
//! Tests skip themselves when permissions are not available.

#![cfg(target_os = "macos")]

use std::process::{Child, Command};

use createdump_core::error::DumpError;
use createdump_core::platform::macos::MacOSTarget;
use createdump_core::target::{DumpTarget, ProcessMemory};
use createdump_core::types::ProcessId;

struct Sleeper(Child);

impl Drop for Sleeper
{
    fn drop(&mut self)
    {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn attach_or_skip(pid: ProcessId) -> Option<MacOSTarget>
{
    match MacOSTarget::attach(pid) {
        Ok(target) => Some(target),
        Err(DumpError::PermissionDenied(_)) | Err(DumpError::MachError(_)) => {
            eprintln!("skipping: task_for_pid() not permitted");
            None
        }
        Err(e) => panic!("attach failed: {e}"),
    }
}

#[test]
fn test_attach_invalid_pid()
{
    // Test attaching to a non-existent process
    let result = MacOSTarget::attach(ProcessId::from(u32::MAX >> 1));
    assert!(result.is_err());
}

#[test]
fn test_suspend_capture_and_maps()
{
    let child = Sleeper(Command::new("sleep").arg("30").spawn().expect("spawn sleep"));
    let Some(mut target) = attach_or_skip(ProcessId(child.0.id())) else {
        return;
    };

    let tids = target.suspend_threads().unwrap();
    assert!(!tids.is_empty());

    let snapshot = target.capture_registers(tids[0]).unwrap();
    let sp = snapshot.stack_pointer().unwrap();
    assert!(target.is_readable(sp), "stack pointer points at readable memory");

    let identity = target.identity().unwrap();
    assert_eq!(identity.name, "sleep");
    assert_eq!(identity.arguments, "sleep 30");

    let maps = target.discover_maps(&identity).unwrap();
    assert!(maps.modules.iter().any(|m| m.file_name.as_deref() == Some("/usr/lib/dyld")));
    assert!(!maps.image_headers.is_empty());

    target.resume_threads();
}
