//! # Platform-Specific Implementations
//!
//! Each platform has its own submodule that implements
//! [`DumpTarget`](crate::target::DumpTarget) on top of that platform's
//! native process-control APIs:
//!
//! - **Linux**: `ptrace` for suspension and registers, procfs for everything else
//!   - See: [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - **macOS**: Mach task and thread ports (`task_for_pid`, `thread_get_state`, etc.)
//!   - See: [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//!
//! Only the module for the host is compiled. [`NativeTarget`] names the
//! host's target type and [`attach`] opens one for a dump.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::config::DumpConfig;
#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::dac::DataTarget;
#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::error::{DumpError, Result};

/// Dump target for the host operating system
#[cfg(target_os = "linux")]
pub type NativeTarget = linux::LinuxTarget;

/// Dump target for the host operating system
#[cfg(target_os = "macos")]
pub type NativeTarget = macos::MacOSTarget;

/// Open the process named by `config` for dumping.
///
/// With `config.companion_attached`, `companion` is the data target of the
/// debugger that already controls the process; the target then never
/// suspends anything itself and reads registers and memory through it.
///
/// Nothing is suspended yet; that happens when the orchestrator asks for it.
///
/// ## Errors
///
/// - `ProcessNotFound`: no such process
/// - `PermissionDenied`: the process may not be inspected
/// - `InvalidArgument`: `companion_attached` and `companion` disagree, or
///   companion mode was requested on macOS
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn attach(config: &DumpConfig, companion: Option<Box<dyn DataTarget>>) -> Result<NativeTarget>
{
    match (config.companion_attached, companion) {
        (false, None) => NativeTarget::attach(config.pid),
        (true, Some(companion)) => attach_companion(config, companion),
        (true, None) => Err(DumpError::InvalidArgument(
            "companion mode needs the companion's data target".to_string(),
        )),
        (false, Some(_)) => Err(DumpError::InvalidArgument(
            "a companion data target was given but companion mode is off".to_string(),
        )),
    }
}

#[cfg(target_os = "linux")]
fn attach_companion(config: &DumpConfig, companion: Box<dyn DataTarget>) -> Result<NativeTarget>
{
    linux::LinuxTarget::with_companion(config.pid, companion)
}

#[cfg(target_os = "macos")]
fn attach_companion(_config: &DumpConfig, _companion: Box<dyn DataTarget>) -> Result<NativeTarget>
{
    Err(DumpError::InvalidArgument(
        "companion mode is only available with ptrace".to_string(),
    ))
}

#[cfg(all(test, target_os = "linux"))]
mod tests
{
    use super::*;
    use crate::target::DumpTarget;
    use crate::types::{ProcessId, ThreadId};

    struct Silent;

    impl DataTarget for Silent
    {
        fn read_virtual(&self, _address: u64, _buffer: &mut [u8]) -> Result<usize>
        {
            Ok(0)
        }

        fn thread_context(&self, _tid: ThreadId) -> Result<Vec<u8>>
        {
            Ok(Vec::new())
        }

        fn image_base(&self, _name: &str) -> Option<u64>
        {
            None
        }

        fn machine_type(&self) -> u16
        {
            0
        }

        fn pointer_size(&self) -> u32
        {
            8
        }
    }

    fn own_config() -> DumpConfig
    {
        DumpConfig::new(ProcessId(std::process::id()))
    }

    #[test]
    fn test_companion_flag_needs_a_data_target()
    {
        let mut config = own_config();
        config.companion_attached = true;
        assert!(matches!(attach(&config, None), Err(DumpError::InvalidArgument(_))));
        assert!(matches!(attach(&own_config(), Some(Box::new(Silent))), Err(DumpError::InvalidArgument(_))));
    }

    #[test]
    fn test_companion_mode_attaches_nothing()
    {
        let mut config = own_config();
        config.companion_attached = true;
        let mut target = attach(&config, Some(Box::new(Silent))).unwrap();

        let threads = target.suspend_threads().unwrap();
        assert!(!threads.is_empty());
        assert!(target.attached_threads().is_empty());
    }
}
