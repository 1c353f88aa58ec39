//! # Dump Configuration
//!
//! Everything a dump operation needs to know, built once by the caller and
//! passed down explicitly. There is no process-wide state.

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{ProcessId, ThreadId};

/// Minidump flag: data segments of loaded modules
pub const MINIDUMP_WITH_DATA_SEGS: u32 = 0x0000_0001;
/// Minidump flag: all accessible memory
pub const MINIDUMP_WITH_FULL_MEMORY: u32 = 0x0000_0002;
/// Minidump flag: handle data
pub const MINIDUMP_WITH_HANDLE_DATA: u32 = 0x0000_0004;
/// Minidump flag: private read/write memory
pub const MINIDUMP_WITH_PRIVATE_READ_WRITE_MEMORY: u32 = 0x0000_0200;
/// Minidump flag: thread information
pub const MINIDUMP_WITH_THREAD_INFO: u32 = 0x0000_1000;
/// Minidump flag: triage filtering
pub const MINIDUMP_FILTER_TRIAGE: u32 = 0x0010_0000;

/// How much memory a dump includes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DumpKind
{
    /// Modules, thread stacks and whatever the data access component reports
    Normal,
    /// Normal plus private read/write memory
    #[default]
    WithHeap,
    /// Only what the data access component reports for triage
    Triage,
    /// Every readable mapping
    Full,
}

impl DumpKind
{
    /// Flag word handed to the data access component.
    ///
    /// ```rust
    /// use createdump_core::config::DumpKind;
    ///
    /// assert_eq!(DumpKind::Full.minidump_flags(), 0x1006);
    /// ```
    pub const fn minidump_flags(self) -> u32
    {
        match self {
            DumpKind::Normal => MINIDUMP_WITH_DATA_SEGS | MINIDUMP_WITH_HANDLE_DATA | MINIDUMP_WITH_THREAD_INFO,
            DumpKind::WithHeap => {
                MINIDUMP_WITH_DATA_SEGS
                    | MINIDUMP_WITH_HANDLE_DATA
                    | MINIDUMP_WITH_PRIVATE_READ_WRITE_MEMORY
                    | MINIDUMP_WITH_THREAD_INFO
            }
            DumpKind::Triage => MINIDUMP_FILTER_TRIAGE,
            DumpKind::Full => MINIDUMP_WITH_FULL_MEMORY | MINIDUMP_WITH_HANDLE_DATA | MINIDUMP_WITH_THREAD_INFO,
        }
    }

    /// Human-readable name used in progress messages.
    pub const fn description(self) -> &'static str
    {
        match self {
            DumpKind::Normal => "minidump",
            DumpKind::WithHeap => "minidump with heap",
            DumpKind::Triage => "triage minidump",
            DumpKind::Full => "full dump",
        }
    }
}

impl fmt::Display for DumpKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.description())
    }
}

/// Options for one dump operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpConfig
{
    /// Target process
    pub pid: ProcessId,
    /// Output path template; see [`format_dump_name`]
    pub name_template: Option<String>,
    /// What to include
    pub kind: DumpKind,
    /// Log every region written
    pub diagnostics: bool,
    /// Most verbose logging requested
    pub verbose: bool,
    /// Thread whose status note is written first
    pub crash_thread: Option<ThreadId>,
    /// Signal recorded for the crash thread
    pub signal: Option<i32>,
    /// Explicit data access component to load
    pub dac_path: Option<PathBuf>,
    /// An in-process debugger already controls the target; do not attach
    pub companion_attached: bool,
}

impl DumpConfig
{
    /// Defaults for `pid`: with-heap dump to the default location.
    pub fn new(pid: impl Into<ProcessId>) -> Self
    {
        Self {
            pid: pid.into(),
            name_template: None,
            kind: DumpKind::default(),
            diagnostics: false,
            verbose: false,
            crash_thread: None,
            signal: None,
            dac_path: None,
            companion_attached: false,
        }
    }

    /// Template in effect, falling back to `<temp dir>/coredump.%p`.
    pub fn template(&self) -> String
    {
        match &self.name_template {
            Some(template) => template.clone(),
            None => std::env::temp_dir().join("coredump.%p").to_string_lossy().into_owned(),
        }
    }
}

/// Expand a dump name template.
///
/// | token | replaced by                     |
/// |-------|---------------------------------|
/// | `%p`  | process id                      |
/// | `%d`  | process id                      |
/// | `%e`  | executable name                 |
/// | `%h`  | host name                       |
/// | `%t`  | seconds since the Unix epoch    |
/// | `%%`  | a literal `%`                   |
///
/// Unknown tokens are kept as written.
///
/// ## Example
///
/// ```rust
/// use createdump_core::config::format_dump_name;
/// use createdump_core::types::ProcessId;
///
/// let name = format_dump_name("/tmp/%e.%p.dmp", ProcessId(42), "dotnet");
/// assert_eq!(name, "/tmp/dotnet.42.dmp");
/// ```
pub fn format_dump_name(template: &str, pid: ProcessId, executable: &str) -> String
{
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('p') | Some('d') => out.push_str(&pid.to_string()),
            Some('e') => out.push_str(executable),
            Some('h') => out.push_str(&host_name()),
            Some('t') => {
                let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
                out.push_str(&secs.to_string());
            }
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn host_name() -> String
{
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for its full length and gethostname NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_flag_words()
    {
        assert_eq!(DumpKind::Normal.minidump_flags(), 0x1005);
        assert_eq!(DumpKind::WithHeap.minidump_flags(), 0x1205);
        assert_eq!(DumpKind::Triage.minidump_flags(), 0x0010_0000);
        assert_eq!(DumpKind::Full.minidump_flags(), 0x1006);
    }

    #[test]
    fn test_default_kind_is_with_heap()
    {
        assert_eq!(DumpConfig::new(1u32).kind, DumpKind::WithHeap);
    }

    #[test]
    fn test_template_tokens()
    {
        let name = format_dump_name("core.%p.%d.%e.100%%", ProcessId(7), "app");
        assert_eq!(name, "core.7.7.app.100%");
    }

    #[test]
    fn test_unknown_token_is_kept()
    {
        assert_eq!(format_dump_name("a%zb%", ProcessId(1), "x"), "a%zb%");
    }

    #[test]
    fn test_time_and_host_are_expanded()
    {
        let name = format_dump_name("%h-%t", ProcessId(1), "x");
        assert!(!name.contains('%'));
        let (_, secs) = name.rsplit_once('-').unwrap();
        assert!(secs.parse::<u64>().unwrap() > 1_600_000_000);
    }

    #[test]
    fn test_default_template_lives_in_temp_dir()
    {
        let template = DumpConfig::new(9u32).template();
        assert!(template.ends_with("coredump.%p"));
        assert!(template.starts_with(&*std::env::temp_dir().to_string_lossy()));
    }
}
