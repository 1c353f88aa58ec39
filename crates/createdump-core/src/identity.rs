//! # Process Identity
//!
//! Who the target is: ids, credentials, command name and the auxiliary
//! vector. Captured once, right after the threads are suspended, and written
//! into `NT_PRPSINFO` and `NT_AUXV`.
//!
//! The parsers here work on text and bytes only so they can be exercised on
//! any host; the Linux platform feeds them `/proc/<pid>/{stat,status,cmdline,auxv}`.
//!
//! ## References
//!
//! - [proc(5)](https://man7.org/linux/man-pages/man5/proc.5.html)
//! - [getauxval(3)](https://man7.org/linux/man-pages/man3/getauxval.3.html)

use crate::error::{DumpError, Result};
use crate::types::ProcessId;

/// End of the auxiliary vector
pub const AT_NULL: u64 = 0;
/// Address of the main program's program headers
pub const AT_PHDR: u64 = 3;
/// Number of main-program program headers
pub const AT_PHNUM: u64 = 5;
/// System page size
pub const AT_PAGESZ: u64 = 6;
/// Base of the vDSO ELF image
pub const AT_SYSINFO_EHDR: u64 = 33;

/// One auxiliary-vector entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxvEntry
{
    /// `a_type`
    pub key: u64,
    /// `a_un.a_val`
    pub value: u64,
}

/// Identity of the target process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessIdentity
{
    /// Process id
    pub pid: u32,
    /// Parent process id
    pub ppid: u32,
    /// Thread-group id
    pub tgid: u32,
    /// Process group
    pub pgrp: u32,
    /// Session id
    pub sid: u32,
    /// Real user id
    pub uid: u32,
    /// Real group id
    pub gid: u32,
    /// One-letter scheduler state (`R`, `S`, `T`, ...)
    pub state: u8,
    /// Nice value
    pub nice: i8,
    /// Command name, at most 15 bytes
    pub name: String,
    /// Space-joined argument list
    pub arguments: String,
    /// Parsed auxiliary vector (without the terminator)
    pub auxv: Vec<AuxvEntry>,
    /// `/proc/<pid>/auxv` as read, written verbatim into `NT_AUXV`
    pub raw_auxv: Vec<u8>,
}

impl ProcessIdentity
{
    /// Identity with only the pid known.
    pub fn new(pid: ProcessId) -> Self
    {
        Self {
            pid: pid.0,
            tgid: pid.0,
            ..Self::default()
        }
    }

    /// Value of an auxiliary-vector entry.
    pub fn auxv_value(&self, key: u64) -> Option<u64>
    {
        self.auxv.iter().find(|entry| entry.key == key).map(|entry| entry.value)
    }

    /// Apply the fields of a `/proc/<pid>/stat` line.
    ///
    /// The command name sits in parentheses and may itself contain spaces
    /// and parentheses, so the fields after it are located from the last
    /// closing parenthesis.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: the line is truncated or malformed
    pub fn apply_stat(&mut self, stat: &str) -> Result<()>
    {
        let malformed = || DumpError::InvalidArgument(format!("malformed stat line: {stat:?}"));

        let open = stat.find('(').ok_or_else(malformed)?;
        let close = stat.rfind(')').ok_or_else(malformed)?;
        if close < open {
            return Err(malformed());
        }
        self.name = truncate_name(&stat[open + 1..close]);

        // Fields after the command: state(3) ppid(4) pgrp(5) session(6) ... nice(19)
        let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
        let field = |number: usize| fields.get(number - 3).copied().ok_or_else(malformed);

        self.state = field(3)?.bytes().next().unwrap_or(b'R');
        self.ppid = field(4)?.parse().map_err(|_| malformed())?;
        self.pgrp = field(5)?.parse().map_err(|_| malformed())?;
        self.sid = field(6)?.parse().map_err(|_| malformed())?;
        self.nice = field(19)?.parse().map_err(|_| malformed())?;
        Ok(())
    }

    /// Apply `Tgid:`, `Uid:` and `Gid:` from `/proc/<pid>/status`.
    pub fn apply_status(&mut self, status: &str)
    {
        for line in status.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let first = rest.split_whitespace().next().and_then(|value| value.parse::<u32>().ok());
            match (key, first) {
                ("Tgid", Some(value)) => self.tgid = value,
                ("Uid", Some(value)) => self.uid = value,
                ("Gid", Some(value)) => self.gid = value,
                _ => {}
            }
        }
    }

    /// Apply the NUL-separated `/proc/<pid>/cmdline`.
    pub fn apply_cmdline(&mut self, cmdline: &[u8])
    {
        self.arguments = cmdline
            .split(|byte| *byte == 0)
            .filter(|arg| !arg.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join(" ");
    }

    /// Apply the argument list from a `KERN_PROCARGS2` buffer.
    ///
    /// The buffer holds `argc` as a native `int`, the executable path, NUL
    /// padding, then `argc` NUL-terminated arguments followed by the
    /// environment. A buffer cut short keeps the arguments read so far.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: no argument count or no executable path
    pub fn apply_procargs2(&mut self, raw: &[u8]) -> Result<()>
    {
        let malformed = || DumpError::InvalidArgument("malformed KERN_PROCARGS2 buffer".to_string());

        let argc = raw
            .get(..4)
            .and_then(|bytes| <[u8; 4]>::try_from(bytes).ok())
            .map(i32::from_ne_bytes)
            .ok_or_else(malformed)?;
        let argc = usize::try_from(argc).map_err(|_| malformed())?;

        let rest = &raw[4..];
        let path_end = rest.iter().position(|byte| *byte == 0).ok_or_else(malformed)?;
        let args_start = rest[path_end..]
            .iter()
            .position(|byte| *byte != 0)
            .map_or(rest.len(), |padding| path_end + padding);

        let mut arguments = Vec::new();
        let mut cursor = &rest[args_start..];
        while arguments.len() < argc {
            let Some(end) = cursor.iter().position(|byte| *byte == 0) else {
                break;
            };
            arguments.push(String::from_utf8_lossy(&cursor[..end]).into_owned());
            cursor = &cursor[end + 1..];
        }
        self.arguments = arguments.join(" ");
        Ok(())
    }

    /// Apply raw `/proc/<pid>/auxv` bytes.
    pub fn apply_auxv(&mut self, raw: Vec<u8>)
    {
        self.auxv = parse_auxv(&raw);
        self.raw_auxv = raw;
    }
}

/// Decode a native 64-bit auxiliary vector, stopping at `AT_NULL`.
pub fn parse_auxv(raw: &[u8]) -> Vec<AuxvEntry>
{
    let word = |bytes: &[u8]| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        u64::from_ne_bytes(buf)
    };

    raw.chunks_exact(16)
        .map(|pair| AuxvEntry {
            key: word(&pair[..8]),
            value: word(&pair[8..]),
        })
        .take_while(|entry| entry.key != AT_NULL)
        .collect()
}

/// Keep the first 15 bytes of a command name on a character boundary (`TASK_COMM_LEN - 1`).
pub(crate) fn truncate_name(name: &str) -> String
{
    let mut end = name.len().min(15);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
