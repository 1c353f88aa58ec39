//! # Process Maps
//!
//! The target's address space as the operating system reports it, split into
//! module mappings (backed by a file path) and everything else.
//!
//! Nothing here inserts into a [`RegionSet`](crate::regions::RegionSet); the
//! orchestrator decides what to include from these lists based on the dump
//! kind. The partition is also used for permission lookup, the file-mapping
//! note and the data access component's image-base queries.
//!
//! ## Sources
//!
//! - **Linux**: the text of `/proc/<pid>/maps` plus the vDSO base from
//!   `AT_SYSINFO_EHDR`, parsed by [`ProcessMaps::from_proc_maps`]
//! - **macOS**: `mach_vm_region_recurse` and the dyld image list, assembled by
//!   the Mach platform module

use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{DumpError, Result};
use crate::regions::{MemoryRegion, Permissions};

/// Attempts made when the loader's module list is being modified
pub const MODULE_LIST_ATTEMPTS: u32 = 10;

/// Pause between module-list attempts
pub const MODULE_LIST_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Classified mappings of one process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessMaps
{
    /// Mappings backed by a file
    pub modules: Vec<MemoryRegion>,
    /// Anonymous, heap, stack and pseudo mappings
    pub others: Vec<MemoryRegion>,
    /// Kernel-provided pages (vDSO), inserted verbatim
    pub kernel_pages: Vec<MemoryRegion>,
    /// ELF/Mach-O headers, program headers, dynamic and note sections of loaded images
    pub image_headers: Vec<MemoryRegion>,
}

impl ProcessMaps
{
    /// Parse `/proc/<pid>/maps`.
    ///
    /// Each line reads `start-end perms offset dev inode [path]`. Lines that do
    /// not parse are skipped with a trace message. `sysinfo_ehdr` is the
    /// `AT_SYSINFO_EHDR` value; the mapping that starts there becomes a kernel
    /// page instead of an "other" mapping.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use createdump_core::maps::ProcessMaps;
    ///
    /// let text = "00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/dotnet\n\
    ///             01c8a000-01cab000 rw-p 00000000 00:00 0 [heap]\n";
    /// let maps = ProcessMaps::from_proc_maps(text, None);
    /// assert_eq!(maps.modules.len(), 1);
    /// assert_eq!(maps.others.len(), 1);
    /// ```
    pub fn from_proc_maps(text: &str, sysinfo_ehdr: Option<u64>) -> Self
    {
        let mut maps = ProcessMaps::default();

        for line in text.lines() {
            let Some(region) = parse_maps_line(line) else {
                if !line.trim().is_empty() {
                    trace!("Skipping unparsable maps line: {line}");
                }
                continue;
            };

            if sysinfo_ehdr.is_some_and(|base| base == region.start) {
                maps.kernel_pages.push(region);
            } else if region.file_name.as_deref().is_some_and(|path| path.starts_with('/')) {
                maps.modules.push(region);
            } else {
                maps.others.push(region);
            }
        }

        debug!(
            "Parsed maps: {} modules, {} other, {} kernel",
            maps.modules.len(),
            maps.others.len(),
            maps.kernel_pages.len()
        );
        maps
    }

    /// "Other" mapping containing `address`.
    pub fn other_containing(&self, address: u64) -> Option<&MemoryRegion>
    {
        self.others.iter().find(|region| region.contains_address(address))
    }

    /// Mapping of any class containing `address`.
    pub fn mapping_containing(&self, address: u64) -> Option<&MemoryRegion>
    {
        self.modules
            .iter()
            .chain(&self.others)
            .chain(&self.kernel_pages)
            .find(|region| region.contains_address(address))
    }

    /// Permissions recorded for `address`, read-only when it is not mapped.
    pub fn flags_for(&self, address: u64) -> Permissions
    {
        self.mapping_containing(address)
            .map(|region| region.permissions)
            .unwrap_or(Permissions::READ_ONLY)
    }

    /// Lowest address at which a module named `name` is mapped.
    ///
    /// Matches either the full path or its file name, so `libcoreclr.so`
    /// finds `/usr/share/dotnet/shared/.../libcoreclr.so`.
    pub fn image_base(&self, name: &str) -> Option<u64>
    {
        self.modules
            .iter()
            .filter(|region| {
                region.file_name.as_deref().is_some_and(|path| {
                    path == name || Path::new(path).file_name().is_some_and(|file| file == name)
                })
            })
            .map(|region| region.start)
            .min()
    }

    /// Module mappings in address order, for the file-mapping note.
    pub fn file_mappings(&self) -> Vec<&MemoryRegion>
    {
        let mut mappings: Vec<&MemoryRegion> = self.modules.iter().collect();
        mappings.sort_by_key(|region| region.start);
        mappings
    }
}

/// Parts of `raw` not covered by any of `covered`.
///
/// Each uncovered piece keeps the permissions and name of the raw region it
/// was cut from. Used on macOS, where the VM walk reports ranges and the
/// dyld walk says which of them belong to images.
pub fn uncovered_ranges(raw: &[MemoryRegion], covered: &[MemoryRegion]) -> Vec<MemoryRegion>
{
    let mut covered: Vec<&MemoryRegion> = covered.iter().filter(|region| region.start < region.end).collect();
    covered.sort_by_key(|region| region.start);

    let mut gaps = Vec::new();
    for region in raw {
        let mut cursor = region.start;
        for segment in covered
            .iter()
            .filter(|segment| segment.start < region.end && segment.end > region.start)
        {
            if segment.start > cursor {
                gaps.push(MemoryRegion {
                    start: cursor,
                    end: segment.start,
                    ..region.clone()
                });
            }
            cursor = cursor.max(segment.end);
        }
        if cursor < region.end {
            gaps.push(MemoryRegion {
                start: cursor,
                ..region.clone()
            });
        }
    }
    gaps
}

/// Parse one `/proc/<pid>/maps` line.
///
/// The path column is everything after the inode, so paths containing spaces
/// survive; a trailing ` (deleted)` marker is kept as part of the name.
pub fn parse_maps_line(line: &str) -> Option<MemoryRegion>
{
    let mut rest = line.trim_start();
    let mut next_field = || {
        let trimmed = rest.trim_start();
        let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        let (field, tail) = trimmed.split_at(end);
        rest = tail;
        (!field.is_empty()).then_some(field)
    };

    let range = next_field()?;
    let perms = next_field()?;
    let offset = next_field()?;
    let _device = next_field()?;
    let _inode = next_field()?;
    let path = rest.trim();

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;
    if start >= end {
        return None;
    }

    let region = MemoryRegion::new(start, end, Permissions::from_maps_letters(perms));
    Some(if path.is_empty() {
        MemoryRegion { offset, ..region }
    } else {
        region.with_file(path, offset)
    })
}

/// Run `attempt` until the loader's module list is stable.
///
/// Only [`DumpError::ModuleListChanged`] is retried; any other error is
/// returned immediately. After [`MODULE_LIST_ATTEMPTS`] failed attempts the
/// result is [`DumpError::Timeout`].
pub fn retry_transient<T, F>(what: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    for number in 1..=MODULE_LIST_ATTEMPTS {
        match attempt() {
            Err(DumpError::ModuleListChanged) => {
                debug!("{what}: module list changed (attempt {number}/{MODULE_LIST_ATTEMPTS})");
                if number < MODULE_LIST_ATTEMPTS {
                    thread::sleep(MODULE_LIST_RETRY_DELAY);
                }
            }
            other => return other,
        }
    }
    warn!("{what}: module list never settled");
    Err(DumpError::Timeout(format!("{what}: module list kept changing")))
}

#[cfg(test)]
mod tests
{
    use super::*;

    const MAPS: &str = "\
55d4c4a00000-55d4c4a1e000 r--p 00000000 08:01 1835227    /usr/share/dotnet/dotnet
55d4c4a1e000-55d4c4a3f000 r-xp 0001e000 08:01 1835227    /usr/share/dotnet/dotnet
55d4c6200000-55d4c6400000 rw-p 00000000 00:00 0          [heap]
7f11a0000000-7f11a0021000 rw-p 00000000 00:00 0
7f11a1000000-7f11a1200000 r-xp 00010000 08:01 2000       /opt/my app/libcoreclr.so
7f11a1200000-7f11a1201000 r--p 00000000 08:01 2000       /opt/my app/libcoreclr.so (deleted)
7ffd5c3a1000-7ffd5c3c2000 rw-p 00000000 00:00 0          [stack]
7ffd5c3f6000-7ffd5c3f8000 r-xp 00000000 00:00 0          [vdso]
";

    #[test]
    fn test_classification()
    {
        let maps = ProcessMaps::from_proc_maps(MAPS, Some(0x7ffd_5c3f_6000));
        assert_eq!(maps.modules.len(), 4);
        assert_eq!(maps.others.len(), 3);
        assert_eq!(maps.kernel_pages.len(), 1);
        assert_eq!(maps.kernel_pages[0].file_name.as_deref(), Some("[vdso]"));
    }

    #[test]
    fn test_vdso_without_auxv_is_other()
    {
        let maps = ProcessMaps::from_proc_maps(MAPS, None);
        assert!(maps.kernel_pages.is_empty());
        assert_eq!(maps.others.len(), 4);
    }

    #[test]
    fn test_path_with_spaces_and_offset()
    {
        let region = parse_maps_line("7f11a1000000-7f11a1200000 r-xp 00010000 08:01 2000       /opt/my app/libcoreclr.so")
            .unwrap();
        assert_eq!(region.file_name.as_deref(), Some("/opt/my app/libcoreclr.so"));
        assert_eq!(region.offset, 0x10000);
        assert!(region.permissions.execute && !region.permissions.write);
    }

    #[test]
    fn test_garbage_lines_are_skipped()
    {
        assert!(parse_maps_line("").is_none());
        assert!(parse_maps_line("zzzz-0000 r-xp 0 0 0").is_none());
        assert!(parse_maps_line("2000-1000 r-xp 0 00:00 0").is_none());
    }

    #[test]
    fn test_flags_and_containment()
    {
        let maps = ProcessMaps::from_proc_maps(MAPS, None);
        assert!(maps.flags_for(0x55d4_c620_0010).write);
        assert_eq!(maps.flags_for(0x10), Permissions::READ_ONLY);
        let stack = maps.other_containing(0x7ffd_5c3b_0000).unwrap();
        assert_eq!(stack.end, 0x7ffd_5c3c_2000);
        assert!(maps.other_containing(0x55d4_c4a0_0000).is_none());
    }

    #[test]
    fn test_image_base_matches_file_name()
    {
        let maps = ProcessMaps::from_proc_maps(MAPS, None);
        assert_eq!(maps.image_base("dotnet"), Some(0x55d4_c4a0_0000));
        assert_eq!(maps.image_base("/opt/my app/libcoreclr.so"), Some(0x7f11_a100_0000));
        assert_eq!(maps.image_base("libclrjit.so"), None);
    }

    #[test]
    fn test_retry_gives_up_with_timeout()
    {
        let mut calls = 0;
        let result: Result<()> = retry_transient("test", || {
            calls += 1;
            Err(DumpError::ModuleListChanged)
        });
        assert!(matches!(result, Err(DumpError::Timeout(_))));
        assert_eq!(calls, MODULE_LIST_ATTEMPTS);
    }

    #[test]
    fn test_retry_passes_through_other_errors()
    {
        let mut calls = 0;
        let result: Result<()> = retry_transient("test", || {
            calls += 1;
            if calls < 3 {
                Err(DumpError::ModuleListChanged)
            } else {
                Err(DumpError::ProcessNotFound(1))
            }
        });
        assert!(matches!(result, Err(DumpError::ProcessNotFound(1))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_uncovered_ranges_split_around_segments()
    {
        let rw = Permissions::from_maps_letters("rw-p");
        let raw = vec![
            MemoryRegion::new(0x1000, 0x9000, rw),
            MemoryRegion::new(0x10000, 0x11000, Permissions::READ_ONLY),
        ];
        let covered = vec![
            MemoryRegion::new(0x3000, 0x4000, Permissions::READ_ONLY).with_file("/usr/lib/libSystem.B.dylib", 0),
            MemoryRegion::new(0x2000, 0x3000, Permissions::READ_ONLY),
            MemoryRegion::new(0x8000, 0xa000, Permissions::READ_ONLY),
        ];

        let gaps = uncovered_ranges(&raw, &covered);
        let spans: Vec<(u64, u64)> = gaps.iter().map(|gap| (gap.start, gap.end)).collect();
        assert_eq!(spans, vec![(0x1000, 0x2000), (0x4000, 0x8000), (0x10000, 0x11000)]);
        assert_eq!(gaps[0].permissions, rw);
    }
}
