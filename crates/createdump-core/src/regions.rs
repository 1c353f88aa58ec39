//! # Region Set
//!
//! The model of which bytes of the target's address space end up in the dump.
//!
//! Memory-layout facts arrive from several independent sources (the live
//! process map, the dynamic loader, the data access component, thread stacks)
//! and routinely overlap. [`RegionSet`] keeps the stored entries disjoint:
//!
//! - A candidate already covered by one entry is dropped.
//! - A candidate that collides with existing entries without being covered is
//!   inserted one page at a time, skipping pages someone else already owns.
//!   The earlier writer wins every contested page.
//!
//! Debuggers that read these dumps are used to exactly this asymmetry, so the
//! rule must not be "fixed" into a merge.
//!
//! ## Example
//!
//! ```rust
//! use createdump_core::regions::RegionSet;
//!
//! let mut regions = RegionSet::new(0x1000);
//! regions.insert(0x1000, 0x1000);
//! regions.insert(0x2000, 0x1000);
//! regions.coalesce();
//!
//! let all: Vec<_> = regions.iter().map(|r| (r.start, r.end)).collect();
//! assert_eq!(all, vec![(0x1000, 0x3000)]);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use object::elf::{PF_R, PF_W, PF_X};
use once_cell::sync::Lazy;

static SYSTEM_PAGE_SIZE: Lazy<u64> = Lazy::new(|| unsafe {
    let size = libc::sysconf(libc::_SC_PAGESIZE);
    if size <= 0 { 4096 } else { size as u64 }
});

/// Page size of the running system (also the target's page size).
pub fn system_page_size() -> u64
{
    *SYSTEM_PAGE_SIZE
}

pub(crate) fn page_align_down(value: u64, page_size: u64) -> u64
{
    value & !(page_size - 1)
}

pub(crate) fn page_align_up(value: u64, page_size: u64) -> u64
{
    value.saturating_add(page_size - 1) & !(page_size - 1)
}

/// Access permissions of a mapping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Permissions
{
    /// Readable
    pub read: bool,
    /// Writable
    pub write: bool,
    /// Executable
    pub execute: bool,
}

impl Permissions
{
    /// `r--`, used when nothing better is known about a range.
    pub const READ_ONLY: Self = Permissions {
        read: true,
        write: false,
        execute: false,
    };

    /// Parse the permission column of `/proc/<pid>/maps` (`"r-xp"`).
    ///
    /// Only the first three letters are looked at.
    ///
    /// ```rust
    /// use createdump_core::regions::Permissions;
    ///
    /// let perms = Permissions::from_maps_letters("r-xp");
    /// assert!(perms.read && !perms.write && perms.execute);
    /// ```
    pub fn from_maps_letters(letters: &str) -> Self
    {
        let bytes = letters.as_bytes();
        Permissions {
            read: bytes.first() == Some(&b'r'),
            write: bytes.get(1) == Some(&b'w'),
            execute: bytes.get(2) == Some(&b'x'),
        }
    }

    /// True when any of r/w/x is set.
    pub fn any(self) -> bool
    {
        self.read || self.write || self.execute
    }

    /// `p_flags` bits for a `PT_LOAD` program header.
    pub fn elf_flags(self) -> u32
    {
        let mut flags = 0;
        if self.read {
            flags |= PF_R;
        }
        if self.write {
            flags |= PF_W;
        }
        if self.execute {
            flags |= PF_X;
        }
        flags
    }
}

impl fmt::Display for Permissions
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let r = if self.read { 'r' } else { '-' };
        let w = if self.write { 'w' } else { '-' };
        let x = if self.execute { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

/// A range of the target's address space
///
/// `start` is inclusive and `end` exclusive. Regions stored in a [`RegionSet`]
/// are page-aligned; regions produced by map discovery are kept as the OS
/// reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion
{
    /// Start address (inclusive)
    pub start: u64,
    /// End address (exclusive)
    pub end: u64,
    /// Access permissions
    pub permissions: Permissions,
    /// Offset into the backing file
    pub offset: u64,
    /// Backing file, if any
    pub file_name: Option<String>,
}

impl MemoryRegion
{
    /// Anonymous region with the given permissions.
    pub fn new(start: u64, end: u64, permissions: Permissions) -> Self
    {
        Self {
            start,
            end,
            permissions,
            offset: 0,
            file_name: None,
        }
    }

    /// Region backed by `file_name` at `offset`.
    pub fn with_file(mut self, file_name: impl Into<String>, offset: u64) -> Self
    {
        self.file_name = Some(file_name.into());
        self.offset = offset;
        self
    }

    /// `end - start`, or 0 for an inverted range.
    pub fn size(&self) -> u64
    {
        self.end.saturating_sub(self.start)
    }

    /// True when `address` lies inside the region.
    pub fn contains_address(&self, address: u64) -> bool
    {
        address >= self.start && address < self.end
    }

    /// True when `[start, end)` is a subset of this region.
    pub fn contains_range(&self, start: u64, end: u64) -> bool
    {
        start >= self.start && end <= self.end
    }

    /// Copy of this region restricted to `[start, end)`, keeping the file offset in step.
    fn slice(&self, start: u64, end: u64) -> Self
    {
        Self {
            start,
            end,
            permissions: self.permissions,
            offset: self.offset + (start - self.start),
            file_name: self.file_name.clone(),
        }
    }
}

impl fmt::Display for MemoryRegion
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "{:016x}-{:016x} {} {:08x}",
            self.start, self.end, self.permissions, self.offset
        )?;
        if let Some(name) = &self.file_name {
            write!(f, " {name}")?;
        }
        Ok(())
    }
}

/// Ordered set of disjoint, page-aligned regions
#[derive(Debug, Clone)]
pub struct RegionSet
{
    page_size: u64,
    regions: BTreeMap<u64, MemoryRegion>,
}

impl Default for RegionSet
{
    fn default() -> Self
    {
        Self::new(system_page_size())
    }
}

impl RegionSet
{
    /// Empty set for the given page size (a power of two).
    pub fn new(page_size: u64) -> Self
    {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size,
            regions: BTreeMap::new(),
        }
    }

    /// Page size used for rounding.
    pub fn page_size(&self) -> u64
    {
        self.page_size
    }

    /// Number of stored regions.
    pub fn len(&self) -> usize
    {
        self.regions.len()
    }

    /// True when nothing has been inserted.
    pub fn is_empty(&self) -> bool
    {
        self.regions.is_empty()
    }

    /// Stored regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> + '_
    {
        self.regions.values()
    }

    /// Total number of bytes covered.
    pub fn total_size(&self) -> u64
    {
        self.regions.values().map(MemoryRegion::size).sum()
    }

    /// Stored region containing `address`.
    pub fn find(&self, address: u64) -> Option<&MemoryRegion>
    {
        self.regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains_address(address))
    }

    /// Add `[address, address + size)` as a read-only range.
    ///
    /// The range is rounded out to page boundaries first. See the module
    /// documentation for how collisions are resolved.
    pub fn insert(&mut self, address: u64, size: u64)
    {
        if size == 0 {
            return;
        }
        let end = address.saturating_add(size);
        self.insert_region(MemoryRegion::new(address, end, Permissions::READ_ONLY), |_| true);
    }

    /// Add a fully described region.
    ///
    /// `readable` is asked about each page start. A range whose pages are
    /// not all readable is inserted page by page, keeping only the readable
    /// pages.
    ///
    /// Returns the number of bytes newly covered.
    pub fn insert_region<F>(&mut self, region: MemoryRegion, mut readable: F) -> u64
    where
        F: FnMut(u64) -> bool,
    {
        let start = page_align_down(region.start, self.page_size);
        let end = page_align_up(region.end, self.page_size);
        if start >= end {
            return 0;
        }
        let region = MemoryRegion {
            start,
            end,
            offset: region.offset.saturating_sub(region.start - start),
            ..region
        };

        if self.covering(start, end).is_some() {
            return 0;
        }

        let page_size = self.page_size;
        let pages = || (start..end).step_by(page_size as usize);

        if !self.overlaps(start, end) && pages().all(&mut readable) {
            self.regions.insert(start, region);
            return end - start;
        }

        let mut added = 0;
        for page in pages() {
            if self.find(page).is_none() && readable(page) {
                self.regions.insert(page, region.slice(page, page + page_size));
                added += page_size;
            }
        }
        added
    }

    /// Merge every run of adjacent regions that share permissions.
    ///
    /// File name and offset of the first region in a run are kept. Running it
    /// twice yields the same set.
    pub fn coalesce(&mut self)
    {
        let mut merged: BTreeMap<u64, MemoryRegion> = BTreeMap::new();
        let mut current: Option<MemoryRegion> = None;

        for region in std::mem::take(&mut self.regions).into_values() {
            current = match current.take() {
                Some(mut run) if run.end == region.start && run.permissions == region.permissions => {
                    run.end = region.end;
                    Some(run)
                }
                Some(run) => {
                    merged.insert(run.start, run);
                    Some(region)
                }
                None => Some(region),
            };
        }
        if let Some(run) = current {
            merged.insert(run.start, run);
        }

        self.regions = merged;
    }

    fn covering(&self, start: u64, end: u64) -> Option<&MemoryRegion>
    {
        self.regions
            .range(..=start)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains_range(start, end))
    }

    fn overlaps(&self, start: u64, end: u64) -> bool
    {
        // Entries are disjoint, so only the last one starting below `end` can reach into the range.
        self.regions
            .range(..end)
            .next_back()
            .is_some_and(|(_, region)| region.end > start)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_insert_rounds_to_pages()
    {
        let mut set = RegionSet::new(0x1000);
        set.insert(0x1234, 0x10);
        let region = set.iter().next().unwrap();
        assert_eq!((region.start, region.end), (0x1000, 0x2000));
    }

    #[test]
    fn test_zero_length_insert_is_noop()
    {
        let mut set = RegionSet::new(0x1000);
        set.insert(0x5000, 0);
        assert!(set.is_empty());
    }

    #[test]
    fn test_partial_overlap_keeps_first_writer()
    {
        let mut set = RegionSet::new(0x1000);
        let rx = Permissions::from_maps_letters("r-x");
        let rw = Permissions::from_maps_letters("rw-");
        set.insert_region(MemoryRegion::new(0x10000, 0x14000, rx), |_| true);
        set.insert_region(MemoryRegion::new(0x13000, 0x16000, rw), |_| true);

        assert_eq!(set.find(0x13000).unwrap().permissions, rx);
        assert_eq!(set.find(0x14000).unwrap().permissions, rw);
        assert_eq!(set.find(0x15fff).unwrap().permissions, rw);
        assert!(set.find(0x16000).is_none());
    }

    #[test]
    fn test_unreadable_pages_are_skipped()
    {
        let mut set = RegionSet::new(0x1000);
        let added = set.insert_region(MemoryRegion::new(0x1000, 0x4000, Permissions::READ_ONLY), |page| page != 0x2000);
        assert_eq!(added, 0x2000);
        assert!(set.find(0x1000).is_some());
        assert!(set.find(0x2000).is_none());
        assert!(set.find(0x3000).is_some());
    }

    #[test]
    fn test_page_split_tracks_file_offset()
    {
        let mut set = RegionSet::new(0x1000);
        set.insert(0x3000, 0x1000);
        let module = MemoryRegion::new(0x2000, 0x5000, Permissions::READ_ONLY).with_file("/lib/libfoo.so", 0x8000);
        set.insert_region(module, |_| true);

        let tail = set.find(0x4000).unwrap();
        assert_eq!(tail.offset, 0xa000);
        assert_eq!(tail.file_name.as_deref(), Some("/lib/libfoo.so"));
    }

    #[test]
    fn test_coalesce_respects_permissions()
    {
        let mut set = RegionSet::new(0x1000);
        set.insert_region(MemoryRegion::new(0x1000, 0x2000, Permissions::READ_ONLY), |_| true);
        set.insert_region(
            MemoryRegion::new(0x2000, 0x3000, Permissions::from_maps_letters("rw-")),
            |_| true,
        );
        set.coalesce();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_permissions_elf_flags()
    {
        assert_eq!(Permissions::from_maps_letters("rwx").elf_flags(), PF_R | PF_W | PF_X);
        assert_eq!(Permissions::from_maps_letters("---p").elf_flags(), 0);
        assert_eq!(Permissions::from_maps_letters("r-x").to_string(), "r-x");
    }
}
