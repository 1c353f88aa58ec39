//! # Crash Info
//!
//! The orchestrator: freezes the target, gathers everything a dump needs and
//! hands it to the ELF writer.
//!
//! ## States
//!
//! ```text
//! Created -> ThreadsSuspended -> IdentityCaptured -> MapsDiscovered
//!         -> DacRegionsGathered -> ThreadRegionsAdded -> Coalesced
//!         -> Serialized -> Resumed
//! ```
//!
//! A failure in any state goes straight to `Resumed`. Threads are resumed on
//! every path: [`CrashInfo::generate`] resumes before returning and the
//! `Drop` impl covers unwinding.

use std::cell::RefCell;
use std::fmt;
use std::io::Write;

use tracing::{debug, error, info, trace};

use crate::config::{DumpConfig, DumpKind};
use crate::dac::{DacLoader, RecordingDataTarget};
use crate::elf::notes::NoteSources;
use crate::elf::CoreFile;
use crate::error::{DumpError, Result};
use crate::identity::ProcessIdentity;
use crate::maps::ProcessMaps;
use crate::regions::{page_align_down, MemoryRegion, RegionSet};
use crate::target::{DumpTarget, ProcessMemory};
use crate::threads::ThreadSnapshot;
use crate::types::ProcessId;

/// Pages assumed for a stack whose mapping is unknown
pub const DEFAULT_STACK_PAGES: u64 = 4;

/// Progress of one dump operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherState
{
    Created,
    ThreadsSuspended,
    IdentityCaptured,
    MapsDiscovered,
    DacRegionsGathered,
    ThreadRegionsAdded,
    Coalesced,
    Serialized,
    Resumed,
}

impl fmt::Display for GatherState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::Debug::fmt(self, f)
    }
}

/// What a finished dump contains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSummary
{
    /// Dumped process
    pub pid: ProcessId,
    /// Kind of dump written
    pub kind: DumpKind,
    /// Threads captured
    pub threads: usize,
    /// `PT_LOAD` segments written
    pub regions: usize,
    /// Bytes of memory included
    pub memory_bytes: u64,
    /// Size of the core file
    pub bytes_written: u64,
}

/// One dump operation against one target
pub struct CrashInfo<'t, T: DumpTarget>
{
    target: &'t mut T,
    config: &'t DumpConfig,
    state: GatherState,
    suspended: bool,
    threads: Vec<ThreadSnapshot>,
    identity: Option<ProcessIdentity>,
    maps: ProcessMaps,
    regions: RegionSet,
}

impl<'t, T: DumpTarget> CrashInfo<'t, T>
{
    /// Start a dump of `target`.
    pub fn new(target: &'t mut T, config: &'t DumpConfig) -> Self
    {
        let page_size = target.page_size();
        Self {
            target,
            config,
            state: GatherState::Created,
            suspended: false,
            threads: Vec::new(),
            identity: None,
            maps: ProcessMaps::default(),
            regions: RegionSet::new(page_size),
        }
    }

    /// Current state.
    pub fn state(&self) -> GatherState
    {
        self.state
    }

    /// Regions gathered so far.
    pub fn regions(&self) -> &RegionSet
    {
        &self.regions
    }

    /// Threads captured so far.
    pub fn threads(&self) -> &[ThreadSnapshot]
    {
        &self.threads
    }

    /// Run the whole pipeline.
    ///
    /// `open_output` is called once the identity is known (so a name template
    /// can use the executable name) and only after everything was gathered;
    /// it returns the sink the core file is written to. The sink is handed
    /// back on success so the caller can commit it.
    ///
    /// The target is resumed before this returns, whatever the outcome.
    ///
    /// ## Errors
    ///
    /// Every error is fatal; see [`DumpError`] for the variants each stage produces.
    pub fn generate<W, F>(&mut self, dac: &dyn DacLoader, open_output: F) -> Result<(DumpSummary, W)>
    where
        W: Write,
        F: FnOnce(&ProcessIdentity) -> Result<W>,
    {
        let result = self.gather_and_write(dac, open_output);
        if let Err(e) = &result {
            error!("Dump of process {} failed in state {}: {e}", self.target.pid(), self.state);
        }
        self.resume();
        result
    }

    fn gather_and_write<W, F>(&mut self, dac: &dyn DacLoader, open_output: F) -> Result<(DumpSummary, W)>
    where
        W: Write,
        F: FnOnce(&ProcessIdentity) -> Result<W>,
    {
        self.suspend_and_capture()?;
        let identity = self.capture_identity()?;
        self.discover_maps(&identity)?;
        self.gather_dac_regions(dac)?;
        self.add_thread_regions();
        self.coalesce();

        let mut out = open_output(&identity)?;
        let bytes_written = self.serialize(&identity, &mut out)?;

        let summary = DumpSummary {
            pid: self.target.pid(),
            kind: self.config.kind,
            threads: self.threads.len(),
            regions: self.regions.len(),
            memory_bytes: self.regions.total_size(),
            bytes_written,
        };
        Ok((summary, out))
    }

    fn transition(&mut self, next: GatherState)
    {
        info!("{} -> {}", self.state, next);
        self.state = next;
    }

    fn suspend_and_capture(&mut self) -> Result<()>
    {
        // Set first: a partial suspension must still be undone.
        self.suspended = true;
        let tids = self.target.suspend_threads()?;
        if tids.is_empty() {
            return Err(DumpError::SuspendFailed(format!(
                "process {} has no threads",
                self.target.pid()
            )));
        }

        for tid in tids {
            let snapshot = self.target.capture_registers(tid)?;
            if snapshot.fp_registers.is_none() {
                debug!("Thread {tid}: no floating-point state");
            }
            self.threads.push(snapshot);
        }
        self.transition(GatherState::ThreadsSuspended);
        Ok(())
    }

    fn capture_identity(&mut self) -> Result<ProcessIdentity>
    {
        let identity = self.target.identity()?;
        for thread in &mut self.threads {
            if thread.tgid == 0 {
                thread.tgid = identity.pid;
            }
            if thread.ppid == 0 {
                thread.ppid = identity.ppid;
            }
        }
        info!("Process {} ({}) with {} threads", identity.pid, identity.name, self.threads.len());
        self.identity = Some(identity.clone());
        self.transition(GatherState::IdentityCaptured);
        Ok(identity)
    }

    fn discover_maps(&mut self, identity: &ProcessIdentity) -> Result<()>
    {
        self.maps = self.target.discover_maps(identity)?;

        let mut candidates: Vec<MemoryRegion> = Vec::new();
        match self.config.kind {
            DumpKind::Full => {
                candidates.extend(self.maps.modules.iter().cloned());
                candidates.extend(self.maps.others.iter().filter(|r| r.permissions.any()).cloned());
            }
            DumpKind::WithHeap => {
                candidates.extend(
                    self.maps
                        .others
                        .iter()
                        .filter(|r| r.permissions.read && r.permissions.write)
                        .cloned(),
                );
            }
            DumpKind::Normal | DumpKind::Triage => {}
        }
        candidates.extend(self.maps.kernel_pages.iter().cloned());
        candidates.extend(self.maps.image_headers.iter().cloned());

        for region in candidates {
            self.insert_checked(region);
        }

        debug!(
            "{} kind: {} regions, {} bytes after map discovery",
            self.config.kind,
            self.regions.len(),
            self.regions.total_size()
        );
        self.transition(GatherState::MapsDiscovered);
        Ok(())
    }

    fn gather_dac_regions(&mut self, dac: &dyn DacLoader) -> Result<()>
    {
        let mut session = dac.load()?;

        let page_size = self.regions.page_size();
        let regions = RefCell::new(std::mem::replace(&mut self.regions, RegionSet::new(page_size)));
        let target: &T = self.target;
        let maps = &self.maps;
        let mut reported = 0usize;

        let data_target = RecordingDataTarget::new(target, target.architecture(), &self.threads, maps, &regions);
        let mut sink = |address: u64, size: u64| {
            reported += 1;
            if size == 0 {
                return;
            }
            let region = MemoryRegion::new(address, address.saturating_add(size), maps.flags_for(address));
            let added = regions.borrow_mut().insert_region(region, |page| target.is_readable(page));
            trace!("DAC region 0x{address:x}+0x{size:x} added {added} bytes");
        };

        let result = session.enumerate(self.config.kind.minidump_flags(), &data_target, &mut sink);
        self.regions = regions.into_inner();
        result?;

        info!("Data access component reported {reported} regions");
        self.transition(GatherState::DacRegionsGathered);
        Ok(())
    }

    fn add_thread_regions(&mut self)
    {
        let page_size = self.regions.page_size();
        let mut candidates = Vec::with_capacity(self.threads.len() * 2);

        for thread in &self.threads {
            if let Some(sp) = thread.stack_pointer() {
                let start = page_align_down(sp, page_size);
                let end = match self.maps.other_containing(start) {
                    Some(mapping) => mapping.end,
                    None => start.saturating_add(DEFAULT_STACK_PAGES * page_size),
                };
                trace!("Thread {} stack 0x{start:x}-0x{end:x}", thread.tid);
                candidates.push(MemoryRegion::new(start, end, self.maps.flags_for(start)));
            }
            if let Some(ip) = thread.instruction_pointer() {
                let start = page_align_down(ip, page_size);
                candidates.push(MemoryRegion::new(start, start.saturating_add(page_size), self.maps.flags_for(start)));
            }
        }

        for region in candidates {
            self.insert_checked(region);
        }
        self.transition(GatherState::ThreadRegionsAdded);
    }

    fn coalesce(&mut self)
    {
        self.regions.coalesce();
        if self.config.diagnostics {
            for region in self.regions.iter() {
                info!("{region}");
            }
        }
        info!(
            "{} regions, {} bytes of memory",
            self.regions.len(),
            self.regions.total_size()
        );
        self.transition(GatherState::Coalesced);
    }

    fn serialize<W: Write>(&mut self, identity: &ProcessIdentity, out: &mut W) -> Result<u64>
    {
        let file_mappings = self.maps.file_mappings();
        let sources = NoteSources {
            identity,
            threads: &self.threads,
            file_mappings: &file_mappings,
            page_size: self.regions.page_size(),
            crash_thread: self.config.crash_thread,
            signal: self.config.signal,
        };
        let target: &T = self.target;
        let core = CoreFile::new(target.architecture(), &self.regions, &sources);
        let written = core.write(out, target as &dyn ProcessMemory)?;

        self.transition(GatherState::Serialized);
        Ok(written)
    }

    fn insert_checked(&mut self, region: MemoryRegion)
    {
        let target: &T = self.target;
        let added = self.regions.insert_region(region, |page| target.is_readable(page));
        if added == 0 {
            trace!("Region already present or unreadable");
        }
    }

    fn resume(&mut self)
    {
        if self.suspended {
            self.target.resume_threads();
            self.suspended = false;
        }
        self.transition(GatherState::Resumed);
    }
}

impl<T: DumpTarget> Drop for CrashInfo<'_, T>
{
    fn drop(&mut self)
    {
        if self.suspended {
            // Best effort resume - failures are logged by the target
            self.target.resume_threads();
        }
    }
}
