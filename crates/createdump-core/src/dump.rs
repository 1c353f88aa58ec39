//! # Dump Entry Point
//!
//! Opens the native target, runs the orchestrator and makes sure a dump only
//! appears under its final name once it is complete.
//!
//! Output is written to `<final>.partial` first. On success the file is
//! flushed, synced and renamed; on failure it is removed. A reader never sees
//! a truncated core under the real name.
//!
//! ## Example
//!
//! ```rust,no_run
//! use createdump_core::config::{DumpConfig, DumpKind};
//! use createdump_core::dump::create_dump;
//!
//! let mut config = DumpConfig::new(12345u32);
//! config.kind = DumpKind::Full;
//! let path = create_dump(&config)?;
//! println!("dump written to {}", path.display());
//! # Ok::<(), createdump_core::error::DumpError>(())
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::{format_dump_name, DumpConfig};
use crate::crash_info::{CrashInfo, DumpSummary};
#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::dac::DataTarget;
use crate::dac::{DacLoader, LibraryDacLoader};
use crate::error::Result;
#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::platform;
use crate::target::DumpTarget;

/// Dump the process described by `config` with the native target and the
/// data access component next to the running executable.
///
/// Returns the path of the finished dump.
///
/// ## Errors
///
/// Anything [`CrashInfo::generate`] reports, plus `Io` for the output file.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn create_dump(config: &DumpConfig) -> Result<PathBuf>
{
    let dac = LibraryDacLoader::locate(config.dac_path.as_deref())?;
    let mut target = platform::attach(config, None)?;
    let (_, path) = create_dump_with(&mut target, &dac, config)?;
    Ok(path)
}

/// Dump a process that an in-process debugger already controls.
///
/// `config.companion_attached` must be set. Nothing is suspended; thread
/// contexts and memory come from `companion`.
///
/// ## Errors
///
/// Anything [`create_dump`] reports, plus `InvalidArgument` when companion
/// mode is off or unsupported on this host.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn create_companion_dump(config: &DumpConfig, companion: Box<dyn DataTarget>) -> Result<PathBuf>
{
    let dac = LibraryDacLoader::locate(config.dac_path.as_deref())?;
    let mut target = platform::attach(config, Some(companion))?;
    let (_, path) = create_dump_with(&mut target, &dac, config)?;
    Ok(path)
}

/// Dump `target` using `dac`, naming the file from `config`'s template.
///
/// ## Errors
///
/// Anything [`CrashInfo::generate`] reports, plus `Io` for the output file.
pub fn create_dump_with<T: DumpTarget>(
    target: &mut T,
    dac: &dyn DacLoader,
    config: &DumpConfig,
) -> Result<(DumpSummary, PathBuf)>
{
    let template = config.template();
    let mut crash_info = CrashInfo::new(target, config);

    let (summary, staged) = crash_info.generate(dac, |identity| {
        let name = format_dump_name(&template, config.pid, &identity.name);
        info!("Writing {} to file {name}", config.kind);
        StagedFile::create(PathBuf::from(name))
    })?;

    let path = staged.commit()?;
    info!(
        "Dump successfully written: {} bytes, {} threads, {} segments",
        summary.bytes_written, summary.threads, summary.regions
    );
    Ok((summary, path))
}

/// Output file that only takes its final name on [`commit`](StagedFile::commit)
pub struct StagedFile
{
    final_path: PathBuf,
    partial_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl StagedFile
{
    /// Create (or truncate) `<path>.partial`.
    ///
    /// ## Errors
    ///
    /// - `Io`: the file could not be created
    pub fn create(path: PathBuf) -> Result<Self>
    {
        let partial_path = partial_path_for(&path);
        let file = File::create(&partial_path)?;
        Ok(Self {
            final_path: path,
            partial_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Path the dump will have once committed.
    pub fn final_path(&self) -> &Path
    {
        &self.final_path
    }

    /// Path being written.
    pub fn partial_path(&self) -> &Path
    {
        &self.partial_path
    }

    /// Flush, sync and move the file to its final name.
    ///
    /// ## Errors
    ///
    /// - `Io`: flushing, syncing or renaming failed; the partial file is removed
    pub fn commit(mut self) -> Result<PathBuf>
    {
        if let Some(writer) = self.writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&self.partial_path, &self.final_path)?;
        Ok(self.final_path.clone())
    }
}

impl Write for StagedFile
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>
    {
        match &mut self.writer {
            Some(writer) => writer.write(buf),
            None => Err(std::io::Error::other("dump file already committed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()>
    {
        match &mut self.writer {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StagedFile
{
    fn drop(&mut self)
    {
        // Still holding the writer means commit never ran or failed before the rename.
        if self.writer.take().is_some() || self.partial_path.exists() {
            if let Err(e) = fs::remove_file(&self.partial_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {e}", self.partial_path.display());
                }
            }
        }
    }
}

fn partial_path_for(path: &Path) -> PathBuf
{
    let mut name = path.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}
