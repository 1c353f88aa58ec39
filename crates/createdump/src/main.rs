use std::path::PathBuf;
use std::process;

use clap::{ArgAction, ArgGroup, Parser};
use createdump_core::config::{DumpConfig, DumpKind};
use createdump_core::types::{ProcessId, ThreadId};
use createdump_utils::{error, info, init_logging, LoggingOptions};

/// Write an ELF core dump of a running .NET process.
#[derive(Parser, Debug)]
#[command(name = "createdump")]
#[command(version)]
#[command(about = "Write an ELF core dump of a running .NET process", long_about = None)]
#[command(disable_help_flag = true)]
#[command(group(ArgGroup::new("kind").args(["normal", "withheap", "triage", "full"])))]
struct Cli
{
    /// Process ID (PID) to dump
    pid: u32,

    /// Dump path template; %p/%d pid, %e executable, %h host, %t time, %% literal %
    #[arg(short = 'f', long = "name", value_name = "PATH")]
    name: Option<String>,

    /// Minimum dump: module data segments and thread info
    #[arg(short = 'n', long)]
    normal: bool,

    /// Add private read/write memory (the default)
    #[arg(short = 'h', long)]
    withheap: bool,

    /// Triage dump: only what the runtime marks as essential
    #[arg(short = 't', long)]
    triage: bool,

    /// Every readable mapping
    #[arg(short = 'u', long)]
    full: bool,

    /// Log each region as it is written
    #[arg(short = 'd', long)]
    diag: bool,

    /// Trace-level logging
    #[arg(long)]
    verbose: bool,

    /// Also write the log to this file
    #[arg(long, value_name = "PATH")]
    logtofile: Option<PathBuf>,

    /// Thread whose state is written first
    #[arg(long, value_name = "TID")]
    crashthread: Option<u64>,

    /// Signal recorded for the crashing thread
    #[arg(long, value_name = "NUMBER")]
    signal: Option<i32>,

    /// Data access component to load instead of the one next to the runtime
    #[arg(long, value_name = "PATH")]
    dac: Option<PathBuf>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Cli
{
    fn kind(&self) -> DumpKind
    {
        if self.normal {
            DumpKind::Normal
        } else if self.triage {
            DumpKind::Triage
        } else if self.full {
            DumpKind::Full
        } else {
            DumpKind::WithHeap
        }
    }

    fn config(&self) -> DumpConfig
    {
        let mut config = DumpConfig::new(ProcessId(self.pid));
        config.name_template = self.name.clone();
        config.kind = self.kind();
        config.diagnostics = self.diag;
        config.verbose = self.verbose;
        config.crash_thread = self.crashthread.map(ThreadId);
        config.signal = self.signal;
        config.dac_path = self.dac.clone();
        config
    }
}

fn main()
{
    let cli = Cli::parse();

    // Hold the guard until exit so the log file is flushed
    let options = LoggingOptions::from_flags(cli.verbose, cli.diag, cli.logtofile.clone());
    let _guard = match init_logging(&options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            process::exit(1);
        }
    };

    let config = cli.config();
    info!("Gathering state for process {} ({})", config.pid, config.kind);

    match run(&config) {
        Ok(path) => {
            info!("Dump successfully written to {}", path.display());
        }
        Err(e) => {
            error!("Failure writing dump: {} ({})", e, e.category());
            eprintln!("Error: {} ({})", e, e.category());
            process::exit(1);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run(config: &DumpConfig) -> createdump_core::Result<PathBuf>
{
    createdump_core::dump::create_dump(config)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn run(_config: &DumpConfig) -> createdump_core::Result<PathBuf>
{
    Err(createdump_core::DumpError::UnsupportedArchitecture(std::env::consts::OS.to_string()))
}
