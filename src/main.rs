//! ftrace-mux: set up ftrace for one or more tracing configs at once.
//!
//! `events` shows what a config resolves to, `record` sets up every config
//! as its own session, leaves tracing on until Ctrl-C (or the duration runs
//! out) and tears everything down again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use protobuf::Enum;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

use ftrace_mux::vendor_events::load_vendor_events;
use ftrace_mux::{
    AtraceCommand, AtraceWrapper, EventTable, FtraceBackend, FtraceConfig, FtraceConfigId,
    FtraceConfigMuxer, FtraceSetupErrors, SyscallTable, Tracefs, TranslationTable, VendorEvents,
};

#[derive(Parser)]
#[command(name = "ftrace-mux")]
#[command(about = "Multiplex tracing configs onto the kernel's ftrace")]
#[command(version)]
struct Cli {
    /// Enable debug logging. RUST_LOG overrides this.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// tracefs mount point, discovered if not given
    #[arg(long, global = true)]
    tracefs: Option<PathBuf>,

    /// Use (and create if needed) this secondary ftrace instance
    #[arg(long, global = true)]
    instance: Option<String>,

    /// File with extra ftrace events per atrace category
    #[arg(long, global = true)]
    vendor_categories: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the ftrace events a config resolves to
    Events {
        /// Path to a JSON config
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Trace with one session per config until Ctrl-C
    Record {
        /// Paths to JSON configs, one session each
        #[arg(short, long, required = true, num_args = 1..)]
        config: Vec<PathBuf>,

        /// Stop after this many seconds, 0 waits for Ctrl-C
        #[arg(short, long, default_value = "0")]
        duration: u64,
    },
}

#[derive(Serialize)]
struct SessionReport<'a> {
    id: FtraceConfigId,
    config: &'a Path,
    errors: &'a FtraceSetupErrors,
    // Kprobe event id to its KprobeType wire value.
    kprobes: BTreeMap<usize, i32>,
}

fn init_log(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
    {
        eprintln!("failed to init logger: {}", e);
    }
}

fn print_events<B, A, T>(muxer: &FtraceConfigMuxer<B, A, T>, path: &Path) -> Result<()>
where
    B: FtraceBackend,
    A: AtraceWrapper,
    T: EventTable,
{
    let config = FtraceConfig::load(path)?;
    for event in muxer.get_ftrace_events(&config) {
        let known = if muxer.table().get_event(&event).is_some() {
            ""
        } else {
            " (generic)"
        };
        println!("{}{}", event, known);
    }
    Ok(())
}

fn record<B, A, T>(
    muxer: &mut FtraceConfigMuxer<B, A, T>,
    paths: &[PathBuf],
    duration: u64,
) -> Result<()>
where
    B: FtraceBackend,
    A: AtraceWrapper,
    T: EventTable,
{
    let mut ids = Vec::new();
    let mut result = Ok(());
    for (i, path) in paths.iter().enumerate() {
        let id = i as FtraceConfigId + 1;
        let config = match FtraceConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                result = Err(e);
                break;
            }
        };

        let mut errors = FtraceSetupErrors::default();
        let setup = muxer.setup_config(id, &config, Some(&mut errors));
        let kprobes = muxer
            .get_data_source_config(id)
            .map(|ds| {
                ds.kprobes
                    .iter()
                    .map(|(event_id, kind)| (*event_id, kind.value()))
                    .collect()
            })
            .unwrap_or_default();
        let report = SessionReport {
            id,
            config: path,
            errors: &errors,
            kprobes,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        if let Err(e) = setup {
            result = Err(e.context(format!("Failed to set up {}", path.display())));
            break;
        }
        ids.push(id);
    }

    if result.is_ok() {
        for id in &ids {
            if let Err(e) = muxer.activate_config(*id) {
                result = Err(e);
                break;
            }
        }
    }

    if result.is_ok() {
        info!(
            "Tracing with {} session(s), {} pages per CPU, clock {:?} ({})",
            ids.len(),
            muxer.per_cpu_buffer_size_pages(),
            muxer.ftrace_clock(),
            muxer.ftrace_clock().value()
        );
        result = wait_for_stop(duration);
    }

    println!("Stopping...");
    for id in ids {
        if let Err(e) = muxer.remove_config(id) {
            warn!("Failed to remove session {}: {:#}", id, e);
        }
    }
    if let Err(e) = muxer.reset_current_tracer() {
        error!("{:#}", e);
    }
    result
}

fn wait_for_stop(duration: u64) -> Result<()> {
    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Error setting Ctrl-C handler")?;

    if duration > 0 {
        println!("Tracing for {} seconds", duration);
        match stop_rx.recv_timeout(Duration::from_secs(duration)) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(e) => Err(e.into()),
        }
    } else {
        println!("Tracing indefinitely...");
        println!("Press Ctrl-C to stop");
        stop_rx.recv().context("Could not receive signal on channel")
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_log(cli.verbose);

    let mut tracefs = match &cli.tracefs {
        Some(dir) => Tracefs::new(dir),
        None => Tracefs::discover()?,
    };
    let secondary_instance = match &cli.instance {
        Some(name) => {
            tracefs = tracefs.instance(name)?;
            true
        }
        None => false,
    };
    let vendor_events = match &cli.vendor_categories {
        Some(path) => load_vendor_events(path)?,
        None => VendorEvents::new(),
    };

    let table = TranslationTable::create(tracefs.clone());
    if tracefs.is_tracing_enabled() {
        warn!(
            "tracing_on is already set in {}",
            tracefs.root_path().display()
        );
    }
    let mut muxer = FtraceConfigMuxer::new(
        tracefs,
        AtraceCommand::new(),
        table,
        SyscallTable::native(),
        vendor_events,
        secondary_instance,
    );

    match cli.command {
        Commands::Events { config } => print_events(&muxer, &config),
        Commands::Record { config, duration } => record(&mut muxer, &config, duration),
    }
}
