//! deploylog-daemon - Watched-folder daemon for deployment log verification
//!
//! Watches a drop directory for deployment-log packages, validates them and
//! files them into the weekly archive hierarchy.
//!
//! # Commands
//!
//! - `run` (default): poll until SIGINT or SIGTERM
//! - `once`: process everything currently in the watched directory and exit
//! - `check <ARCHIVE>`: validate one archive and print the verdict as JSON,
//!   without archiving or notifying
//!
//! # Threads
//!
//! The monitor runs on its own OS thread and never touches the Tokio
//! runtime. The runtime only waits for Unix signals and for the monitor to
//! finish. Activity lines are drained by a separate writer thread so a slow
//! terminal or disk never stalls the pipeline.

mod state;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use deploylog_core::monitor::ActivityLine;
use deploylog_core::{IngestLoop, MonitorConfig, Pipeline, spawn_monitor};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::state::DaemonStateHandle;

/// deploylog daemon - deployment log verification
#[derive(Parser, Debug)]
#[command(name = "deploylog-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "deploylog.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Append activity lines to this file instead of stdout
    #[arg(long)]
    activity_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Poll the watched directory until interrupted
    Run,
    /// Process the watched directory once and exit
    Once,
    /// Validate a single archive without archiving it
    Check {
        /// Zip archive to validate
        archive: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = MonitorConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Run => {
            let runtime =
                tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
            runtime.block_on(run(&args, &config))
        },
        Command::Once => run_once(config),
        Command::Check { archive } => check(&config, &archive),
    }
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

async fn run(args: &Args, config: &MonitorConfig) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    let mut handle = spawn_monitor(config).context("failed to start monitor")?;
    let state = Arc::new(DaemonStateHandle::new(
        handle.stop_signal(),
        handle.status_cell(),
    ));
    let sink = match handle.take_activity() {
        Some(activity) => Some(spawn_activity_sink(activity, args.activity_file.as_deref())?),
        None => None,
    };

    info!(
        config = %args.config.display(),
        watch_dir = %config.monitor.watch_dir.display(),
        "deploylog daemon started"
    );

    let signal_state = state.clone();
    let signal_task = tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
        signal_state.request_shutdown();
    });

    let mut monitor_task = tokio::task::spawn_blocking(move || handle.join());

    let finished = tokio::select! {
        _ = signal_task => None,
        result = &mut monitor_task => Some(result),
    };
    let joined = match finished {
        Some(result) => {
            if !state.is_shutdown_requested() {
                warn!("Monitor exited without a shutdown request");
            }
            result
        },
        None => {
            info!("Signal handler triggered shutdown, waiting for current file");
            monitor_task.await
        },
    };
    if !joined.unwrap_or(false) {
        error!("Monitor thread panicked");
    }

    if let Some(sink) = sink {
        if sink.join().is_err() {
            error!("Activity writer thread panicked");
        }
    }

    let status = state.status();
    info!(
        uptime_secs = state.uptime_secs(),
        processed = status.processed,
        failed = status.failed,
        "deploylog daemon stopped"
    );
    Ok(())
}

fn run_once(mut config: MonitorConfig) -> Result<()> {
    // A single pass cannot wait for files to settle.
    config.monitor.settle_polls = false;

    let mut ingest = IngestLoop::from_config(&config).context("failed to start monitor")?;
    let summary = ingest.poll_once().context("poll failed")?;
    info!(
        processed = summary.processed,
        failed = summary.failed,
        rejected = summary.rejected,
        "single pass finished"
    );
    if summary.failed > 0 {
        bail!("{} file(s) failed and will be retried", summary.failed);
    }
    Ok(())
}

fn check(config: &MonitorConfig, archive: &Path) -> Result<()> {
    let result = Pipeline::from_config(config)
        .check_archive(archive)
        .with_context(|| format!("failed to check {}", archive.display()))?;

    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &result).context("failed to write verdict")?;
    writeln!(stdout).context("failed to write verdict")?;

    if !result.verdict.passed() {
        bail!("{}", result.verdict.summary);
    }
    Ok(())
}

/// Drain the activity feed into `path`, or stdout when no path is given.
fn spawn_activity_sink(
    activity: Receiver<ActivityLine>,
    path: Option<&Path>,
) -> Result<JoinHandle<()>> {
    let mut out: Box<dyn Write + Send> = match path {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open activity file {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };

    std::thread::Builder::new()
        .name("deploylog-activity".to_string())
        .spawn(move || {
            for line in activity {
                if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
                    warn!(error = %e, "failed to write activity line");
                }
            }
        })
        .context("failed to spawn activity writer")
}
