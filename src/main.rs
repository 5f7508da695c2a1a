//! `aiocopy <SOURCE> <DESTINATION>`: copy a file through an asynchronous
//! I/O completion facility.

use std::{path::PathBuf, process::ExitCode, time::Duration};

use aiocopy::{
    engine::builder::{DEFAULT_BATCH_CAPACITY, DEFAULT_BLOCK_SIZE, DEFAULT_MIN_DRAIN_THRESHOLD},
    facility::{
        aio::AioFacility, threaded::ThreadedFacility, threaded::DEFAULT_WORKERS,
        uring::UringFacility, Facility,
    },
    CopyConfig, CopyEngine, CopyReport, ProgressPolicy, Result,
};
use clap::{Parser, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// Linux io_uring
    Uring,
    /// Linux native AIO syscalls
    Aio,
    /// Worker threads doing pread/pwrite
    Threads,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Policy {
    Abort,
    Resume,
}

impl From<Policy> for ProgressPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Abort => ProgressPolicy::Abort,
            Policy::Resume => ProgressPolicy::Resume,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Batched asynchronous file copy")]
struct Cli {
    /// File to copy from
    source: PathBuf,
    /// File to create or truncate
    destination: PathBuf,

    /// Bytes per I/O request
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,
    /// Maximum number of outstanding requests
    #[arg(long, default_value_t = DEFAULT_BATCH_CAPACITY)]
    batch_capacity: u32,
    /// Minimum completions gathered per wait
    #[arg(long, default_value_t = DEFAULT_MIN_DRAIN_THRESHOLD)]
    min_drain: usize,
    /// Give up a wait after this many milliseconds (default: wait forever)
    #[arg(long)]
    wait_timeout_ms: Option<u64>,
    /// What to do when only part of a batch is accepted
    #[arg(long, value_enum, default_value = "abort")]
    submit_policy: Policy,
    /// What to do when a write-back is short
    #[arg(long, value_enum, default_value = "abort")]
    write_policy: Policy,
    #[arg(long, value_enum, default_value = "uring")]
    backend: Backend,
    /// Worker threads for the `threads` backend
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(report) => {
            tracing::info!(
                bytes = report.bytes_copied,
                rounds = report.rounds,
                completions = report.completions,
                wait_calls = report.wait_calls,
                "copied {} to {} in {:?}",
                cli.source.display(),
                cli.destination.display(),
                report.elapsed
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("aiocopy: {} failed: {}", err.phase(), err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<CopyReport> {
    let mut builder = CopyConfig::builder()
        .block_size(cli.block_size)
        .batch_capacity(cli.batch_capacity)
        .min_drain_threshold(cli.min_drain)
        .submit_policy(cli.submit_policy.into())
        .write_policy(cli.write_policy.into());
    if let Some(ms) = cli.wait_timeout_ms {
        builder = builder.wait_timeout(Duration::from_millis(ms));
    }
    let config = builder.build()?;

    match cli.backend {
        Backend::Uring => copy_with(cli, config, UringFacility::new()),
        Backend::Aio => copy_with(cli, config, AioFacility::new()),
        Backend::Threads => copy_with(cli, config, ThreadedFacility::new(cli.workers)),
    }
}

fn copy_with<F: Facility>(cli: &Cli, config: CopyConfig, facility: F) -> Result<CopyReport> {
    tracing::debug!(backend = facility.name(), ?config, "Starting copy");
    let engine = CopyEngine::new(config, facility)?;
    engine.copy_path(&cli.source, &cli.destination)
}
