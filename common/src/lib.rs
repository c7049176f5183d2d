//! AutoTx core: supervises a single bulk transfer on behalf of a background service
//!
//! A periodic driver ([`service::run_service`]) pulls a [`resources::ResourceSnapshot`] on every
//! tick and hands it to the [`controller::TransferController`]. The controller asks
//! [`admission::evaluate`] whether the host may carry a transfer right now and pauses or
//! resumes the [`engine::CopyEngine`] accordingly. File and progress events coming back from
//! the engine are fed into a [`progress::ProgressTracker`] which keeps the manifest of newly
//! transferred files.
//!
//! # Transfer states
//!
//! - `Stopped`: no transfer running, the next queued source may be started
//! - `Active`: the engine is copying
//! - `Paused`: admission denied, the engine was asked to pause
//! - `DoNothing`: shutdown, every further event or tick is ignored
//!
//! # Logging
//!
//! Verbosity follows the number of `-v` flags: 0 = ERROR, 1 = INFO, 2 = DEBUG, 3 = TRACE.
//! `RUST_LOG` overrides it. A debug log file, if configured, always receives TRACE output.

use std::future::Future;

use tracing_subscriber::{
    Layer, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

pub mod admission;
pub mod config;
pub mod controller;
pub mod conv;
pub mod engine;
pub mod fs_utils;
pub mod local_engine;
pub mod progress;
pub mod resources;
pub mod service;
pub mod timeutils;

#[cfg(test)]
mod testutils;

pub use config::{DriveToCheck, OutputConfig, RuntimeConfig, ThresholdConfig, TracingConfig};
pub use controller::{TransferController, TransferState};
pub use service::{ServiceSettings, ServiceSummary};

fn verbosity_filter(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(output: &OutputConfig, tracing_config: &TracingConfig) -> anyhow::Result<()> {
    let stdout_layer = if output.quiet {
        None
    } else {
        let filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(verbosity_filter(output.verbose).into())
            .from_env_lossy();
        Some(
            fmt::layer()
                .with_target(output.verbose >= 2)
                .with_filter(filter),
        )
    };
    let file_layer = match &tracing_config.debug_log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|error| {
                    anyhow::anyhow!("cannot open debug log file {:?}: {}", path, error)
                })?;
            Some(
                fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_filter(LevelFilter::TRACE),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Set up logging and the tokio runtime, then run `func` to completion.
///
/// Errors are printed to stderr (unless quiet) and turned into `None`, the caller decides on
/// the exit code.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing_config: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: Future<Output = Result<Summary, Error>>,
{
    if let Err(error) = init_tracing(&output, &tracing_config) {
        eprintln!("{error:#}");
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            eprintln!("failed to start tokio runtime: {error}");
            return None;
        }
    };
    let start = std::time::Instant::now();
    let res = tokio_runtime.block_on(func());
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
                println!("walltime: {:.2?}", start.elapsed());
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
