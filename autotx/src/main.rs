use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "autotx",
    version,
    about = "Transfer directories to a staging area while the host has resources to spare",
    long_about = "`autotx` copies each source directory into the temporary transfer directory, one at a time.

Before and during every transfer the host resources are checked: the transfer is paused while
CPU usage is too high, available memory is too low or a blacklisted process is running, and
resumed once things are back to normal.

EXAMPLE:
    # Transfer two directories, checking resources every 5 seconds
    autotx /data/incoming/alice /data/incoming/bob --tmp-transfer-dir /data/staging \\
        --service-timer 5s --max-cpu-usage 50 --exit-when-idle --summary"
)]
struct Args {
    // Admission thresholds
    /// Pause transfers while CPU usage across all cores is above this value (percent)
    #[arg(
        long,
        default_value = "25",
        value_name = "PERCENT",
        help_heading = "Admission thresholds"
    )]
    max_cpu_usage: u32,

    /// Pause transfers while available memory is below this value (MB)
    #[arg(
        long,
        default_value = "512",
        value_name = "MB",
        help_heading = "Admission thresholds"
    )]
    min_available_memory: u64,

    /// Pause transfers while a process with this name is running (can be specified multiple times)
    #[arg(long, value_name = "NAME", action = clap::ArgAction::Append, help_heading = "Admission thresholds")]
    blacklisted_process: Vec<String>,

    /// Warn when free space on a drive drops below a threshold, given as PATH:MB (can be specified multiple times)
    #[arg(long, value_name = "PATH:MB", action = clap::ArgAction::Append, help_heading = "Admission thresholds")]
    space_monitoring: Vec<common::DriveToCheck>,

    // Copy options
    /// Directory the sources are transferred into
    #[arg(long, value_name = "PATH", help_heading = "Copy options")]
    tmp_transfer_dir: std::path::PathBuf,

    /// Wait between copied packets (ms), limits the bandwidth used by a transfer
    #[arg(
        long,
        default_value = "0",
        value_name = "MS",
        help_heading = "Copy options"
    )]
    inter_packet_gap: u64,

    /// Number of retries for a failed file, 0 leaves failed files to the next run
    #[arg(long, default_value_t = common::config::DEFAULT_RETRY_COUNT, value_name = "N", help_heading = "Copy options")]
    retry_count: u32,

    /// Wait between retries of a failed file (seconds)
    #[arg(long, default_value_t = common::config::DEFAULT_RETRY_WAIT_SECS, value_name = "SECONDS", help_heading = "Copy options")]
    retry_wait: u64,

    /// Also copy setuid, setgid and sticky bits
    #[arg(long, help_heading = "Copy options")]
    enforce_inherited_acls: bool,

    /// Size of a single copied packet
    #[arg(
        long,
        default_value = "64KiB",
        value_name = "SIZE",
        help_heading = "Copy options"
    )]
    chunk_size: bytesize::ByteSize,

    // Service
    /// Interval between resource checks, e.g. "1s", "30s", "5min"
    #[arg(long, default_value = "1s", value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Service")]
    service_timer: std::time::Duration,

    /// Write the current transfer status as JSON into this file
    #[arg(long, value_name = "PATH", help_heading = "Service")]
    status_file: Option<std::path::PathBuf>,

    /// Exit once all sources were transferred instead of waiting for ctrl-c
    #[arg(long, help_heading = "Service")]
    exit_when_idle: bool,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Write TRACE level logs into this file
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    debug_log_file: Option<String>,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Directories to transfer, in order
    #[arg(required = true)]
    sources: Vec<std::path::PathBuf>,
}

impl Args {
    fn thresholds(&self) -> common::ThresholdConfig {
        common::ThresholdConfig {
            max_cpu_usage_percent: self.max_cpu_usage,
            min_available_memory_mb: self.min_available_memory,
            blacklisted_process_names: self.blacklisted_process.iter().cloned().collect(),
            inter_packet_gap_ms: self.inter_packet_gap,
            retry_count: self.retry_count,
            retry_wait_secs: self.retry_wait,
            enforce_inherited_acls: self.enforce_inherited_acls,
            space_monitoring: self.space_monitoring.clone(),
        }
    }

    fn service_settings(&self) -> common::ServiceSettings {
        common::ServiceSettings {
            tick_interval: self.service_timer,
            tmp_transfer_dir: self.tmp_transfer_dir.clone(),
            status_file: self.status_file.clone(),
            exit_when_idle: self.exit_when_idle,
            packet_size: self.chunk_size.as_u64(),
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<common::ServiceSummary> {
    for source in &args.sources {
        let metadata = tokio::fs::metadata(source)
            .await
            .with_context(|| format!("cannot access source {:?}", source))?;
        if !metadata.is_dir() {
            return Err(anyhow!("source {:?} is not a directory", source));
        }
        if source.file_name().is_none() {
            return Err(anyhow!("source {:?} has no directory name", source));
        }
    }
    common::service::serve(
        args.sources.clone(),
        args.thresholds(),
        args.service_settings(),
    )
    .await
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let tracing = common::TracingConfig {
        debug_log_file: args.debug_log_file.clone(),
    };
    let res = common::run(output, runtime, tracing, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
