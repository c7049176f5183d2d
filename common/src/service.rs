//! Periodic driver: ticks admission control, forwards engine events and starts queued transfers
//!
//! Ticks, engine events and the shutdown signal are all consumed by one task, so the
//! controller sees them strictly one after another.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::admission;
use crate::config::{MIN_SERVICE_TIMER, ThresholdConfig};
use crate::controller::{TransferController, TransferReport, TransferState, TransferStatus};
use crate::conv;
use crate::engine::{CopyEngine, EventReceiver, event_channel};
use crate::fs_utils;
use crate::local_engine::LocalCopyEngine;
use crate::resources::{ResourceCollector, SysinfoCollector};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Interval between admission checks
    pub tick_interval: std::time::Duration,
    /// Root directory transfers are staged in
    pub tmp_transfer_dir: PathBuf,
    /// Write the transfer status as JSON to this file after every tick
    pub status_file: Option<PathBuf>,
    /// Exit once every queued source was transferred
    pub exit_when_idle: bool,
    /// Copy engine packet size (bytes)
    pub packet_size: u64,
}

impl ServiceSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval < MIN_SERVICE_TIMER {
            return Err(format!(
                "service timer must be at least {:?}, got {:?}",
                MIN_SERVICE_TIMER, self.tick_interval
            ));
        }
        if self.packet_size == 0 {
            return Err("chunk size must be greater than 0".to_string());
        }
        // the transfer dir itself is created on the first start, its parent must be there
        let parent = match self.tmp_transfer_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if !parent.is_dir() {
            return Err(format!(
                "can't find (or reach) the parent of the temporary transfer dir: {:?}",
                &self.tmp_transfer_dir
            ));
        }
        if self.tmp_transfer_dir.exists() && !self.tmp_transfer_dir.is_dir() {
            return Err(format!(
                "temporary transfer dir {:?} is not a directory",
                &self.tmp_transfer_dir
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub ticks: u64,
    pub transfers_started: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub files_new: u64,
    pub bytes_new: u64,
}

impl ServiceSummary {
    fn record(&mut self, report: &TransferReport) {
        self.transfers_completed += 1;
        if report.error.is_some() {
            self.transfers_failed += 1;
        }
        self.files_new += report.counts.new;
        self.bytes_new += report.counts.bytes_new;
    }
}

impl std::fmt::Display for ServiceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ticks: {}\n\
            transfers started: {}\n\
            transfers completed: {}\n\
            transfers failed: {}\n\
            new files: {}\n\
            bytes transferred: {}\n",
            self.ticks,
            self.transfers_started,
            self.transfers_completed,
            self.transfers_failed,
            self.files_new,
            conv::bytes_to_string(self.bytes_new),
        )
    }
}

#[derive(Serialize)]
struct StatusFile<'a> {
    updated_at: chrono::DateTime<chrono::Local>,
    status: TransferStatus,
    queued: Vec<&'a Path>,
    summary: &'a ServiceSummary,
}

async fn write_status_file(
    path: &Path,
    status: TransferStatus,
    queue: &VecDeque<PathBuf>,
    summary: &ServiceSummary,
) -> Result<()> {
    let contents = serde_json::to_vec_pretty(&StatusFile {
        updated_at: chrono::Local::now(),
        status,
        queued: queue.iter().map(PathBuf::as_path).collect(),
        summary,
    })?;
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    tokio::fs::write(&tmp_path, contents)
        .await
        .with_context(|| format!("failed writing status file {:?}", &tmp_path))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("failed moving status file into {:?}", path))?;
    Ok(())
}

async fn update_status_file<E: CopyEngine>(
    settings: &ServiceSettings,
    controller: &TransferController<E>,
    queue: &VecDeque<PathBuf>,
    summary: &ServiceSummary,
) {
    let Some(path) = &settings.status_file else {
        return;
    };
    if let Err(error) = write_status_file(path, controller.status(), queue, summary).await {
        tracing::warn!("{:#}", &error);
    }
}

type Sizing = tokio::task::JoinHandle<(PathBuf, u64)>;

/// Resolves once the pending size measurement finished, never without one.
async fn sizing_done(
    sizing: &mut Option<Sizing>,
) -> Result<(PathBuf, u64), tokio::task::JoinError> {
    match sizing {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Drive `controller` until `shutdown` resolves, or until idle when `exit_when_idle` is set.
///
/// Sources in `queue` are started one at a time whenever the controller is stopped and the
/// host resources allow it.
pub async fn run_service<E, C, S>(
    controller: Arc<TransferController<E>>,
    mut collector: C,
    mut events: EventReceiver,
    mut queue: VecDeque<PathBuf>,
    settings: &ServiceSettings,
    shutdown: S,
) -> Result<ServiceSummary>
where
    E: CopyEngine,
    C: ResourceCollector,
    S: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(settings.tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);
    let mut summary = ServiceSummary::default();
    let mut low_space = BTreeSet::new();
    // the front of the queue is measured on the blocking pool before it is started
    let mut sizing: Option<Sizing> = None;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested");
                controller.shutdown();
                break;
            }
            Some(event) = events.recv() => {
                let Some(report) = controller.handle_event(event) else {
                    continue;
                };
                summary.record(&report);
                tracing::info!("Transfer report:\n{}", &report);
            }
            measured = sizing_done(&mut sizing), if sizing.is_some() => {
                sizing = None;
                match measured {
                    Ok((source, total_size_bytes)) => {
                        if queue.front() == Some(&source)
                            && controller.start_transfer(&source, total_size_bytes)
                        {
                            queue.pop_front();
                            summary.transfers_started += 1;
                        }
                    }
                    Err(error) => tracing::error!("failed measuring the next source: {}", error),
                }
            }
            _ = interval.tick() => {
                summary.ticks += 1;
                let snapshot = collector.snapshot();
                let verdict = controller.tick(&snapshot);
                let now_low = admission::low_space_drives(&snapshot, controller.thresholds());
                let low_paths: BTreeSet<_> = now_low.iter().map(|(path, _)| path.clone()).collect();
                if low_paths != low_space {
                    for (path, free_mb) in &now_low {
                        tracing::warn!(
                            "low free space on {:?}: {} left",
                            path,
                            conv::megabytes_to_string(*free_mb)
                        );
                    }
                    if now_low.is_empty() {
                        tracing::info!("free space is back above all thresholds");
                    }
                    low_space = low_paths;
                }
                if controller.state() == TransferState::Stopped && sizing.is_none() {
                    if let Some(source) = queue.front().cloned() {
                        if verdict.is_allow() {
                            tracing::debug!("measuring {:?}", &source);
                            sizing = Some(tokio::task::spawn_blocking(move || {
                                let total_size_bytes = fs_utils::directory_size(&source);
                                (source, total_size_bytes)
                            }));
                        } else {
                            tracing::debug!("not starting {:?} yet: {:?}", &source, verdict);
                        }
                    } else if settings.exit_when_idle {
                        tracing::info!("Nothing left to transfer");
                        break;
                    }
                }
            }
        }
        update_status_file(settings, &controller, &queue, &summary).await;
    }
    update_status_file(settings, &controller, &queue, &summary).await;
    if !queue.is_empty() {
        tracing::info!("{} source(s) were not transferred", queue.len());
    }
    Ok(summary)
}

/// Transfer every source with the local copy engine, admission-controlled by host resources.
pub async fn serve(
    sources: Vec<PathBuf>,
    thresholds: ThresholdConfig,
    settings: ServiceSettings,
) -> Result<ServiceSummary> {
    thresholds.validate()?;
    settings.validate().map_err(|error| anyhow::anyhow!(error))?;
    tracing::info!("Thresholds:\n{}", thresholds.summary());
    let collector = SysinfoCollector::new(&thresholds.space_monitoring);
    let (events_tx, events_rx) = event_channel();
    let engine = LocalCopyEngine::new(events_tx, settings.packet_size);
    let controller = Arc::new(TransferController::new(
        engine,
        thresholds,
        settings.tmp_transfer_dir.clone(),
    ));
    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("failed listening for ctrl-c: {}", error);
            std::future::pending::<()>().await;
        }
    };
    run_service(
        controller,
        collector,
        events_rx,
        sources.into(),
        &settings,
        shutdown,
    )
    .await
}
