//! Transfer controller: the state machine supervising a single bulk transfer
//!
//! ```text
//!            start_transfer                    tick(Deny)
//!  Stopped ─────────────────► Active ◄──────────────────► Paused
//!     ▲                        │          tick(Allow)       │
//!     └──── Completed ─────────┴────────────────────────────┘
//!
//!  any state ── shutdown ──► DoNothing (terminal)
//! ```
//!
//! Ticks and engine events may come from different tasks. Every mutation (task creation,
//! state transitions, manifest appends) happens under one mutex, engine commands are
//! fire-and-forget so the lock is only ever held for the time it takes to issue one.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::admission::{self, AdmissionVerdict};
use crate::config::ThresholdConfig;
use crate::conv;
use crate::engine::{CopyEngine, CopyFlags, CopyOptions, EngineEvent};
use crate::fs_utils;
use crate::progress::{FileCounts, ProgressTracker};
use crate::resources::ResourceSnapshot;
use crate::timeutils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    Stopped,
    Active,
    Paused,
    /// Shutdown sentinel, no transitions happen anymore
    DoNothing,
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferState::Stopped => "Stopped",
            TransferState::Active => "Active",
            TransferState::Paused => "Paused",
            TransferState::DoNothing => "DoNothing",
        };
        write!(f, "{name}")
    }
}

/// One in-flight (or just completed) transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferTask {
    pub source_path: PathBuf,
    /// Staging location: last component of the source below the temporary transfer root
    pub target_temp_path: PathBuf,
    /// Computed once when the task is created
    pub total_size_bytes: u64,
    pub started_at: chrono::DateTime<chrono::Local>,
    pub transfer_in_progress: bool,
    /// Set when the engine aborted the whole transfer
    pub completion_error: Option<String>,
}

/// Produced once per task when the engine reports completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub source_path: PathBuf,
    pub target_temp_path: PathBuf,
    pub total_size_bytes: u64,
    pub elapsed_secs: i64,
    pub counts: FileCounts,
    pub manifest: Vec<String>,
    pub error: Option<String>,
}

impl std::fmt::Display for TransferReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "source: {}\nstaging: {}\ntotal size: {}\nelapsed: {}\nfiles: {}",
            self.source_path.display(),
            self.target_temp_path.display(),
            conv::bytes_to_string(self.total_size_bytes),
            timeutils::seconds_to_human(self.elapsed_secs),
            self.counts,
        )?;
        if let Some(error) = &self.error {
            writeln!(f, "error: {error}")?;
        }
        for entry in &self.manifest {
            writeln!(f, "  {entry}")?;
        }
        Ok(())
    }
}

/// Externally observable status, read by the status file writer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferStatus {
    pub state: TransferState,
    pub task: Option<TransferTask>,
    pub last_verdict: Option<AdmissionVerdict>,
    pub progress_percent: u8,
    pub counts: FileCounts,
    pub manifest: Vec<String>,
    /// Human-readable start time of the task, e.g. "5 minutes ago"
    pub started: Option<String>,
}

struct Inner<E> {
    state: TransferState,
    task: Option<TransferTask>,
    progress: ProgressTracker,
    last_verdict: Option<AdmissionVerdict>,
    engine: E,
}

pub struct TransferController<E> {
    inner: Mutex<Inner<E>>,
    thresholds: ThresholdConfig,
    tmp_root: PathBuf,
}

impl<E: CopyEngine> TransferController<E> {
    /// `tmp_root` is the directory below which transfers are staged.
    pub fn new(engine: E, thresholds: ThresholdConfig, tmp_root: PathBuf) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: TransferState::Stopped,
                task: None,
                progress: ProgressTracker::new(),
                last_verdict: None,
                engine,
            }),
            thresholds,
            tmp_root,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    fn copy_options(&self, source: &Path, destination: PathBuf) -> CopyOptions {
        CopyOptions {
            source: source.to_path_buf(),
            destination,
            copy_flags: CopyFlags::for_transfer(self.thresholds.enforce_inherited_acls),
            include_empty_subdirectories: true,
            exclude_older: true,
            retry_count: self.thresholds.retry_count,
            retry_wait: self.thresholds.retry_wait(),
            inter_packet_gap: self.thresholds.inter_packet_gap(),
        }
    }

    /// Start transferring `source`, only accepted while Stopped.
    ///
    /// `total_size_bytes` is measured by the caller, off the driver task.
    ///
    /// Returns false if the request was ignored or the engine refused the command; neither is
    /// an error, the next tick simply tries again.
    pub fn start_transfer(&self, source: &Path, total_size_bytes: u64) -> bool {
        let Some(target_temp_path) = fs_utils::staging_path(&self.tmp_root, source) else {
            tracing::error!("cannot derive a staging path for {:?}", source);
            return false;
        };
        let options = self.copy_options(source, target_temp_path.clone());
        let mut inner = self.lock();
        if inner.state != TransferState::Stopped {
            tracing::debug!("ignoring start of {:?} in state {}", source, inner.state);
            return false;
        }
        tracing::debug!("starting copy engine with {:?}", &options);
        if let Err(error) = inner.engine.start(options) {
            tracing::error!("failed to start transfer of {:?}: {}", source, error);
            return false;
        }
        inner.task = Some(TransferTask {
            source_path: source.to_path_buf(),
            target_temp_path,
            total_size_bytes,
            started_at: chrono::Local::now(),
            transfer_in_progress: true,
            completion_error: None,
        });
        inner.progress.reset();
        inner.state = TransferState::Active;
        tracing::info!(
            "Transfer started, total size: {}",
            conv::bytes_to_string(total_size_bytes)
        );
        true
    }

    /// Pause the running transfer, only accepted while Active.
    pub fn pause_transfer(&self) -> bool {
        self.lock().pause()
    }

    /// Resume the paused transfer, only accepted while Paused.
    pub fn resume_transfer(&self) -> bool {
        self.lock().resume()
    }

    /// Evaluate admission for `snapshot` and pause/resume the transfer accordingly.
    pub fn tick(&self, snapshot: &ResourceSnapshot) -> AdmissionVerdict {
        let verdict = admission::evaluate(snapshot, &self.thresholds);
        let mut inner = self.lock();
        if inner.state == TransferState::DoNothing {
            return verdict;
        }
        inner.last_verdict = Some(verdict);
        match (inner.state, verdict) {
            (TransferState::Active, AdmissionVerdict::Deny(reason)) => {
                tracing::info!("Pausing transfer: {}", reason);
                inner.pause();
            }
            (TransferState::Paused, AdmissionVerdict::Allow) => {
                tracing::info!("Resources available again, resuming transfer");
                inner.resume();
            }
            _ => {}
        }
        verdict
    }

    /// Feed one engine event, returns the transfer report when it completed the task.
    pub fn handle_event(&self, event: EngineEvent) -> Option<TransferReport> {
        let mut inner = self.lock();
        if inner.state == TransferState::DoNothing {
            tracing::trace!("shutting down, dropping {:?}", event);
            return None;
        }
        match event {
            EngineEvent::FileProcessed(file) => {
                if inner.task.is_none() {
                    tracing::debug!("no transfer task, dropping file event for {}", file.name);
                    return None;
                }
                inner.progress.on_file_event(&file);
                None
            }
            EngineEvent::ProgressChanged(percent) => {
                if !matches!(inner.state, TransferState::Active | TransferState::Paused) {
                    return None;
                }
                if let Some(bucket) = inner.progress.on_progress(percent) {
                    tracing::info!("Transfer progress {}%", bucket);
                }
                None
            }
            EngineEvent::Completed { error } => inner.complete(error),
        }
    }

    /// Disable all further transitions, asking the engine to stop a running transfer.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if inner.state == TransferState::DoNothing {
            return;
        }
        let stopped = match inner.state {
            TransferState::Active | TransferState::Paused => inner.engine.stop(),
            _ => Ok(()),
        };
        if let Err(error) = stopped {
            tracing::warn!("failed to stop copy engine: {}", error);
        }
        inner.state = TransferState::DoNothing;
        tracing::info!("Shutting down, transfer control disabled");
    }

    pub fn state(&self) -> TransferState {
        self.lock().state
    }

    /// Current task; a completed task is kept until the next start replaces it.
    pub fn task(&self) -> Option<TransferTask> {
        self.lock().task.clone()
    }

    pub fn is_transfer_in_progress(&self) -> bool {
        self.lock()
            .task
            .as_ref()
            .is_some_and(|task| task.transfer_in_progress)
    }

    pub fn manifest(&self) -> Vec<String> {
        self.lock().progress.manifest().to_vec()
    }

    pub fn progress_bucket(&self) -> u8 {
        self.lock().progress.bucket()
    }

    pub fn status(&self) -> TransferStatus {
        let inner = self.lock();
        TransferStatus {
            state: inner.state,
            task: inner.task.clone(),
            last_verdict: inner.last_verdict,
            progress_percent: inner.progress.bucket(),
            counts: inner.progress.counts(),
            manifest: inner.progress.manifest().to_vec(),
            started: inner
                .task
                .as_ref()
                .map(|task| timeutils::seconds_to_human(timeutils::seconds_since(task.started_at))),
        }
    }
}

impl<E: CopyEngine> Inner<E> {
    fn pause(&mut self) -> bool {
        if self.state != TransferState::Active {
            tracing::debug!("ignoring pause in state {}", self.state);
            return false;
        }
        if let Err(error) = self.engine.pause() {
            tracing::error!("failed to pause transfer: {}", error);
            return false;
        }
        self.state = TransferState::Paused;
        tracing::info!("Transfer paused");
        true
    }

    fn resume(&mut self) -> bool {
        if self.state != TransferState::Paused {
            tracing::debug!("ignoring resume in state {}", self.state);
            return false;
        }
        if let Err(error) = self.engine.resume() {
            tracing::error!("failed to resume transfer: {}", error);
            return false;
        }
        self.state = TransferState::Active;
        tracing::info!("Transfer resumed");
        true
    }

    fn complete(&mut self, error: Option<String>) -> Option<TransferReport> {
        // a pause may have been issued after the engine already finished
        if !matches!(self.state, TransferState::Active | TransferState::Paused) {
            tracing::debug!("ignoring completion in state {}", self.state);
            return None;
        }
        if let Err(error) = self.engine.stop() {
            tracing::warn!("failed to stop copy engine: {}", error);
        }
        self.engine.dispose();
        self.state = TransferState::Stopped;
        let task = self.task.as_mut()?;
        task.transfer_in_progress = false;
        task.completion_error.clone_from(&error);
        let report = TransferReport {
            source_path: task.source_path.clone(),
            target_temp_path: task.target_temp_path.clone(),
            total_size_bytes: task.total_size_bytes,
            elapsed_secs: timeutils::seconds_since(task.started_at),
            counts: self.progress.counts(),
            manifest: self.progress.manifest().to_vec(),
            error,
        };
        match &report.error {
            Some(error) => tracing::warn!(
                "Transfer of {:?} aborted: {}",
                &report.source_path,
                error
            ),
            None => tracing::info!(
                "Transfer of {:?} completed, {}",
                &report.source_path,
                report.counts
            ),
        }
        Some(report)
    }
}
