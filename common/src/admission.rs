//! Admission control: may a transfer run given the current host resources?
//!
//! The decision is a pure function of a [`ResourceSnapshot`] and the configured
//! [`ThresholdConfig`]: no I/O, no clocks, no state. It is evaluated on every service tick.

use std::path::PathBuf;

use serde::Serialize;

use crate::config::ThresholdConfig;
use crate::resources::ResourceSnapshot;

/// Why a transfer must not run right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DenyReason {
    CpuTooHigh,
    MemoryTooLow,
    BlacklistedProcessRunning,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DenyReason::CpuTooHigh => "CPU usage too high",
            DenyReason::MemoryTooLow => "available memory too low",
            DenyReason::BlacklistedProcessRunning => "blacklisted process running",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdmissionVerdict {
    Allow,
    Deny(DenyReason),
}

impl AdmissionVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, AdmissionVerdict::Allow)
    }
}

/// Decide whether a transfer may run.
///
/// Checks are done in a fixed order and the first failing one is reported:
/// CPU usage, then available memory, then blacklisted processes.
pub fn evaluate(snapshot: &ResourceSnapshot, thresholds: &ThresholdConfig) -> AdmissionVerdict {
    if snapshot.cpu_percent_all_cores > thresholds.max_cpu_usage_percent as f32 {
        return AdmissionVerdict::Deny(DenyReason::CpuTooHigh);
    }
    if snapshot.available_memory_mb < thresholds.min_available_memory_mb {
        return AdmissionVerdict::Deny(DenyReason::MemoryTooLow);
    }
    if blacklisted_processes(snapshot, thresholds).next().is_some() {
        return AdmissionVerdict::Deny(DenyReason::BlacklistedProcessRunning);
    }
    AdmissionVerdict::Allow
}

/// Names of the blacklisted processes present in the snapshot.
pub fn blacklisted_processes<'a>(
    snapshot: &'a ResourceSnapshot,
    thresholds: &'a ThresholdConfig,
) -> impl Iterator<Item = &'a str> + 'a {
    snapshot
        .running_process_names
        .intersection(&thresholds.blacklisted_process_names)
        .map(String::as_str)
}

/// Monitored drives whose free space dropped below their threshold, with the free space (MB).
///
/// Low space is reported, it does not gate admission.
pub fn low_space_drives(
    snapshot: &ResourceSnapshot,
    thresholds: &ThresholdConfig,
) -> Vec<(PathBuf, u64)> {
    thresholds
        .space_monitoring
        .iter()
        .filter_map(|drive| {
            let free = *snapshot.drive_free_space_mb.get(&drive.path)?;
            (free < drive.space_threshold_mb).then(|| (drive.path.clone(), free))
        })
        .collect()
}
