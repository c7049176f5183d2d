//! Configuration types for thresholds, runtime and output settings

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::conv;

/// Number of automatic per-file retries done by the copy engine. Failed files are picked up
/// again by a later re-scan instead.
pub const DEFAULT_RETRY_COUNT: u32 = 0;
/// Wait between per-file retries (seconds).
pub const DEFAULT_RETRY_WAIT_SECS: u64 = 2;

pub const MIN_MAX_CPU_USAGE_PERCENT: u32 = 5;
pub const MIN_AVAILABLE_MEMORY_MB: u64 = 256;
pub const MIN_SERVICE_TIMER: std::time::Duration = std::time::Duration::from_secs(1);

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Tracing configuration for debugging
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Debug log file path, receives TRACE level output regardless of verbosity
    pub debug_log_file: Option<String>,
}

/// A drive (mount point or any path on it) whose free space is monitored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveToCheck {
    pub path: std::path::PathBuf,
    /// Warn when the free space drops below this value (MB)
    pub space_threshold_mb: u64,
}

impl std::str::FromStr for DriveToCheck {
    type Err = String;

    /// Parses `<path>:<threshold MB>`, splitting on the last colon.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (path, threshold) = value
            .rsplit_once(':')
            .ok_or_else(|| format!("expected <path>:<threshold MB>, got {value:?}"))?;
        if path.is_empty() {
            return Err(format!("missing drive path in {value:?}"));
        }
        let space_threshold_mb = threshold
            .trim()
            .parse::<u64>()
            .map_err(|err| format!("invalid space threshold {threshold:?}: {err}"))?;
        Ok(Self {
            path: path.into(),
            space_threshold_mb,
        })
    }
}

/// Validated, read-only thresholds consumed by admission control and the transfer controller.
///
/// Treated as immutable for the lifetime of a controller, reconfiguration requires a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Maximum CPU usage across all cores (percent), transfers are paused above it
    pub max_cpu_usage_percent: u32,
    /// Minimum amount of available memory (MB), transfers are paused below it
    pub min_available_memory_mb: u64,
    /// Transfers are paused while any of these processes is running
    pub blacklisted_process_names: BTreeSet<String>,
    /// Bandwidth limit: wait between packets sent by the copy engine (ms)
    pub inter_packet_gap_ms: u64,
    pub retry_count: u32,
    pub retry_wait_secs: u64,
    /// Copy security (special mode bits) along with the data
    pub enforce_inherited_acls: bool,
    pub space_monitoring: Vec<DriveToCheck>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_cpu_usage_percent: 25,
            min_available_memory_mb: 512,
            blacklisted_process_names: BTreeSet::new(),
            inter_packet_gap_ms: 0,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_wait_secs: DEFAULT_RETRY_WAIT_SECS,
            enforce_inherited_acls: false,
            space_monitoring: Vec::new(),
        }
    }
}

/// All issues found while validating a configuration.
#[derive(Debug, thiserror::Error)]
#[error("configuration issues detected:\n{}", .issues.join("\n"))]
pub struct ValidationError {
    pub issues: Vec<String>,
}

impl ThresholdConfig {
    /// Validate configuration and return every issue found at once
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = vec![];
        if self.max_cpu_usage_percent < MIN_MAX_CPU_USAGE_PERCENT {
            issues.push(format!(
                "max CPU usage must not be smaller than {MIN_MAX_CPU_USAGE_PERCENT}%, got {}%",
                self.max_cpu_usage_percent
            ));
        }
        if self.max_cpu_usage_percent > 100 {
            issues.push(format!(
                "max CPU usage must not exceed 100%, got {}%",
                self.max_cpu_usage_percent
            ));
        }
        if self.min_available_memory_mb < MIN_AVAILABLE_MEMORY_MB {
            issues.push(format!(
                "min available memory must not be smaller than {MIN_AVAILABLE_MEMORY_MB} MB, got {} MB",
                self.min_available_memory_mb
            ));
        }
        if self
            .blacklisted_process_names
            .iter()
            .any(|name| name.trim().is_empty())
        {
            issues.push("blacklisted process names must not be empty".to_string());
        }
        for drive in &self.space_monitoring {
            if drive.space_threshold_mb == 0 {
                issues.push(format!(
                    "space threshold for {:?} is unset (or set to 0)",
                    drive.path
                ));
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }

    pub fn inter_packet_gap(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.inter_packet_gap_ms)
    }

    pub fn retry_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_wait_secs)
    }

    /// Human-readable summary of the thresholds, one setting per line
    pub fn summary(&self) -> String {
        let mut msg = format!(
            "MaxCpuUsage: {}%\n\
            MinAvailableMemory: {}\n\
            InterPacketGap: {} ms\n\
            RetryCount: {} (wait {} s)\n\
            EnforceInheritedACLs: {}\n",
            self.max_cpu_usage_percent,
            conv::megabytes_to_string(self.min_available_memory_mb),
            self.inter_packet_gap_ms,
            self.retry_count,
            self.retry_wait_secs,
            self.enforce_inherited_acls,
        );
        for name in &self.blacklisted_process_names {
            msg.push_str(&format!("BlacklistedProcess: {name}\n"));
        }
        for drive in &self.space_monitoring {
            msg.push_str(&format!(
                "Drive to check free space: {} (threshold: {})\n",
                drive.path.display(),
                conv::megabytes_to_string(drive.space_threshold_mb)
            ));
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = ThresholdConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_count, 0);
        assert_eq!(config.retry_wait(), std::time::Duration::from_secs(2));
    }

    #[test]
    fn validation_collects_all_issues() {
        let config = ThresholdConfig {
            max_cpu_usage_percent: 2,
            min_available_memory_mb: 100,
            blacklisted_process_names: [" ".to_string()].into(),
            space_monitoring: vec![DriveToCheck {
                path: "/data".into(),
                space_threshold_mb: 0,
            }],
            ..Default::default()
        };
        let error = config.validate().unwrap_err();
        assert_eq!(error.issues.len(), 4);
        let message = error.to_string();
        assert!(message.starts_with("configuration issues detected:"));
        assert!(message.contains("max CPU usage"));
        assert!(message.contains("min available memory"));
    }

    #[test]
    fn cpu_above_hundred_is_rejected() {
        let config = ThresholdConfig {
            max_cpu_usage_percent: 101,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_drive_to_check() {
        let drive: DriveToCheck = "/mnt/data:1024".parse().unwrap();
        assert_eq!(drive.path, std::path::PathBuf::from("/mnt/data"));
        assert_eq!(drive.space_threshold_mb, 1024);
        // windows style drive letters keep their colon
        let drive: DriveToCheck = "D:\\:2048".parse().unwrap();
        assert_eq!(drive.path, std::path::PathBuf::from("D:\\"));
        assert!("/mnt/data".parse::<DriveToCheck>().is_err());
        assert!(":10".parse::<DriveToCheck>().is_err());
        assert!("/mnt:abc".parse::<DriveToCheck>().is_err());
    }

    #[test]
    fn summary_lists_everything() {
        let config = ThresholdConfig {
            blacklisted_process_names: ["matlab".to_string()].into(),
            space_monitoring: vec![DriveToCheck {
                path: "/data".into(),
                space_threshold_mb: 2048,
            }],
            ..Default::default()
        };
        let summary = config.summary();
        assert!(summary.contains("MaxCpuUsage: 25%"));
        assert!(summary.contains("MinAvailableMemory: 512 MB"));
        assert!(summary.contains("BlacklistedProcess: matlab"));
        assert!(summary.contains("/data (threshold: 2 GB)"));
    }
}
