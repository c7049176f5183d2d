//! Host resource snapshots used for admission control

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::DriveToCheck;
use crate::conv;

/// Point-in-time view of the host resources relevant for admission control.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    /// CPU usage averaged across all cores (percent)
    pub cpu_percent_all_cores: f32,
    pub available_memory_mb: u64,
    pub running_process_names: BTreeSet<String>,
    /// Free space (MB) for every monitored drive that could be resolved
    pub drive_free_space_mb: BTreeMap<PathBuf, u64>,
}

/// Source of resource snapshots, pulled once per service tick.
pub trait ResourceCollector: Send {
    fn snapshot(&mut self) -> ResourceSnapshot;
}

/// Collects resource snapshots from the running host via `sysinfo`.
pub struct SysinfoCollector {
    system: sysinfo::System,
    drives: Vec<PathBuf>,
}

impl SysinfoCollector {
    pub fn new(space_monitoring: &[DriveToCheck]) -> Self {
        let mut system = sysinfo::System::new();
        // cpu usage is computed as a delta between two refreshes, prime the first one
        system.refresh_cpu_usage();
        Self {
            system,
            drives: space_monitoring
                .iter()
                .map(|drive| drive.path.clone())
                .collect(),
        }
    }

    fn drive_free_space_mb(&self) -> BTreeMap<PathBuf, u64> {
        if self.drives.is_empty() {
            return BTreeMap::new();
        }
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut free_space = BTreeMap::new();
        for drive in &self.drives {
            match best_mount_match(drive, disks.iter().map(|disk| disk.mount_point())) {
                Some(idx) => {
                    let available = disks.list()[idx].available_space();
                    free_space.insert(drive.clone(), available / conv::MEGA_BYTES);
                }
                None => {
                    tracing::warn!("no mounted disk found for monitored drive {:?}", drive);
                }
            }
        }
        free_space
    }
}

impl ResourceCollector for SysinfoCollector {
    fn snapshot(&mut self) -> ResourceSnapshot {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.system
            .refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        let running_process_names = self
            .system
            .processes()
            .values()
            .map(|process| process.name().to_string_lossy().into_owned())
            .collect();
        let snapshot = ResourceSnapshot {
            cpu_percent_all_cores: self.system.global_cpu_usage(),
            available_memory_mb: self.system.available_memory() / conv::MEGA_BYTES,
            running_process_names,
            drive_free_space_mb: self.drive_free_space_mb(),
        };
        tracing::trace!(
            "resource snapshot: cpu {:.1}%, memory {} MB, {} processes",
            snapshot.cpu_percent_all_cores,
            snapshot.available_memory_mb,
            snapshot.running_process_names.len()
        );
        snapshot
    }
}

/// Index of the mount point holding `path`, preferring the deepest (longest) match.
fn best_mount_match<'a>(
    path: &Path,
    mount_points: impl Iterator<Item = &'a Path>,
) -> Option<usize> {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut best = None;
    let mut best_len = 0usize;
    for (idx, mount) in mount_points.enumerate() {
        if canonical.starts_with(mount) {
            let depth = mount.components().count();
            if best.is_none() || depth > best_len {
                best_len = depth;
                best = Some(idx);
            }
        }
    }
    best
}
