use enum_map::EnumMap;
use serde::Serialize;

use crate::conv;
use crate::engine::{FileClass, FileEvent};

/// Progress is reported in steps of this many percent.
pub const PROGRESS_STEP: u8 = 20;

/// Tracks the progress of the current transfer and the manifest of newly transferred files.
///
/// Not synchronized on its own: the controller keeps it inside its state lock so that
/// appends and state transitions are serialized.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    manifest: Vec<String>,
    bucket: u8,
    files: EnumMap<FileClass, u64>,
    bytes_new: u64,
}

/// Per-class file counts of the current transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileCounts {
    pub new: u64,
    pub existing: u64,
    pub mismatched: u64,
    pub other: u64,
    pub bytes_new: u64,
}

impl std::fmt::Display for FileCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "new: {} ({}), existing: {}, mismatched: {}, other: {}",
            self.new,
            conv::bytes_to_string(self.bytes_new),
            self.existing,
            self.mismatched,
            self.other
        )
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a processed file, only files classified as new end up in the manifest.
    pub fn on_file_event(&mut self, event: &FileEvent) {
        tracing::trace!(
            "file processed: class [{}] - size [{}] - name [{}]",
            event.class,
            event.size_bytes,
            event.name
        );
        self.files[event.class] += 1;
        if event.class == FileClass::New {
            self.bytes_new += event.size_bytes;
            self.manifest.push(format!(
                "{} ({})",
                event.name,
                conv::bytes_to_string(event.size_bytes)
            ));
        }
    }

    /// Update the progress, returns the new bucket if `percent` crossed into another one.
    pub fn on_progress(&mut self, percent: f64) -> Option<u8> {
        if percent.is_nan() {
            return None;
        }
        // truncation is intended: 39.9% still is in the 20% bucket
        let percent = percent.clamp(0.0, 100.0) as u8;
        let bucket = (percent / PROGRESS_STEP) * PROGRESS_STEP;
        if bucket == self.bucket {
            return None;
        }
        self.bucket = bucket;
        Some(bucket)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn manifest(&self) -> &[String] {
        &self.manifest
    }

    /// Last reported progress bucket (percent)
    pub fn bucket(&self) -> u8 {
        self.bucket
    }

    pub fn counts(&self) -> FileCounts {
        FileCounts {
            new: self.files[FileClass::New],
            existing: self.files[FileClass::Existing],
            mismatched: self.files[FileClass::Mismatched],
            other: self.files[FileClass::Other],
            bytes_new: self.bytes_new,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::{KILO_BYTES, MEGA_BYTES};
    use proptest::prelude::*;

    fn event(name: &str, size_bytes: u64, class: FileClass) -> FileEvent {
        FileEvent {
            name: name.to_string(),
            size_bytes,
            class,
        }
    }

    #[test]
    fn manifest_keeps_new_files_in_order() {
        let mut tracker = ProgressTracker::new();
        tracker.on_file_event(&event("a.txt", 2 * MEGA_BYTES, FileClass::New));
        tracker.on_file_event(&event("skipped.txt", 10, FileClass::Existing));
        tracker.on_file_event(&event("b.txt", 512 * KILO_BYTES, FileClass::New));
        assert_eq!(
            tracker.manifest().to_vec(),
            vec!["a.txt (2 MB)", "b.txt (512 KB)"]
        );
        let counts = tracker.counts();
        assert_eq!(counts.new, 2);
        assert_eq!(counts.existing, 1);
        assert_eq!(counts.bytes_new, 2 * MEGA_BYTES + 512 * KILO_BYTES);
    }

    #[test]
    fn progress_changes_only_on_bucket_crossing() {
        let mut tracker = ProgressTracker::new();
        let changes: Vec<(u32, Option<u8>)> = [0u32, 5, 19, 20, 21, 39, 40]
            .into_iter()
            .map(|percent| (percent, tracker.on_progress(f64::from(percent))))
            .filter(|(_, change)| change.is_some())
            .collect();
        assert_eq!(changes, vec![(20, Some(20)), (40, Some(40))]);
        assert_eq!(tracker.bucket(), 40);
    }

    #[test]
    fn at_most_six_updates_per_transfer() {
        let mut tracker = ProgressTracker::new();
        let mut updates = 0;
        for step in 0u32..=1000 {
            if tracker.on_progress(f64::from(step) / 10.0).is_some() {
                updates += 1;
            }
        }
        // 0% is the starting bucket, so only 20/40/60/80/100 show up
        assert_eq!(updates, 5);
        assert_eq!(tracker.bucket(), 100);
    }

    #[test]
    fn out_of_range_progress_is_clamped() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.on_progress(250.0), Some(100));
        assert_eq!(tracker.on_progress(-3.0), Some(0));
        assert_eq!(tracker.on_progress(f64::NAN), None);
    }

    #[test]
    fn reset_clears_everything() {
        let mut tracker = ProgressTracker::new();
        tracker.on_file_event(&event("a.txt", 1, FileClass::New));
        tracker.on_progress(60.0);
        tracker.reset();
        assert!(tracker.manifest().is_empty());
        assert_eq!(tracker.bucket(), 0);
        assert_eq!(tracker.counts(), FileCounts::default());
    }

    proptest! {
        #[test]
        fn bucket_follows_last_progress(percents in proptest::collection::vec(0.0f64..=100.0, 1..50)) {
            let mut tracker = ProgressTracker::new();
            for percent in &percents {
                tracker.on_progress(*percent);
            }
            let last = *percents.last().unwrap();
            prop_assert_eq!(tracker.bucket(), ((last as u8) / 20) * 20);
            prop_assert_eq!(tracker.bucket() % PROGRESS_STEP, 0);
        }
    }
}
