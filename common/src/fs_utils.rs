use std::path::{Path, PathBuf};

/// Total size (bytes) of all regular files below `path`.
///
/// Unreadable entries are skipped, a missing directory has size 0.
#[tracing::instrument]
pub fn directory_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                tracing::debug!("skipping entry while computing size: {}", error);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Staging location of a transfer: the last component of `source` below `tmp_root`.
pub fn staging_path(tmp_root: &Path, source: &Path) -> Option<PathBuf> {
    source.file_name().map(|name| tmp_root.join(name))
}
