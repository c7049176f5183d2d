//! Copy engine contract: commands accepted and events emitted by a bulk-copy engine
//!
//! The transfer controller only talks to an engine through [`CopyEngine`]. Commands are
//! fire-and-forget, the engine does the actual I/O on its own tasks and reports back through
//! an [`EngineEvent`] channel.

use enum_map::Enum;
use serde::Serialize;

/// Classification of a processed file as reported by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Enum, Serialize)]
pub enum FileClass {
    /// Not present at the destination, transferred
    New,
    /// Already present at the destination, skipped
    Existing,
    /// Destination entry is of a different type, skipped
    Mismatched,
    /// Anything else: overwritten changed files, failed files
    Other,
}

impl std::str::FromStr for FileClass {
    type Err = std::convert::Infallible;

    /// Maps the English file class labels printed by robocopy-like tools, unknown labels
    /// become [`FileClass::Other`].
    fn from_str(label: &str) -> Result<Self, Self::Err> {
        let class = match label.trim().to_lowercase().as_str() {
            "new file" | "new" => FileClass::New,
            "same" | "older" | "existing" | "skipped" => FileClass::Existing,
            "mismatch" | "mismatched" => FileClass::Mismatched,
            _ => FileClass::Other,
        };
        Ok(class)
    }
}

impl std::fmt::Display for FileClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FileClass::New => "new",
            FileClass::Existing => "existing",
            FileClass::Mismatched => "mismatched",
            FileClass::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// One file processed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEvent {
    /// Path relative to the transfer source
    pub name: String,
    pub size_bytes: u64,
    pub class: FileClass,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineEvent {
    FileProcessed(FileEvent),
    /// Overall progress of the running command (percent)
    ProgressChanged(f64),
    /// The command finished; `error` is set when the engine aborted the whole transfer
    Completed { error: Option<String> },
}

/// Which parts of a file get copied (robocopy style D/A/T/S/O/U letters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CopyFlags {
    pub data: bool,
    /// Permission bits
    pub attributes: bool,
    pub timestamps: bool,
    /// Security descriptors; special mode bits (setuid, setgid, sticky) on unix
    pub security: bool,
    pub owner: bool,
    pub auditing: bool,
}

impl CopyFlags {
    /// Data, attributes, timestamps and owner; security only with `enforce_inherited_acls`.
    pub fn for_transfer(enforce_inherited_acls: bool) -> Self {
        Self {
            data: true,
            attributes: true,
            timestamps: true,
            security: enforce_inherited_acls,
            owner: true,
            auditing: false,
        }
    }
}

impl std::fmt::Display for CopyFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letters = [
            (self.data, 'D'),
            (self.attributes, 'A'),
            (self.timestamps, 'T'),
            (self.security, 'S'),
            (self.owner, 'O'),
            (self.auditing, 'U'),
        ];
        for (enabled, letter) in letters {
            if enabled {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

/// Options passed along with the `Start` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyOptions {
    pub source: std::path::PathBuf,
    pub destination: std::path::PathBuf,
    pub copy_flags: CopyFlags,
    /// Recurse into subdirectories, creating empty ones as well
    pub include_empty_subdirectories: bool,
    /// Skip files whose source is older than the destination copy
    pub exclude_older: bool,
    pub retry_count: u32,
    pub retry_wait: std::time::Duration,
    /// Wait between packets, limits the bandwidth used
    pub inter_packet_gap: std::time::Duration,
}

/// Failure to dispatch a command to the engine.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("copy engine is unavailable: {0}")]
    Unavailable(String),
    #[error("copy engine rejected '{command}': {reason}")]
    Rejected {
        command: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Command surface of a bulk-copy engine.
///
/// None of the commands may block for longer than it takes to hand the command over.
pub trait CopyEngine: Send {
    fn start(&mut self, options: CopyOptions) -> Result<(), CommandError>;
    fn pause(&mut self) -> Result<(), CommandError>;
    fn resume(&mut self) -> Result<(), CommandError>;
    fn stop(&mut self) -> Result<(), CommandError>;
    /// Release everything held for the last command, the engine is reusable afterwards.
    fn dispose(&mut self);
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<EngineEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
