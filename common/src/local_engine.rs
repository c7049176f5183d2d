//! Local bulk-copy engine running on tokio
//!
//! Every `start` spawns one copy job. The job enumerates the source, creates the directory
//! tree at the destination and copies files one after another in packets of `packet_size`
//! bytes. Pause, resume and stop are delivered through a watch channel and take effect at
//! packet boundaries.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{Instrument, instrument};

use crate::engine::{
    CommandError, CopyEngine, CopyFlags, CopyOptions, EngineEvent, EventSender, FileClass,
    FileEvent,
};

pub const DEFAULT_PACKET_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Stopped,
}

struct Run {
    control: tokio::sync::watch::Sender<Control>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct LocalCopyEngine {
    events: EventSender,
    packet_size: u64,
    run: Option<Run>,
}

impl LocalCopyEngine {
    pub fn new(events: EventSender, packet_size: u64) -> Self {
        Self {
            events,
            packet_size: packet_size.max(1),
            run: None,
        }
    }

    fn send_control(&self, command: &'static str, control: Control) -> Result<(), CommandError> {
        let run = self.run.as_ref().ok_or_else(|| CommandError::Rejected {
            command,
            reason: "no copy has been started".to_string(),
        })?;
        // a finished job has dropped its receiver, the command is then a no-op
        run.control.send_replace(control);
        Ok(())
    }
}

impl CopyEngine for LocalCopyEngine {
    fn start(&mut self, options: CopyOptions) -> Result<(), CommandError> {
        if self
            .run
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
        {
            return Err(CommandError::Rejected {
                command: "start",
                reason: "a copy is already running".to_string(),
            });
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| CommandError::Unavailable(error.to_string()))?;
        let (control_tx, control_rx) = tokio::sync::watch::channel(Control::Running);
        let job = CopyJob {
            options,
            packet_size: self.packet_size,
            events: self.events.clone(),
            control: control_rx,
        };
        let handle = runtime.spawn(job.run().in_current_span());
        self.run = Some(Run {
            control: control_tx,
            handle,
        });
        Ok(())
    }

    fn pause(&mut self) -> Result<(), CommandError> {
        self.send_control("pause", Control::Paused)
    }

    fn resume(&mut self) -> Result<(), CommandError> {
        self.send_control("resume", Control::Running)
    }

    fn stop(&mut self) -> Result<(), CommandError> {
        self.send_control("stop", Control::Stopped)
    }

    fn dispose(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        if !run.handle.is_finished() {
            run.control.send_replace(Control::Stopped);
            run.handle.abort();
        }
    }
}

impl Drop for LocalCopyEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[derive(Debug)]
enum Entry {
    Dir(PathBuf),
    File { rel: PathBuf, size: u64 },
}

/// Returned by a job that observed a stop request.
struct Stopped;

struct CopyJob {
    options: CopyOptions,
    packet_size: u64,
    events: EventSender,
    control: tokio::sync::watch::Receiver<Control>,
}

impl CopyJob {
    async fn run(mut self) {
        tracing::info!(
            "copying {:?} -> {:?} (flags: {}, retries: {}, gap: {:?})",
            &self.options.source,
            &self.options.destination,
            self.options.copy_flags,
            self.options.retry_count,
            self.options.inter_packet_gap
        );
        let error = match self.copy_all().await {
            Ok(Ok(())) => None,
            Ok(Err(Stopped)) => {
                tracing::info!("copy of {:?} stopped", &self.options.source);
                return;
            }
            Err(error) => {
                tracing::error!("copy of {:?} aborted: {:#}", &self.options.source, &error);
                Some(format!("{error:#}"))
            }
        };
        self.emit(EngineEvent::Completed { error });
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("engine event receiver is gone, dropping event");
        }
    }

    /// Block while paused, returns false once a stop was requested.
    async fn wait_runnable(&mut self) -> bool {
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                Control::Running => return true,
                Control::Stopped => return false,
                Control::Paused => {
                    tracing::debug!("copy paused, waiting for resume");
                    if self.control.changed().await.is_err() {
                        // engine dropped
                        return false;
                    }
                }
            }
        }
    }

    async fn copy_all(&mut self) -> Result<Result<(), Stopped>> {
        let source = self.options.source.clone();
        let destination = self.options.destination.clone();
        let source_metadata = tokio::fs::metadata(&source)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", &source))?;
        if !source_metadata.is_dir() {
            return Err(anyhow::anyhow!("source {:?} is not a directory", &source));
        }
        tokio::fs::create_dir_all(&destination)
            .await
            .with_context(|| format!("cannot create destination {:?}", &destination))?;
        let mut entries = vec![];
        collect_entries(&source, Path::new(""), &mut entries).await?;
        let total_bytes: u64 = entries
            .iter()
            .map(|entry| match entry {
                Entry::File { size, .. } => *size,
                Entry::Dir(_) => 0,
            })
            .sum();
        tracing::debug!(
            "found {} entries, {} bytes in {:?}",
            entries.len(),
            total_bytes,
            &source
        );
        if self.options.include_empty_subdirectories {
            for entry in &entries {
                if let Entry::Dir(rel) = entry {
                    let dst = destination.join(rel);
                    if let Err(error) = tokio::fs::create_dir_all(&dst).await {
                        tracing::warn!("cannot create directory {:?}: {}", &dst, error);
                    }
                }
            }
        }
        let mut done_bytes = 0u64;
        for entry in &entries {
            let Entry::File { rel, size } = entry else {
                continue;
            };
            if !self.wait_runnable().await {
                return Ok(Err(Stopped));
            }
            let class = match self.process_file(rel).await {
                Ok(class) => class,
                Err(Stopped) => return Ok(Err(Stopped)),
            };
            self.emit(EngineEvent::FileProcessed(FileEvent {
                name: rel.display().to_string(),
                size_bytes: *size,
                class,
            }));
            done_bytes += size;
            if total_bytes > 0 {
                self.emit(EngineEvent::ProgressChanged(
                    done_bytes as f64 * 100.0 / total_bytes as f64,
                ));
            }
        }
        self.emit(EngineEvent::ProgressChanged(100.0));
        Ok(Ok(()))
    }

    /// Classify and (if needed) copy a single file, retrying failed copies as configured.
    #[instrument(skip(self))]
    async fn process_file(&mut self, rel: &Path) -> Result<FileClass, Stopped> {
        let src = self.options.source.join(rel);
        let dst = self.options.destination.join(rel);
        let src_metadata = match tokio::fs::metadata(&src).await {
            Ok(metadata) => metadata,
            Err(error) => {
                tracing::warn!("failed reading metadata from {:?}: {}", &src, error);
                return Ok(FileClass::Other);
            }
        };
        let class = match classify(&src_metadata, &dst, self.options.exclude_older).await {
            Decision::Skip(class) => {
                tracing::debug!("skipping {:?} ({})", rel, class);
                return Ok(class);
            }
            Decision::Copy(class) => class,
        };
        let mut attempt = 0;
        loop {
            match self.copy_file(&src, &dst, &src_metadata).await {
                Ok(true) => return Ok(class),
                Ok(false) => {
                    remove_partial(&dst).await;
                    return Err(Stopped);
                }
                Err(error) => {
                    remove_partial(&dst).await;
                    if attempt >= self.options.retry_count {
                        tracing::warn!("failed copying {:?}: {:#}", &src, &error);
                        return Ok(FileClass::Other);
                    }
                    attempt += 1;
                    tracing::info!(
                        "copying {:?} failed, retry {}/{} in {:?}: {:#}",
                        &src,
                        attempt,
                        self.options.retry_count,
                        self.options.retry_wait,
                        &error
                    );
                    tokio::time::sleep(self.options.retry_wait).await;
                }
            }
        }
    }

    /// Copy one file, returns false if the copy was stopped half way.
    async fn copy_file(
        &mut self,
        src: &Path,
        dst: &Path,
        src_metadata: &std::fs::Metadata,
    ) -> Result<bool> {
        let mut reader = tokio::fs::File::open(src)
            .await
            .with_context(|| format!("cannot open {:?} for reading", &src))?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {:?}", &parent))?;
        }
        let mut writer = tokio::fs::File::create(dst)
            .await
            .with_context(|| format!("cannot open {:?} for writing", &dst))?;
        if self.options.copy_flags.data {
            let mut buffer = vec![0u8; usize::try_from(self.packet_size).unwrap_or(usize::MAX)];
            loop {
                let read = reader
                    .read(&mut buffer)
                    .await
                    .with_context(|| format!("failed reading from {:?}", &src))?;
                if read == 0 {
                    break;
                }
                writer
                    .write_all(&buffer[..read])
                    .await
                    .with_context(|| format!("failed writing to {:?}", &dst))?;
                if !self.options.inter_packet_gap.is_zero() {
                    tokio::time::sleep(self.options.inter_packet_gap).await;
                }
                if !self.wait_runnable().await {
                    return Ok(false);
                }
            }
        }
        writer
            .flush()
            .await
            .with_context(|| format!("failed flushing {:?}", &dst))?;
        drop(writer);
        set_file_metadata(&self.options.copy_flags, src_metadata, dst).await?;
        Ok(true)
    }
}

/// Partial files are not resumed, drop them so a later scan sees them as new.
async fn remove_partial(dst: &Path) {
    match tokio::fs::remove_file(dst).await {
        Ok(()) => tracing::debug!("removed partial file {:?}", dst),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!("cannot remove partial file {:?}: {}", dst, error),
    }
}

enum Decision {
    Copy(FileClass),
    Skip(FileClass),
}

async fn classify(src_metadata: &std::fs::Metadata, dst: &Path, exclude_older: bool) -> Decision {
    let dst_metadata = match tokio::fs::symlink_metadata(dst).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Decision::Copy(FileClass::New);
        }
        Err(error) => {
            tracing::debug!("cannot read metadata of {:?}: {}", dst, error);
            return Decision::Copy(FileClass::Other);
        }
    };
    if !dst_metadata.is_file() {
        return Decision::Skip(FileClass::Mismatched);
    }
    let src_mtime = filetime::FileTime::from_last_modification_time(src_metadata);
    let dst_mtime = filetime::FileTime::from_last_modification_time(&dst_metadata);
    if src_metadata.len() == dst_metadata.len() && src_mtime == dst_mtime {
        return Decision::Skip(FileClass::Existing);
    }
    if exclude_older && src_mtime < dst_mtime {
        return Decision::Skip(FileClass::Existing);
    }
    Decision::Copy(FileClass::Other)
}

#[async_recursion]
async fn collect_entries(root: &Path, rel: &Path, entries: &mut Vec<Entry>) -> Result<()> {
    let dir = root.join(rel);
    let mut read_dir = match tokio::fs::read_dir(&dir).await {
        Ok(read_dir) => read_dir,
        Err(error)
            if error.kind() == std::io::ErrorKind::PermissionDenied
                && !rel.as_os_str().is_empty() =>
        {
            // ignore permission denied on READ errors below the transfer root
            tracing::warn!("cannot open {:?} for reading: Permission denied", &dir);
            return Ok(());
        }
        Err(error) => {
            return Err(error).with_context(|| format!("cannot open {:?} for reading", &dir));
        }
    };
    let mut children = vec![];
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &dir))?
    {
        children.push(entry);
    }
    children.sort_by_key(|entry| entry.file_name());
    for entry in children {
        let entry_rel = rel.join(entry.file_name());
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed reading file type of {:?}", entry.path()))?;
        if file_type.is_dir() {
            entries.push(Entry::Dir(entry_rel.clone()));
            collect_entries(root, &entry_rel, entries).await?;
        } else if file_type.is_file() {
            let size = entry
                .metadata()
                .await
                .with_context(|| format!("failed reading metadata from {:?}", entry.path()))?
                .len();
            entries.push(Entry::File {
                rel: entry_rel,
                size,
            });
        } else {
            tracing::debug!("skipping {:?}: not a regular file or directory", entry.path());
        }
    }
    Ok(())
}

#[instrument(skip(metadata))]
async fn set_file_metadata(
    flags: &CopyFlags,
    metadata: &std::fs::Metadata,
    dst: &Path,
) -> Result<()> {
    let flags = *flags;
    let metadata = metadata.to_owned();
    let dst = dst.to_owned();
    tokio::task::spawn_blocking(move || -> Result<()> {
        // owner goes first, changing it may clear the setuid/setgid bits
        if flags.owner {
            tracing::debug!("setting uid and gid");
            if let Err(error) =
                std::os::unix::fs::chown(&dst, Some(metadata.uid()), Some(metadata.gid()))
            {
                // only privileged users may hand files to somebody else
                tracing::debug!("cannot set owner of {:?}: {}", &dst, error);
            }
        }
        if flags.attributes || flags.security {
            let current = std::fs::metadata(&dst)
                .with_context(|| format!("failed reading metadata from {:?}", &dst))?
                .permissions()
                .mode();
            let source = metadata.permissions().mode();
            let base = (if flags.attributes { source } else { current }) & 0o777;
            let special = if flags.security { source & 0o7000 } else { 0 };
            let permissions = std::fs::Permissions::from_mode(base | special);
            std::fs::set_permissions(&dst, permissions.clone()).with_context(|| {
                format!("cannot set {:?} permissions to {:?}", &dst, &permissions)
            })?;
        }
        if flags.timestamps {
            tracing::debug!("setting timestamps");
            let atime = filetime::FileTime::from_last_access_time(&metadata);
            let mtime = filetime::FileTime::from_last_modification_time(&metadata);
            filetime::set_file_times(&dst, atime, mtime)
                .with_context(|| format!("failed setting timestamps for {:?}", &dst))?;
        }
        Ok(())
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EventReceiver, event_channel};
    use crate::testutils;
    use tracing_test::traced_test;

    fn options(source: PathBuf, destination: PathBuf) -> CopyOptions {
        CopyOptions {
            source,
            destination,
            copy_flags: CopyFlags::for_transfer(false),
            include_empty_subdirectories: true,
            exclude_older: true,
            retry_count: 0,
            retry_wait: std::time::Duration::from_secs(2),
            inter_packet_gap: std::time::Duration::ZERO,
        }
    }

    struct Outcome {
        files: Vec<FileEvent>,
        last_progress: Option<f64>,
        error: Option<String>,
    }

    async fn wait_for_completion(events: &mut EventReceiver) -> Outcome {
        let mut outcome = Outcome {
            files: vec![],
            last_progress: None,
            error: None,
        };
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::FileProcessed(file) => outcome.files.push(file),
                EngineEvent::ProgressChanged(percent) => outcome.last_progress = Some(percent),
                EngineEvent::Completed { error } => {
                    outcome.error = error;
                    return outcome;
                }
            }
        }
        panic!("event channel closed before completion");
    }

    fn names_of(files: &[FileEvent], class: FileClass) -> Vec<String> {
        files
            .iter()
            .filter(|file| file.class == class)
            .map(|file| file.name.clone())
            .collect()
    }

    #[tokio::test]
    #[traced_test]
    async fn copies_tree_and_reports_new_files() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let (tx, mut rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, 1024);
        engine.start(options(tmp_dir.join("foo"), tmp_dir.join("staging/foo")))?;
        let outcome = wait_for_completion(&mut rx).await;
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.last_progress, Some(100.0));
        assert_eq!(
            names_of(&outcome.files, FileClass::New),
            vec![
                "0.txt",
                "bar/1.txt",
                "bar/2.txt",
                "bar/3.txt",
                "baz/4.txt",
                "baz/5.txt",
                "baz/big.bin"
            ]
        );
        let dst = tmp_dir.join("staging/foo");
        assert_eq!(tokio::fs::read_to_string(dst.join("bar/2.txt")).await?, "2");
        assert_eq!(tokio::fs::metadata(dst.join("baz/big.bin")).await?.len(), 2048);
        assert!(tokio::fs::metadata(dst.join("empty")).await?.is_dir());
        // same mtime and size, second run skips everything
        engine.dispose();
        engine.start(options(tmp_dir.join("foo"), dst.clone()))?;
        let outcome = wait_for_completion(&mut rx).await;
        assert_eq!(outcome.files.len(), 7);
        assert!(names_of(&outcome.files, FileClass::New).is_empty());
        assert_eq!(names_of(&outcome.files, FileClass::Existing).len(), 7);
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn skips_older_sources_and_mismatched_entries() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let dst = tmp_dir.join("staging");
        tokio::fs::create_dir_all(dst.join("bar")).await?;
        // newer destination copy with different content
        tokio::fs::write(dst.join("0.txt"), "newer and longer").await?;
        filetime::set_file_mtime(
            dst.join("0.txt"),
            filetime::FileTime::from_unix_time(4_000_000_000, 0),
        )?;
        // a directory where the source has a file
        tokio::fs::create_dir_all(dst.join("bar").join("1.txt")).await?;
        // older destination copy gets overwritten
        tokio::fs::write(dst.join("bar").join("2.txt"), "old").await?;
        filetime::set_file_mtime(
            dst.join("bar").join("2.txt"),
            filetime::FileTime::from_unix_time(1_000_000, 0),
        )?;
        let (tx, mut rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, DEFAULT_PACKET_SIZE);
        engine.start(options(tmp_dir.join("foo"), dst.clone()))?;
        let outcome = wait_for_completion(&mut rx).await;
        assert_eq!(names_of(&outcome.files, FileClass::Existing), vec!["0.txt"]);
        assert_eq!(
            names_of(&outcome.files, FileClass::Mismatched),
            vec!["bar/1.txt"]
        );
        assert_eq!(names_of(&outcome.files, FileClass::Other), vec!["bar/2.txt"]);
        assert_eq!(
            tokio::fs::read_to_string(dst.join("0.txt")).await?,
            "newer and longer"
        );
        assert_eq!(tokio::fs::read_to_string(dst.join("bar/2.txt")).await?, "2");
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn pause_holds_the_copy_until_resumed() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let (tx, mut rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, DEFAULT_PACKET_SIZE);
        engine.start(options(tmp_dir.join("foo"), tmp_dir.join("staging")))?;
        // the current-thread runtime has not polled the job yet
        engine.pause()?;
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            wait_for_completion(&mut rx),
        )
        .await;
        assert!(waited.is_err(), "copy must not complete while paused");
        engine.resume()?;
        let outcome = wait_for_completion(&mut rx).await;
        assert_eq!(outcome.error, None);
        assert_eq!(names_of(&outcome.files, FileClass::New).len(), 7);
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn stop_ends_without_completion() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let (tx, mut rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, DEFAULT_PACKET_SIZE);
        engine.start(options(tmp_dir.join("foo"), tmp_dir.join("staging")))?;
        engine.stop()?;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, EngineEvent::Completed { .. }));
        }
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let (tx, mut rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, DEFAULT_PACKET_SIZE);
        engine.start(options(tmp_dir.join("foo"), tmp_dir.join("staging")))?;
        let error = engine
            .start(options(tmp_dir.join("foo"), tmp_dir.join("other")))
            .unwrap_err();
        assert!(matches!(
            error,
            CommandError::Rejected {
                command: "start",
                ..
            }
        ));
        wait_for_completion(&mut rx).await;
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_aborts_with_error() -> Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let (tx, mut rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, DEFAULT_PACKET_SIZE);
        engine.start(options(tmp_dir.join("missing"), tmp_dir.join("staging")))?;
        let outcome = wait_for_completion(&mut rx).await;
        assert!(outcome.files.is_empty());
        assert!(outcome.error.unwrap().contains("failed reading metadata"));
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    /// Start a copy that holds before its first file, once the source was enumerated.
    async fn start_held(engine: &mut LocalCopyEngine, options: CopyOptions) -> Result<()> {
        engine.start(options)?;
        // the current-thread runtime has not polled the job yet
        engine.pause()?;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        Ok(())
    }

    /// Turn an enumerated source file into a directory, reading it then fails half way.
    async fn break_source_file(path: &Path) -> Result<()> {
        tokio::fs::remove_file(path).await?;
        tokio::fs::create_dir(path).await?;
        Ok(())
    }

    async fn restore_source_file(path: &Path) -> Result<()> {
        tokio::fs::remove_dir(path).await?;
        tokio::fs::write(path, "2").await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_file_leaves_nothing_behind() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.join("foo");
        let dst = tmp_dir.join("staging");
        let (tx, mut rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, DEFAULT_PACKET_SIZE);
        start_held(&mut engine, options(src.clone(), dst.clone())).await?;
        break_source_file(&src.join("bar/2.txt")).await?;
        engine.resume()?;
        let outcome = wait_for_completion(&mut rx).await;
        // a single file failing does not fail the transfer
        assert_eq!(outcome.error, None);
        assert_eq!(names_of(&outcome.files, FileClass::Other), vec!["bar/2.txt"]);
        assert_eq!(names_of(&outcome.files, FileClass::New).len(), 6);
        assert!(logs_contain("failed copying"));
        assert!(!logs_contain("retry 1/"));
        assert!(!dst.join("bar/2.txt").exists());
        // an older source is picked up again by the next run
        restore_source_file(&src.join("bar/2.txt")).await?;
        filetime::set_file_mtime(
            src.join("bar/2.txt"),
            filetime::FileTime::from_unix_time(1_600_000_000, 0),
        )?;
        engine.dispose();
        engine.start(options(src.clone(), dst.clone()))?;
        let outcome = wait_for_completion(&mut rx).await;
        assert_eq!(names_of(&outcome.files, FileClass::New), vec!["bar/2.txt"]);
        assert_eq!(tokio::fs::read_to_string(dst.join("bar/2.txt")).await?, "2");
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_file_is_retried_as_configured() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.join("foo");
        let dst = tmp_dir.join("staging");
        let (tx, mut rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, DEFAULT_PACKET_SIZE);
        let options = CopyOptions {
            retry_count: 2,
            retry_wait: std::time::Duration::from_millis(10),
            ..options(src.clone(), dst.clone())
        };
        start_held(&mut engine, options).await?;
        break_source_file(&src.join("bar/2.txt")).await?;
        engine.resume()?;
        let outcome = wait_for_completion(&mut rx).await;
        assert_eq!(outcome.error, None);
        assert_eq!(names_of(&outcome.files, FileClass::Other), vec!["bar/2.txt"]);
        assert!(logs_contain("retry 1/2"));
        assert!(logs_contain("retry 2/2"));
        assert!(!logs_contain("retry 3/2"));
        assert!(logs_contain("failed copying"));
        assert!(!dst.join("bar/2.txt").exists());
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn retry_succeeds_once_the_source_is_back() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.join("foo");
        let dst = tmp_dir.join("staging");
        let (tx, mut rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, DEFAULT_PACKET_SIZE);
        let options = CopyOptions {
            retry_count: 1,
            retry_wait: std::time::Duration::from_secs(1),
            ..options(src.clone(), dst.clone())
        };
        start_held(&mut engine, options).await?;
        break_source_file(&src.join("bar/2.txt")).await?;
        engine.resume()?;
        // first attempt fails right away, fix the source during the retry wait
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        restore_source_file(&src.join("bar/2.txt")).await?;
        let outcome = wait_for_completion(&mut rx).await;
        assert!(logs_contain("retry 1/1"));
        assert!(names_of(&outcome.files, FileClass::Other).is_empty());
        assert_eq!(names_of(&outcome.files, FileClass::New).len(), 7);
        assert_eq!(tokio::fs::read_to_string(dst.join("bar/2.txt")).await?, "2");
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    #[test]
    fn start_without_runtime_is_unavailable() {
        let (tx, _rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, DEFAULT_PACKET_SIZE);
        let error = engine
            .start(options("/src".into(), "/dst".into()))
            .unwrap_err();
        assert!(matches!(error, CommandError::Unavailable(_)));
    }

    #[test]
    fn commands_before_start_are_rejected() {
        let (tx, _rx) = event_channel();
        let mut engine = LocalCopyEngine::new(tx, DEFAULT_PACKET_SIZE);
        assert!(engine.pause().is_err());
        assert!(engine.resume().is_err());
        assert!(engine.stop().is_err());
        // dispose never fails
        engine.dispose();
    }
}
