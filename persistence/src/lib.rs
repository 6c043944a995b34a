// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use fs2::FileExt;
use hashing::{is_valid_project_hash, ReaderHasher, WriterHasher};
use journal::{Journal, JournalError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use task_executor::Executor;
use tempfile::NamedTempFile;

/// Bumped whenever the backup byte format changes incompatibly.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// The version of the journal's native backup framing this manager writes and accepts.
pub const STORE_VERSION: u32 = 1;

pub const BACKUP_FILE_NAME: &str = "latest.backup.gz";
pub const METADATA_FILE_NAME: &str = "metadata.json";

const LOCK_SUFFIX: &str = ".lock";
const LOCK_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const LOCK_MAX_BACKOFF: Duration = Duration::from_secs(2);
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(5);

///
/// A collaborator which refreshes the external code graph in the background. It is paused across
/// restores so that a half-restored journal is never observed by a refresh.
///
pub trait RefreshCoordinator: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PersistenceError {
    /// No backup exists for the requested project.
    NotFound,
    /// The backup bytes did not match their recorded content hash, or could not be decompressed.
    Corrupted(String),
    /// The backup was written by an incompatible schema or store version.
    VersionMismatch { field: String, want: u32, got: u32 },
    /// The advisory lock could not be acquired within the configured timeout.
    LockFailed(String),
    /// The metadata file failed its own integrity hash or could not be parsed.
    MetadataCorrupted(String),
    /// The project hash was not 8-64 lowercase hex characters.
    InvalidProjectHash(String),
    /// The manager has been closed.
    Closed,
    /// Another restore is already running on this manager.
    RestoreInProgress,
    Journal(JournalError),
    Io(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::NotFound => write!(f, "No backup found"),
            PersistenceError::Corrupted(msg) => write!(f, "Backup corrupted: {msg}"),
            PersistenceError::VersionMismatch { field, want, got } => {
                write!(f, "Backup {field} mismatch: want {want}, got {got}")
            }
            PersistenceError::LockFailed(msg) => write!(f, "Backup lock failed: {msg}"),
            PersistenceError::MetadataCorrupted(msg) => {
                write!(f, "Backup metadata corrupted: {msg}")
            }
            PersistenceError::InvalidProjectHash(hash) => {
                write!(f, "Invalid project hash: {hash:?}")
            }
            PersistenceError::Closed => write!(f, "Persistence manager is closed"),
            PersistenceError::RestoreInProgress => write!(f, "A restore is already in progress"),
            PersistenceError::Journal(err) => write!(f, "{err}"),
            PersistenceError::Io(msg) => write!(f, "Backup io error: {msg}"),
        }
    }
}

impl From<JournalError> for PersistenceError {
    fn from(err: JournalError) -> Self {
        PersistenceError::Journal(err)
    }
}

impl PersistenceError {
    ///
    /// Whether retrying might help. Integrity and validation failures are never retried.
    ///
    pub fn is_transient(&self) -> bool {
        match self {
            PersistenceError::Io(_) | PersistenceError::LockFailed(_) => true,
            PersistenceError::Journal(err) => {
                matches!(err, JournalError::Io(_) | JournalError::Lmdb(_))
            }
            _ => false,
        }
    }
}

///
/// The sidecar record written next to every backup. `metadata_hash` is the SHA-256 of this JSON
/// object serialized with `metadata_hash` set to the empty string.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub project_hash: String,
    pub created_at_ms: i64,
    pub store_version: u32,
    pub content_hash: String,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub generation: u64,
    pub session_id: String,
    pub delta_count: u64,
    pub schema_version: u32,
    pub metadata_hash: String,
}

impl BackupMetadata {
    fn compute_hash(&self) -> Result<String, PersistenceError> {
        let mut unhashed = self.clone();
        unhashed.metadata_hash = String::new();
        let encoded = serde_json::to_vec(&unhashed)
            .map_err(|err| PersistenceError::Io(format!("Failed to encode metadata: {err}")))?;
        Ok(hashing::Digest::of_bytes(&encoded).hash.to_hex())
    }

    fn seal(mut self) -> Result<BackupMetadata, PersistenceError> {
        self.metadata_hash = self.compute_hash()?;
        Ok(self)
    }

    fn verify(&self) -> Result<(), PersistenceError> {
        let want = self.compute_hash()?;
        if want != self.metadata_hash {
            return Err(PersistenceError::MetadataCorrupted(format!(
                "Hash mismatch: recorded {}, computed {want}",
                self.metadata_hash
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PersistenceOptions {
    /// The directory under which every project keeps its store and backups.
    pub base_dir: PathBuf,
    /// How long to poll for the advisory backup lock before failing.
    pub lock_timeout: Duration,
    /// How many times a transiently failing backup is retried.
    pub max_backup_retries: usize,
}

impl PersistenceOptions {
    pub fn new(base_dir: PathBuf) -> PersistenceOptions {
        PersistenceOptions {
            base_dir,
            lock_timeout: Duration::from_secs(30),
            max_backup_retries: 3,
        }
    }
}

struct Metrics {
    save_duration_seconds: Histogram,
    restore_duration_seconds: Histogram,
    save_retries_total: IntCounter,
    save_failures_total: IntCounter,
    restore_failures_total: IntCounter,
    // Only the gauges carry the project_hash label: the label set stays bounded by the number of
    // projects on the machine, while counters and histograms stay label free.
    backup_size_bytes: IntGaugeVec,
    backup_created_at_seconds: IntGaugeVec,
}

impl Metrics {
    fn new(registry: Option<&Registry>) -> Result<Metrics, PersistenceError> {
        let register_err =
            |err: prometheus::Error| PersistenceError::Io(format!("Failed to register metric: {err}"));

        let save_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "crs_backup_save_duration_seconds",
            "Wall time of successful backup saves.",
        ))
        .map_err(register_err)?;
        let restore_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "crs_backup_restore_duration_seconds",
            "Wall time of successful backup restores.",
        ))
        .map_err(register_err)?;
        let save_retries_total = IntCounter::new(
            "crs_backup_save_retries_total",
            "Transient backup save failures that were retried.",
        )
        .map_err(register_err)?;
        let save_failures_total = IntCounter::new(
            "crs_backup_save_failures_total",
            "Backup saves that failed permanently.",
        )
        .map_err(register_err)?;
        let restore_failures_total = IntCounter::new(
            "crs_backup_restore_failures_total",
            "Backup restores that failed.",
        )
        .map_err(register_err)?;
        let backup_size_bytes = IntGaugeVec::new(
            Opts::new("crs_backup_size_bytes", "Compressed size of the last backup."),
            &["project_hash"],
        )
        .map_err(register_err)?;
        let backup_created_at_seconds = IntGaugeVec::new(
            Opts::new(
                "crs_backup_created_at_seconds",
                "Unix timestamp of the last backup.",
            ),
            &["project_hash"],
        )
        .map_err(register_err)?;

        if let Some(registry) = registry {
            for collector in [
                Box::new(save_duration_seconds.clone()) as Box<dyn prometheus::core::Collector>,
                Box::new(restore_duration_seconds.clone()),
                Box::new(save_retries_total.clone()),
                Box::new(save_failures_total.clone()),
                Box::new(restore_failures_total.clone()),
                Box::new(backup_size_bytes.clone()),
                Box::new(backup_created_at_seconds.clone()),
            ] {
                registry.register(collector).map_err(register_err)?;
            }
        }

        Ok(Metrics {
            save_duration_seconds,
            restore_duration_seconds,
            save_retries_total,
            save_failures_total,
            restore_failures_total,
            backup_size_bytes,
            backup_created_at_seconds,
        })
    }
}

struct Inner {
    options: PersistenceOptions,
    coordinator: Mutex<Option<Arc<dyn RefreshCoordinator>>>,
    // Only one restore may run at a time per manager.
    restore_gate: Mutex<()>,
    closed: AtomicBool,
    metrics: Metrics,
}

///
/// Manages compressed, hash-verified on-disk backups of journal state, one directory per project
/// hash:
///
/// ```text
/// <base>/<project-hash>/
///     journal/                  (live store, owned by the Journal)
///     backups/
///       latest.backup.gz        (gzipped native journal backup)
///       latest.backup.gz.lock   (advisory lock)
///     metadata.json
/// ```
///
/// Concurrent saves against the same project serialize on the exclusive advisory lock; loads
/// take it shared.
///
#[derive(Clone)]
pub struct PersistenceManager {
    inner: Arc<Inner>,
    executor: Executor,
}

impl PersistenceManager {
    pub fn new(
        executor: Executor,
        options: PersistenceOptions,
        registry: Option<&Registry>,
    ) -> Result<PersistenceManager, PersistenceError> {
        Ok(PersistenceManager {
            inner: Arc::new(Inner {
                options,
                coordinator: Mutex::new(None),
                restore_gate: Mutex::new(()),
                closed: AtomicBool::new(false),
                metrics: Metrics::new(registry)?,
            }),
            executor,
        })
    }

    pub fn set_refresh_coordinator(&self, coordinator: Arc<dyn RefreshCoordinator>) {
        *self.inner.coordinator.lock() = Some(coordinator);
    }

    /// The directory in which the given project's live journal store should be opened.
    pub fn store_path(&self, project_hash: &str) -> PathBuf {
        self.inner.options.base_dir.join(project_hash).join("journal")
    }

    fn project_dir(&self, project_hash: &str) -> PathBuf {
        self.inner.options.base_dir.join(project_hash)
    }

    fn backup_path(&self, project_hash: &str) -> PathBuf {
        self.project_dir(project_hash)
            .join("backups")
            .join(BACKUP_FILE_NAME)
    }

    fn metadata_path(&self, project_hash: &str) -> PathBuf {
        self.project_dir(project_hash).join(METADATA_FILE_NAME)
    }

    fn ensure_open(&self) -> Result<(), PersistenceError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PersistenceError::Closed);
        }
        Ok(())
    }

    fn validate_hash(project_hash: &str) -> Result<(), PersistenceError> {
        if !is_valid_project_hash(project_hash) {
            return Err(PersistenceError::InvalidProjectHash(project_hash.to_owned()));
        }
        Ok(())
    }

    ///
    /// Streams a gzipped backup of the given journal to disk, then atomically writes the sealed
    /// metadata record. Transient failures are retried with exponential backoff.
    ///
    pub async fn save_backup<T: Serialize + DeserializeOwned + Send + 'static>(
        &self,
        project_hash: &str,
        journal: &Journal<T>,
        generation: u64,
    ) -> Result<BackupMetadata, PersistenceError> {
        self.ensure_open()?;
        Self::validate_hash(project_hash)?;

        let mut backoff = RETRY_INITIAL_BACKOFF;
        let mut attempt = 0_usize;
        loop {
            let started = Instant::now();
            match self.save_attempt(project_hash, journal, generation).await {
                Ok(metadata) => {
                    let metrics = &self.inner.metrics;
                    metrics
                        .save_duration_seconds
                        .observe(started.elapsed().as_secs_f64());
                    metrics
                        .backup_size_bytes
                        .with_label_values(&[project_hash])
                        .set(metadata.compressed_size as i64);
                    metrics
                        .backup_created_at_seconds
                        .with_label_values(&[project_hash])
                        .set(metadata.created_at_ms / 1000);
                    info!(
                        "Saved backup for project {project_hash}: {} deltas, {} -> {} bytes",
                        metadata.delta_count, metadata.uncompressed_size, metadata.compressed_size
                    );
                    return Ok(metadata);
                }
                Err(err) if err.is_transient() && attempt < self.inner.options.max_backup_retries => {
                    attempt += 1;
                    self.inner.metrics.save_retries_total.inc();
                    warn!(
                        "Backup save attempt {attempt} for project {project_hash} failed ({err}): retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
                }
                Err(err) => {
                    self.inner.metrics.save_failures_total.inc();
                    return Err(err);
                }
            }
        }
    }

    async fn save_attempt<T: Serialize + DeserializeOwned + Send + 'static>(
        &self,
        project_hash: &str,
        journal: &Journal<T>,
        generation: u64,
    ) -> Result<BackupMetadata, PersistenceError> {
        let inner = self.inner.clone();
        let journal = journal.clone();
        let project_hash = project_hash.to_owned();
        let project_dir = self.project_dir(&project_hash);
        let backup_path = self.backup_path(&project_hash);
        let metadata_path = self.metadata_path(&project_hash);

        self.executor
            .spawn_blocking(
                move || {
                    let backups_dir = backup_path
                        .parent()
                        .expect("Backup path always has a parent")
                        .to_owned();
                    std::fs::create_dir_all(&backups_dir).map_err(|err| {
                        PersistenceError::Io(format!("Error making {backups_dir:?}: {err}"))
                    })?;

                    let lock_path = backups_dir.join(format!("{BACKUP_FILE_NAME}{LOCK_SUFFIX}"));
                    let _lock =
                        BackupLock::acquire(&lock_path, true, inner.options.lock_timeout)?;

                    // Stream: journal frames -> byte counter -> gzip -> hashing -> tmp file. The
                    // hash therefore covers exactly the compressed bytes that land on disk.
                    let mut tmp = NamedTempFile::new_in(&backups_dir).map_err(|err| {
                        PersistenceError::Io(format!("Error creating temp backup file: {err}"))
                    })?;
                    let (content_digest, uncompressed_size, frame_count) = {
                        let hasher = WriterHasher::new(tmp.as_file_mut());
                        let encoder = GzEncoder::new(hasher, Compression::default());
                        let mut counter = CountingWriter::new(encoder);
                        let frames = journal.backup_sync(&mut counter)?;
                        let uncompressed_size = counter.written();
                        let encoder = counter.into_inner();
                        let hasher = encoder.finish().map_err(|err| {
                            PersistenceError::Io(format!("Error finishing compression: {err}"))
                        })?;
                        let (digest, _file) = hasher.finish();
                        (digest, uncompressed_size, frames)
                    };
                    tmp.as_file().sync_all().map_err(|err| {
                        PersistenceError::Io(format!("Error syncing backup file: {err}"))
                    })?;
                    tmp.persist(&backup_path).map_err(|err| {
                        PersistenceError::Io(format!("Error renaming backup into place: {err}"))
                    })?;
                    fsync_dir(&backups_dir)?;

                    let metadata = BackupMetadata {
                        project_hash: project_hash.clone(),
                        created_at_ms: now_ms(),
                        store_version: STORE_VERSION,
                        content_hash: content_digest.hash.to_hex(),
                        uncompressed_size: uncompressed_size as u64,
                        compressed_size: content_digest.size_bytes as u64,
                        generation,
                        session_id: journal.session_id().to_owned(),
                        delta_count: journal.delta_count() as u64,
                        schema_version: CURRENT_SCHEMA_VERSION,
                        metadata_hash: String::new(),
                    }
                    .seal()?;

                    write_atomically(
                        &project_dir,
                        &metadata_path,
                        &serde_json::to_vec_pretty(&metadata).map_err(|err| {
                            PersistenceError::Io(format!("Failed to encode metadata: {err}"))
                        })?,
                    )?;

                    debug!("Backup for {project_hash} wrote {frame_count} frames to {backup_path:?}");
                    Ok(metadata)
                },
                |e| Err(PersistenceError::Io(format!("`save_backup` task failed: {e}"))),
            )
            .await
    }

    ///
    /// Restores the given project's backup into the journal, verifying the metadata record and
    /// the content hash in a single decompression pass. The refresh coordinator, if registered,
    /// is paused for the duration (resume runs even if the restore panics).
    ///
    pub async fn load_backup<T: Serialize + DeserializeOwned + Send + 'static>(
        &self,
        project_hash: &str,
        journal: &Journal<T>,
    ) -> Result<BackupMetadata, PersistenceError> {
        self.ensure_open()?;
        Self::validate_hash(project_hash)?;

        let started = Instant::now();
        let result = self.load_attempt(project_hash, journal).await;
        match &result {
            Ok(_) => {
                self.inner
                    .metrics
                    .restore_duration_seconds
                    .observe(started.elapsed().as_secs_f64());
            }
            Err(_) => self.inner.metrics.restore_failures_total.inc(),
        }
        result
    }

    async fn load_attempt<T: Serialize + DeserializeOwned + Send + 'static>(
        &self,
        project_hash: &str,
        journal: &Journal<T>,
    ) -> Result<BackupMetadata, PersistenceError> {
        let inner = self.inner.clone();
        let journal = journal.clone();
        let backup_path = self.backup_path(project_hash);
        let metadata_path = self.metadata_path(project_hash);
        let project_hash = project_hash.to_owned();

        self.executor
            .spawn_blocking(
                move || {
                    let _restore = inner
                        .restore_gate
                        .try_lock()
                        .ok_or(PersistenceError::RestoreInProgress)?;

                    if !backup_path.is_file() || !metadata_path.is_file() {
                        return Err(PersistenceError::NotFound);
                    }

                    let lock_path = backup_path.with_file_name(format!(
                        "{BACKUP_FILE_NAME}{LOCK_SUFFIX}"
                    ));
                    let _lock =
                        BackupLock::acquire(&lock_path, false, inner.options.lock_timeout)?;

                    let metadata = read_metadata(&metadata_path)?;
                    if metadata.schema_version != CURRENT_SCHEMA_VERSION {
                        return Err(PersistenceError::VersionMismatch {
                            field: "schema_version".to_owned(),
                            want: CURRENT_SCHEMA_VERSION,
                            got: metadata.schema_version,
                        });
                    }
                    if metadata.store_version != STORE_VERSION {
                        return Err(PersistenceError::VersionMismatch {
                            field: "store_version".to_owned(),
                            want: STORE_VERSION,
                            got: metadata.store_version,
                        });
                    }

                    // Pause the refresh coordinator across the restore. The guard resumes it on
                    // every exit path, including panic unwinding.
                    let coordinator = inner.coordinator.lock().clone();
                    let _pause = PauseGuard::new(coordinator);

                    let file = File::open(&backup_path).map_err(|err| {
                        PersistenceError::Io(format!("Error opening {backup_path:?}: {err}"))
                    })?;
                    let reader = ReaderHasher::new(file);
                    let mut decoder = GzDecoder::new(reader);
                    journal.restore_sync(&mut decoder)?;

                    // Drain whatever the decoder did not consume (the gzip trailer, or trailing
                    // garbage) so that the hash covers the whole file.
                    let mut reader = decoder.into_inner();
                    io::copy(&mut reader, &mut io::sink()).map_err(|err| {
                        PersistenceError::Io(format!("Error draining backup file: {err}"))
                    })?;
                    let (digest, _file) = reader.finish();
                    let computed = digest.hash.to_hex();
                    if computed != metadata.content_hash {
                        return Err(PersistenceError::Corrupted(format!(
                            "Content hash mismatch: recorded {}, computed {computed}",
                            metadata.content_hash
                        )));
                    }

                    info!(
                        "Restored backup for project {project_hash}: {} deltas at generation {}",
                        metadata.delta_count, metadata.generation
                    );
                    Ok(metadata)
                },
                |e| Err(PersistenceError::Io(format!("`load_backup` task failed: {e}"))),
            )
            .await
    }

    pub fn has_backup(&self, project_hash: &str) -> Result<bool, PersistenceError> {
        self.ensure_open()?;
        Self::validate_hash(project_hash)?;
        Ok(self.backup_path(project_hash).is_file() && self.metadata_path(project_hash).is_file())
    }

    ///
    /// Reads and integrity-checks the metadata record without touching the backup itself.
    ///
    pub async fn get_backup_metadata(
        &self,
        project_hash: &str,
    ) -> Result<BackupMetadata, PersistenceError> {
        self.ensure_open()?;
        Self::validate_hash(project_hash)?;
        let metadata_path = self.metadata_path(project_hash);

        self.executor
            .spawn_blocking(
                move || {
                    if !metadata_path.is_file() {
                        return Err(PersistenceError::NotFound);
                    }
                    read_metadata(&metadata_path)
                },
                |e| {
                    Err(PersistenceError::Io(format!(
                        "`get_backup_metadata` task failed: {e}"
                    )))
                },
            )
            .await
    }

    ///
    /// Closes the manager. Idempotent: all subsequent operations fail with `Closed`.
    ///
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("Persistence manager closed");
        }
    }
}

///
/// An acquired advisory file lock, released on drop.
///
struct BackupLock {
    file: File,
}

impl BackupLock {
    ///
    /// Polls for the lock with exponential backoff until `timeout` elapses.
    ///
    fn acquire(path: &Path, exclusive: bool, timeout: Duration) -> Result<BackupLock, PersistenceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|err| {
                PersistenceError::Io(format!("Error opening lock file {path:?}: {err}"))
            })?;

        let deadline = Instant::now() + timeout;
        let mut backoff = LOCK_INITIAL_BACKOFF;
        loop {
            let attempt = if exclusive {
                file.try_lock_exclusive()
            } else {
                fs2::FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => return Ok(BackupLock { file }),
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(PersistenceError::LockFailed(format!(
                            "Timed out waiting for {} lock on {path:?}: {err}",
                            if exclusive { "exclusive" } else { "shared" },
                        )));
                    }
                    std::thread::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())));
                    backoff = (backoff * 2).min(LOCK_MAX_BACKOFF);
                }
            }
        }
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

///
/// Pauses the coordinator on construction and resumes it on drop, so that resume runs on all
/// exit paths including panic unwinding.
///
struct PauseGuard {
    coordinator: Option<Arc<dyn RefreshCoordinator>>,
}

impl PauseGuard {
    fn new(coordinator: Option<Arc<dyn RefreshCoordinator>>) -> PauseGuard {
        if let Some(coordinator) = &coordinator {
            coordinator.pause();
        }
        PauseGuard { coordinator }
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if let Some(coordinator) = &self.coordinator {
            coordinator.resume();
        }
    }
}

///
/// A Write instance that counts the bytes that pass through it.
///
struct CountingWriter<W> {
    inner: W,
    written: usize,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> CountingWriter<W> {
        CountingWriter { inner, written: 0 }
    }

    fn written(&self) -> usize {
        self.written
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.written += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn read_metadata(path: &Path) -> Result<BackupMetadata, PersistenceError> {
    let bytes = std::fs::read(path)
        .map_err(|err| PersistenceError::Io(format!("Error reading {path:?}: {err}")))?;
    let metadata: BackupMetadata = serde_json::from_slice(&bytes)
        .map_err(|err| PersistenceError::MetadataCorrupted(format!("Unparseable: {err}")))?;
    metadata.verify()?;
    Ok(metadata)
}

///
/// Writes via a temp file in the same directory, fsyncs, renames into place, and fsyncs the
/// directory, so a crash leaves either the old or the new content.
///
fn write_atomically(dir: &Path, target: &Path, content: &[u8]) -> Result<(), PersistenceError> {
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|err| PersistenceError::Io(format!("Error creating temp file in {dir:?}: {err}")))?;
    tmp.write_all(content)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| PersistenceError::Io(format!("Error writing {target:?}: {err}")))?;
    tmp.persist(target)
        .map_err(|err| PersistenceError::Io(format!("Error renaming {target:?}: {err}")))?;
    fsync_dir(dir)
}

fn fsync_dir(dir: &Path) -> Result<(), PersistenceError> {
    File::open(dir)
        .and_then(|f| f.sync_all())
        .map_err(|err| PersistenceError::Io(format!("Error syncing directory {dir:?}: {err}")))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Surely you're not before the unix epoch?")
        .as_millis() as i64
}

#[cfg(test)]
mod tests;
