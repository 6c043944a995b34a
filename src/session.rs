// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use hashing::{Digest, StreamingHasher};
use journal::Journal;
use log::{debug, info, warn};
use persistence::PersistenceManager;

use crate::context::Context;
use crate::core::Crs;
use crate::delta::Delta;
use crate::error::Error;

///
/// The lock files whose contents identify a project's dependency state. Ordered: the project
/// hash is a streaming digest over their concatenated contents.
///
const LOCK_FILES: &[&str] = &[
    "go.mod",
    "go.sum",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "requirements.txt",
    "poetry.lock",
];

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

///
/// Identifies the project a session runs against: where it is, what its dependencies were, and
/// (best effort) which commit it was on.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionIdentifier {
    /// The canonical absolute project path.
    pub project_path: PathBuf,
    /// Lowercase hex, derived from lock file contents (or the path, when none exist).
    pub project_hash: String,
    /// Best effort: absent when the project is not a git checkout.
    pub git_commit_hash: Option<String>,
    pub computed_at_ms: i64,
}

impl SessionIdentifier {
    pub fn compute(project_path: &Path) -> Result<SessionIdentifier, Error> {
        let project_path = project_path
            .canonicalize()
            .map_err(|err| {
                Error::SessionIdentifier(format!(
                    "Could not canonicalize {project_path:?}: {err}"
                ))
            })?;

        let mut hasher = StreamingHasher::new();
        let mut saw_lock_file = false;
        for lock_file in LOCK_FILES {
            let path = project_path.join(lock_file);
            match std::fs::read(&path) {
                Ok(contents) => {
                    hasher.update(&contents);
                    saw_lock_file = true;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => {
                    return Err(Error::SessionIdentifier(format!(
                        "Could not read {path:?}: {err}"
                    )));
                }
            }
        }

        let project_hash = if saw_lock_file {
            hasher.finish().hash.to_hex()
        } else {
            // No lock files: fall back to a prefix of the path digest.
            Self::path_digest(&project_path).hash.prefix_hex()
        };

        Ok(SessionIdentifier {
            git_commit_hash: git_commit_hash(&project_path),
            project_hash,
            computed_at_ms: crate::now_ms(),
            project_path,
        })
    }

    fn path_digest(path: &Path) -> Digest {
        Digest::of_bytes(path.to_string_lossy().as_bytes())
    }

    ///
    /// The per-project persistence directory name: the first 16 bytes of the path digest, hex
    /// encoded (32 characters, satisfying the persistence manager's lexical check).
    ///
    pub fn checkpoint_key(&self) -> String {
        Self::path_digest(&self.project_path).hash.prefix_hex()
    }
}

fn git_commit_hash(project_path: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(project_path)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8(output.stdout).ok()?.trim().to_owned();
    if hash.is_empty() {
        None
    } else {
        Some(hash)
    }
}

///
/// The outcome of a restore attempt. `restored == false` with a reason is the normal path for
/// fresh projects and incompatible checkpoints; errors are reserved for failures of a
/// compatible restore.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RestoreOutcome {
    pub restored: bool,
    pub reason: String,
    pub deltas_applied: usize,
    pub generation: u64,
}

impl RestoreOutcome {
    fn skipped(reason: &str) -> RestoreOutcome {
        RestoreOutcome {
            restored: false,
            reason: reason.to_owned(),
            deltas_applied: 0,
            generation: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionRestorerOptions {
    /// Checkpoints older than this are ignored.
    pub checkpoint_max_age_ms: i64,
    /// How many times transient restore failures are retried.
    pub max_retries: usize,
}

impl Default for SessionRestorerOptions {
    fn default() -> SessionRestorerOptions {
        SessionRestorerOptions {
            checkpoint_max_age_ms: 7 * DAY_MS,
            max_retries: 3,
        }
    }
}

///
/// Restores a prior session's state on startup: gate on checkpoint compatibility and age, load
/// the backup into the journal, replay and apply every delta, then checkpoint the journal so
/// the same deltas are not replayed next session.
///
pub struct SessionRestorer {
    manager: PersistenceManager,
    options: SessionRestorerOptions,
}

impl SessionRestorer {
    pub fn new(manager: PersistenceManager, options: SessionRestorerOptions) -> SessionRestorer {
        SessionRestorer { manager, options }
    }

    pub async fn try_restore(
        &self,
        ctx: &Context,
        crs: &Crs,
        journal: &Journal<Delta>,
        sid: &SessionIdentifier,
    ) -> Result<RestoreOutcome, Error> {
        ctx.check()?;
        let key = sid.checkpoint_key();

        if !self.manager.has_backup(&key)? {
            return Ok(RestoreOutcome::skipped("no checkpoint found"));
        }
        let metadata = match self.manager.get_backup_metadata(&key).await {
            Ok(metadata) => metadata,
            Err(persistence::PersistenceError::NotFound) => {
                return Ok(RestoreOutcome::skipped("no checkpoint metadata"));
            }
            Err(err) => return Err(err.into()),
        };

        // Compatibility gates: wrong versions or a stale checkpoint mean "start fresh", never
        // "fail the session", and are never retried.
        if metadata.schema_version != persistence::CURRENT_SCHEMA_VERSION {
            return Ok(RestoreOutcome::skipped(&format!(
                "incompatible schema version {}",
                metadata.schema_version
            )));
        }
        if metadata.store_version != persistence::STORE_VERSION {
            return Ok(RestoreOutcome::skipped(&format!(
                "incompatible store version {}",
                metadata.store_version
            )));
        }
        let age_ms = crate::now_ms() - metadata.created_at_ms;
        if age_ms > self.options.checkpoint_max_age_ms {
            debug!(
                "Ignoring checkpoint for {key}: {age_ms}ms old exceeds {}ms",
                self.options.checkpoint_max_age_ms
            );
            return Ok(RestoreOutcome::skipped("checkpoint too old"));
        }

        let mut backoff = Duration::from_millis(100);
        let mut attempt = 0_usize;
        loop {
            ctx.check()?;
            match self.restore_attempt(ctx, crs, journal, &key).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if is_transient(&err) && attempt < self.options.max_retries => {
                    attempt += 1;
                    warn!("Restore attempt {attempt} for {key} failed ({err}): retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn restore_attempt(
        &self,
        ctx: &Context,
        crs: &Crs,
        journal: &Journal<Delta>,
        key: &str,
    ) -> Result<RestoreOutcome, Error> {
        self.manager.load_backup(key, journal).await?;

        let replayed = journal.replay().await?;
        let mut applied = 0_usize;
        for item in replayed.entries {
            ctx.check()?;
            crs.apply(ctx, item.entry).await?;
            applied += 1;
        }

        // Checkpoint, so a future session does not replay what this one just applied.
        journal.checkpoint().await?;

        info!(
            "Restored session for project {key}: {applied} deltas applied, now at generation {}",
            crs.generation()
        );
        Ok(RestoreOutcome {
            restored: true,
            reason: "checkpoint restored".to_owned(),
            deltas_applied: applied,
            generation: crs.generation(),
        })
    }
}

fn is_transient(err: &Error) -> bool {
    match err {
        Error::Persistence(err) => err.is_transient(),
        Error::Journal(err) => {
            matches!(err, journal::JournalError::Io(_) | journal::JournalError::Lmdb(_))
        }
        Error::Io(_) => true,
        _ => false,
    }
}

#[derive(Clone, Debug)]
pub struct ModifiedFilesOptions {
    /// Whether to try `git diff` before falling back to a filesystem walk.
    pub use_git: bool,
    /// Discovery aborts once more than this many files have been found.
    pub max_files: usize,
}

impl Default for ModifiedFilesOptions {
    fn default() -> ModifiedFilesOptions {
        ModifiedFilesOptions {
            use_git: true,
            max_files: 1000,
        }
    }
}

///
/// Finds files under the project modified since the given time: via git when enabled and
/// available, otherwise by walking the tree (skipping hidden directories) and comparing mtimes.
/// Either path aborts with `TooManyModifiedFiles` once the limit is exceeded.
///
pub fn find_files_modified_since(
    ctx: &Context,
    project_path: &Path,
    since: SystemTime,
    options: &ModifiedFilesOptions,
) -> Result<Vec<PathBuf>, Error> {
    ctx.check()?;
    if options.use_git {
        if let Some(files) = git_modified_files(project_path, since, options.max_files)? {
            return Ok(files);
        }
    }
    walk_modified_files(ctx, project_path, since, options.max_files)
}

///
/// The git fast path. Returns None when git is unavailable or the query fails, in which case
/// the caller falls back to walking.
///
fn git_modified_files(
    project_path: &Path,
    since: SystemTime,
    max_files: usize,
) -> Result<Option<Vec<PathBuf>>, Error> {
    let since_ms = since
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let output = match Command::new("git")
        .args([
            "diff",
            "--name-only",
            "--diff-filter=ACMRT",
            &format!("@{{{since_ms}}}"),
        ])
        .current_dir(project_path)
        .output()
    {
        Ok(output) => output,
        Err(_) => return Ok(None),
    };
    if !output.status.success() {
        return Ok(None);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut files = Vec::new();
    for line in stdout.lines().filter(|l| !l.is_empty()) {
        files.push(project_path.join(line));
        if files.len() > max_files {
            return Err(Error::TooManyModifiedFiles { limit: max_files });
        }
    }
    Ok(Some(files))
}

// How many walk entries may elapse between cancellation polls.
const WALK_POLL_INTERVAL: usize = 256;

fn walk_modified_files(
    ctx: &Context,
    project_path: &Path,
    since: SystemTime,
    max_files: usize,
) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(project_path)
        .into_iter()
        .filter_entry(|entry| {
            // Skip hidden directories (and files): .git, .venv, editor state.
            !(entry.depth() > 0
                && entry
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with('.'))
                    .unwrap_or(false))
        });

    for (i, entry) in walker.enumerate() {
        if i % WALK_POLL_INTERVAL == 0 {
            ctx.check()?;
        }
        let entry = match entry {
            Ok(entry) => entry,
            // Unreadable subtrees are skipped, not fatal.
            Err(err) => {
                debug!("Skipping unreadable entry during scan: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok());
        if matches!(modified, Some(mtime) if mtime > since) {
            files.push(entry.into_path());
            if files.len() > max_files {
                return Err(Error::TooManyModifiedFiles { limit: max_files });
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod session_tests;
