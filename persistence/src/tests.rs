// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use journal::{Journal, JournalOptions};
use serde_derive::{Deserialize, Serialize};
use task_executor::Executor;
use tempfile::TempDir;

use crate::{
    BackupMetadata, PersistenceError, PersistenceManager, PersistenceOptions, RefreshCoordinator,
    CURRENT_SCHEMA_VERSION,
};

const PROJECT: &str = "abcdef0123456789";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
struct TestEntry {
    node: String,
    proof: u64,
}

fn entry(node: &str, proof: u64) -> TestEntry {
    TestEntry {
        node: node.to_owned(),
        proof,
    }
}

fn new_manager() -> (PersistenceManager, TempDir) {
    let tempdir = TempDir::new().unwrap();
    let manager = PersistenceManager::new(
        Executor::new(),
        PersistenceOptions {
            lock_timeout: Duration::from_secs(2),
            ..PersistenceOptions::new(tempdir.path().to_owned())
        },
        None,
    )
    .unwrap();
    (manager, tempdir)
}

fn new_journal(tempdir: &TempDir, name: &str) -> Journal<TestEntry> {
    Journal::new(
        Executor::new(),
        tempdir.path().join(name),
        "session-1".to_owned(),
        JournalOptions::default(),
    )
    .unwrap()
}

async fn save_sample_backup(manager: &PersistenceManager, tempdir: &TempDir) -> BackupMetadata {
    let journal = new_journal(tempdir, "src-journal");
    journal.append(&entry("node1", 10)).await.unwrap();
    journal.append(&entry("node2", 20)).await.unwrap();
    manager.save_backup(PROJECT, &journal, 2).await.unwrap()
}

#[tokio::test]
async fn save_and_load_round_trip() {
    let (manager, tempdir) = new_manager();
    let metadata = save_sample_backup(&manager, &tempdir).await;

    assert_eq!(metadata.project_hash, PROJECT);
    assert_eq!(metadata.delta_count, 2);
    assert_eq!(metadata.schema_version, CURRENT_SCHEMA_VERSION);
    assert!(metadata.compressed_size > 0);
    assert!(metadata.uncompressed_size > 0);
    assert!(!metadata.content_hash.is_empty());

    let fresh = new_journal(&tempdir, "dst-journal");
    let loaded = manager.load_backup(PROJECT, &fresh).await.unwrap();
    assert_eq!(loaded, metadata);

    let replayed = fresh.replay().await.unwrap();
    assert_eq!(replayed.entries.len(), 2);
    assert_eq!(replayed.entries[0].entry, entry("node1", 10));
    assert_eq!(replayed.entries[1].entry, entry("node2", 20));
}

#[tokio::test]
async fn has_backup_and_metadata() {
    let (manager, tempdir) = new_manager();
    assert!(!manager.has_backup(PROJECT).unwrap());
    assert_eq!(
        manager.get_backup_metadata(PROJECT).await.unwrap_err(),
        PersistenceError::NotFound
    );

    let saved = save_sample_backup(&manager, &tempdir).await;
    assert!(manager.has_backup(PROJECT).unwrap());
    assert_eq!(manager.get_backup_metadata(PROJECT).await.unwrap(), saved);
}

#[tokio::test]
async fn rejects_invalid_project_hashes() {
    let (manager, tempdir) = new_manager();
    let journal = new_journal(&tempdir, "journal");

    for bad in ["", "short", "UPPERCASE0123456", "not-hex-0123456!", &"a".repeat(65)] {
        let err = manager.save_backup(bad, &journal, 0).await.unwrap_err();
        assert!(
            matches!(err, PersistenceError::InvalidProjectHash(_)),
            "Want InvalidProjectHash for {bad:?}, got {err:?}"
        );
    }
}

#[tokio::test]
async fn load_missing_backup_is_not_found() {
    let (manager, tempdir) = new_manager();
    let journal = new_journal(&tempdir, "journal");
    assert_eq!(
        manager.load_backup(PROJECT, &journal).await.unwrap_err(),
        PersistenceError::NotFound
    );
}

#[tokio::test]
async fn tampered_backup_fails_to_load() {
    let (manager, tempdir) = new_manager();
    save_sample_backup(&manager, &tempdir).await;

    // Flip one byte in the middle of the compressed stream.
    let backup_path = tempdir
        .path()
        .join(PROJECT)
        .join("backups")
        .join("latest.backup.gz");
    let mut bytes = std::fs::read(&backup_path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    std::fs::write(&backup_path, &bytes).unwrap();

    let fresh = new_journal(&tempdir, "dst-journal");
    let err = manager.load_backup(PROJECT, &fresh).await.unwrap_err();
    // Depending on where the flip lands this surfaces as a decompression failure, a journal
    // frame error, or a content hash mismatch; it must never load cleanly.
    assert!(
        matches!(
            err,
            PersistenceError::Corrupted(_) | PersistenceError::Io(_) | PersistenceError::Journal(_)
        ),
        "Want a corruption error, got {err:?}"
    );
}

#[tokio::test]
async fn tampered_metadata_fails_to_load() {
    let (manager, tempdir) = new_manager();
    let saved = save_sample_backup(&manager, &tempdir).await;

    let metadata_path = tempdir.path().join(PROJECT).join("metadata.json");
    let tampered = BackupMetadata {
        generation: saved.generation + 1,
        ..saved
    };
    std::fs::write(&metadata_path, serde_json::to_vec(&tampered).unwrap()).unwrap();

    let fresh = new_journal(&tempdir, "dst-journal");
    let err = manager.load_backup(PROJECT, &fresh).await.unwrap_err();
    assert!(
        matches!(err, PersistenceError::MetadataCorrupted(_)),
        "Want MetadataCorrupted, got {err:?}"
    );
}

#[tokio::test]
async fn schema_version_mismatch_fails_to_load() {
    let (manager, tempdir) = new_manager();
    let saved = save_sample_backup(&manager, &tempdir).await;

    // Re-seal the metadata with a bad schema version, so only the version check can object.
    let tampered = BackupMetadata {
        schema_version: CURRENT_SCHEMA_VERSION + 1,
        ..saved
    }
    .seal()
    .unwrap();
    let metadata_path = tempdir.path().join(PROJECT).join("metadata.json");
    std::fs::write(&metadata_path, serde_json::to_vec(&tampered).unwrap()).unwrap();

    let fresh = new_journal(&tempdir, "dst-journal");
    let err = manager.load_backup(PROJECT, &fresh).await.unwrap_err();
    assert_eq!(
        err,
        PersistenceError::VersionMismatch {
            field: "schema_version".to_owned(),
            want: CURRENT_SCHEMA_VERSION,
            got: CURRENT_SCHEMA_VERSION + 1,
        }
    );
}

#[derive(Default)]
struct RecordingCoordinator {
    pauses: AtomicUsize,
    resumes: AtomicUsize,
}

impl RefreshCoordinator for RecordingCoordinator {
    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.pauses.load(Ordering::SeqCst) > self.resumes.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn refresh_coordinator_is_paused_and_resumed() {
    let (manager, tempdir) = new_manager();
    save_sample_backup(&manager, &tempdir).await;

    let coordinator = Arc::new(RecordingCoordinator::default());
    manager.set_refresh_coordinator(coordinator.clone());

    let fresh = new_journal(&tempdir, "dst-journal");
    manager.load_backup(PROJECT, &fresh).await.unwrap();
    assert_eq!(coordinator.pauses.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.resumes.load(Ordering::SeqCst), 1);
    assert!(!coordinator.is_paused());

    // Resume also runs when the restore fails.
    let backup_path = tempdir
        .path()
        .join(PROJECT)
        .join("backups")
        .join("latest.backup.gz");
    let mut bytes = std::fs::read(&backup_path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    std::fs::write(&backup_path, &bytes).unwrap();
    let fresh = new_journal(&tempdir, "dst-journal-2");
    manager.load_backup(PROJECT, &fresh).await.unwrap_err();
    assert_eq!(coordinator.resumes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn save_overwrites_previous_backup() {
    let (manager, tempdir) = new_manager();
    save_sample_backup(&manager, &tempdir).await;

    let journal = new_journal(&tempdir, "src-journal-2");
    journal.append(&entry("node3", 30)).await.unwrap();
    let second = manager.save_backup(PROJECT, &journal, 5).await.unwrap();
    assert_eq!(second.generation, 5);

    let fresh = new_journal(&tempdir, "dst-journal");
    manager.load_backup(PROJECT, &fresh).await.unwrap();
    let replayed = fresh.replay().await.unwrap();
    assert_eq!(replayed.entries.len(), 1);
    assert_eq!(replayed.entries[0].entry, entry("node3", 30));
}

#[tokio::test]
async fn close_is_idempotent() {
    let (manager, tempdir) = new_manager();
    let journal = new_journal(&tempdir, "journal");
    manager.close();
    manager.close();
    assert_eq!(
        manager.save_backup(PROJECT, &journal, 0).await.unwrap_err(),
        PersistenceError::Closed
    );
    assert_eq!(manager.has_backup(PROJECT).unwrap_err(), PersistenceError::Closed);
}
