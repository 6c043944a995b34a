// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use serde_derive::{Deserialize, Serialize};
use task_executor::Executor;
use tempfile::TempDir;

use crate::{Journal, JournalError, JournalOptions};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
struct TestEntry {
    node: String,
    value: u64,
}

fn entry(node: &str, value: u64) -> TestEntry {
    TestEntry {
        node: node.to_owned(),
        value,
    }
}

fn new_journal(options: JournalOptions) -> (Journal<TestEntry>, TempDir) {
    let tempdir = TempDir::new().unwrap();
    let journal = Journal::new(
        Executor::new(),
        tempdir.path().join("journal"),
        "session-1".to_owned(),
        options,
    )
    .unwrap();
    (journal, tempdir)
}

#[tokio::test]
async fn append_and_replay_in_order() {
    let (journal, _tempdir) = new_journal(JournalOptions::default());

    for i in 0..5 {
        let seq = journal.append(&entry("node", i)).await.unwrap();
        assert_eq!(seq, i + 1);
    }

    let replayed = journal.replay().await.unwrap();
    assert_eq!(replayed.skipped, 0);
    assert_eq!(replayed.entries.len(), 5);
    for (i, item) in replayed.entries.iter().enumerate() {
        assert_eq!(item.seq, i as u64 + 1);
        assert_eq!(item.entry, entry("node", i as u64));
    }
}

#[tokio::test]
async fn append_batch_is_contiguous() {
    let (journal, _tempdir) = new_journal(JournalOptions::default());

    journal.append(&entry("a", 0)).await.unwrap();
    let range = journal
        .append_batch(&[entry("b", 1), entry("c", 2), entry("d", 3)])
        .await
        .unwrap();
    assert_eq!(range, 2..5);

    let replayed = journal.replay().await.unwrap();
    let seqs: Vec<u64> = replayed.entries.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn replay_survives_reopen() {
    let tempdir = TempDir::new().unwrap();
    let path = tempdir.path().join("journal");
    {
        let journal: Journal<TestEntry> = Journal::new(
            Executor::new(),
            path.clone(),
            "session-1".to_owned(),
            JournalOptions::default(),
        )
        .unwrap();
        journal.append(&entry("persisted", 42)).await.unwrap();
        journal.close();
    }

    let journal: Journal<TestEntry> = Journal::new(
        Executor::new(),
        path,
        "session-1".to_owned(),
        JournalOptions::default(),
    )
    .unwrap();
    // The sequence counter continues where it left off.
    assert_eq!(journal.append(&entry("next", 43)).await.unwrap(), 2);
    let replayed = journal.replay().await.unwrap();
    assert_eq!(replayed.entries.len(), 2);
    assert_eq!(replayed.entries[0].entry, entry("persisted", 42));
}

#[tokio::test]
async fn checkpoint_truncates() {
    let (journal, _tempdir) = new_journal(JournalOptions::default());

    journal.append(&entry("a", 0)).await.unwrap();
    journal.append(&entry("b", 1)).await.unwrap();
    assert_eq!(journal.checkpoint().await.unwrap(), 2);

    // Nothing to replay, and the byte budget was reset.
    let replayed = journal.replay().await.unwrap();
    assert!(replayed.entries.is_empty());
    let stats = journal.stats();
    assert_eq!(stats.byte_count, 0);
    assert_eq!(stats.checkpoint_seq, 2);

    // New appends continue the sequence and replay from the checkpoint.
    assert_eq!(journal.append(&entry("c", 2)).await.unwrap(), 3);
    let replayed = journal.replay().await.unwrap();
    assert_eq!(replayed.entries.len(), 1);
    assert_eq!(replayed.entries[0].seq, 3);
}

#[tokio::test]
async fn corrupted_entry_fails_replay() {
    let (journal, _tempdir) = new_journal(JournalOptions::default());
    journal.append(&entry("a", 0)).await.unwrap();

    flip_one_value_byte(&journal);

    let err = journal.replay().await.unwrap_err();
    assert!(
        matches!(err, JournalError::Corrupted(_)),
        "Want Corrupted, got {err:?}"
    );
}

#[tokio::test]
async fn corrupted_entry_skipped_when_configured() {
    let (journal, _tempdir) = new_journal(JournalOptions {
        skip_corrupted_deltas: true,
        ..JournalOptions::default()
    });
    journal.append(&entry("a", 0)).await.unwrap();
    journal.append(&entry("b", 1)).await.unwrap();

    flip_one_value_byte(&journal);

    let replayed = journal.replay().await.unwrap();
    assert_eq!(replayed.skipped, 1);
    assert_eq!(replayed.entries.len(), 1);
}

#[tokio::test]
async fn sequence_gap_fails_replay() {
    let (journal, _tempdir) = new_journal(JournalOptions::default());
    journal.append(&entry("a", 0)).await.unwrap();
    journal.append(&entry("b", 1)).await.unwrap();
    journal.append(&entry("c", 2)).await.unwrap();

    delete_seq(&journal, 2);

    let err = journal.replay().await.unwrap_err();
    assert_eq!(
        err,
        JournalError::SequenceGap {
            expected: 2,
            found: 3,
        }
    );
}

#[tokio::test]
async fn full_journal_refuses_appends() {
    let (journal, _tempdir) = new_journal(JournalOptions {
        max_journal_bytes: 32,
        ..JournalOptions::default()
    });

    journal.append(&entry("tiny", 0)).await.unwrap();
    let err = journal.append(&entry("overflow", 1)).await.unwrap_err();
    assert!(
        matches!(err, JournalError::Full { .. }),
        "Want Full, got {err:?}"
    );
}

#[tokio::test]
async fn close_is_idempotent() {
    let (journal, _tempdir) = new_journal(JournalOptions::default());
    journal.close();
    journal.close();
    assert_eq!(
        journal.append(&entry("a", 0)).await.unwrap_err(),
        JournalError::Closed
    );
    assert_eq!(journal.replay().await.unwrap_err(), JournalError::Closed);
}

#[tokio::test]
async fn degraded_mode_refuses_writes_and_replays_empty() {
    let tempdir = TempDir::new().unwrap();
    // Occupy the journal path with a file, so the store cannot open.
    let path = tempdir.path().join("journal");
    std::fs::write(&path, b"not a directory").unwrap();

    let journal: Journal<TestEntry> = Journal::new(
        Executor::new(),
        path,
        "session-1".to_owned(),
        JournalOptions {
            allow_degraded: true,
            ..JournalOptions::default()
        },
    )
    .unwrap();

    assert!(journal.is_degraded());
    assert_eq!(
        journal.append(&entry("a", 0)).await.unwrap_err(),
        JournalError::Degraded
    );
    assert!(journal.replay().await.unwrap().entries.is_empty());
    // Checkpoint and sync no-op cleanly.
    journal.checkpoint().await.unwrap();
    journal.sync().await.unwrap();
}

#[tokio::test]
async fn replay_stream_yields_all_entries() {
    let (journal, _tempdir) = new_journal(JournalOptions::default());
    for i in 0..10 {
        journal.append(&entry("node", i)).await.unwrap();
    }

    let mut rx = journal.replay_stream(4);
    let mut seqs = Vec::new();
    while let Some(event) = rx.recv().await {
        assert!(!event.skipped);
        assert!(event.error.is_none());
        seqs.push(event.seq);
    }
    assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn replay_stream_reports_skipped_entries() {
    let (journal, _tempdir) = new_journal(JournalOptions {
        skip_corrupted_deltas: true,
        ..JournalOptions::default()
    });
    journal.append(&entry("a", 0)).await.unwrap();
    journal.append(&entry("b", 1)).await.unwrap();
    flip_one_value_byte(&journal);

    let mut rx = journal.replay_stream(4);
    let mut entries = 0;
    let mut skipped = 0;
    while let Some(event) = rx.recv().await {
        if event.skipped {
            skipped += 1;
            assert!(event.error.is_some());
        } else {
            entries += 1;
        }
    }
    assert_eq!((entries, skipped), (1, 1));
}

#[tokio::test]
async fn replay_stream_delivers_fatal_errors() {
    let (journal, _tempdir) = new_journal(JournalOptions::default());
    journal.append(&entry("a", 0)).await.unwrap();
    flip_one_value_byte(&journal);

    let mut rx = journal.replay_stream(4);
    let event = rx.recv().await.expect("Want a terminal error event");
    assert!(matches!(event.error, Some(JournalError::Corrupted(_))));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn backup_restore_round_trip() {
    let (journal, _tempdir) = new_journal(JournalOptions::default());
    journal.append(&entry("a", 0)).await.unwrap();
    journal.append(&entry("b", 1)).await.unwrap();

    let mut backup = Vec::new();
    journal.backup_sync(&mut backup).unwrap();

    let (fresh, _tempdir2) = new_journal(JournalOptions::default());
    fresh.restore_sync(&mut backup.as_slice()).unwrap();

    let replayed = fresh.replay().await.unwrap();
    assert_eq!(replayed.entries.len(), 2);
    assert_eq!(replayed.entries[0].entry, entry("a", 0));
    assert_eq!(replayed.entries[1].entry, entry("b", 1));
    // The restored journal continues the restored sequence.
    assert_eq!(fresh.append(&entry("c", 2)).await.unwrap(), 3);
}

///
/// Flips one byte beyond the CRC prefix of the first stored entry, bypassing the journal API.
///
fn flip_one_value_byte(journal: &Journal<TestEntry>) {
    journal
        .tamper_first_entry(|value| {
            let last = value.len() - 1;
            value[last] ^= 0x01;
        })
        .unwrap();
}

fn delete_seq(journal: &Journal<TestEntry>, seq: u64) {
    journal.tamper_delete_seq(seq).unwrap();
}
