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
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use lmdb::{
    Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, Transaction, WriteFlags,
};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use task_executor::Executor;

/// The default budget for journal growth between checkpoints.
pub const DEFAULT_MAX_JOURNAL_BYTES: usize = 256 * 1024 * 1024;

// The CRC32 frame prefix on every stored entry.
const CRC_PREFIX_SIZE: usize = 4;

// Sequences are rendered zero padded to this width so that the lexicographic key order LMDB
// iterates in is also the numeric order.
const SEQ_WIDTH: usize = 16;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JournalError {
    /// The journal has been closed; no further operations are possible.
    Closed,
    /// The backing store could not be opened and the journal was configured to degrade rather
    /// than fail: writes are refused and replays are empty.
    Degraded,
    /// Appending would exceed the configured byte budget.
    Full { needed: usize, budget: usize },
    /// An entry failed its CRC or could not be decoded.
    Corrupted(String),
    /// A sequence number was missing during replay.
    SequenceGap { expected: u64, found: u64 },
    Lmdb(String),
    Encoding(String),
    Io(String),
}

impl fmt::Display for JournalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalError::Closed => write!(f, "Journal is closed"),
            JournalError::Degraded => write!(f, "Journal is in degraded mode"),
            JournalError::Full { needed, budget } => {
                write!(f, "Journal is full: needed {needed} bytes of budget {budget}")
            }
            JournalError::Corrupted(msg) => write!(f, "Journal entry corrupted: {msg}"),
            JournalError::SequenceGap { expected, found } => {
                write!(f, "Journal sequence gap: expected {expected}, found {found}")
            }
            JournalError::Lmdb(msg) => write!(f, "Journal store error: {msg}"),
            JournalError::Encoding(msg) => write!(f, "Journal encoding error: {msg}"),
            JournalError::Io(msg) => write!(f, "Journal io error: {msg}"),
        }
    }
}

impl From<lmdb::Error> for JournalError {
    fn from(err: lmdb::Error) -> Self {
        JournalError::Lmdb(err.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct JournalOptions {
    /// How many bytes of entries may accumulate between checkpoints.
    pub max_journal_bytes: usize,
    /// Whether replay logs and skips corrupted entries and sequence gaps instead of failing.
    pub skip_corrupted_deltas: bool,
    /// Whether a journal whose store cannot open comes up degraded instead of failing.
    pub allow_degraded: bool,
    /// The LMDB map size.
    pub map_size: usize,
}

impl Default for JournalOptions {
    fn default() -> JournalOptions {
        JournalOptions {
            max_journal_bytes: DEFAULT_MAX_JOURNAL_BYTES,
            skip_corrupted_deltas: false,
            allow_degraded: false,
            map_size: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalStats {
    pub entry_count: usize,
    pub byte_count: usize,
    pub last_seq: u64,
    pub checkpoint_seq: u64,
    pub degraded: bool,
}

/// One replayed entry, along with the sequence it was stored under.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Replayed<T> {
    pub seq: u64,
    pub entry: T,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplayResult<T> {
    pub entries: Vec<Replayed<T>>,
    pub skipped: usize,
}

/// One event on a streaming replay: either a decoded entry, or a skipped-corruption notice when
/// `skip_corrupted_deltas` is set.
#[derive(Clone, Debug)]
pub struct ReplayEvent<T> {
    pub seq: u64,
    pub entry: Option<T>,
    pub error: Option<JournalError>,
    pub skipped: bool,
}

enum Store {
    Open {
        env: Arc<Environment>,
        db: Database,
        #[allow(dead_code)]
        path: PathBuf,
    },
    Degraded,
    Closed,
}

struct Inner {
    store: Mutex<Store>,
    // Serializes writers: LMDB allows one write transaction at a time, and the sequence claim
    // must be atomic with the transaction that stores the entry.
    write_lock: Mutex<()>,
    next_seq: AtomicU64,
    byte_count: AtomicUsize,
    checkpoint_seq: AtomicU64,
    session_id: String,
    options: JournalOptions,
}

///
/// A write-ahead journal of binary encoded entries in a local LMDB store.
///
/// Entries are stored under `delta:<session>:<seq>` keys with zero padded sequences, so cursor
/// order is replay order. Values carry a big-endian CRC32 of the encoded entry as a prefix. A
/// `checkpoint:latest:<session>` marker holds the last truncated sequence as 8 big-endian bytes.
///
/// Unlike a content-addressed store, the journal env is opened without `NO_SYNC`: losing
/// acknowledged appends on system crash would defeat the purpose of a WAL.
///
pub struct Journal<T> {
    inner: Arc<Inner>,
    executor: Executor,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Journal<T> {
    fn clone(&self) -> Self {
        Journal {
            inner: self.inner.clone(),
            executor: self.executor.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned + Send + 'static> Journal<T> {
    pub fn new(
        executor: Executor,
        path: PathBuf,
        session_id: String,
        options: JournalOptions,
    ) -> Result<Journal<T>, JournalError> {
        let store = match Self::open_store(&path, &options) {
            Ok((env, db)) => Store::Open {
                env: Arc::new(env),
                db,
                path,
            },
            Err(err) if options.allow_degraded => {
                warn!("Journal store failed to open ({err}): continuing in degraded mode.");
                Store::Degraded
            }
            Err(err) => return Err(err),
        };

        let inner = Inner {
            store: Mutex::new(store),
            write_lock: Mutex::new(()),
            next_seq: AtomicU64::new(1),
            byte_count: AtomicUsize::new(0),
            checkpoint_seq: AtomicU64::new(0),
            session_id,
            options,
        };
        inner.recover_counters()?;

        Ok(Journal {
            inner: Arc::new(inner),
            executor,
            _marker: PhantomData,
        })
    }

    fn open_store(
        path: &PathBuf,
        options: &JournalOptions,
    ) -> Result<(Environment, Database), JournalError> {
        std::fs::create_dir_all(path)
            .map_err(|err| JournalError::Io(format!("Error making journal dir {path:?}: {err}")))?;
        let env = Environment::new()
            // NO_TLS
            // ======
            //
            // Without this flag, each time a read transaction is started, it eats into our
            // transaction limit (default: 126) until that thread dies.
            //
            // This flag makes transactions be removed from that limit when they are dropped, rather
            // than when their thread dies. This is important, because we perform reads from a
            // thread pool, so our threads never die.
            .set_flags(EnvironmentFlags::NO_TLS)
            .set_max_dbs(1)
            .set_map_size(options.map_size)
            .open(path)
            .map_err(|e| JournalError::Lmdb(format!("Error opening journal at {path:?}: {e}")))?;
        let db = env
            .create_db(Some("journal-versioned"), DatabaseFlags::empty())
            .map_err(|e| JournalError::Lmdb(format!("Error creating journal database: {e}")))?;
        trace!("Opened journal store at {path:?}");
        Ok((env, db))
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn is_degraded(&self) -> bool {
        matches!(*self.inner.store.lock(), Store::Degraded)
    }

    ///
    /// Appends one entry, claiming the next sequence number. The write is synced before this
    /// returns.
    ///
    pub async fn append(&self, entry: &T) -> Result<u64, JournalError> {
        let frames = vec![Self::encode_frame(entry)?];
        let seqs = self.append_frames(frames).await?;
        Ok(seqs.start)
    }

    ///
    /// Appends the given entries under a contiguous range of sequence numbers, committed in a
    /// single transaction. All entries are encoded before the transaction begins.
    ///
    pub async fn append_batch(&self, entries: &[T]) -> Result<std::ops::Range<u64>, JournalError> {
        if entries.is_empty() {
            let next = self.inner.next_seq.load(Ordering::SeqCst);
            return Ok(next..next);
        }
        let frames = entries
            .iter()
            .map(Self::encode_frame)
            .collect::<Result<Vec<_>, _>>()?;
        self.append_frames(frames).await
    }

    async fn append_frames(
        &self,
        frames: Vec<Vec<u8>>,
    ) -> Result<std::ops::Range<u64>, JournalError> {
        let inner = self.inner.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let total: usize = frames.iter().map(|f| f.len()).sum();
                    let _write = inner.write_lock.lock();

                    let store = inner.store.lock();
                    let (env, db) = match &*store {
                        Store::Open { env, db, .. } => (env.clone(), *db),
                        Store::Degraded => return Err(JournalError::Degraded),
                        Store::Closed => return Err(JournalError::Closed),
                    };
                    drop(store);

                    let current = inner.byte_count.load(Ordering::SeqCst);
                    if current + total > inner.options.max_journal_bytes {
                        return Err(JournalError::Full {
                            needed: current + total,
                            budget: inner.options.max_journal_bytes,
                        });
                    }

                    let start = inner.next_seq.load(Ordering::SeqCst);
                    let mut txn = env.begin_rw_txn()?;
                    for (offset, frame) in frames.iter().enumerate() {
                        let key = inner.entry_key(start + offset as u64);
                        txn.put(db, &key, frame, WriteFlags::empty())?;
                    }
                    txn.commit()?;

                    let end = start + frames.len() as u64;
                    inner.next_seq.store(end, Ordering::SeqCst);
                    inner.byte_count.fetch_add(total, Ordering::SeqCst);
                    trace!("Journal appended sequences [{start}, {end})");
                    Ok(start..end)
                },
                |e| Err(JournalError::Io(format!("`append` task failed: {e}"))),
            )
            .await
    }

    ///
    /// Reads all entries after the checkpoint, in sequence order, verifying CRCs and sequence
    /// contiguity. With `skip_corrupted_deltas` set, corrupted entries and gaps are logged,
    /// counted and skipped instead of failing the replay.
    ///
    pub async fn replay(&self) -> Result<ReplayResult<T>, JournalError> {
        let inner = self.inner.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let mut entries = Vec::new();
                    let mut skipped = 0_usize;
                    inner.replay_inner(|event| {
                        if event.skipped {
                            skipped += 1;
                            Ok(())
                        } else if let Some(err) = event.error {
                            Err(err)
                        } else if let Some(entry) = event.entry {
                            entries.push(Replayed {
                                seq: event.seq,
                                entry,
                            });
                            Ok(())
                        } else {
                            Ok(())
                        }
                    })?;
                    Ok(ReplayResult { entries, skipped })
                },
                |e| Err(JournalError::Io(format!("`replay` task failed: {e}"))),
            )
            .await
    }

    ///
    /// Streaming form of `Self::replay`: yields one event per journal entry through a bounded
    /// channel. A fatal error is delivered as a final event with `error` set.
    ///
    pub fn replay_stream(&self, buffer: usize) -> tokio::sync::mpsc::Receiver<ReplayEvent<T>> {
        let (tx, rx) = tokio::sync::mpsc::channel(buffer.max(1));
        let inner = self.inner.clone();
        let _join = self.executor.native_spawn_blocking(move || {
            let tx_events = tx.clone();
            let res = inner.replay_inner(|event| {
                tx_events
                    .blocking_send(event)
                    .map_err(|_| JournalError::Io("Replay stream receiver dropped".to_owned()))
            });
            if let Err(err) = res {
                let _ = tx.blocking_send(ReplayEvent {
                    seq: 0,
                    entry: None,
                    error: Some(err),
                    skipped: false,
                });
            }
        });
        rx
    }

    ///
    /// Writes a checkpoint marker at the current tail and deletes every entry at or below it,
    /// resetting the byte budget.
    ///
    pub async fn checkpoint(&self) -> Result<u64, JournalError> {
        let inner = self.inner.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let _write = inner.write_lock.lock();
                    let store = inner.store.lock();
                    let (env, db) = match &*store {
                        Store::Open { env, db, .. } => (env.clone(), *db),
                        Store::Degraded => return Ok(inner.checkpoint_seq.load(Ordering::SeqCst)),
                        Store::Closed => return Err(JournalError::Closed),
                    };
                    drop(store);

                    let tail = inner.next_seq.load(Ordering::SeqCst) - 1;
                    let mut marker = [0_u8; 8];
                    BigEndian::write_u64(&mut marker, tail);

                    let prefix = inner.entry_prefix();
                    let mut txn = env.begin_rw_txn()?;
                    txn.put(db, &inner.checkpoint_key(), &marker, WriteFlags::empty())?;
                    let stale: Vec<Vec<u8>> = {
                        let mut cursor = txn.open_ro_cursor(db)?;
                        let mut stale = Vec::new();
                        for item in cursor.iter_from(prefix.as_bytes()) {
                            let (key, _) = item?;
                            if !key.starts_with(prefix.as_bytes()) {
                                break;
                            }
                            if matches!(Inner::parse_seq(&prefix, key), Some(seq) if seq <= tail) {
                                stale.push(key.to_vec());
                            }
                        }
                        stale
                    };
                    for key in stale {
                        txn.del(db, &key, None)?;
                    }
                    txn.commit()?;

                    inner.checkpoint_seq.store(tail, Ordering::SeqCst);
                    inner.byte_count.store(0, Ordering::SeqCst);
                    debug!("Journal checkpointed at sequence {tail}");
                    Ok(tail)
                },
                |e| Err(JournalError::Io(format!("`checkpoint` task failed: {e}"))),
            )
            .await
    }

    /// Forces a sync of the backing store.
    pub async fn sync(&self) -> Result<(), JournalError> {
        let inner = self.inner.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let store = inner.store.lock();
                    match &*store {
                        Store::Open { env, .. } => env.sync(true).map_err(JournalError::from),
                        Store::Degraded => Ok(()),
                        Store::Closed => Err(JournalError::Closed),
                    }
                },
                |e| Err(JournalError::Io(format!("`sync` task failed: {e}"))),
            )
            .await
    }

    pub fn stats(&self) -> JournalStats {
        let degraded = self.is_degraded();
        let next = self.inner.next_seq.load(Ordering::SeqCst);
        let checkpoint_seq = self.inner.checkpoint_seq.load(Ordering::SeqCst);
        let last_seq = next - 1;
        JournalStats {
            entry_count: (last_seq.saturating_sub(checkpoint_seq)) as usize,
            byte_count: self.inner.byte_count.load(Ordering::SeqCst),
            last_seq,
            checkpoint_seq,
            degraded,
        }
    }

    /// The number of entries currently stored (after the checkpoint).
    pub fn delta_count(&self) -> usize {
        self.stats().entry_count
    }

    ///
    /// Closes the journal. Idempotent: all subsequent operations fail with `Closed`.
    ///
    pub fn close(&self) {
        let mut store = self.inner.store.lock();
        if !matches!(*store, Store::Closed) {
            *store = Store::Closed;
            debug!("Journal closed for session {}", self.inner.session_id);
        }
    }

    ///
    /// Streams a native backup of the entire journal store (entries and checkpoint markers) to
    /// the given writer as length-prefixed key/value frames.
    ///
    /// NB: Blocking. Callers are expected to run this under `Executor::spawn_blocking` (the
    /// persistence manager pipes it through compression on its own blocking task).
    ///
    pub fn backup_sync(&self, writer: &mut dyn Write) -> Result<usize, JournalError> {
        let store = self.inner.store.lock();
        let (env, db) = match &*store {
            Store::Open { env, db, .. } => (env.clone(), *db),
            Store::Degraded => return Err(JournalError::Degraded),
            Store::Closed => return Err(JournalError::Closed),
        };
        drop(store);

        let txn = env.begin_ro_txn()?;
        let mut cursor = txn.open_ro_cursor(db)?;
        let mut count = 0_usize;
        let mut len_buf = [0_u8; 4];
        for item in cursor.iter_start() {
            let (key, value) = item?;
            BigEndian::write_u32(&mut len_buf, key.len() as u32);
            writer
                .write_all(&len_buf)
                .and_then(|()| writer.write_all(key))
                .and_then(|()| {
                    BigEndian::write_u32(&mut len_buf, value.len() as u32);
                    writer.write_all(&len_buf)
                })
                .and_then(|()| writer.write_all(value))
                .map_err(|err| JournalError::Io(format!("Error writing backup frame: {err}")))?;
            count += 1;
        }
        Ok(count)
    }

    ///
    /// Restores a native backup produced by `Self::backup_sync` into this journal, replacing any
    /// current contents. Blocking, like `Self::backup_sync`.
    ///
    pub fn restore_sync(&self, reader: &mut dyn Read) -> Result<usize, JournalError> {
        let _write = self.inner.write_lock.lock();
        let store = self.inner.store.lock();
        let (env, db) = match &*store {
            Store::Open { env, db, .. } => (env.clone(), *db),
            Store::Degraded => return Err(JournalError::Degraded),
            Store::Closed => return Err(JournalError::Closed),
        };
        drop(store);

        let mut txn = env.begin_rw_txn()?;
        txn.clear_db(db)?;
        let mut count = 0_usize;
        loop {
            let key = match read_frame(reader)? {
                Some(key) => key,
                None => break,
            };
            let value = read_frame(reader)?.ok_or_else(|| {
                JournalError::Corrupted("Backup frame had a key but no value".to_owned())
            })?;
            txn.put(db, &key, &value, WriteFlags::empty())?;
            count += 1;
        }
        txn.commit()?;

        self.inner.recover_counters()?;
        debug!("Journal restored {count} frames from backup");
        Ok(count)
    }

    fn encode_frame(entry: &T) -> Result<Vec<u8>, JournalError> {
        let encoded = bincode::serialize(entry)
            .map_err(|err| JournalError::Encoding(format!("Failed to encode entry: {err}")))?;
        let mut frame = Vec::with_capacity(CRC_PREFIX_SIZE + encoded.len());
        let mut crc_buf = [0_u8; 4];
        BigEndian::write_u32(&mut crc_buf, crc32fast::hash(&encoded));
        frame.extend_from_slice(&crc_buf);
        frame.extend_from_slice(&encoded);
        Ok(frame)
    }
}

impl Inner {
    fn entry_prefix(&self) -> String {
        format!("delta:{}:", self.session_id)
    }

    fn entry_key(&self, seq: u64) -> Vec<u8> {
        format!("delta:{}:{seq:0width$}", self.session_id, width = SEQ_WIDTH).into_bytes()
    }

    fn checkpoint_key(&self) -> Vec<u8> {
        format!("checkpoint:latest:{}", self.session_id).into_bytes()
    }

    fn parse_seq(prefix: &str, key: &[u8]) -> Option<u64> {
        let suffix = key.strip_prefix(prefix.as_bytes())?;
        std::str::from_utf8(suffix).ok()?.parse().ok()
    }

    ///
    /// Recomputes the sequence counter, byte counter and checkpoint sequence from the store.
    /// Called on open and after a restore.
    ///
    fn recover_counters(&self) -> Result<(), JournalError> {
        let store = self.store.lock();
        let (env, db) = match &*store {
            Store::Open { env, db, .. } => (env.clone(), *db),
            _ => return Ok(()),
        };
        drop(store);

        let txn = env.begin_ro_txn()?;
        let checkpoint = match txn.get(db, &self.checkpoint_key()) {
            Ok(bytes) if bytes.len() == 8 => BigEndian::read_u64(bytes),
            Ok(_) => {
                return Err(JournalError::Corrupted(
                    "Checkpoint marker had unexpected length".to_owned(),
                ))
            }
            Err(lmdb::Error::NotFound) => 0,
            Err(err) => return Err(err.into()),
        };

        let prefix = self.entry_prefix();
        let mut tail = checkpoint;
        let mut bytes = 0_usize;
        let mut cursor = txn.open_ro_cursor(db)?;
        for item in cursor.iter_from(prefix.as_bytes()) {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            if let Some(seq) = Self::parse_seq(&prefix, key) {
                tail = tail.max(seq);
                bytes += value.len();
            }
        }

        self.checkpoint_seq.store(checkpoint, Ordering::SeqCst);
        self.next_seq.store(tail + 1, Ordering::SeqCst);
        self.byte_count.store(bytes, Ordering::SeqCst);
        Ok(())
    }

    ///
    /// Iterates entries after the checkpoint in sequence order, delivering one `ReplayEvent` per
    /// entry via `deliver`. Corruption handling honors `skip_corrupted_deltas`.
    ///
    fn replay_inner<T: DeserializeOwned>(
        &self,
        mut deliver: impl FnMut(ReplayEvent<T>) -> Result<(), JournalError>,
    ) -> Result<(), JournalError> {
        let store = self.store.lock();
        let (env, db) = match &*store {
            Store::Open { env, db, .. } => (env.clone(), *db),
            Store::Degraded => return Ok(()),
            Store::Closed => return Err(JournalError::Closed),
        };
        drop(store);

        let checkpoint = self.checkpoint_seq.load(Ordering::SeqCst);
        let prefix = self.entry_prefix();
        let mut expected = checkpoint + 1;

        let txn = env.begin_ro_txn()?;
        let mut cursor = txn.open_ro_cursor(db)?;
        for item in cursor.iter_from(prefix.as_bytes()) {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let Some(seq) = Self::parse_seq(&prefix, key) else {
                continue;
            };
            if seq <= checkpoint {
                continue;
            }

            if seq != expected {
                let err = JournalError::SequenceGap {
                    expected,
                    found: seq,
                };
                if self.options.skip_corrupted_deltas {
                    warn!("Skipping journal sequence gap: expected {expected}, found {seq}");
                    deliver(ReplayEvent {
                        seq,
                        entry: None,
                        error: Some(err),
                        skipped: true,
                    })?;
                    expected = seq;
                } else {
                    return Err(err);
                }
            }
            expected += 1;

            match decode_frame(value) {
                Ok(entry) => deliver(ReplayEvent {
                    seq,
                    entry: Some(entry),
                    error: None,
                    skipped: false,
                })?,
                Err(err) => {
                    if self.options.skip_corrupted_deltas {
                        warn!("Skipping corrupted journal entry at sequence {seq}: {err}");
                        deliver(ReplayEvent {
                            seq,
                            entry: None,
                            error: Some(err),
                            skipped: true,
                        })?;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }
}

fn decode_frame<T: DeserializeOwned>(value: &[u8]) -> Result<T, JournalError> {
    if value.len() < CRC_PREFIX_SIZE {
        return Err(JournalError::Corrupted(format!(
            "Entry too short to carry a checksum: {} bytes",
            value.len()
        )));
    }
    let (crc_bytes, encoded) = value.split_at(CRC_PREFIX_SIZE);
    let stored = BigEndian::read_u32(crc_bytes);
    let computed = crc32fast::hash(encoded);
    if stored != computed {
        return Err(JournalError::Corrupted(format!(
            "Checksum mismatch: stored {stored:08x}, computed {computed:08x}"
        )));
    }
    bincode::deserialize(encoded)
        .map_err(|err| JournalError::Corrupted(format!("Failed to decode entry: {err}")))
}

#[cfg(test)]
impl<T: Serialize + DeserializeOwned + Send + 'static> Journal<T> {
    ///
    /// Mutates the raw stored value of the first journal entry in place, bypassing the framing.
    /// Only used to simulate on-disk corruption.
    ///
    pub(crate) fn tamper_first_entry(
        &self,
        mutate: impl FnOnce(&mut Vec<u8>),
    ) -> Result<(), JournalError> {
        let store = self.inner.store.lock();
        let (env, db) = match &*store {
            Store::Open { env, db, .. } => (env.clone(), *db),
            _ => return Err(JournalError::Closed),
        };
        drop(store);

        let prefix = self.inner.entry_prefix();
        let mut txn = env.begin_rw_txn()?;
        let (key, mut value) = {
            let mut cursor = txn.open_ro_cursor(db)?;
            let (key, value) = cursor
                .iter_from(prefix.as_bytes())
                .next()
                .expect("Want at least one journal entry")?;
            (key.to_vec(), value.to_vec())
        };
        mutate(&mut value);
        txn.put(db, &key, &value, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    pub(crate) fn tamper_delete_seq(&self, seq: u64) -> Result<(), JournalError> {
        let store = self.inner.store.lock();
        let (env, db) = match &*store {
            Store::Open { env, db, .. } => (env.clone(), *db),
            _ => return Err(JournalError::Closed),
        };
        drop(store);

        let mut txn = env.begin_rw_txn()?;
        txn.del(db, &self.inner.entry_key(seq), None)?;
        txn.commit()?;
        Ok(())
    }
}

fn read_frame(reader: &mut dyn Read) -> Result<Option<Vec<u8>>, JournalError> {
    let mut len_buf = [0_u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => (),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(JournalError::Io(format!("Error reading backup frame: {err}"))),
    }
    let len = BigEndian::read_u32(&len_buf) as usize;
    let mut buf = vec![0_u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|err| JournalError::Io(format!("Error reading backup frame body: {err}")))?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests;
