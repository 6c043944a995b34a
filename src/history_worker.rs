// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::sync::Arc;

use fnv::FnvHashMap as HashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use task_executor::Executor;
use tokio::sync::mpsc;

use crate::context::Context;
use crate::delta::{DeltaKind, IndexMask};
use crate::error::Error;
use crate::proof::SignalSource;

///
/// One applied delta, as remembered by the history ring: enough to reconstruct what changed,
/// when, and why, without retaining the delta itself.
///
#[derive(Clone, Debug, PartialEq)]
pub struct DeltaRecord {
    pub id: String,
    pub generation: u64,
    pub delta_kind: DeltaKind,
    pub source: SignalSource,
    pub session_id: String,
    pub applied_at_ms: i64,
    pub indexes_affected: IndexMask,
    pub affected_nodes: Vec<String>,
    /// The caller-provided attribution, when Apply was invoked through ApplyWithSource.
    pub source_name: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct DeltaHistoryOptions {
    /// The ring capacity: how many applied deltas are remembered.
    pub max_records: usize,
    /// The worker queue depth. Enqueueing never blocks; overflow drops the record.
    pub queue_size: usize,
}

impl Default for DeltaHistoryOptions {
    fn default() -> DeltaHistoryOptions {
        DeltaHistoryOptions {
            max_records: 1000,
            queue_size: 256,
        }
    }
}

#[derive(Default)]
struct RingState {
    ring: std::collections::VecDeque<Arc<DeltaRecord>>,
    by_generation: HashMap<u64, Arc<DeltaRecord>>,
    by_node: HashMap<String, Vec<Arc<DeltaRecord>>>,
}

impl RingState {
    fn insert(&mut self, record: Arc<DeltaRecord>, max_records: usize) {
        if self.ring.len() == max_records {
            if let Some(evicted) = self.ring.pop_front() {
                self.remove_from_indexes(&evicted);
            }
        }
        self.by_generation.insert(record.generation, record.clone());
        for node in &record.affected_nodes {
            self.by_node
                .entry(node.clone())
                .or_default()
                .push(record.clone());
        }
        self.ring.push_back(record);
    }

    fn remove_from_indexes(&mut self, record: &Arc<DeltaRecord>) {
        self.by_generation.remove(&record.generation);
        for node in &record.affected_nodes {
            if let Some(records) = self.by_node.get_mut(node) {
                records.retain(|r| r.generation != record.generation);
                if records.is_empty() {
                    self.by_node.remove(node);
                }
            }
        }
    }
}

///
/// The delta-history worker: a background consumer that maintains a bounded chronological ring
/// of applied-delta records, plus by-generation and by-node secondary indexes.
///
/// `record` never blocks the applying thread: the record is pushed onto a bounded queue, and
/// dropped (with a log line) if the queue is full.
///
pub struct DeltaHistory {
    sender: Mutex<Option<mpsc::Sender<Arc<DeltaRecord>>>>,
    state: Arc<Mutex<RingState>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    options: DeltaHistoryOptions,
}

impl DeltaHistory {
    pub fn new(executor: &Executor, options: DeltaHistoryOptions) -> DeltaHistory {
        let (sender, mut receiver) = mpsc::channel::<Arc<DeltaRecord>>(options.queue_size.max(1));
        let state = Arc::new(Mutex::new(RingState::default()));

        let worker_state = state.clone();
        let max_records = options.max_records.max(1);
        let worker = executor.native_spawn(async move {
            while let Some(record) = receiver.recv().await {
                worker_state.lock().insert(record, max_records);
            }
            debug!("Delta history worker drained and stopped");
        });

        DeltaHistory {
            sender: Mutex::new(Some(sender)),
            state,
            worker: Mutex::new(Some(worker)),
            options,
        }
    }

    ///
    /// Enqueues a record without blocking. Queue overflow (or a closed worker) drops the record.
    ///
    pub fn record(&self, record: DeltaRecord) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            warn!("Delta history is closed: dropping record for generation {}", record.generation);
            return;
        };
        if let Err(err) = sender.try_send(Arc::new(record)) {
            warn!("Delta history queue overflow: dropping record ({err})");
        }
    }

    pub fn size(&self, ctx: &Context) -> Result<usize, Error> {
        ctx.check()?;
        Ok(self.state.lock().ring.len())
    }

    /// Every retained record, oldest first.
    pub fn all(&self, ctx: &Context) -> Result<Vec<DeltaRecord>, Error> {
        ctx.check()?;
        Ok(self
            .state
            .lock()
            .ring
            .iter()
            .map(|r| (**r).clone())
            .collect())
    }

    ///
    /// Records with generation in `(lo, hi]`, oldest first.
    ///
    pub fn get_range(&self, ctx: &Context, lo: u64, hi: u64) -> Result<Vec<DeltaRecord>, Error> {
        ctx.check()?;
        Ok(self
            .state
            .lock()
            .ring
            .iter()
            .filter(|r| r.generation > lo && r.generation <= hi)
            .map(|r| (**r).clone())
            .collect())
    }

    pub fn get_by_generation(&self, ctx: &Context, generation: u64) -> Result<Option<DeltaRecord>, Error> {
        ctx.check()?;
        Ok(self
            .state
            .lock()
            .by_generation
            .get(&generation)
            .map(|r| (**r).clone()))
    }

    /// Records that touched the given node, chronological.
    pub fn get_by_node(&self, ctx: &Context, node_id: &str) -> Result<Vec<DeltaRecord>, Error> {
        ctx.check()?;
        Ok(self
            .state
            .lock()
            .by_node
            .get(node_id)
            .map(|records| records.iter().map(|r| (**r).clone()).collect())
            .unwrap_or_default())
    }

    ///
    /// The causal explanation of a node's current state: every retained record that touched it,
    /// in application order.
    ///
    pub fn explain(&self, ctx: &Context, node_id: &str) -> Result<Vec<DeltaRecord>, Error> {
        self.get_by_node(ctx, node_id)
    }

    pub fn queue_capacity(&self) -> usize {
        self.options.queue_size
    }

    ///
    /// Stops the worker, draining any queued records first. Idempotent.
    ///
    pub async fn close(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
#[path = "history_worker_tests.rs"]
mod history_worker_tests;
