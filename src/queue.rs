//! Job queue: one FIFO lane per document, indices assigned at enqueue time.
//!
//! `mutate` callers observe monotonically increasing operation indices the
//! moment their actions are accepted, before any job has executed; the
//! per-unit counters here are the single authority for "next index" and are
//! seeded from storage the first time a unit is touched. Jobs are
//! control-plane records: they live and die with the process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::document::{Operation, Scope, SyncUnitId};
use crate::registry::Action;

/// Terminal and non-terminal states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Success,
    Conflict,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

/// What a job applies: a local action (index assigned at enqueue) or an
/// operation received from a remote (index fixed by the sender).
#[derive(Debug, Clone)]
pub enum JobKind {
    Local(Action),
    Remote(Operation),
}

/// A queued unit of work for one document.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub document_id: String,
    pub scope: Scope,
    pub branch: String,
    pub index: u64,
    pub kind: JobKind,
}

/// Handle returned to the caller at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub status: JobStatus,
}

/// Terminal outcome kept for status queries.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub status: JobStatus,
    pub error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    /// Next index per synchronization unit, seeded from storage on first
    /// touch. Counters only move forward.
    next_index: HashMap<SyncUnitId, u64>,
    /// One sender per document; the receiver side is owned by that
    /// document's worker task.
    lanes: HashMap<String, mpsc::UnboundedSender<Job>>,
    statuses: HashMap<String, JobResult>,
}

/// The queue shared between the reactor front-end and the executor.
#[derive(Clone, Default)]
pub struct JobQueue {
    state: Arc<Mutex<QueueState>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next index for a unit. `storage_revision` is the
    /// revision read from storage; the counter never goes backwards even if
    /// enqueued jobs have not executed yet.
    pub fn reserve_index(&self, unit: SyncUnitId, storage_revision: u64) -> u64 {
        let mut state = self.state.lock();
        let counter = state.next_index.entry(unit).or_insert(storage_revision);
        *counter = (*counter).max(storage_revision);
        let index = *counter;
        *counter += 1;
        index
    }

    /// Moves a unit's counter forward after remote operations landed.
    pub fn advance_index(&self, unit: SyncUnitId, next: u64) {
        let mut state = self.state.lock();
        let counter = state.next_index.entry(unit).or_insert(next);
        *counter = (*counter).max(next);
    }

    /// Enqueues onto the document's lane, creating it if needed. When a new
    /// lane is created its receiver is returned so the caller can spawn the
    /// worker that drains it.
    pub fn enqueue(&self, job: Job) -> Option<mpsc::UnboundedReceiver<Job>> {
        let mut state = self.state.lock();
        state.statuses.insert(
            job.id.clone(),
            JobResult {
                status: JobStatus::Pending,
                error: None,
            },
        );
        let document_id = job.document_id.clone();
        if let Some(sender) = state.lanes.get(&document_id) {
            if sender.send(job.clone()).is_ok() {
                return None;
            }
            // the worker is gone; fall through and rebuild the lane
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(job).expect("receiver just created");
        state.lanes.insert(document_id, tx);
        Some(rx)
    }

    pub fn set_result(&self, job_id: &str, status: JobStatus, error: Option<String>) {
        self.state
            .lock()
            .statuses
            .insert(job_id.to_string(), JobResult { status, error });
    }

    pub fn result(&self, job_id: &str) -> Option<JobResult> {
        self.state.lock().statuses.get(job_id).cloned()
    }

    /// Drops all lanes, which lets the per-document workers drain and exit.
    pub fn close(&self) {
        self.state.lock().lanes.clear();
    }
}
