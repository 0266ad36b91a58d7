//! Event bus connecting the executor, the sync engine and external callers.
//!
//! A bounded [`tokio::sync::broadcast`] channel: when a subscriber falls
//! behind by more than the capacity it loses the oldest events and observes
//! a `Lagged` gap on its receiver. Producers never block on slow consumers.

use tokio::sync::broadcast;

use crate::document::Operation;
use crate::queue::JobStatus;
use crate::sync::SyncStatus;

/// Events published by the reactor.
#[derive(Debug, Clone, strum::Display)]
pub enum Event {
    /// A job reached a terminal status.
    #[strum(serialize = "job-completed")]
    JobCompleted {
        job_id: String,
        document_id: String,
        status: JobStatus,
        error: Option<String>,
    },
    /// Operations were committed to storage. Feeds the push listeners.
    #[strum(serialize = "operations-added")]
    OperationsAdded {
        document_id: String,
        operations: Vec<Operation>,
    },
    /// A drive's sync status changed.
    #[strum(serialize = "sync-status-changed")]
    SyncStatusChanged {
        drive_id: String,
        previous: Option<SyncStatus>,
        status: SyncStatus,
        error: Option<String>,
    },
    /// Progress of configured remote drive initialization at startup.
    #[strum(serialize = "remote-drive-init")]
    RemoteDriveInit {
        url: String,
        status: RemoteDriveInitStatus,
        drive_id: Option<String>,
    },
}

/// Lifecycle of one configured remote drive during startup reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RemoteDriveInitStatus {
    Pending,
    Adding,
    AlreadyAdded,
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishes an event. Nothing listening is fine.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
