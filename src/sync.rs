//! Pull/push synchronization between reactors.
//!
//! Operations travel as strands: ordered per-unit batches since the
//! receiver's last known revision. Pull triggers poll a remote on an
//! interval and acknowledge what they applied; push listeners forward
//! freshly committed operations after every local mutation. Delivery is
//! at-least-once: a re-delivered strand is detected by its duplicate
//! indices and applied as a no-op.
//!
//! Conflict policy: first writer wins. A conflicting strand flips the
//! drive's sync status to `Conflict` and halts further application for that
//! drive until [`SyncManager::reset_sync_status`] is called; everything
//! else keeps polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::document::{Operation, OperationContext, Scope, SyncUnitId, MAIN_BRANCH};
use crate::drive::{self, Listener, ListenerFilter, Trigger};
use crate::error::StorageError;
use crate::events::{Event, EventBus};
use crate::queue::JobStatus;
use crate::store::DocumentStorage;

pub mod remote;

/// Per-drive synchronization status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Configured but no cycle has run yet.
    Pending,
    /// The first cycle is in flight.
    InitialSync,
    /// A pull or push cycle is in flight.
    Syncing,
    Success,
    Conflict,
    Error,
}

/// One operation as carried on the wire: trimmed of state snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationUpdate {
    pub index: u64,
    pub skip: u64,
    #[serde(rename = "type")]
    pub op_type: String,
    pub input: Value,
    pub hash: String,
    pub timestamp_utc_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<OperationContext>,
}

impl OperationUpdate {
    pub fn from_operation(op: &Operation) -> Self {
        OperationUpdate {
            index: op.index,
            skip: op.skip,
            op_type: op.op_type.clone(),
            input: op.input.clone(),
            hash: op.hash.clone(),
            timestamp_utc_ms: op.timestamp_utc_ms,
            context: op.context.clone(),
        }
    }

    pub fn into_operation(self, scope: Scope, branch: &str) -> Operation {
        Operation {
            index: self.index,
            skip: self.skip,
            scope,
            branch: branch.to_string(),
            op_type: self.op_type,
            input: self.input,
            hash: self.hash,
            timestamp_utc_ms: self.timestamp_utc_ms,
            attachments: Vec::new(),
            resulting_state: None,
            context: self.context,
        }
    }
}

/// An ordered batch of operations for one synchronization unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strand {
    pub drive_id: String,
    pub document_id: String,
    pub scope: Scope,
    pub branch: String,
    pub operations: Vec<OperationUpdate>,
}

/// Acknowledgment / status record for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerRevision {
    pub drive_id: String,
    pub document_id: String,
    pub scope: Scope,
    pub branch: String,
    /// Index of the last operation covered by this record.
    pub revision: i64,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Metadata a remote exposes about a drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveInfo {
    pub id: String,
    pub slug: String,
    pub name: String,
}

/// Options for fetching pending strands.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrandsOptions {
    pub limit: Option<usize>,
}

/// Errors crossing the sync transport.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The remote does not know this listener (e.g. it restarted); the
    /// caller re-registers and retries.
    #[error("listener not found: {0}")]
    ListenerNotFound(String),
    #[error("drive not found: {0}")]
    DriveNotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("remote call failed: {0}")]
    Transport(#[from] anyhow::Error),
}

/// The operations a sync remote must expose, carried over whatever RPC it
/// speaks. [`remote::ReactorRemote`] is the in-process implementation.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Metadata of the remote drive.
    async fn drive_info(&self) -> Result<DriveInfo, SyncError>;

    /// Registers a pull listener on the remote; returns its id.
    async fn register_listener(&self, filter: ListenerFilter) -> Result<String, SyncError>;

    /// Pending strands for a registered listener since its delivery cursor.
    async fn strands(
        &self,
        listener_id: &str,
        options: StrandsOptions,
    ) -> Result<Vec<Strand>, SyncError>;

    /// Acknowledges consumed strands so the remote can advance its cursor.
    async fn acknowledge(
        &self,
        listener_id: &str,
        revisions: Vec<ListenerRevision>,
    ) -> Result<bool, SyncError>;

    /// Pushes strands to the remote; returns per-unit status.
    async fn push_strands(
        &self,
        strands: Vec<Strand>,
    ) -> Result<Vec<ListenerRevision>, SyncError>;
}

/// Delivery state of one inbound pull listener (we are the remote).
#[derive(Debug, Clone)]
struct PullResponderState {
    drive_id: String,
    filter: ListenerFilter,
    /// Next index to deliver per unit.
    cursors: HashMap<SyncUnitId, u64>,
}

/// A registered outbound push target.
struct PushTarget {
    listener: Listener,
    remote: Arc<dyn RemoteDrive>,
    /// Next index to send per unit.
    cursors: HashMap<SyncUnitId, u64>,
}

#[derive(Default)]
struct SyncState {
    statuses: HashMap<String, SyncStatus>,
    responders: HashMap<String, PullResponderState>,
    push_targets: HashMap<(String, String), PushTarget>,
}

/// Owns transient per-drive sync status and listener delivery state. Never
/// owns document content.
#[derive(Clone)]
pub struct SyncManager {
    state: Arc<Mutex<SyncState>>,
    events: EventBus,
}

impl SyncManager {
    pub fn new(events: EventBus) -> Self {
        SyncManager {
            state: Arc::new(Mutex::new(SyncState::default())),
            events,
        }
    }

    pub fn sync_status(&self, drive_id: &str) -> Option<SyncStatus> {
        self.state.lock().statuses.get(drive_id).copied()
    }

    /// Applies a transition, preserving `InitialSync` until a terminal
    /// status replaces it: a `Syncing` report during the first cycle stays
    /// `InitialSync`.
    pub fn update_sync_status(
        &self,
        drive_id: &str,
        status: SyncStatus,
        error: Option<String>,
    ) {
        let (previous, effective) = {
            let mut state = self.state.lock();
            let previous = state.statuses.get(drive_id).copied();
            let effective = match (previous, status) {
                (Some(SyncStatus::Pending) | None, SyncStatus::Syncing) => SyncStatus::InitialSync,
                (Some(SyncStatus::InitialSync), SyncStatus::Syncing) => SyncStatus::InitialSync,
                _ => status,
            };
            state.statuses.insert(drive_id.to_string(), effective);
            (previous, effective)
        };
        if previous != Some(effective) {
            debug!(drive_id, ?previous, status = %effective, "sync status changed");
            self.events.emit(Event::SyncStatusChanged {
                drive_id: drive_id.to_string(),
                previous,
                status: effective,
                error,
            });
        }
    }

    /// Clears a `Conflict` (or any terminal status) so polling resumes.
    /// This is the manual-resolution hook.
    pub fn reset_sync_status(&self, drive_id: &str) {
        self.update_sync_status(drive_id, SyncStatus::Pending, None);
    }

    pub fn remove_drive(&self, drive_id: &str) {
        let mut state = self.state.lock();
        state.statuses.remove(drive_id);
        state.responders.retain(|_, r| r.drive_id != drive_id);
        state.push_targets.retain(|(d, _), _| d != drive_id);
    }

    ////////////////////////////////
    // Pull-responder side: we are the remote another reactor pulls from.
    ////////////////////////////////

    pub fn register_pull_responder(&self, drive_id: &str, filter: ListenerFilter) -> String {
        let listener_id = crate::document::new_document_id();
        self.state.lock().responders.insert(
            listener_id.clone(),
            PullResponderState {
                drive_id: drive_id.to_string(),
                filter,
                cursors: HashMap::new(),
            },
        );
        debug!(drive_id, %listener_id, "registered pull responder");
        listener_id
    }

    pub fn has_listener(&self, listener_id: &str) -> bool {
        self.state.lock().responders.contains_key(listener_id)
    }

    /// Builds the pending strands for a listener from storage. Only
    /// operations at or past the listener's cursor are included; global
    /// scope only for documents, both scopes never cross the wire for
    /// local state (local is by definition this reactor's own).
    pub async fn strands_for_listener(
        &self,
        storage: &dyn DocumentStorage,
        listener_id: &str,
        options: StrandsOptions,
    ) -> Result<Vec<Strand>, SyncError> {
        let responder = self
            .state
            .lock()
            .responders
            .get(listener_id)
            .cloned()
            .ok_or_else(|| SyncError::ListenerNotFound(listener_id.to_string()))?;

        let drive = storage
            .get(&responder.drive_id)
            .await
            .map_err(|_| SyncError::DriveNotFound(responder.drive_id.clone()))?;
        let mut document_ids = vec![responder.drive_id.clone()];
        document_ids.extend(storage.get_children(&responder.drive_id).await?);

        let mut strands = Vec::new();
        for document_id in document_ids {
            let document = match storage.get(&document_id).await {
                Ok(doc) => doc,
                // a manifest entry may point at a document that has not
                // been synced to us yet
                Err(StorageError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            let scope = Scope::Global;
            if !responder.filter.matches(
                &document_id,
                &document.header.document_type,
                &scope.to_string(),
                MAIN_BRANCH,
            ) {
                continue;
            }
            let unit = SyncUnitId::main(document_id.clone(), scope);
            let cursor = responder.cursors.get(&unit).copied().unwrap_or(0);
            let mut updates: Vec<OperationUpdate> = document
                .operations
                .get(scope)
                .iter()
                .filter(|op| op.index >= cursor)
                .map(OperationUpdate::from_operation)
                .collect();
            if let Some(limit) = options.limit {
                updates.truncate(limit);
            }
            if updates.is_empty() {
                continue;
            }
            trace!(
                listener_id,
                document_id = %unit.document_id,
                count = updates.len(),
                "strand prepared"
            );
            strands.push(Strand {
                drive_id: drive.header.id.clone(),
                document_id: unit.document_id,
                scope,
                branch: MAIN_BRANCH.to_string(),
                operations: updates,
            });
        }
        Ok(strands)
    }

    /// Advances delivery cursors for acknowledged units. Unknown units are
    /// logged and skipped; the overall call still succeeds for the rest.
    pub fn acknowledge(&self, listener_id: &str, revisions: &[ListenerRevision]) -> bool {
        let mut state = self.state.lock();
        let Some(responder) = state.responders.get_mut(listener_id) else {
            warn!(listener_id, "acknowledge for unknown listener");
            return false;
        };
        for revision in revisions {
            // only successfully applied strands advance delivery; anything
            // else must be re-delivered after resolution
            if revision.status != JobStatus::Success || revision.revision < 0 {
                continue;
            }
            let unit = SyncUnitId::new(
                revision.document_id.clone(),
                revision.scope,
                revision.branch.clone(),
            );
            let cursor = responder.cursors.entry(unit).or_insert(0);
            *cursor = (*cursor).max(revision.revision as u64 + 1);
        }
        true
    }

    ////////////////////////////////
    // Push side: forward local commits to registered remotes.
    ////////////////////////////////

    pub fn register_push_target(
        &self,
        drive_id: &str,
        listener: Listener,
        remote: Arc<dyn RemoteDrive>,
    ) {
        self.state.lock().push_targets.insert(
            (drive_id.to_string(), listener.id.clone()),
            PushTarget {
                listener,
                remote,
                cursors: HashMap::new(),
            },
        );
    }

    pub fn unregister_push_target(&self, drive_id: &str, listener_id: &str) {
        self.state
            .lock()
            .push_targets
            .remove(&(drive_id.to_string(), listener_id.to_string()));
    }

    /// Forwards freshly committed operations to every push target of the
    /// drives containing the document. Remote acks are merged back into the
    /// drive's sync status; a remote-reported conflict is treated exactly
    /// like a local one.
    pub async fn dispatch_push(
        &self,
        storage: &dyn DocumentStorage,
        document_id: &str,
        operations: &[Operation],
    ) {
        let mut drive_ids = storage.get_parents(document_id).await.unwrap_or_default();
        match storage.get(document_id).await {
            Ok(doc) if doc.is_drive() => drive_ids.push(document_id.to_string()),
            _ => {}
        }

        let document_type = match storage.get(document_id).await {
            Ok(doc) => doc.header.document_type,
            Err(_) => return,
        };

        for drive_id in drive_ids {
            let targets: Vec<(String, Arc<dyn RemoteDrive>, ListenerFilter, HashMap<SyncUnitId, u64>)> = {
                let state = self.state.lock();
                state
                    .push_targets
                    .iter()
                    .filter(|((d, _), _)| d == &drive_id)
                    .map(|((_, listener_id), target)| {
                        (
                            listener_id.clone(),
                            Arc::clone(&target.remote),
                            target.listener.filter.clone(),
                            target.cursors.clone(),
                        )
                    })
                    .collect()
            };

            for (listener_id, remote, filter, cursors) in targets {
                let mut strands = Vec::new();
                for scope in [Scope::Global] {
                    if !filter.matches(
                        document_id,
                        &document_type,
                        &scope.to_string(),
                        MAIN_BRANCH,
                    ) {
                        continue;
                    }
                    let unit = SyncUnitId::main(document_id, scope);
                    let cursor = cursors.get(&unit).copied().unwrap_or(0);
                    let updates: Vec<OperationUpdate> = operations
                        .iter()
                        .filter(|op| op.scope == scope && op.index >= cursor)
                        .map(OperationUpdate::from_operation)
                        .collect();
                    if updates.is_empty() {
                        continue;
                    }
                    strands.push(Strand {
                        drive_id: drive_id.clone(),
                        document_id: document_id.to_string(),
                        scope,
                        branch: MAIN_BRANCH.to_string(),
                        operations: updates,
                    });
                }
                if strands.is_empty() {
                    continue;
                }

                self.update_sync_status(&drive_id, SyncStatus::Syncing, None);
                match remote.push_strands(strands).await {
                    Ok(revisions) => {
                        let mut worst = SyncStatus::Success;
                        for revision in &revisions {
                            match revision.status {
                                JobStatus::Success => {
                                    if revision.revision >= 0 {
                                        let unit = SyncUnitId::new(
                                            revision.document_id.clone(),
                                            revision.scope,
                                            revision.branch.clone(),
                                        );
                                        let mut state = self.state.lock();
                                        if let Some(target) = state
                                            .push_targets
                                            .get_mut(&(drive_id.clone(), listener_id.clone()))
                                        {
                                            let cursor =
                                                target.cursors.entry(unit).or_insert(0);
                                            *cursor =
                                                (*cursor).max(revision.revision as u64 + 1);
                                        }
                                    }
                                }
                                JobStatus::Conflict => worst = SyncStatus::Conflict,
                                JobStatus::Error if worst != SyncStatus::Conflict => {
                                    worst = SyncStatus::Error
                                }
                                _ => {}
                            }
                        }
                        let error = revisions
                            .iter()
                            .find_map(|r| r.error.clone());
                        self.update_sync_status(&drive_id, worst, error);
                    }
                    Err(err) => {
                        warn!(%drive_id, %listener_id, %err, "push failed");
                        self.update_sync_status(
                            &drive_id,
                            SyncStatus::Error,
                            Some(err.to_string()),
                        );
                    }
                }
            }
        }
    }
}

/// Outcome of applying one strand locally.
#[derive(Debug, Clone)]
pub struct StrandOutcome {
    pub status: JobStatus,
    /// Last operation index covered, `-1` when nothing applied.
    pub revision: i64,
    pub error: Option<String>,
}

/// Runs pull cycles for one trigger until cancelled. An in-flight cycle is
/// not aborted by cancellation; no further cycles are scheduled.
pub fn spawn_pull_loop(
    reactor: Arc<crate::reactor::Reactor>,
    drive_id: String,
    trigger: Trigger,
    remote: Arc<dyn RemoteDrive>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut listener_id = trigger.data.listener_id.clone();
        let interval = Duration::from_millis(trigger.data.interval_ms.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%drive_id, "pull loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    execute_pull(&reactor, &drive_id, &trigger, &mut listener_id, remote.as_ref()).await;
                }
            }
        }
    })
}

/// One pull cycle: fetch strands, apply, acknowledge.
pub async fn execute_pull(
    reactor: &crate::reactor::Reactor,
    drive_id: &str,
    trigger: &Trigger,
    listener_id: &mut String,
    remote: &dyn RemoteDrive,
) {
    let sync = reactor.sync_manager();
    // a conflicted drive stays halted until manually resolved
    if sync.sync_status(drive_id) == Some(SyncStatus::Conflict) {
        trace!(drive_id, "pull skipped: conflict pending resolution");
        return;
    }
    sync.update_sync_status(drive_id, SyncStatus::Syncing, None);

    let strands = match remote.strands(listener_id, StrandsOptions::default()).await {
        Ok(strands) => strands,
        Err(SyncError::ListenerNotFound(_)) => {
            // the remote forgot us (restart); re-register and retry once
            match remote.register_listener(trigger.filter.clone()).await {
                Ok(new_id) => {
                    debug!(drive_id, old = %listener_id, new = %new_id, "re-registered pull listener");
                    *listener_id = new_id;
                    match remote.strands(listener_id, StrandsOptions::default()).await {
                        Ok(strands) => strands,
                        Err(err) => {
                            sync.update_sync_status(
                                drive_id,
                                SyncStatus::Error,
                                Some(err.to_string()),
                            );
                            return;
                        }
                    }
                }
                Err(err) => {
                    sync.update_sync_status(drive_id, SyncStatus::Error, Some(err.to_string()));
                    return;
                }
            }
        }
        Err(err) => {
            sync.update_sync_status(drive_id, SyncStatus::Error, Some(err.to_string()));
            return;
        }
    };

    if strands.is_empty() {
        sync.update_sync_status(drive_id, SyncStatus::Success, None);
        return;
    }

    let mut revisions = Vec::new();
    let mut worst = SyncStatus::Success;
    for strand in strands {
        if worst == SyncStatus::Conflict {
            // application halted; unprocessed strands are not acknowledged
            // and will be re-delivered
            break;
        }
        let outcome = reactor.apply_strand(&strand).await;
        match outcome.status {
            JobStatus::Conflict => worst = SyncStatus::Conflict,
            JobStatus::Error if worst != SyncStatus::Conflict => worst = SyncStatus::Error,
            _ => {}
        }
        revisions.push(ListenerRevision {
            drive_id: strand.drive_id.clone(),
            document_id: strand.document_id.clone(),
            scope: strand.scope,
            branch: strand.branch.clone(),
            revision: outcome.revision,
            status: outcome.status,
            error: outcome.error,
        });
    }

    match remote.acknowledge(listener_id, revisions).await {
        Ok(true) => {}
        Ok(false) => warn!(drive_id, "remote rejected strand acknowledgment"),
        Err(err) => warn!(drive_id, %err, "failed to acknowledge strands"),
    }

    sync.update_sync_status(drive_id, worst, None);
}

/// Strips a drive of its sync configuration: emits remove-listener,
/// remove-trigger and set-sharing-type operations into its local log. The
/// drive keeps its content but no longer synchronizes.
pub async fn detach_drive(
    reactor: &crate::reactor::Reactor,
    drive_id: &str,
) -> Result<(), StorageError> {
    let document = reactor.storage().get(drive_id).await?;
    let local = drive::drive_local_state(&document)
        .map_err(|e| StorageError::backend(anyhow::anyhow!(e.to_string())))?;

    reactor.cancel_pull_loops(drive_id);

    let mut actions = Vec::new();
    for listener in &local.listeners {
        reactor
            .sync_manager()
            .unregister_push_target(drive_id, &listener.id);
        actions.push(drive::actions::remove_listener(&listener.id));
    }
    for trigger in &local.triggers {
        actions.push(drive::actions::remove_trigger(&trigger.id));
    }
    actions.push(drive::actions::set_sharing_type(drive::SharingType::Local));

    let jobs = reactor.mutate(drive_id, actions).await?;
    for job in &jobs {
        reactor.wait_for_job(&job.id).await;
    }
    reactor.sync_manager().remove_drive(drive_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_syncing_report_is_initial_sync() {
        let sync = SyncManager::new(EventBus::default());
        sync.update_sync_status("d", SyncStatus::Pending, None);
        sync.update_sync_status("d", SyncStatus::Syncing, None);
        assert_eq!(sync.sync_status("d"), Some(SyncStatus::InitialSync));
        // still the first cycle
        sync.update_sync_status("d", SyncStatus::Syncing, None);
        assert_eq!(sync.sync_status("d"), Some(SyncStatus::InitialSync));
        sync.update_sync_status("d", SyncStatus::Success, None);
        assert_eq!(sync.sync_status("d"), Some(SyncStatus::Success));
        // later cycles report plain syncing
        sync.update_sync_status("d", SyncStatus::Syncing, None);
        assert_eq!(sync.sync_status("d"), Some(SyncStatus::Syncing));
    }

    #[test]
    fn status_changes_are_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let sync = SyncManager::new(bus);
        sync.update_sync_status("d", SyncStatus::Pending, None);
        sync.update_sync_status("d", SyncStatus::Conflict, Some("racer".into()));

        match rx.try_recv().unwrap() {
            Event::SyncStatusChanged { status, .. } => assert_eq!(status, SyncStatus::Pending),
            other => panic!("unexpected {other}"),
        }
        match rx.try_recv().unwrap() {
            Event::SyncStatusChanged { status, error, .. } => {
                assert_eq!(status, SyncStatus::Conflict);
                assert_eq!(error.as_deref(), Some("racer"));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn acknowledge_advances_cursors_monotonically() {
        let sync = SyncManager::new(EventBus::default());
        let listener_id = sync.register_pull_responder("drive", ListenerFilter::any());
        let revision = |rev: i64| ListenerRevision {
            drive_id: "drive".into(),
            document_id: "doc".into(),
            scope: Scope::Global,
            branch: MAIN_BRANCH.into(),
            revision: rev,
            status: JobStatus::Success,
            error: None,
        };
        assert!(sync.acknowledge(&listener_id, &[revision(4)]));
        // a late, lower ack must not rewind the cursor
        assert!(sync.acknowledge(&listener_id, &[revision(2)]));
        let cursor = {
            let state = sync.state.lock();
            state.responders[&listener_id].cursors
                [&SyncUnitId::main("doc", Scope::Global)]
        };
        assert_eq!(cursor, 5);

        assert!(!sync.acknowledge("unknown", &[revision(0)]));
    }

    #[test]
    fn wire_shapes_roundtrip() {
        let op = OperationUpdate {
            index: 3,
            skip: 0,
            op_type: "ADD_FILE".into(),
            input: serde_json::json!({"id": "x"}),
            hash: "h".into(),
            timestamp_utc_ms: 7,
            context: None,
        };
        let strand = Strand {
            drive_id: "drive".into(),
            document_id: "doc".into(),
            scope: Scope::Global,
            branch: MAIN_BRANCH.into(),
            operations: vec![op],
        };
        let json = serde_json::to_string(&strand).unwrap();
        let back: Strand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, strand);
        assert_eq!(back.operations[0].op_type, "ADD_FILE");

        let full = back.operations[0]
            .clone()
            .into_operation(Scope::Global, MAIN_BRANCH);
        assert_eq!(full.index, 3);
        assert!(full.resulting_state.is_none());
    }
}
