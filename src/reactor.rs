//! The reactor: accepts mutations, serializes them per document and drives
//! them through the reducer into storage.
//!
//! `mutate` is non-blocking: it assigns operation indices at enqueue time
//! under the queue lock and returns pending job handles. One worker task
//! drains each document's lane, so jobs for one document apply strictly in
//! index order while different documents execute concurrently. Terminal job
//! statuses surface on the event bus; conflicts are never retried here.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::cache::{Cache, CachedStorage};
use crate::document::{
    new_document_id, Document, DocumentState, Operation, Scope, SyncUnitId, DRIVE_DOCUMENT_TYPE,
};
use crate::drive::{self, DriveModel, DriveState, ListenerFilter, Trigger};
use crate::error::StorageError;
use crate::events::{Event, EventBus};
use crate::queue::{Job, JobInfo, JobKind, JobQueue, JobResult, JobStatus};
use crate::registry::{finalize_operation, Action, ModelRegistry};
use crate::store::{DocumentStorage, MemoryStorage};
use crate::sync::{
    DriveInfo, ListenerRevision, RemoteDrive, Strand, StrandOutcome, StrandsOptions, SyncError,
    SyncManager, SyncStatus,
};

/// Default poll interval for pull triggers.
pub const DEFAULT_PULL_INTERVAL_MS: u64 = 5_000;

/// Input for [`Reactor::add_drive`].
#[derive(Debug, Clone, Default)]
pub struct AddDriveInput {
    pub id: Option<String>,
    pub slug: Option<String>,
    pub name: String,
}

/// Options for [`Reactor::add_remote_drive`].
#[derive(Debug, Clone)]
pub struct RemoteDriveOptions {
    pub pull_interval_ms: u64,
    pub filter: ListenerFilter,
}

impl Default for RemoteDriveOptions {
    fn default() -> Self {
        RemoteDriveOptions {
            pull_interval_ms: DEFAULT_PULL_INTERVAL_MS,
            filter: ListenerFilter::any(),
        }
    }
}

pub struct Reactor {
    storage: Arc<dyn DocumentStorage>,
    registry: Arc<ModelRegistry>,
    events: EventBus,
    queue: JobQueue,
    sync: SyncManager,
    /// Makes "reserve index, enqueue" atomic so queue order always equals
    /// index order within a document.
    enqueue_lock: Mutex<()>,
    /// Running pull loops per drive.
    pull_loops: Mutex<HashMap<String, Vec<(CancellationToken, tokio::task::JoinHandle<()>)>>>,
    /// Known sync transports by url.
    remotes: Mutex<HashMap<String, Arc<dyn RemoteDrive>>>,
    /// Handed to per-document workers so they do not keep the reactor
    /// alive.
    weak_self: Mutex<Weak<Reactor>>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").finish_non_exhaustive()
    }
}

pub struct ReactorBuilder {
    storage: Option<Arc<dyn DocumentStorage>>,
    registry: Option<ModelRegistry>,
    cache: Option<Cache>,
    event_capacity: usize,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        ReactorBuilder {
            storage: None,
            registry: None,
            cache: None,
            event_capacity: 256,
        }
    }
}

impl ReactorBuilder {
    /// Selects the storage backend. Defaults to [`MemoryStorage`].
    pub fn with_storage(mut self, storage: Arc<dyn DocumentStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Installs the model registry. The drive model is always registered on
    /// top of whatever is provided.
    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Puts the write-through cache in front of storage.
    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Arc<Reactor> {
        // the drive model is always available; provided models win on a
        // document-type clash
        let mut registry_builder = ModelRegistry::builder().register(Arc::new(DriveModel));
        if let Some(provided) = &self.registry {
            let types: Vec<String> = provided.document_types().map(str::to_string).collect();
            for document_type in types {
                if let Ok(model) = provided.get(&document_type) {
                    registry_builder = registry_builder.register(Arc::clone(model));
                }
            }
        }
        let registry = registry_builder.build();

        let mut storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        if let Some(cache) = self.cache {
            storage = Arc::new(CachedStorage::new(storage, &cache));
        }

        let events = EventBus::new(self.event_capacity);
        let sync = SyncManager::new(events.clone());
        let reactor = Arc::new(Reactor {
            storage,
            registry: Arc::new(registry),
            events,
            queue: JobQueue::new(),
            sync,
            enqueue_lock: Mutex::new(()),
            pull_loops: Mutex::new(HashMap::new()),
            remotes: Mutex::new(HashMap::new()),
            weak_self: Mutex::new(Weak::new()),
        });
        *reactor.weak_self.lock() = Arc::downgrade(&reactor);
        reactor.spawn_push_dispatcher();
        reactor
    }
}

impl Reactor {
    pub fn builder() -> ReactorBuilder {
        ReactorBuilder::default()
    }

    pub fn storage(&self) -> &Arc<dyn DocumentStorage> {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn sync_manager(&self) -> &SyncManager {
        &self.sync
    }

    /// Makes a sync transport reachable under a url for remote drives and
    /// push listeners.
    pub fn register_remote(&self, url: &str, remote: Arc<dyn RemoteDrive>) {
        self.remotes.lock().insert(url.to_string(), remote);
    }

    pub fn remote_for(&self, url: &str) -> Result<Arc<dyn RemoteDrive>, SyncError> {
        self.remotes
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| SyncError::Transport(anyhow::anyhow!("no transport for url {url}")))
    }

    ////////////////////////////////
    // Mutation front-end
    ////////////////////////////////

    /// Queues one job per action and returns immediately. Queue order
    /// within the document equals the caller's action order, and operation
    /// indices are assigned here, before execution.
    pub async fn mutate(
        &self,
        document_id: &str,
        actions: Vec<Action>,
    ) -> Result<Vec<JobInfo>, StorageError> {
        let document = self.storage.get(document_id).await?;
        let mut infos = Vec::with_capacity(actions.len());
        let _guard = self.enqueue_lock.lock();
        for action in actions {
            let unit = SyncUnitId::main(document_id, action.scope);
            let index = self
                .queue
                .reserve_index(unit, document.header.revision(action.scope));
            let job = Job {
                id: new_document_id(),
                document_id: document_id.to_string(),
                scope: action.scope,
                branch: crate::document::MAIN_BRANCH.to_string(),
                index,
                kind: JobKind::Local(action),
            };
            infos.push(JobInfo {
                id: job.id.clone(),
                status: JobStatus::Pending,
            });
            trace!(document_id, index, job_id = %job.id, "job queued");
            if let Some(lane) = self.queue.enqueue(job) {
                self.spawn_worker(lane);
            }
        }
        Ok(infos)
    }

    /// Queues operations received from a remote. Their indices are fixed by
    /// the sender; duplicates are resolved during execution.
    pub async fn queue_remote_operations(
        &self,
        document_id: &str,
        operations: Vec<Operation>,
    ) -> Result<Vec<JobInfo>, StorageError> {
        if !self.storage.exists(document_id).await? {
            return Err(StorageError::NotFound(document_id.to_string()));
        }
        let mut infos = Vec::with_capacity(operations.len());
        let _guard = self.enqueue_lock.lock();
        for operation in operations {
            let unit = SyncUnitId::main(document_id, operation.scope);
            self.queue.advance_index(unit, operation.index + 1);
            let job = Job {
                id: new_document_id(),
                document_id: document_id.to_string(),
                scope: operation.scope,
                branch: operation.branch.clone(),
                index: operation.index,
                kind: JobKind::Remote(operation),
            };
            infos.push(JobInfo {
                id: job.id.clone(),
                status: JobStatus::Pending,
            });
            if let Some(lane) = self.queue.enqueue(job) {
                self.spawn_worker(lane);
            }
        }
        Ok(infos)
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobResult> {
        self.queue.result(job_id)
    }

    /// Waits for a job to reach a terminal status.
    pub async fn wait_for_job(&self, job_id: &str) -> JobResult {
        let mut rx = self.events.subscribe();
        loop {
            if let Some(result) = self.queue.result(job_id) {
                if result.status.is_terminal() {
                    return result;
                }
            }
            match rx.recv().await {
                Ok(Event::JobCompleted { job_id: id, .. }) if id == job_id => {
                    if let Some(result) = self.queue.result(job_id) {
                        return result;
                    }
                }
                Ok(_) => {}
                // lagged: loop re-checks the status map
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return self.queue.result(job_id).unwrap_or(JobResult {
                        status: JobStatus::Error,
                        error: Some("reactor shut down".into()),
                    });
                }
            }
        }
    }

    ////////////////////////////////
    // Executor
    ////////////////////////////////

    fn spawn_worker(&self, mut lane: mpsc::UnboundedReceiver<Job>) {
        let weak = self.weak_self.lock().clone();
        tokio::spawn(async move {
            while let Some(job) = lane.recv().await {
                let Some(reactor) = weak.upgrade() else {
                    break;
                };
                let span = error_span!("job", id = %job.id, document = %job.document_id);
                reactor.process_job(job).instrument(span).await;
            }
        });
    }

    async fn process_job(&self, job: Job) {
        let job_id = job.id.clone();
        let document_id = job.document_id.clone();
        let (status, committed, error) = match self.execute_job(job).await {
            Ok(committed) => (JobStatus::Success, committed, None),
            Err((status, message)) => (status, Vec::new(), Some(message)),
        };
        self.queue.set_result(&job_id, status, error.clone());
        if !committed.is_empty() {
            if committed.iter().any(|op| op.scope == Scope::Global) {
                if let Err(err) = self.reconcile_drive_manifest(&document_id).await {
                    warn!(%document_id, %err, "drive manifest reconciliation failed");
                }
            }
            self.events.emit(Event::OperationsAdded {
                document_id: document_id.clone(),
                operations: committed,
            });
        }
        self.events.emit(Event::JobCompleted {
            job_id,
            document_id,
            status,
            error,
        });
    }

    /// Brings a drive's manifest in line with its node tree after global
    /// operations committed: file nodes become child documents (created
    /// from their registered model when first seen), vanished nodes lose
    /// their edge, and a child whose last parent disappeared is deleted.
    async fn reconcile_drive_manifest(&self, document_id: &str) -> Result<(), StorageError> {
        let document = self.storage.get(document_id).await?;
        if !document.is_drive() {
            return Ok(());
        }
        let state = drive::drive_state(&document)
            .map_err(|e| StorageError::backend(anyhow::anyhow!(e.to_string())))?;
        let children = self.storage.get_children(document_id).await?;

        for node in &state.nodes {
            if children.contains(&node.id) {
                continue;
            }
            if !self.storage.exists(&node.id).await? {
                let Ok(model) = self.registry.get(&node.document_type) else {
                    warn!(
                        node = %node.id,
                        document_type = %node.document_type,
                        "file node of unregistered type; not materialized"
                    );
                    continue;
                };
                let child = Document::new(
                    node.id.clone(),
                    "",
                    node.document_type.clone(),
                    model.initial_state(),
                );
                self.storage.create(child).await?;
            }
            self.storage.add_child(document_id, &node.id).await?;
        }

        for child in children {
            if state.nodes.iter().any(|node| node.id == child) {
                continue;
            }
            self.storage.remove_child(document_id, &child).await?;
            if self.storage.get_parents(&child).await?.is_empty() {
                debug!(%child, drive = document_id, "removing orphaned child document");
                self.storage.delete(&child).await?;
            }
        }
        Ok(())
    }

    /// Applies one job through the reducer into storage. Returns the
    /// committed operations (empty for a deduplicated remote no-op).
    async fn execute_job(&self, job: Job) -> Result<Vec<Operation>, (JobStatus, String)> {
        let document = self
            .storage
            .get(&job.document_id)
            .await
            .map_err(|e| (JobStatus::Error, e.to_string()))?;

        let operation = match &job.kind {
            JobKind::Local(action) => {
                let reduced = self
                    .registry
                    .reduce(&document, action)
                    .map_err(|e| (JobStatus::Error, e.to_string()))?;
                finalize_operation(action, &reduced, job.index, 0)
            }
            JobKind::Remote(operation) => {
                let log = document.operations.get(operation.scope);
                if let Some(existing) = log.iter().find(|op| op.index == operation.index) {
                    if existing.hash == operation.hash && existing.op_type == operation.op_type {
                        // re-delivery of an acknowledged operation
                        trace!(index = operation.index, "duplicate strand operation skipped");
                        return Ok(Vec::new());
                    }
                    return Err((
                        JobStatus::Conflict,
                        format!(
                            "operation {} at index {} conflicts with committed {}",
                            operation.op_type, operation.index, existing.op_type
                        ),
                    ));
                }
                let action = Action::new(
                    operation.op_type.clone(),
                    operation.input.clone(),
                    operation.scope,
                );
                let reduced = self
                    .registry
                    .reduce(&document, &action)
                    .map_err(|e| (JobStatus::Error, e.to_string()))?;
                let hash = crate::document::hash_state(&reduced.state);
                if hash != operation.hash {
                    return Err((
                        JobStatus::Error,
                        format!(
                            "state hash diverged at index {}: remote {} local {}",
                            operation.index, operation.hash, hash
                        ),
                    ));
                }
                let mut operation = operation.clone();
                operation.resulting_state = Some(reduced.state);
                operation
            }
        };

        let mut header = document.header.clone();
        header
            .revision
            .insert(operation.scope, operation.index + 1);
        header.last_modified_ms = header.last_modified_ms.max(operation.timestamp_utc_ms);

        match self
            .storage
            .add_operations(&job.document_id, std::slice::from_ref(&operation), &header)
            .await
        {
            Ok(()) => Ok(vec![operation]),
            Err(StorageError::Conflict(conflict)) => Err((
                JobStatus::Conflict,
                format!(
                    "index {} already holds {}",
                    conflict.new_operation.index, conflict.existing_operation.op_type
                ),
            )),
            Err(err) => Err((JobStatus::Error, err.to_string())),
        }
    }

    fn spawn_push_dispatcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::OperationsAdded {
                        document_id,
                        operations,
                    }) => {
                        let Some(reactor) = weak.upgrade() else { break };
                        reactor
                            .sync
                            .dispatch_push(reactor.storage.as_ref(), &document_id, &operations)
                            .await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "push dispatcher lagged; some pushes deferred to next pull");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    ////////////////////////////////
    // Drive-level API
    ////////////////////////////////

    pub async fn add_drive(&self, input: AddDriveInput) -> Result<Document, StorageError> {
        let id = input.id.unwrap_or_else(new_document_id);
        let state = DriveState {
            name: input.name,
            ..Default::default()
        };
        let initial_state = DocumentState {
            global: serde_json::to_value(&state).map_err(StorageError::backend)?,
            local: serde_json::to_value(drive::DriveLocalState::default())
                .map_err(StorageError::backend)?,
        };
        let mut document = Document::new(
            id,
            input.slug.unwrap_or_default(),
            DRIVE_DOCUMENT_TYPE,
            initial_state,
        );
        document.refresh_header();
        self.storage.create(document.clone()).await?;
        self.storage.get(&document.header.id).await
    }

    /// Creates a document of a registered type inside a drive: the document
    /// itself, the manifest edge and the drive's `ADD_FILE` operation.
    pub async fn add_document(
        &self,
        drive_id: &str,
        document_id: &str,
        name: &str,
        document_type: &str,
    ) -> Result<Document, StorageError> {
        let model = self
            .registry
            .get(document_type)
            .map_err(|e| StorageError::backend(anyhow::anyhow!(e.to_string())))?;
        let document = Document::new(document_id, "", document_type, model.initial_state());
        self.storage.create(document).await?;
        self.storage.add_child(drive_id, document_id).await?;
        let jobs = self
            .mutate(
                drive_id,
                vec![drive::actions::add_file(document_id, name, document_type)],
            )
            .await?;
        for job in &jobs {
            self.wait_for_job(&job.id).await;
        }
        self.storage.get(document_id).await
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<bool, StorageError> {
        self.storage.delete(document_id).await
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Document, StorageError> {
        self.storage.get(document_id).await
    }

    pub async fn get_drive(&self, drive_id: &str) -> Result<Document, StorageError> {
        let document = self.storage.get(drive_id).await?;
        if !document.is_drive() {
            return Err(StorageError::NotFound(drive_id.to_string()));
        }
        Ok(document)
    }

    pub async fn get_drive_by_slug(&self, slug: &str) -> Result<Document, StorageError> {
        let document = self.storage.get_by_slug(slug).await?;
        if !document.is_drive() {
            return Err(StorageError::NotFound(slug.to_string()));
        }
        Ok(document)
    }

    /// Ids of every drive in storage.
    pub async fn drives(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .storage
                .find_by_type(DRIVE_DOCUMENT_TYPE, 100, cursor.as_deref())
                .await?;
            ids.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(ids)
    }

    pub async fn delete_drive(&self, drive_id: &str) -> Result<bool, StorageError> {
        self.cancel_pull_loops(drive_id);
        self.sync.remove_drive(drive_id);
        self.storage.delete(drive_id).await
    }

    /// Mirrors a drive from a remote: fetches its metadata, creates the
    /// local copy, registers a pull listener on the remote and starts the
    /// poll loop.
    pub async fn add_remote_drive(
        &self,
        url: &str,
        options: RemoteDriveOptions,
    ) -> Result<Document, SyncError> {
        let remote = self.remote_for(url)?;
        let info = remote.drive_info().await?;

        if self.storage.exists(&info.id).await? {
            debug!(drive_id = %info.id, url, "remote drive already added");
            return Ok(self.storage.get(&info.id).await?);
        }

        self.add_drive(AddDriveInput {
            id: Some(info.id.clone()),
            slug: (info.slug != info.id).then(|| info.slug.clone()),
            name: info.name.clone(),
        })
        .await?;

        let listener_id = remote.register_listener(options.filter.clone()).await?;
        let mut trigger = drive::new_pull_trigger(url, options.pull_interval_ms, &listener_id);
        trigger.filter = options.filter;
        let jobs = self
            .mutate(&info.id, vec![drive::actions::add_trigger(&trigger)])
            .await?;
        for job in &jobs {
            self.wait_for_job(&job.id).await;
        }

        self.sync.update_sync_status(&info.id, SyncStatus::Pending, None);
        self.start_pull_loop(&info.id, trigger, remote);
        Ok(self.storage.get(&info.id).await?)
    }

    /// Registers a push listener on a drive: every matching local commit is
    /// forwarded to the remote.
    pub async fn add_push_listener(
        &self,
        drive_id: &str,
        url: &str,
        filter: ListenerFilter,
    ) -> Result<String, SyncError> {
        let remote = self.remote_for(url)?;
        let listener = drive::new_push_listener(url, filter);
        let jobs = self
            .mutate(drive_id, vec![drive::actions::add_listener(&listener)])
            .await?;
        for job in &jobs {
            self.wait_for_job(&job.id).await;
        }
        self.sync
            .register_push_target(drive_id, listener.clone(), remote);
        self.sync
            .update_sync_status(drive_id, SyncStatus::Pending, None);
        Ok(listener.id)
    }

    /// Starts polling for a trigger. Used at startup for triggers restored
    /// from drive state and by [`Reactor::add_remote_drive`].
    pub fn start_pull_loop(
        &self,
        drive_id: &str,
        trigger: Trigger,
        remote: Arc<dyn RemoteDrive>,
    ) {
        let Some(reactor) = self.weak_self.lock().upgrade() else {
            return;
        };
        let cancel = CancellationToken::new();
        let handle = crate::sync::spawn_pull_loop(
            reactor,
            drive_id.to_string(),
            trigger,
            remote,
            cancel.clone(),
        );
        self.pull_loops
            .lock()
            .entry(drive_id.to_string())
            .or_default()
            .push((cancel, handle));
    }

    /// Stops scheduling pull cycles for a drive. In-flight requests finish.
    pub fn cancel_pull_loops(&self, drive_id: &str) {
        if let Some(loops) = self.pull_loops.lock().remove(drive_id) {
            for (cancel, _handle) in loops {
                cancel.cancel();
            }
        }
    }

    /// Stops all sync loops and closes the job lanes.
    pub fn shutdown(&self) {
        let drives: Vec<String> = self.pull_loops.lock().keys().cloned().collect();
        for drive_id in drives {
            self.cancel_pull_loops(&drive_id);
        }
        self.queue.close();
    }

    ////////////////////////////////
    // Server-side sync surface (what a remote peer invokes on us)
    ////////////////////////////////

    pub async fn drive_info(&self, drive_id: &str) -> Result<DriveInfo, SyncError> {
        let document = self
            .get_drive(drive_id)
            .await
            .map_err(|_| SyncError::DriveNotFound(drive_id.to_string()))?;
        let state = drive::drive_state(&document)
            .map_err(|e| SyncError::Transport(anyhow::anyhow!(e.to_string())))?;
        Ok(DriveInfo {
            id: document.header.id.clone(),
            slug: document.header.slug.clone(),
            name: state.name,
        })
    }

    pub fn register_pull_listener(&self, drive_id: &str, filter: ListenerFilter) -> String {
        self.sync.register_pull_responder(drive_id, filter)
    }

    pub async fn pull_strands(
        &self,
        listener_id: &str,
        options: StrandsOptions,
    ) -> Result<Vec<Strand>, SyncError> {
        self.sync
            .strands_for_listener(self.storage.as_ref(), listener_id, options)
            .await
    }

    pub fn acknowledge_listener(
        &self,
        listener_id: &str,
        revisions: &[ListenerRevision],
    ) -> bool {
        self.sync.acknowledge(listener_id, revisions)
    }

    /// Ingests pushed strands and reports per-unit status.
    pub async fn receive_strands(&self, strands: Vec<Strand>) -> Vec<ListenerRevision> {
        let mut revisions = Vec::with_capacity(strands.len());
        for strand in strands {
            let outcome = self.apply_strand(&strand).await;
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
        revisions
    }

    /// Applies one strand: creates the document on first contact, queues
    /// the operations and waits for the per-document worker to commit them.
    pub async fn apply_strand(&self, strand: &Strand) -> StrandOutcome {
        let last_index = strand
            .operations
            .last()
            .map(|op| op.index as i64)
            .unwrap_or(-1);

        if let Err(err) = self.ensure_strand_document(strand).await {
            return StrandOutcome {
                status: JobStatus::Error,
                revision: -1,
                error: Some(err.to_string()),
            };
        }

        let operations: Vec<Operation> = strand
            .operations
            .iter()
            .map(|op| op.clone().into_operation(strand.scope, &strand.branch))
            .collect();
        let jobs = match self
            .queue_remote_operations(&strand.document_id, operations)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                return StrandOutcome {
                    status: JobStatus::Error,
                    revision: -1,
                    error: Some(err.to_string()),
                }
            }
        };

        let mut status = JobStatus::Success;
        let mut error = None;
        for job in &jobs {
            let result = self.wait_for_job(&job.id).await;
            match result.status {
                JobStatus::Conflict => {
                    status = JobStatus::Conflict;
                    error = result.error;
                    break;
                }
                JobStatus::Error => {
                    status = JobStatus::Error;
                    error = result.error;
                    break;
                }
                _ => {}
            }
        }
        StrandOutcome {
            status,
            revision: last_index,
            error,
        }
    }

    /// A strand can reference a document we have never seen: its type is
    /// recovered from the drive's node tree and an empty instance is
    /// created and attached before the operations apply.
    async fn ensure_strand_document(&self, strand: &Strand) -> Result<(), StorageError> {
        if self.storage.exists(&strand.document_id).await? {
            return Ok(());
        }
        let drive = self.storage.get(&strand.drive_id).await?;
        let state = drive::drive_state(&drive)
            .map_err(|e| StorageError::backend(anyhow::anyhow!(e.to_string())))?;
        let node = state
            .nodes
            .iter()
            .find(|node| node.id == strand.document_id)
            .ok_or_else(|| StorageError::NotFound(strand.document_id.clone()))?;
        let model = self
            .registry
            .get(&node.document_type)
            .map_err(|e| StorageError::backend(anyhow::anyhow!(e.to_string())))?;
        let document = Document::new(
            strand.document_id.clone(),
            "",
            node.document_type.clone(),
            model.initial_state(),
        );
        self.storage.create(document).await?;
        self.storage
            .add_child(&strand.drive_id, &strand.document_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn reactor() -> Arc<Reactor> {
        Reactor::builder().build()
    }

    #[tokio::test]
    async fn mutate_assigns_monotonic_indices_before_execution() {
        let reactor = reactor().await;
        reactor
            .add_drive(AddDriveInput {
                id: Some("drive-1".into()),
                name: "test".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let jobs = reactor
            .mutate(
                "drive-1",
                vec![
                    drive::actions::add_file("a", "a.json", "test/doc"),
                    drive::actions::add_file("b", "b.json", "test/doc"),
                    drive::actions::add_file("c", "c.json", "test/doc"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));

        for job in &jobs {
            let result = reactor.wait_for_job(&job.id).await;
            assert_eq!(result.status, JobStatus::Success, "{:?}", result.error);
        }

        let drive = reactor.get_drive("drive-1").await.unwrap();
        assert_eq!(drive.header.revision(Scope::Global), 3);
        let indices: Vec<u64> = drive.operations.global.iter().map(|op| op.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        let replayed = crate::document::replay_scope(
            &drive.initial_state.global,
            &drive.operations.global,
            crate::document::CheckHashes::Yes,
            |_, _| panic!("snapshots present"),
        )
        .unwrap();
        assert_eq!(replayed, drive.state.global);
    }

    #[tokio::test]
    async fn unknown_action_fails_the_job_not_the_reactor() {
        let reactor = reactor().await;
        reactor
            .add_drive(AddDriveInput {
                id: Some("drive-1".into()),
                name: "test".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let jobs = reactor
            .mutate("drive-1", vec![Action::global("NO_SUCH_ACTION", json!({}))])
            .await
            .unwrap();
        let result = reactor.wait_for_job(&jobs[0].id).await;
        assert_eq!(result.status, JobStatus::Error);

        // the reactor keeps working
        let jobs = reactor
            .mutate(
                "drive-1",
                vec![drive::actions::add_file("a", "a", "test/doc")],
            )
            .await
            .unwrap();
        assert_eq!(
            reactor.wait_for_job(&jobs[0].id).await.status,
            JobStatus::Success
        );
    }

    #[tokio::test]
    async fn duplicate_remote_operation_is_a_no_op() {
        let reactor = reactor().await;
        reactor
            .add_drive(AddDriveInput {
                id: Some("drive-1".into()),
                name: "test".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let jobs = reactor
            .mutate(
                "drive-1",
                vec![drive::actions::add_file("a", "a", "test/doc")],
            )
            .await
            .unwrap();
        reactor.wait_for_job(&jobs[0].id).await;

        let committed = reactor.get_drive("drive-1").await.unwrap().operations.global[0].clone();
        let jobs = reactor
            .queue_remote_operations("drive-1", vec![committed.trimmed()])
            .await
            .unwrap();
        let result = reactor.wait_for_job(&jobs[0].id).await;
        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(
            reactor
                .get_drive("drive-1")
                .await
                .unwrap()
                .operations
                .global
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn conflicting_remote_operation_reports_conflict() {
        let reactor = reactor().await;
        reactor
            .add_drive(AddDriveInput {
                id: Some("drive-1".into()),
                name: "test".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let jobs = reactor
            .mutate(
                "drive-1",
                vec![drive::actions::add_file("a", "a", "test/doc")],
            )
            .await
            .unwrap();
        reactor.wait_for_job(&jobs[0].id).await;

        // a different operation claiming index 0
        let mut racer = reactor.get_drive("drive-1").await.unwrap().operations.global[0].clone();
        racer.op_type = drive::SET_DRIVE_NAME.to_string();
        racer.input = json!({"name": "usurper"});
        racer.hash = "someone-elses-hash".to_string();
        let jobs = reactor
            .queue_remote_operations("drive-1", vec![racer.trimmed()])
            .await
            .unwrap();
        let result = reactor.wait_for_job(&jobs[0].id).await;
        assert_eq!(result.status, JobStatus::Conflict);
    }

    #[tokio::test]
    async fn documents_execute_concurrently_but_serially_within() {
        let reactor = reactor().await;
        for id in ["drive-a", "drive-b"] {
            reactor
                .add_drive(AddDriveInput {
                    id: Some(id.into()),
                    name: id.into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let mut all = Vec::new();
        for i in 0..5 {
            for id in ["drive-a", "drive-b"] {
                all.extend(
                    reactor
                        .mutate(
                            id,
                            vec![drive::actions::add_file(
                                &format!("f{i}"),
                                "f",
                                "test/doc",
                            )],
                        )
                        .await
                        .unwrap(),
                );
            }
        }
        for job in &all {
            assert_eq!(
                reactor.wait_for_job(&job.id).await.status,
                JobStatus::Success
            );
        }
        for id in ["drive-a", "drive-b"] {
            let doc = reactor.get_drive(id).await.unwrap();
            let indices: Vec<u64> = doc.operations.global.iter().map(|op| op.index).collect();
            assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn add_document_wires_manifest_and_drive_state() {
        let reactor = reactor().await;
        reactor
            .add_drive(AddDriveInput {
                id: Some("drive-1".into()),
                name: "test".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        reactor
            .add_document("drive-1", "doc-x", "notes.json", DRIVE_DOCUMENT_TYPE)
            .await
            .unwrap();

        assert_eq!(
            reactor.storage().get_children("drive-1").await.unwrap(),
            vec!["doc-x"]
        );
        let drive = reactor.get_drive("drive-1").await.unwrap();
        let state = drive::drive_state(&drive).unwrap();
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.nodes[0].id, "doc-x");
    }
}
