//! Replicated, operation-log document store.
//!
//! Documents live in drive containers; each document's state derives from
//! replaying ordered per-scope operation logs, persisted through one of
//! five interchangeable storage backends. Independent [`reactor::Reactor`]
//! instances synchronize operation logs over a pull/push strand protocol
//! with first-writer-wins conflict detection.
//!
//! The pieces, bottom up:
//!
//! - [`document`]: the operation-log data model and its invariants
//! - [`registry`]: the reducer boundary and document-model registry
//! - [`drive`]: the built-in drive (container) document model
//! - [`store`]: the storage contract and the five backends
//! - [`cache`]: the namespaced write-through cache
//! - [`queue`] + [`reactor`]: per-document serialized job execution
//! - [`sync`]: the pull/push synchronization engine
//! - [`strategy`]: startup reconciliation of configured remote drives

pub mod cache;
pub mod document;
pub mod drive;
pub mod error;
pub mod events;
pub mod queue;
pub mod reactor;
pub mod registry;
pub mod store;
pub mod strategy;
pub mod sync;

pub use cache::{Cache, CachedStorage};
pub use document::{Document, DocumentState, Operation, Scope, SyncUnitId};
pub use error::{ConflictOperationError, ReducerError, StorageError};
pub use events::{Event, EventBus};
pub use queue::{JobInfo, JobStatus};
pub use reactor::{AddDriveInput, Reactor, RemoteDriveOptions};
pub use registry::{Action, DocumentModel, ModelRegistry};
pub use store::{
    ContentStorage, DocumentStorage, FsStorage, KvStorage, MemoryStorage, SqliteStorage,
};
pub use sync::{remote::ReactorRemote, RemoteDrive, Strand, SyncStatus};
