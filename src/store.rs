//! Storage contract shared by every backend.
//!
//! Five interchangeable implementations live in the submodules: in-memory,
//! filesystem, embedded key-value ([`redb`]), content-addressed and
//! relational ([`rusqlite`]). They differ in durability and latency, never
//! in observable invariants; the conformance battery in `testing` runs the
//! same assertions over all of them.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::document::{Document, DocumentHeader, Operation, Scope, SyncUnitId, MAIN_BRANCH};
use crate::error::StorageError;

pub mod content;
pub mod fs;
pub mod kv;
pub mod memory;
pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use content::ContentStorage;
pub use fs::FsStorage;
pub use kv::KvStorage;
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// One page of a cursor-paginated result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass back to resume after this page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// One `(document, scope, branch)` storage unit as reported by queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnit {
    pub document_id: String,
    pub document_type: String,
    pub scope: Scope,
    pub branch: String,
}

/// Filter for [`DocumentStorage::find_storage_units_by`]. Empty members
/// match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageUnitFilter {
    /// Restrict to these drives (the drives themselves and their children).
    pub parent_id: Option<BTreeSet<String>>,
    pub document_id: Option<BTreeSet<String>>,
    pub document_type: Option<BTreeSet<String>>,
    pub scope: Option<BTreeSet<String>>,
    pub branch: Option<BTreeSet<String>>,
}

impl StorageUnitFilter {
    fn set(ids: &[&str]) -> Option<BTreeSet<String>> {
        Some(ids.iter().map(|s| s.to_string()).collect())
    }

    pub fn for_parents(ids: &[&str]) -> Self {
        StorageUnitFilter {
            parent_id: Self::set(ids),
            ..Default::default()
        }
    }

    pub fn for_document_types(types: &[&str]) -> Self {
        StorageUnitFilter {
            document_type: Self::set(types),
            ..Default::default()
        }
    }
}

/// Revision snapshot of one synchronization unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUnitRevision {
    pub document_id: String,
    pub scope: Scope,
    pub branch: String,
    pub last_updated_ms: u64,
    pub revision: u64,
}

/// What a transaction callback produces: the batch to commit.
#[derive(Debug, Clone)]
pub struct OperationBatch {
    pub operations: Vec<Operation>,
    pub header: DocumentHeader,
}

/// Callback for [`DocumentStorage::add_operations_with_transaction`].
///
/// Invoked with the document as read inside the transaction; may run more
/// than once when the backend retries.
pub type TxCallback =
    Box<dyn Fn(&Document) -> Result<OperationBatch, StorageError> + Send + Sync>;

/// Bounded exponential backoff with jitter, used for transaction retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubled per attempt
    /// and capped, with up to 50% random jitter added.
    pub fn delay(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..=0.5);
        exp.mul_f64(1.0 + jitter).min(self.max_delay.mul_f64(1.5))
    }
}

/// The backend-agnostic storage contract.
///
/// All operations may be backed by I/O and are therefore async and
/// fallible. Implementations own their physical store exclusively;
/// cross-process concurrency relies on the store's own locking.
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    async fn exists(&self, id: &str) -> Result<bool, StorageError>;

    /// Stores a new document. Fails with [`StorageError::AlreadyExists`]
    /// when the id or slug is taken, and with the validation errors when
    /// either is malformed. Drive-typed documents get an empty manifest in
    /// the same call.
    async fn create(&self, document: Document) -> Result<(), StorageError>;

    async fn get(&self, id: &str) -> Result<Document, StorageError>;

    async fn get_by_slug(&self, slug: &str) -> Result<Document, StorageError>;

    /// Removes the document, its slug entry, its membership in every drive
    /// manifest and any manifest it owns. Children left without a parent
    /// are deleted in the same batch. Returns `false` when the document did
    /// not exist.
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    /// Adds `child_id` to the parent's manifest. Rejects self-reference and
    /// one-level cycles; idempotent when already present.
    async fn add_child(&self, parent_id: &str, child_id: &str) -> Result<(), StorageError>;

    async fn remove_child(&self, parent_id: &str, child_id: &str) -> Result<bool, StorageError>;

    async fn get_children(&self, parent_id: &str) -> Result<Vec<String>, StorageError>;

    /// Drives whose manifest currently lists the child (single level).
    async fn get_parents(&self, child_id: &str) -> Result<Vec<String>, StorageError>;

    /// Appends a batch of operations and installs the updated header. The
    /// batch fully commits or fully fails; a duplicate index fails with
    /// [`StorageError::Conflict`] carrying the stored operation.
    async fn add_operations(
        &self,
        id: &str,
        operations: &[Operation],
        header: &DocumentHeader,
    ) -> Result<(), StorageError>;

    /// Reads the document under the backend's isolation, lets `callback`
    /// produce the batch, and commits it in the same transaction.
    /// Serialization failures are retried with backoff inside the backend;
    /// conflicts are not.
    async fn add_operations_with_transaction(
        &self,
        id: &str,
        callback: TxCallback,
    ) -> Result<(), StorageError>;

    /// Ids of documents of one type, paginated in `(created_at, id)` order.
    async fn find_by_type(
        &self,
        document_type: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<String>, StorageError>;

    async fn find_storage_units_by(
        &self,
        filter: &StorageUnitFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<StorageUnit>, StorageError>;

    /// Batched revision lookup; units that cannot be resolved are dropped
    /// from the result rather than failing the batch.
    async fn get_synchronization_units_revision(
        &self,
        units: &[SyncUnitId],
    ) -> Result<Vec<SyncUnitRevision>, StorageError>;

    /// Resolves slugs to ids; fails fast with [`StorageError::Aborted`]
    /// when the token is already cancelled.
    async fn resolve_ids(
        &self,
        slugs: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StorageError>;

    async fn resolve_slugs(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StorageError>;

    /// Drops everything. Administrative.
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Validates id and slug for `create` and returns the effective slug
/// (defaults to the id when unset).
pub(crate) fn effective_slug(document: &Document) -> Result<String, StorageError> {
    let id = &document.header.id;
    if !crate::document::is_valid_document_id(id) {
        return Err(StorageError::InvalidDocumentId(id.clone()));
    }
    let slug = if document.header.slug.is_empty() {
        id.clone()
    } else {
        document.header.slug.clone()
    };
    // an id used as a fallback slug may contain dots, which slugs of their
    // own cannot
    if slug != *id && !crate::document::is_valid_slug(&slug) {
        return Err(StorageError::InvalidSlug(slug));
    }
    Ok(slug)
}

/// Cursor pagination over a sorted list: the cursor names the first item of
/// the page, which keeps page boundaries stable under concurrent inserts
/// (the cursor is located by key, not by position).
pub(crate) fn paginate_by_id<T: Clone>(
    items: &[T],
    id_of: impl Fn(&T) -> &str,
    limit: usize,
    cursor: Option<&str>,
) -> Page<T> {
    let start = cursor
        .and_then(|c| items.iter().position(|item| id_of(item) == c))
        .unwrap_or(0);
    let end = (start + limit).min(items.len());
    let next_cursor = (end < items.len()).then(|| id_of(&items[end]).to_string());
    Page {
        items: items[start..end].to_vec(),
        next_cursor,
    }
}

/// Sort key for [`DocumentStorage::find_by_type`].
pub(crate) fn created_order(a: &(u64, String), b: &(u64, String)) -> std::cmp::Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1))
}

/// The storage units a document exposes, one per scope on the main branch.
pub(crate) fn storage_units_of(document: &Document) -> Vec<StorageUnit> {
    Scope::all()
        .into_iter()
        .map(|scope| StorageUnit {
            document_id: document.header.id.clone(),
            document_type: document.header.document_type.clone(),
            scope,
            branch: MAIN_BRANCH.to_string(),
        })
        .collect()
}

/// Applies a [`StorageUnitFilter`] given the full document list and a
/// children lookup. Shared by the backends that filter in memory.
pub(crate) fn filter_storage_units(
    documents: &[Document],
    children_of: impl Fn(&str) -> Vec<String>,
    filter: &StorageUnitFilter,
) -> Vec<StorageUnit> {
    let allowed_ids: Option<BTreeSet<String>> = filter.parent_id.as_ref().map(|parents| {
        let mut ids: BTreeSet<String> = parents.clone();
        for parent in parents {
            ids.extend(children_of(parent));
        }
        ids
    });

    let mut units = Vec::new();
    for document in documents {
        let id = &document.header.id;
        if let Some(allowed) = &allowed_ids {
            if !allowed.contains(id) {
                continue;
            }
        }
        if let Some(ids) = &filter.document_id {
            if !ids.contains(id) {
                continue;
            }
        }
        if let Some(types) = &filter.document_type {
            if !types.contains(&document.header.document_type) {
                continue;
            }
        }
        for unit in storage_units_of(document) {
            if let Some(scopes) = &filter.scope {
                if !scopes.contains(&unit.scope.to_string()) {
                    continue;
                }
            }
            if let Some(branches) = &filter.branch {
                if !branches.contains(&unit.branch) {
                    continue;
                }
            }
            units.push(unit);
        }
    }
    units
}

/// Revision snapshot of one unit from a loaded document, `None` when the
/// unit does not resolve (absent document or branch).
pub(crate) fn unit_revision(document: &Document, unit: &SyncUnitId) -> Option<SyncUnitRevision> {
    if unit.branch != MAIN_BRANCH {
        return None;
    }
    let operations = document.operations.get(unit.scope);
    Some(SyncUnitRevision {
        document_id: unit.document_id.clone(),
        scope: unit.scope,
        branch: unit.branch.clone(),
        last_updated_ms: operations
            .last()
            .map(|op| op.timestamp_utc_ms)
            .unwrap_or(document.header.created_at_ms),
        revision: crate::document::operations_to_revision(operations),
    })
}

/// Applies a committed batch to an owned document: appends (after the
/// backend's conflict check), installs the header and rolls the per-scope
/// state forward to the last snapshot.
pub(crate) fn apply_batch(
    document: &mut Document,
    operations: &[Operation],
    header: &DocumentHeader,
) {
    for op in operations {
        document.operations.get_mut(op.scope).push(op.clone());
        if let Some(state) = &op.resulting_state {
            document.state.set(op.scope, state.clone());
        }
    }
    document.header = header.clone();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_concatenation_is_stable() {
        let items: Vec<(u64, String)> = (0..10).map(|i| (i, format!("doc-{i:02}"))).collect();
        let mut sorted = items.clone();
        sorted.sort_by(created_order);

        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = paginate_by_id(&sorted, |item| &item.1, 2, cursor.as_deref());
            collected.extend(page.items.iter().map(|i| i.1.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        let all: Vec<String> = sorted.iter().map(|i| i.1.clone()).collect();
        assert_eq!(collected, all);
    }

    #[test]
    fn unknown_cursor_restarts_from_the_beginning() {
        let items: Vec<(u64, String)> = (0..4).map(|i| (i, format!("d{i}"))).collect();
        let page = paginate_by_id(&items, |i| &i.1, 10, Some("gone"));
        assert_eq!(page.items.len(), 4);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        let d0 = policy.delay(0);
        let d4 = policy.delay(4);
        assert!(d0 >= policy.base_delay);
        assert!(d4 <= policy.max_delay.mul_f64(1.5));
        assert!(d4 >= d0);
    }
}
