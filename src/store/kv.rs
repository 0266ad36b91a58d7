//! Embedded key-value storage on [`redb`].
//!
//! Documents (sans log), operations, slugs and parent/child edges each get
//! their own table. Operation keys embed the `(scope, branch, index)`
//! triple, so a duplicate index is a plain occupied key and the conflict
//! check is a point lookup inside the same write transaction that would
//! commit the batch.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tokio_util::sync::CancellationToken;

use crate::document::{
    operations_to_revision, Document, DocumentHeader, Operation, Scope, SyncUnitId,
};
use crate::error::{
    AlreadyExistsReason, AssociationErrorReason, ConflictOperationError, StorageError,
};
use crate::store::{
    created_order, effective_slug, filter_storage_units, paginate_by_id, unit_revision,
    DocumentStorage, OperationBatch, Page, StorageUnit, StorageUnitFilter, SyncUnitRevision,
    TxCallback,
};

// Key: document id. Value: document JSON with an empty operation log.
const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents-1");

// Key: `<id>\0<scope>\0<branch>\0<index:020>`. Value: operation JSON.
const OPERATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("operations-1");

// Key: slug. Value: document id.
const SLUGS: TableDefinition<&str, &str> = TableDefinition::new("slugs-1");

// Key: parent id. Value: JSON array of child ids.
const CHILDREN: TableDefinition<&str, &[u8]> = TableDefinition::new("children-1");

fn op_key(id: &str, scope: Scope, branch: &str, index: u64) -> String {
    format!("{id}\0{scope}\0{branch}\0{index:020}")
}

fn op_prefix(id: &str) -> (String, String) {
    (format!("{id}\0"), format!("{id}\u{1}"))
}

#[derive(Clone)]
pub struct KvStorage {
    db: Arc<Database>,
}

impl std::fmt::Debug for KvStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStorage").finish_non_exhaustive()
    }
}

impl KvStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path).map_err(StorageError::backend)?;
        {
            let write_tx = db.begin_write().map_err(StorageError::backend)?;
            write_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
            write_tx.open_table(OPERATIONS).map_err(StorageError::backend)?;
            write_tx.open_table(SLUGS).map_err(StorageError::backend)?;
            write_tx.open_table(CHILDREN).map_err(StorageError::backend)?;
            write_tx.commit().map_err(StorageError::backend)?;
        }
        Ok(KvStorage { db: Arc::new(db) })
    }

    fn decode_document(bytes: &[u8]) -> Result<Document, StorageError> {
        serde_json::from_slice(bytes).map_err(StorageError::backend)
    }

    fn decode_children(bytes: &[u8]) -> Result<Vec<String>, StorageError> {
        serde_json::from_slice(bytes).map_err(StorageError::backend)
    }

    /// Loads a document and reassembles its operation log from the
    /// operations table.
    fn load_document<T: ReadableTable<&'static str, &'static [u8]>>(
        documents: &T,
        operations: &T,
        id: &str,
    ) -> Result<Document, StorageError> {
        let Some(guard) = documents.get(id).map_err(StorageError::backend)? else {
            return Err(StorageError::NotFound(id.to_string()));
        };
        let mut document = Self::decode_document(guard.value())?;
        let (low, high) = op_prefix(id);
        let range = operations
            .range(low.as_str()..high.as_str())
            .map_err(StorageError::backend)?;
        for entry in range {
            let (_, value) = entry.map_err(StorageError::backend)?;
            let op: Operation =
                serde_json::from_slice(value.value()).map_err(StorageError::backend)?;
            document.operations.get_mut(op.scope).push(op);
        }
        for scope in Scope::all() {
            document
                .operations
                .get_mut(scope)
                .sort_by_key(|op| op.index);
        }
        Ok(document)
    }

    fn read_document(&self, id: &str) -> Result<Document, StorageError> {
        let read_tx = self.db.begin_read().map_err(StorageError::backend)?;
        let documents = read_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
        let operations = read_tx.open_table(OPERATIONS).map_err(StorageError::backend)?;
        Self::load_document(&documents, &operations, id)
    }

    fn all_document_ids(&self) -> Result<Vec<String>, StorageError> {
        let read_tx = self.db.begin_read().map_err(StorageError::backend)?;
        let documents = read_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
        let mut ids = Vec::new();
        for entry in documents.iter().map_err(StorageError::backend)? {
            let (key, _) = entry.map_err(StorageError::backend)?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }

    /// Appends a batch inside an open write transaction. The conflict check
    /// and the inserts see the same snapshot.
    fn append_in_tx(
        write_tx: &redb::WriteTransaction,
        id: &str,
        batch_ops: &[Operation],
        header: &DocumentHeader,
    ) -> Result<(), StorageError> {
        let mut documents = write_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
        let mut operations = write_tx.open_table(OPERATIONS).map_err(StorageError::backend)?;

        let mut document = {
            let Some(guard) = documents.get(id).map_err(StorageError::backend)? else {
                return Err(StorageError::NotFound(id.to_string()));
            };
            Self::decode_document(guard.value())?
        };

        // conflict and continuity checks for the whole batch up front
        let mut revisions = std::collections::HashMap::new();
        for scope in Scope::all() {
            let (low, high) = op_prefix(id);
            let mut last: Option<u64> = None;
            for entry in operations
                .range(low.as_str()..high.as_str())
                .map_err(StorageError::backend)?
            {
                let (_, value) = entry.map_err(StorageError::backend)?;
                let op: Operation =
                    serde_json::from_slice(value.value()).map_err(StorageError::backend)?;
                if op.scope == scope {
                    last = Some(last.map_or(op.index, |l: u64| l.max(op.index)));
                }
            }
            revisions.insert(scope, last.map(|l| l + 1).unwrap_or(0));
        }

        for op in batch_ops {
            let key = op_key(id, op.scope, &op.branch, op.index);
            if let Some(existing) = operations.get(key.as_str()).map_err(StorageError::backend)? {
                let stored: Operation =
                    serde_json::from_slice(existing.value()).map_err(StorageError::backend)?;
                return Err(ConflictOperationError {
                    document_id: id.to_string(),
                    existing_operation: stored,
                    new_operation: op.clone(),
                }
                .into());
            }
            let revision = revisions.get_mut(&op.scope).expect("all scopes present");
            if op.index < *revision || op.index - *revision > op.skip {
                return Err(StorageError::InvalidOperationIndex {
                    document_id: id.to_string(),
                    index: op.index,
                    skip: op.skip,
                    revision: *revision,
                });
            }
            *revision = op.index + 1;
        }

        for op in batch_ops {
            let key = op_key(id, op.scope, &op.branch, op.index);
            let bytes = serde_json::to_vec(op).map_err(StorageError::backend)?;
            operations
                .insert(key.as_str(), bytes.as_slice())
                .map_err(StorageError::backend)?;
            if let Some(state) = &op.resulting_state {
                document.state.set(op.scope, state.clone());
            }
        }
        document.header = header.clone();
        let bytes = serde_json::to_vec(&document).map_err(StorageError::backend)?;
        documents
            .insert(id, bytes.as_slice())
            .map_err(StorageError::backend)?;
        Ok(())
    }

    fn children_in_tx(
        children: &impl ReadableTable<&'static str, &'static [u8]>,
        parent: &str,
    ) -> Result<Vec<String>, StorageError> {
        match children.get(parent).map_err(StorageError::backend)? {
            Some(guard) => Self::decode_children(guard.value()),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl DocumentStorage for KvStorage {
    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let read_tx = self.db.begin_read().map_err(StorageError::backend)?;
        let documents = read_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
        Ok(documents.get(id).map_err(StorageError::backend)?.is_some())
    }

    async fn create(&self, mut document: Document) -> Result<(), StorageError> {
        let slug = effective_slug(&document)?;
        let id = document.header.id.clone();
        let write_tx = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut documents = write_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
            let mut slugs = write_tx.open_table(SLUGS).map_err(StorageError::backend)?;
            let mut children = write_tx.open_table(CHILDREN).map_err(StorageError::backend)?;

            if documents.get(id.as_str()).map_err(StorageError::backend)?.is_some() {
                return Err(StorageError::AlreadyExists {
                    id,
                    reason: AlreadyExistsReason::Id,
                });
            }
            if slugs.get(slug.as_str()).map_err(StorageError::backend)?.is_some() {
                return Err(StorageError::AlreadyExists {
                    id,
                    reason: AlreadyExistsReason::Slug,
                });
            }
            document.header.slug = slug.clone();
            let is_drive = document.is_drive();
            // the log lives in the operations table
            let mut stored = document.clone();
            stored.operations = Default::default();
            let bytes = serde_json::to_vec(&stored).map_err(StorageError::backend)?;
            documents
                .insert(id.as_str(), bytes.as_slice())
                .map_err(StorageError::backend)?;
            slugs
                .insert(slug.as_str(), id.as_str())
                .map_err(StorageError::backend)?;
            if is_drive {
                children
                    .insert(id.as_str(), b"[]".as_slice())
                    .map_err(StorageError::backend)?;
            }
        }
        write_tx.commit().map_err(StorageError::backend)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Document, StorageError> {
        self.read_document(id)
    }

    async fn get_by_slug(&self, slug: &str) -> Result<Document, StorageError> {
        let id = {
            let read_tx = self.db.begin_read().map_err(StorageError::backend)?;
            let slugs = read_tx.open_table(SLUGS).map_err(StorageError::backend)?;
            let Some(guard) = slugs.get(slug).map_err(StorageError::backend)? else {
                return Err(StorageError::NotFound(slug.to_string()));
            };
            guard.value().to_string()
        };
        self.read_document(&id)
            .map_err(|_| StorageError::NotFound(slug.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let write_tx = self.db.begin_write().map_err(StorageError::backend)?;
        let existed;
        {
            let mut documents = write_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
            let mut operations = write_tx.open_table(OPERATIONS).map_err(StorageError::backend)?;
            let mut slugs = write_tx.open_table(SLUGS).map_err(StorageError::backend)?;
            let mut children = write_tx.open_table(CHILDREN).map_err(StorageError::backend)?;

            let mut worklist = vec![id.to_string()];
            let mut first = true;
            existed = documents.get(id).map_err(StorageError::backend)?.is_some();
            while let Some(target) = worklist.pop() {
                // after the first round, only delete documents that lost
                // their last parent
                if !first {
                    let mut has_parent = false;
                    for entry in children.iter().map_err(StorageError::backend)? {
                        let (_, value) = entry.map_err(StorageError::backend)?;
                        if Self::decode_children(value.value())?.contains(&target) {
                            has_parent = true;
                            break;
                        }
                    }
                    if has_parent {
                        continue;
                    }
                }
                first = false;

                if let Some(guard) = documents.remove(target.as_str()).map_err(StorageError::backend)? {
                    let doc = Self::decode_document(guard.value())?;
                    drop(guard);
                    let slug = if doc.header.slug.is_empty() {
                        target.clone()
                    } else {
                        doc.header.slug.clone()
                    };
                    let matches = slugs
                        .get(slug.as_str())
                        .map_err(StorageError::backend)?
                        .map(|g| g.value() == target)
                        .unwrap_or(false);
                    if matches {
                        slugs.remove(slug.as_str()).map_err(StorageError::backend)?;
                    }
                }

                let (low, high) = op_prefix(&target);
                loop {
                    let key = {
                        let mut range = operations
                            .range(low.as_str()..high.as_str())
                            .map_err(StorageError::backend)?;
                        match range.next() {
                            Some(entry) => {
                                let (k, _) = entry.map_err(StorageError::backend)?;
                                k.value().to_string()
                            }
                            None => break,
                        }
                    };
                    operations.remove(key.as_str()).map_err(StorageError::backend)?;
                }

                // drop the target from every remaining manifest
                let mut parents_to_update = Vec::new();
                for entry in children.iter().map_err(StorageError::backend)? {
                    let (key, value) = entry.map_err(StorageError::backend)?;
                    let ids = Self::decode_children(value.value())?;
                    if ids.contains(&target) {
                        parents_to_update.push((key.value().to_string(), ids));
                    }
                }
                for (parent, mut ids) in parents_to_update {
                    ids.retain(|c| c != &target);
                    let bytes = serde_json::to_vec(&ids).map_err(StorageError::backend)?;
                    children
                        .insert(parent.as_str(), bytes.as_slice())
                        .map_err(StorageError::backend)?;
                }

                if let Some(guard) = children.remove(target.as_str()).map_err(StorageError::backend)? {
                    worklist.extend(Self::decode_children(guard.value())?);
                }
            }
        }
        write_tx.commit().map_err(StorageError::backend)?;
        Ok(existed)
    }

    async fn add_child(&self, parent_id: &str, child_id: &str) -> Result<(), StorageError> {
        if parent_id == child_id {
            return Err(StorageError::InvalidAssociation {
                parent: parent_id.to_string(),
                child: child_id.to_string(),
                reason: AssociationErrorReason::SelfReference,
            });
        }
        let write_tx = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut children = write_tx.open_table(CHILDREN).map_err(StorageError::backend)?;
            if Self::children_in_tx(&children, child_id)?.contains(&parent_id.to_string()) {
                return Err(StorageError::InvalidAssociation {
                    parent: parent_id.to_string(),
                    child: child_id.to_string(),
                    reason: AssociationErrorReason::Cycle,
                });
            }
            let mut ids = Self::children_in_tx(&children, parent_id)?;
            if !ids.contains(&child_id.to_string()) {
                ids.push(child_id.to_string());
                ids.sort();
                let bytes = serde_json::to_vec(&ids).map_err(StorageError::backend)?;
                children
                    .insert(parent_id, bytes.as_slice())
                    .map_err(StorageError::backend)?;
            }
        }
        write_tx.commit().map_err(StorageError::backend)?;
        Ok(())
    }

    async fn remove_child(&self, parent_id: &str, child_id: &str) -> Result<bool, StorageError> {
        let write_tx = self.db.begin_write().map_err(StorageError::backend)?;
        let removed;
        {
            let mut children = write_tx.open_table(CHILDREN).map_err(StorageError::backend)?;
            let mut ids = Self::children_in_tx(&children, parent_id)?;
            let before = ids.len();
            ids.retain(|c| c != child_id);
            removed = ids.len() != before;
            if removed {
                let bytes = serde_json::to_vec(&ids).map_err(StorageError::backend)?;
                children
                    .insert(parent_id, bytes.as_slice())
                    .map_err(StorageError::backend)?;
            }
        }
        write_tx.commit().map_err(StorageError::backend)?;
        Ok(removed)
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<String>, StorageError> {
        let read_tx = self.db.begin_read().map_err(StorageError::backend)?;
        let children = read_tx.open_table(CHILDREN).map_err(StorageError::backend)?;
        Self::children_in_tx(&children, parent_id)
    }

    async fn get_parents(&self, child_id: &str) -> Result<Vec<String>, StorageError> {
        let read_tx = self.db.begin_read().map_err(StorageError::backend)?;
        let children = read_tx.open_table(CHILDREN).map_err(StorageError::backend)?;
        let mut parents = Vec::new();
        for entry in children.iter().map_err(StorageError::backend)? {
            let (key, value) = entry.map_err(StorageError::backend)?;
            if Self::decode_children(value.value())?.contains(&child_id.to_string()) {
                parents.push(key.value().to_string());
            }
        }
        parents.sort();
        Ok(parents)
    }

    async fn add_operations(
        &self,
        id: &str,
        operations: &[Operation],
        header: &DocumentHeader,
    ) -> Result<(), StorageError> {
        let write_tx = self.db.begin_write().map_err(StorageError::backend)?;
        Self::append_in_tx(&write_tx, id, operations, header)?;
        write_tx.commit().map_err(StorageError::backend)?;
        Ok(())
    }

    async fn add_operations_with_transaction(
        &self,
        id: &str,
        callback: TxCallback,
    ) -> Result<(), StorageError> {
        // the whole read-modify-write runs inside one redb write
        // transaction, which is exclusive in this process
        let write_tx = self.db.begin_write().map_err(StorageError::backend)?;
        let batch = {
            let documents = write_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
            let operations = write_tx.open_table(OPERATIONS).map_err(StorageError::backend)?;
            let document = Self::load_document(&documents, &operations, id)?;
            callback(&document)?
        };
        Self::append_in_tx(&write_tx, id, &batch.operations, &batch.header)?;
        write_tx.commit().map_err(StorageError::backend)?;
        Ok(())
    }

    async fn find_by_type(
        &self,
        document_type: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<String>, StorageError> {
        let read_tx = self.db.begin_read().map_err(StorageError::backend)?;
        let documents = read_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
        let mut keyed = Vec::new();
        for entry in documents.iter().map_err(StorageError::backend)? {
            let (_, value) = entry.map_err(StorageError::backend)?;
            let doc = Self::decode_document(value.value())?;
            if doc.header.document_type == document_type {
                keyed.push((doc.header.created_at_ms, doc.header.id));
            }
        }
        keyed.sort_by(created_order);
        let ids: Vec<String> = keyed.into_iter().map(|(_, id)| id).collect();
        Ok(paginate_by_id(&ids, |id| id, limit, cursor))
    }

    async fn find_storage_units_by(
        &self,
        filter: &StorageUnitFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<StorageUnit>, StorageError> {
        let mut documents = Vec::new();
        for id in self.all_document_ids()? {
            documents.push(self.read_document(&id)?);
        }
        documents.sort_by(|a, b| {
            created_order(
                &(a.header.created_at_ms, a.header.id.clone()),
                &(b.header.created_at_ms, b.header.id.clone()),
            )
        });
        let read_tx = self.db.begin_read().map_err(StorageError::backend)?;
        let children = read_tx.open_table(CHILDREN).map_err(StorageError::backend)?;
        let units = filter_storage_units(
            &documents,
            |parent| Self::children_in_tx(&children, parent).unwrap_or_default(),
            filter,
        );
        Ok(paginate_by_id(&units, |u| &u.document_id, limit, cursor))
    }

    async fn get_synchronization_units_revision(
        &self,
        units: &[SyncUnitId],
    ) -> Result<Vec<SyncUnitRevision>, StorageError> {
        let mut revisions = Vec::new();
        for unit in units {
            if let Ok(doc) = self.read_document(&unit.document_id) {
                debug_assert_eq!(
                    doc.header.revision(unit.scope),
                    operations_to_revision(doc.operations.get(unit.scope))
                );
                if let Some(revision) = unit_revision(&doc, unit) {
                    revisions.push(revision);
                }
            }
        }
        Ok(revisions)
    }

    async fn resolve_ids(
        &self,
        slugs: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Aborted);
        }
        let read_tx = self.db.begin_read().map_err(StorageError::backend)?;
        let table = read_tx.open_table(SLUGS).map_err(StorageError::backend)?;
        slugs
            .iter()
            .map(|slug| {
                table
                    .get(slug.as_str())
                    .map_err(StorageError::backend)?
                    .map(|g| g.value().to_string())
                    .ok_or_else(|| StorageError::NotFound(slug.clone()))
            })
            .collect()
    }

    async fn resolve_slugs(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Aborted);
        }
        let read_tx = self.db.begin_read().map_err(StorageError::backend)?;
        let documents = read_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
        ids.iter()
            .map(|id| {
                documents
                    .get(id.as_str())
                    .map_err(StorageError::backend)?
                    .map(|g| Self::decode_document(g.value()).map(|d| d.header.slug))
                    .ok_or_else(|| StorageError::NotFound(id.clone()))?
            })
            .collect()
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let write_tx = self.db.begin_write().map_err(StorageError::backend)?;
        {
            write_tx.delete_table(DOCUMENTS).map_err(StorageError::backend)?;
            write_tx.delete_table(OPERATIONS).map_err(StorageError::backend)?;
            write_tx.delete_table(SLUGS).map_err(StorageError::backend)?;
            write_tx.delete_table(CHILDREN).map_err(StorageError::backend)?;
            write_tx.open_table(DOCUMENTS).map_err(StorageError::backend)?;
            write_tx.open_table(OPERATIONS).map_err(StorageError::backend)?;
            write_tx.open_table(SLUGS).map_err(StorageError::backend)?;
            write_tx.open_table(CHILDREN).map_err(StorageError::backend)?;
        }
        write_tx.commit().map_err(StorageError::backend)?;
        Ok(())
    }
}
