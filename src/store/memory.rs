//! In-memory storage.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::document::{check_append, Document, DocumentHeader, Operation, SyncUnitId};
use crate::error::{AlreadyExistsReason, AssociationErrorReason, StorageError};
use crate::store::{
    apply_batch, created_order, effective_slug, filter_storage_units, paginate_by_id,
    unit_revision, DocumentStorage, OperationBatch, Page, StorageUnit, StorageUnitFilter,
    SyncUnitRevision, TxCallback,
};

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<String, Document>,
    manifests: HashMap<String, BTreeSet<String>>,
    slugs: HashMap<String, String>,
}

/// Keeps everything in process memory. The reference implementation of the
/// contract: the other backends must be observationally identical to this
/// one.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Inner>>,
    /// Serializes read-modify-write transactions.
    tx_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_operations_inner(
        inner: &mut Inner,
        id: &str,
        operations: &[Operation],
        header: &DocumentHeader,
    ) -> Result<(), StorageError> {
        let document = inner
            .documents
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        for scope in crate::document::Scope::all() {
            let scoped: Vec<Operation> = operations
                .iter()
                .filter(|op| op.scope == scope)
                .cloned()
                .collect();
            if !scoped.is_empty() {
                check_append(id, &document.operations, scope, &scoped)?;
            }
        }
        // the whole batch checked out; now it can be applied
        apply_batch(document, operations, header);
        Ok(())
    }

    fn delete_inner(inner: &mut Inner, id: &str) -> bool {
        let Some(document) = inner.documents.remove(id) else {
            inner.manifests.remove(id);
            return false;
        };

        let slug = if document.header.slug.is_empty() {
            id.to_string()
        } else {
            document.header.slug.clone()
        };
        if inner.slugs.get(&slug).map(String::as_str) == Some(id) {
            inner.slugs.remove(&slug);
        }

        let mut orphan_candidates = Vec::new();
        for manifest in inner.manifests.values_mut() {
            manifest.remove(id);
        }
        if let Some(children) = inner.manifests.remove(id) {
            orphan_candidates.extend(children);
        }

        // cascade as a worklist: a child whose last parent just vanished is
        // deleted too, which may orphan grandchildren in turn
        while let Some(candidate) = orphan_candidates.pop() {
            let has_parent = inner
                .manifests
                .values()
                .any(|manifest| manifest.contains(&candidate));
            if !has_parent {
                if let Some(child_doc) = inner.documents.get(&candidate) {
                    let child_slug = if child_doc.header.slug.is_empty() {
                        candidate.clone()
                    } else {
                        child_doc.header.slug.clone()
                    };
                    if inner.slugs.get(&child_slug).map(String::as_str)
                        == Some(candidate.as_str())
                    {
                        inner.slugs.remove(&child_slug);
                    }
                    inner.documents.remove(&candidate);
                }
                if let Some(grandchildren) = inner.manifests.remove(&candidate) {
                    orphan_candidates.extend(grandchildren);
                }
            }
        }
        true
    }
}

#[async_trait]
impl DocumentStorage for MemoryStorage {
    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.inner.read().documents.contains_key(id))
    }

    async fn create(&self, mut document: Document) -> Result<(), StorageError> {
        let slug = effective_slug(&document)?;
        let id = document.header.id.clone();
        let mut inner = self.inner.write();
        if inner.documents.contains_key(&id) {
            return Err(StorageError::AlreadyExists {
                id,
                reason: AlreadyExistsReason::Id,
            });
        }
        if inner.slugs.contains_key(&slug) {
            return Err(StorageError::AlreadyExists {
                id,
                reason: AlreadyExistsReason::Slug,
            });
        }
        document.header.slug = slug.clone();
        let is_drive = document.is_drive();
        inner.slugs.insert(slug, id.clone());
        inner.documents.insert(id.clone(), document);
        if is_drive {
            inner.manifests.entry(id).or_default();
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Document, StorageError> {
        self.inner
            .read()
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn get_by_slug(&self, slug: &str) -> Result<Document, StorageError> {
        let inner = self.inner.read();
        let id = inner
            .slugs
            .get(slug)
            .ok_or_else(|| StorageError::NotFound(slug.to_string()))?;
        inner
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(slug.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        Ok(Self::delete_inner(&mut self.inner.write(), id))
    }

    async fn add_child(&self, parent_id: &str, child_id: &str) -> Result<(), StorageError> {
        if parent_id == child_id {
            return Err(StorageError::InvalidAssociation {
                parent: parent_id.to_string(),
                child: child_id.to_string(),
                reason: AssociationErrorReason::SelfReference,
            });
        }
        let mut inner = self.inner.write();
        let child_contains_parent = inner
            .manifests
            .get(child_id)
            .is_some_and(|m| m.contains(parent_id));
        if child_contains_parent {
            return Err(StorageError::InvalidAssociation {
                parent: parent_id.to_string(),
                child: child_id.to_string(),
                reason: AssociationErrorReason::Cycle,
            });
        }
        inner
            .manifests
            .entry(parent_id.to_string())
            .or_default()
            .insert(child_id.to_string());
        Ok(())
    }

    async fn remove_child(&self, parent_id: &str, child_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .inner
            .write()
            .manifests
            .get_mut(parent_id)
            .is_some_and(|m| m.remove(child_id)))
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .inner
            .read()
            .manifests
            .get(parent_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_parents(&self, child_id: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.read();
        let mut parents: Vec<String> = inner
            .manifests
            .iter()
            .filter(|(_, manifest)| manifest.contains(child_id))
            .map(|(id, _)| id.clone())
            .collect();
        parents.sort();
        Ok(parents)
    }

    async fn add_operations(
        &self,
        id: &str,
        operations: &[Operation],
        header: &DocumentHeader,
    ) -> Result<(), StorageError> {
        Self::add_operations_inner(&mut self.inner.write(), id, operations, header)
    }

    async fn add_operations_with_transaction(
        &self,
        id: &str,
        callback: TxCallback,
    ) -> Result<(), StorageError> {
        let _guard = self.tx_lock.lock().await;
        let document = self.get(id).await?;
        let OperationBatch { operations, header } = callback(&document)?;
        Self::add_operations_inner(&mut self.inner.write(), id, &operations, &header)
    }

    async fn find_by_type(
        &self,
        document_type: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<String>, StorageError> {
        let inner = self.inner.read();
        let mut keyed: Vec<(u64, String)> = inner
            .documents
            .values()
            .filter(|doc| doc.header.document_type == document_type)
            .map(|doc| (doc.header.created_at_ms, doc.header.id.clone()))
            .collect();
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
        let inner = self.inner.read();
        let mut documents: Vec<Document> = inner.documents.values().cloned().collect();
        documents.sort_by(|a, b| {
            created_order(
                &(a.header.created_at_ms, a.header.id.clone()),
                &(b.header.created_at_ms, b.header.id.clone()),
            )
        });
        let units = filter_storage_units(
            &documents,
            |parent| {
                inner
                    .manifests
                    .get(parent)
                    .map(|m| m.iter().cloned().collect())
                    .unwrap_or_default()
            },
            filter,
        );
        Ok(paginate_by_id(&units, |u| &u.document_id, limit, cursor))
    }

    async fn get_synchronization_units_revision(
        &self,
        units: &[SyncUnitId],
    ) -> Result<Vec<SyncUnitRevision>, StorageError> {
        let inner = self.inner.read();
        Ok(units
            .iter()
            .filter_map(|unit| {
                inner
                    .documents
                    .get(&unit.document_id)
                    .and_then(|doc| unit_revision(doc, unit))
            })
            .collect())
    }

    async fn resolve_ids(
        &self,
        slugs: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Aborted);
        }
        let inner = self.inner.read();
        slugs
            .iter()
            .map(|slug| {
                inner
                    .slugs
                    .get(slug)
                    .cloned()
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
        let inner = self.inner.read();
        ids.iter()
            .map(|id| {
                inner
                    .documents
                    .get(id)
                    .map(|doc| doc.header.slug.clone())
                    .ok_or_else(|| StorageError::NotFound(id.clone()))
            })
            .collect()
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        inner.documents.clear();
        inner.manifests.clear();
        inner.slugs.clear();
        Ok(())
    }
}
