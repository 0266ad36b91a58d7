//! Content-addressed storage.
//!
//! Every stored value (document snapshot, manifest, slug index) is an
//! immutable blob in `objects/`, named by the blake3 hash of its bytes;
//! mutable state is confined to tiny ref files in `refs/` that point at the
//! current root blob per document. A write is therefore "add blob, swing
//! ref" and never mutates existing content. Unreferenced blobs are left
//! behind; collecting them is an offline concern.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::document::{check_append, Document, DocumentHeader, Operation, Scope, SyncUnitId};
use crate::error::{AlreadyExistsReason, AssociationErrorReason, StorageError};
use crate::store::{
    apply_batch, created_order, effective_slug, filter_storage_units, paginate_by_id,
    unit_revision, DocumentStorage, OperationBatch, Page, StorageUnit, StorageUnitFilter,
    SyncUnitRevision, TxCallback,
};

#[derive(Debug, Clone)]
pub struct ContentStorage {
    base: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl ContentStorage {
    pub fn new(base: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base = base.as_ref().to_path_buf();
        std::fs::create_dir_all(base.join("objects")).map_err(StorageError::backend)?;
        std::fs::create_dir_all(base.join("refs")).map_err(StorageError::backend)?;
        Ok(ContentStorage {
            base,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.base.join("objects").join(hash)
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.base.join("refs").join(name)
    }

    /// Stores a blob and returns its hash. Writing an already-present blob
    /// is a no-op: same bytes, same name.
    fn put_blob(&self, bytes: &Bytes) -> Result<String, StorageError> {
        let hash = blake3::hash(bytes).to_hex().to_string();
        let path = self.object_path(&hash);
        if !path.exists() {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, bytes).map_err(StorageError::backend)?;
            std::fs::rename(&tmp, &path).map_err(StorageError::backend)?;
        }
        Ok(hash)
    }

    fn get_blob(&self, hash: &str) -> Result<Bytes, StorageError> {
        std::fs::read(self.object_path(hash))
            .map(Bytes::from)
            .map_err(StorageError::backend)
    }

    fn read_ref(&self, name: &str) -> Result<Option<String>, StorageError> {
        let path = self.ref_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let hash = std::fs::read_to_string(&path).map_err(StorageError::backend)?;
        Ok(Some(hash.trim().to_string()))
    }

    fn write_ref(&self, name: &str, hash: &str) -> Result<(), StorageError> {
        let path = self.ref_path(name);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, hash).map_err(StorageError::backend)?;
        std::fs::rename(&tmp, &path).map_err(StorageError::backend)?;
        Ok(())
    }

    fn remove_ref(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.ref_path(name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(StorageError::backend)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn store_json<T: serde::Serialize>(&self, value: &T) -> Result<String, StorageError> {
        let bytes = serde_json::to_vec(value).map_err(StorageError::backend)?;
        self.put_blob(&Bytes::from(bytes))
    }

    fn load_json<T: for<'de> serde::Deserialize<'de>>(
        &self,
        hash: &str,
    ) -> Result<T, StorageError> {
        let bytes = self.get_blob(hash)?;
        serde_json::from_slice(&bytes).map_err(StorageError::backend)
    }

    fn doc_ref(id: &str) -> String {
        format!("doc-{id}")
    }

    fn manifest_ref(id: &str) -> String {
        format!("manifest-{id}")
    }

    fn read_document(&self, id: &str) -> Result<Document, StorageError> {
        let Some(hash) = self.read_ref(&Self::doc_ref(id))? else {
            return Err(StorageError::NotFound(id.to_string()));
        };
        self.load_json(&hash)
    }

    fn write_document(&self, document: &Document) -> Result<(), StorageError> {
        let hash = self.store_json(document)?;
        self.write_ref(&Self::doc_ref(&document.header.id), &hash)
    }

    fn read_manifest(&self, id: &str) -> Result<Option<BTreeSet<String>>, StorageError> {
        match self.read_ref(&Self::manifest_ref(id))? {
            Some(hash) => Ok(Some(self.load_json(&hash)?)),
            None => Ok(None),
        }
    }

    fn write_manifest(&self, id: &str, children: &BTreeSet<String>) -> Result<(), StorageError> {
        let hash = self.store_json(children)?;
        self.write_ref(&Self::manifest_ref(id), &hash)
    }

    fn read_slugs(&self) -> Result<HashMap<String, String>, StorageError> {
        match self.read_ref("slugs")? {
            Some(hash) => self.load_json(&hash),
            None => Ok(HashMap::new()),
        }
    }

    fn write_slugs(&self, slugs: &HashMap<String, String>) -> Result<(), StorageError> {
        let hash = self.store_json(slugs)?;
        self.write_ref("slugs", &hash)
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(self.base.join("refs")).map_err(StorageError::backend)?;
        for entry in entries {
            let entry = entry.map_err(StorageError::backend)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix(prefix) {
                if !name.ends_with(".tmp") {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    fn load_all_documents(&self) -> Result<Vec<Document>, StorageError> {
        self.list_refs("doc-")?
            .iter()
            .map(|id| self.read_document(id))
            .collect()
    }

    fn has_parent(&self, id: &str) -> Result<bool, StorageError> {
        for parent in self.list_refs("manifest-")? {
            if let Some(children) = self.read_manifest(&parent)? {
                if children.contains(id) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn delete_one(&self, id: &str) -> Result<(bool, Vec<String>), StorageError> {
        let existed = self.read_ref(&Self::doc_ref(id))?.is_some();
        if existed {
            if let Ok(document) = self.read_document(id) {
                let slug = if document.header.slug.is_empty() {
                    id.to_string()
                } else {
                    document.header.slug.clone()
                };
                let mut slugs = self.read_slugs()?;
                if slugs.get(&slug).map(String::as_str) == Some(id) {
                    slugs.remove(&slug);
                    self.write_slugs(&slugs)?;
                }
            }
            self.remove_ref(&Self::doc_ref(id))?;
        }

        for parent in self.list_refs("manifest-")? {
            if parent == id {
                continue;
            }
            if let Some(mut children) = self.read_manifest(&parent)? {
                if children.remove(id) {
                    self.write_manifest(&parent, &children)?;
                }
            }
        }

        let mut orphans = Vec::new();
        if let Some(children) = self.read_manifest(id)? {
            orphans.extend(children);
            self.remove_ref(&Self::manifest_ref(id))?;
        }
        Ok((existed, orphans))
    }
}

#[async_trait]
impl DocumentStorage for ContentStorage {
    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.read_ref(&Self::doc_ref(id))?.is_some())
    }

    async fn create(&self, mut document: Document) -> Result<(), StorageError> {
        let slug = effective_slug(&document)?;
        let id = document.header.id.clone();
        let _guard = self.lock.lock().await;
        if self.read_ref(&Self::doc_ref(&id))?.is_some() {
            return Err(StorageError::AlreadyExists {
                id,
                reason: AlreadyExistsReason::Id,
            });
        }
        let mut slugs = self.read_slugs()?;
        if slugs.contains_key(&slug) {
            return Err(StorageError::AlreadyExists {
                id,
                reason: AlreadyExistsReason::Slug,
            });
        }
        document.header.slug = slug.clone();
        self.write_document(&document)?;
        slugs.insert(slug, id.clone());
        self.write_slugs(&slugs)?;
        if document.is_drive() {
            self.write_manifest(&id, &BTreeSet::new())?;
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Document, StorageError> {
        self.read_document(id)
    }

    async fn get_by_slug(&self, slug: &str) -> Result<Document, StorageError> {
        let slugs = self.read_slugs()?;
        let id = slugs
            .get(slug)
            .ok_or_else(|| StorageError::NotFound(slug.to_string()))?;
        self.read_document(id)
            .map_err(|_| StorageError::NotFound(slug.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let (existed, mut orphans) = self.delete_one(id)?;
        while let Some(candidate) = orphans.pop() {
            if !self.has_parent(&candidate)? {
                let (_, more) = self.delete_one(&candidate)?;
                orphans.extend(more);
            }
        }
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
        let _guard = self.lock.lock().await;
        if let Some(child_children) = self.read_manifest(child_id)? {
            if child_children.contains(parent_id) {
                return Err(StorageError::InvalidAssociation {
                    parent: parent_id.to_string(),
                    child: child_id.to_string(),
                    reason: AssociationErrorReason::Cycle,
                });
            }
        }
        let mut children = self.read_manifest(parent_id)?.unwrap_or_default();
        if children.insert(child_id.to_string()) {
            self.write_manifest(parent_id, &children)?;
        }
        Ok(())
    }

    async fn remove_child(&self, parent_id: &str, child_id: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let Some(mut children) = self.read_manifest(parent_id)? else {
            return Ok(false);
        };
        if children.remove(child_id) {
            self.write_manifest(parent_id, &children)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .read_manifest(parent_id)?
            .map(|m| m.into_iter().collect())
            .unwrap_or_default())
    }

    async fn get_parents(&self, child_id: &str) -> Result<Vec<String>, StorageError> {
        let mut parents = Vec::new();
        for parent in self.list_refs("manifest-")? {
            if let Some(children) = self.read_manifest(&parent)? {
                if children.contains(child_id) {
                    parents.push(parent);
                }
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
        let _guard = self.lock.lock().await;
        let mut document = self.read_document(id)?;
        for scope in Scope::all() {
            let scoped: Vec<Operation> = operations
                .iter()
                .filter(|op| op.scope == scope)
                .cloned()
                .collect();
            if !scoped.is_empty() {
                check_append(id, &document.operations, scope, &scoped)?;
            }
        }
        apply_batch(&mut document, operations, header);
        self.write_document(&document)
    }

    async fn add_operations_with_transaction(
        &self,
        id: &str,
        callback: TxCallback,
    ) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document(id)?;
        let OperationBatch { operations, header } = callback(&document)?;
        for scope in Scope::all() {
            let scoped: Vec<Operation> = operations
                .iter()
                .filter(|op| op.scope == scope)
                .cloned()
                .collect();
            if !scoped.is_empty() {
                check_append(id, &document.operations, scope, &scoped)?;
            }
        }
        apply_batch(&mut document, &operations, &header);
        self.write_document(&document)
    }

    async fn find_by_type(
        &self,
        document_type: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<String>, StorageError> {
        let mut keyed: Vec<(u64, String)> = self
            .load_all_documents()?
            .into_iter()
            .filter(|doc| doc.header.document_type == document_type)
            .map(|doc| (doc.header.created_at_ms, doc.header.id))
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
        let mut documents = self.load_all_documents()?;
        documents.sort_by(|a, b| {
            created_order(
                &(a.header.created_at_ms, a.header.id.clone()),
                &(b.header.created_at_ms, b.header.id.clone()),
            )
        });
        let units = filter_storage_units(
            &documents,
            |parent| {
                self.read_manifest(parent)
                    .ok()
                    .flatten()
                    .map(|m| m.into_iter().collect())
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
        Ok(units
            .iter()
            .filter_map(|unit| {
                self.read_document(&unit.document_id)
                    .ok()
                    .and_then(|doc| unit_revision(&doc, unit))
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
        let index = self.read_slugs()?;
        slugs
            .iter()
            .map(|slug| {
                index
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
        ids.iter()
            .map(|id| self.read_document(id).map(|doc| doc.header.slug))
            .collect()
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        for dir in ["objects", "refs"] {
            let path = self.base.join(dir);
            std::fs::remove_dir_all(&path).map_err(StorageError::backend)?;
            std::fs::create_dir_all(&path).map_err(StorageError::backend)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing;

    #[tokio::test]
    async fn conformance() {
        let dir = tempfile::tempdir().unwrap();
        let mut n = 0;
        testing::run_conformance(move || {
            n += 1;
            ContentStorage::new(dir.path().join(format!("store-{n}"))).unwrap()
        })
        .await;
    }

    #[tokio::test]
    async fn identical_content_shares_one_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStorage::new(dir.path()).unwrap();
        let bytes = Bytes::from_static(b"same bytes");
        let h1 = store.put_blob(&bytes).unwrap();
        let h2 = store.put_blob(&bytes).unwrap();
        assert_eq!(h1, h2);
        let objects = std::fs::read_dir(dir.path().join("objects")).unwrap().count();
        assert_eq!(objects, 1);
    }

    #[tokio::test]
    async fn rewrite_swings_the_ref() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStorage::new(dir.path()).unwrap();
        store
            .create(testing::test_document("doc-1", "test/doc"))
            .await
            .unwrap();
        let before = store.read_ref("doc-doc-1").unwrap().unwrap();

        let doc = store.get("doc-1").await.unwrap();
        let op = testing::test_operation(0, crate::document::Scope::Global, "SET");
        let mut header = doc.header.clone();
        header.revision.insert(crate::document::Scope::Global, 1);
        store.add_operations("doc-1", &[op], &header).await.unwrap();

        let after = store.read_ref("doc-doc-1").unwrap().unwrap();
        assert_ne!(before, after, "new content, new root blob");
    }
}
