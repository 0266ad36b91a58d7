//! Filesystem storage: one JSON file per document and per drive manifest.
//!
//! Layout under the base directory: `document-<id>.json` (full document
//! snapshot including the operation log), `manifest-<driveId>.json`
//! (`{"documentIds": [...]}`) and `slugs.json` (slug to id index). Writes
//! go to a temp file first and are renamed into place so a crash never
//! leaves a half-written file.
//!
//! There is no cross-process lock; this backend is single-writer. Within
//! the process a single mutex serializes mutations.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::document::{check_append, Document, DocumentHeader, Operation, Scope, SyncUnitId};
use crate::error::{AlreadyExistsReason, AssociationErrorReason, StorageError};
use crate::store::{
    apply_batch, created_order, effective_slug, filter_storage_units, paginate_by_id,
    unit_revision, DocumentStorage, OperationBatch, Page, StorageUnit, StorageUnitFilter,
    SyncUnitRevision, TxCallback,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(rename = "documentIds")]
    document_ids: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct FsStorage {
    base: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl FsStorage {
    pub fn new(base: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base = base.as_ref().to_path_buf();
        std::fs::create_dir_all(&base)
            .map_err(|e| StorageError::backend(anyhow::Error::new(e).context("create base dir")))?;
        Ok(FsStorage {
            base,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    fn document_path(&self, id: &str) -> PathBuf {
        self.base.join(format!("document-{id}.json"))
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.base.join(format!("manifest-{id}.json"))
    }

    fn slugs_path(&self) -> PathBuf {
        self.base.join("slugs.json")
    }

    fn read_document(&self, id: &str) -> Result<Document, StorageError> {
        let path = self.document_path(id);
        if !path.exists() {
            return Err(StorageError::NotFound(id.to_string()));
        }
        let bytes = std::fs::read(&path).map_err(StorageError::backend)?;
        serde_json::from_slice(&bytes).map_err(StorageError::backend)
    }

    fn write_document(&self, document: &Document) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(document).map_err(StorageError::backend)?;
        atomic_write(&self.document_path(&document.header.id), &bytes)
    }

    fn read_manifest(&self, id: &str) -> Result<Option<BTreeSet<String>>, StorageError> {
        let path = self.manifest_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(StorageError::backend)?;
        let manifest: Manifest = serde_json::from_slice(&bytes).map_err(StorageError::backend)?;
        Ok(Some(manifest.document_ids))
    }

    fn write_manifest(&self, id: &str, document_ids: &BTreeSet<String>) -> Result<(), StorageError> {
        let manifest = Manifest {
            document_ids: document_ids.clone(),
        };
        let bytes = serde_json::to_vec(&manifest).map_err(StorageError::backend)?;
        atomic_write(&self.manifest_path(id), &bytes)
    }

    fn read_slugs(&self) -> Result<HashMap<String, String>, StorageError> {
        let path = self.slugs_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = std::fs::read(&path).map_err(StorageError::backend)?;
        serde_json::from_slice(&bytes).map_err(StorageError::backend)
    }

    fn write_slugs(&self, slugs: &HashMap<String, String>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(slugs).map_err(StorageError::backend)?;
        atomic_write(&self.slugs_path(), &bytes)
    }

    fn list_ids(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.base).map_err(StorageError::backend)?;
        for entry in entries {
            let entry = entry.map_err(StorageError::backend)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(prefix) {
                if let Some(id) = rest.strip_suffix(".json") {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    fn load_all_documents(&self) -> Result<Vec<Document>, StorageError> {
        self.list_ids("document-")?
            .iter()
            .map(|id| self.read_document(id))
            .collect()
    }

    fn delete_one(&self, id: &str) -> Result<(bool, Vec<String>), StorageError> {
        let path = self.document_path(id);
        let existed = path.exists();
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
            std::fs::remove_file(&path).map_err(StorageError::backend)?;
        }

        for parent in self.list_ids("manifest-")? {
            if parent == id {
                continue;
            }
            if let Some(mut children) = self.read_manifest(&parent)? {
                if children.remove(id) {
                    self.write_manifest(&parent, &children)?;
                }
            }
        }

        let mut orphan_candidates = Vec::new();
        if let Some(children) = self.read_manifest(id)? {
            orphan_candidates.extend(children);
            std::fs::remove_file(self.manifest_path(id)).map_err(StorageError::backend)?;
        }
        Ok((existed, orphan_candidates))
    }

    fn has_parent(&self, id: &str) -> Result<bool, StorageError> {
        for parent in self.list_ids("manifest-")? {
            if let Some(children) = self.read_manifest(&parent)? {
                if children.contains(id) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(StorageError::backend)?;
    std::fs::rename(&tmp, path).map_err(StorageError::backend)?;
    Ok(())
}

#[async_trait]
impl DocumentStorage for FsStorage {
    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.document_path(id).exists())
    }

    async fn create(&self, mut document: Document) -> Result<(), StorageError> {
        let slug = effective_slug(&document)?;
        let id = document.header.id.clone();
        let _guard = self.lock.lock().await;
        if self.document_path(&id).exists() {
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
        let (existed, mut orphan_candidates) = self.delete_one(id)?;
        while let Some(candidate) = orphan_candidates.pop() {
            if !self.has_parent(&candidate)? {
                let (_, more) = self.delete_one(&candidate)?;
                orphan_candidates.extend(more);
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
        for parent in self.list_ids("manifest-")? {
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
        let entries = std::fs::read_dir(&self.base).map_err(StorageError::backend)?;
        for entry in entries {
            let entry = entry.map_err(StorageError::backend)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("document-")
                || name.starts_with("manifest-")
                || name == "slugs.json"
            {
                std::fs::remove_file(entry.path()).map_err(StorageError::backend)?;
            }
        }
        Ok(())
    }
}
