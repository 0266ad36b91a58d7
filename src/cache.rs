//! Write-through cache in front of storage.
//!
//! One physical key-value store is shared by any number of typed
//! namespaces; every key is prefixed with its namespace up front, so the
//! logical caches cannot collide. The cache is strictly an optimization:
//! storage stays the source of truth, a miss falls through, and writes
//! invalidate rather than update.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::document::{Document, DocumentHeader, Operation, SyncUnitId};
use crate::error::StorageError;
use crate::store::{
    DocumentStorage, Page, StorageUnit, StorageUnitFilter, SyncUnitRevision, TxCallback,
};

#[derive(Debug, Default)]
struct Shared {
    entries: HashMap<String, Value>,
    /// Insertion order; the oldest entry is evicted when over capacity.
    order: VecDeque<String>,
}

/// The shared physical cache.
#[derive(Debug, Clone)]
pub struct Cache {
    shared: Arc<Mutex<Shared>>,
    capacity: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Cache::new(1024)
    }
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        Cache {
            shared: Arc::new(Mutex::new(Shared::default())),
            capacity: capacity.max(1),
        }
    }

    /// An isolated typed view over this cache.
    pub fn namespace<T: Serialize + DeserializeOwned>(&self, name: &str) -> Namespace<T> {
        Namespace {
            cache: self.clone(),
            prefix: format!("{name}/"),
            _marker: PhantomData,
        }
    }

    fn set(&self, key: String, value: Value) {
        let mut shared = self.shared.lock();
        if shared.entries.insert(key.clone(), value).is_none() {
            shared.order.push_back(key);
        }
        while shared.entries.len() > self.capacity {
            let Some(oldest) = shared.order.pop_front() else {
                break;
            };
            shared.entries.remove(&oldest);
        }
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.shared.lock().entries.get(key).cloned()
    }

    fn remove(&self, key: &str) -> bool {
        let mut shared = self.shared.lock();
        let removed = shared.entries.remove(key).is_some();
        if removed {
            shared.order.retain(|k| k != key);
        }
        removed
    }

    fn retain_in(&self, prefix: &str, mut keep: impl FnMut(&str, &Value) -> bool) {
        let mut shared = self.shared.lock();
        let doomed: Vec<String> = shared
            .entries
            .iter()
            .filter(|(key, value)| key.starts_with(prefix) && !keep(key, value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            shared.entries.remove(key);
        }
        shared.order.retain(|k| !doomed.contains(k));
    }
}

/// Typed key-value view; keys are disambiguated by the namespace prefix.
#[derive(Debug, Clone)]
pub struct Namespace<T> {
    cache: Cache,
    prefix: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Namespace<T> {
    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn set(&self, key: &str, value: &T) {
        if let Ok(json) = serde_json::to_value(value) {
            self.cache.set(self.key(key), json);
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let value = self.cache.get(&self.key(key))?;
        serde_json::from_value(value).ok()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.cache.remove(&self.key(key))
    }

    /// Drops every entry of this namespace the predicate rejects.
    pub fn retain(&self, mut keep: impl FnMut(&str, &T) -> bool) {
        let prefix = self.prefix.clone();
        self.cache.retain_in(&self.prefix, |key, value| {
            let bare = &key[prefix.len()..];
            match serde_json::from_value::<T>(value.clone()) {
                Ok(typed) => keep(bare, &typed),
                Err(_) => false,
            }
        });
    }
}

/// Document cache: state-trimmed copies keyed by id.
#[derive(Debug, Clone)]
pub struct DocumentCache {
    documents: Namespace<Document>,
}

impl DocumentCache {
    pub fn new(cache: &Cache) -> Self {
        DocumentCache {
            documents: cache.namespace("documents"),
        }
    }

    /// Stores a trimmed copy: per-operation state snapshots are dropped so
    /// a long log cannot pin its whole history in memory.
    pub fn set_document(&self, document: &Document) {
        self.documents
            .set(&document.header.id, &document.trimmed());
    }

    pub fn get_document(&self, id: &str) -> Option<Document> {
        self.documents.get(id)
    }

    pub fn delete_document(&self, id: &str) -> bool {
        self.documents.delete(id)
    }
}

/// Drive cache: documents plus a slug-to-id secondary index.
///
/// Cross-index invariant: deleting a drive by id also drops any slug entry
/// resolving to it.
#[derive(Debug, Clone)]
pub struct DriveCache {
    drives: Namespace<Document>,
    slugs: Namespace<String>,
}

impl DriveCache {
    pub fn new(cache: &Cache) -> Self {
        DriveCache {
            drives: cache.namespace("drives"),
            slugs: cache.namespace("drive-slugs"),
        }
    }

    pub fn set_drive(&self, drive: &Document) {
        self.drives.set(&drive.header.id, &drive.trimmed());
        if !drive.header.slug.is_empty() {
            self.slugs.set(&drive.header.slug, &drive.header.id);
        }
    }

    pub fn set_drive_by_slug(&self, slug: &str, drive: &Document) {
        self.drives.set(&drive.header.id, &drive.trimmed());
        self.slugs.set(slug, &drive.header.id);
    }

    pub fn get_drive(&self, id: &str) -> Option<Document> {
        self.drives.get(id)
    }

    pub fn get_drive_by_slug(&self, slug: &str) -> Option<Document> {
        let id = self.slugs.get(slug)?;
        self.drives.get(&id)
    }

    pub fn delete_drive(&self, id: &str) -> bool {
        let removed = self.drives.delete(id);
        self.slugs.retain(|_, mapped| mapped != id);
        removed
    }
}

/// Storage wrapper that keeps the caches coherent: reads prefer the cache,
/// writes invalidate, and a miss transparently falls back to the inner
/// backend.
#[derive(Clone)]
pub struct CachedStorage {
    inner: Arc<dyn DocumentStorage>,
    documents: DocumentCache,
    drives: DriveCache,
}

impl std::fmt::Debug for CachedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStorage").finish_non_exhaustive()
    }
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn DocumentStorage>, cache: &Cache) -> Self {
        CachedStorage {
            inner,
            documents: DocumentCache::new(cache),
            drives: DriveCache::new(cache),
        }
    }

    fn invalidate(&self, id: &str) {
        self.documents.delete_document(id);
        self.drives.delete_drive(id);
    }

    fn store(&self, document: &Document) {
        self.documents.set_document(document);
        if document.is_drive() {
            self.drives.set_drive(document);
        }
    }
}

#[async_trait]
impl DocumentStorage for CachedStorage {
    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        if self.documents.get_document(id).is_some() {
            return Ok(true);
        }
        self.inner.exists(id).await
    }

    async fn create(&self, document: Document) -> Result<(), StorageError> {
        self.inner.create(document.clone()).await?;
        self.store(&document);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Document, StorageError> {
        if let Some(document) = self.documents.get_document(id) {
            trace!(id, "document cache hit");
            return Ok(document);
        }
        let document = self.inner.get(id).await?;
        self.store(&document);
        Ok(document)
    }

    async fn get_by_slug(&self, slug: &str) -> Result<Document, StorageError> {
        if let Some(drive) = self.drives.get_drive_by_slug(slug) {
            trace!(slug, "drive slug cache hit");
            return Ok(drive);
        }
        let document = self.inner.get_by_slug(slug).await?;
        self.store(&document);
        Ok(document)
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        // children may cascade inside the backend; their cached copies must
        // not outlive them
        let children = self.inner.get_children(id).await.unwrap_or_default();
        let deleted = self.inner.delete(id).await?;
        self.invalidate(id);
        for child in children {
            if !self.inner.exists(&child).await.unwrap_or(false) {
                self.invalidate(&child);
            }
        }
        Ok(deleted)
    }

    async fn add_child(&self, parent_id: &str, child_id: &str) -> Result<(), StorageError> {
        self.inner.add_child(parent_id, child_id).await
    }

    async fn remove_child(&self, parent_id: &str, child_id: &str) -> Result<bool, StorageError> {
        self.inner.remove_child(parent_id, child_id).await
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<String>, StorageError> {
        self.inner.get_children(parent_id).await
    }

    async fn get_parents(&self, child_id: &str) -> Result<Vec<String>, StorageError> {
        self.inner.get_parents(child_id).await
    }

    async fn add_operations(
        &self,
        id: &str,
        operations: &[Operation],
        header: &DocumentHeader,
    ) -> Result<(), StorageError> {
        let result = self.inner.add_operations(id, operations, header).await;
        self.invalidate(id);
        result
    }

    async fn add_operations_with_transaction(
        &self,
        id: &str,
        callback: TxCallback,
    ) -> Result<(), StorageError> {
        let result = self.inner.add_operations_with_transaction(id, callback).await;
        self.invalidate(id);
        result
    }

    async fn find_by_type(
        &self,
        document_type: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<String>, StorageError> {
        self.inner.find_by_type(document_type, limit, cursor).await
    }

    async fn find_storage_units_by(
        &self,
        filter: &StorageUnitFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page<StorageUnit>, StorageError> {
        self.inner.find_storage_units_by(filter, limit, cursor).await
    }

    async fn get_synchronization_units_revision(
        &self,
        units: &[SyncUnitId],
    ) -> Result<Vec<SyncUnitRevision>, StorageError> {
        self.inner.get_synchronization_units_revision(units).await
    }

    async fn resolve_ids(
        &self,
        slugs: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StorageError> {
        self.inner.resolve_ids(slugs, cancel).await
    }

    async fn resolve_slugs(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StorageError> {
        self.inner.resolve_slugs(ids, cancel).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await?;
        self.documents.documents.retain(|_, _| false);
        self.drives.drives.retain(|_, _| false);
        self.drives.slugs.retain(|_, _| false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentState, DRIVE_DOCUMENT_TYPE};
    use crate::store::MemoryStorage;

    fn drive(id: &str, slug: &str) -> Document {
        let mut doc = Document::new(id, slug, DRIVE_DOCUMENT_TYPE, DocumentState::default());
        doc.header.slug = slug.to_string();
        doc
    }

    #[test]
    fn namespaces_do_not_collide() {
        let cache = Cache::new(16);
        let a = cache.namespace::<String>("a");
        let b = cache.namespace::<String>("b");
        a.set("k", &"from-a".to_string());
        b.set("k", &"from-b".to_string());
        assert_eq!(a.get("k").as_deref(), Some("from-a"));
        assert_eq!(b.get("k").as_deref(), Some("from-b"));
        a.delete("k");
        assert!(a.get("k").is_none());
        assert_eq!(b.get("k").as_deref(), Some("from-b"));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = Cache::new(2);
        let ns = cache.namespace::<u32>("n");
        ns.set("one", &1);
        ns.set("two", &2);
        ns.set("three", &3);
        assert!(ns.get("one").is_none());
        assert_eq!(ns.get("two"), Some(2));
        assert_eq!(ns.get("three"), Some(3));
    }

    #[test]
    fn drive_delete_invalidates_slug_index() {
        let cache = Cache::new(16);
        let drives = DriveCache::new(&cache);
        let d = drive("drive-1", "my-drive");
        drives.set_drive_by_slug("my-drive", &d);
        assert!(drives.get_drive_by_slug("my-drive").is_some());

        drives.delete_drive("drive-1");
        assert!(drives.get_drive_by_slug("my-drive").is_none());
        assert!(drives.get_drive("drive-1").is_none());
    }

    #[test]
    fn document_cache_trims_snapshots() {
        let cache = Cache::new(16);
        let docs = DocumentCache::new(&cache);
        let mut doc = Document::new("d", "d", "test/doc", DocumentState::default());
        let mut op = Operation::test_stub(0, crate::document::Scope::Global, "SET");
        op.resulting_state = Some(serde_json::json!({"huge": true}));
        doc.operations.global.push(op);
        docs.set_document(&doc);
        let cached = docs.get_document("d").unwrap();
        assert!(cached.operations.global[0].resulting_state.is_none());
    }

    #[tokio::test]
    async fn miss_falls_back_to_storage() {
        let inner = Arc::new(MemoryStorage::new());
        let cache = Cache::new(16);
        let cached = CachedStorage::new(inner.clone(), &cache);

        // written directly to the backend, bypassing the cache
        inner
            .create(Document::new("d1", "", "test/doc", DocumentState::default()))
            .await
            .unwrap();
        let doc = cached.get("d1").await.unwrap();
        assert_eq!(doc.header.id, "d1");
        // now cached
        assert!(cached.documents.get_document("d1").is_some());
    }

    #[tokio::test]
    async fn write_invalidates() {
        let inner = Arc::new(MemoryStorage::new());
        let cache = Cache::new(16);
        let cached = CachedStorage::new(inner, &cache);

        cached.create(drive("drive-1", "my-drive")).await.unwrap();
        assert!(cached.drives.get_drive_by_slug("my-drive").is_some());

        cached.delete("drive-1").await.unwrap();
        assert!(cached.drives.get_drive("drive-1").is_none());
        assert!(cached.drives.get_drive_by_slug("my-drive").is_none());
        assert!(matches!(
            cached.get("drive-1").await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }
}
