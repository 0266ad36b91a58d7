//! Conformance battery shared by every storage backend.
//!
//! The backends differ in durability and latency, never in observable
//! behavior; each backend's test module calls [`run_conformance`] with a
//! factory producing fresh stores.

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::document::{
    hash_state, Document, DocumentState, Operation, Scope, SyncUnitId, DRIVE_DOCUMENT_TYPE,
    MAIN_BRANCH,
};
use crate::error::{AlreadyExistsReason, StorageError};
use crate::store::{DocumentStorage, OperationBatch, StorageUnitFilter};

pub(crate) fn test_document(id: &str, document_type: &str) -> Document {
    let mut doc = Document::new(id, "", document_type, DocumentState::default());
    // deterministic creation order for pagination tests
    doc.header.created_at_ms = id.bytes().map(u64::from).sum();
    doc
}

pub(crate) fn test_drive(id: &str) -> Document {
    test_document(id, DRIVE_DOCUMENT_TYPE)
}

pub(crate) fn test_operation(index: u64, scope: Scope, op_type: &str) -> Operation {
    let state = json!({ "last": op_type, "index": index });
    Operation {
        index,
        skip: 0,
        scope,
        branch: MAIN_BRANCH.to_string(),
        op_type: op_type.to_string(),
        input: json!({}),
        hash: hash_state(&state),
        timestamp_utc_ms: 1_000 + index,
        attachments: Vec::new(),
        resulting_state: Some(state),
        context: None,
    }
}

async fn append(store: &impl DocumentStorage, id: &str, ops: &[Operation]) -> Result<(), StorageError> {
    let mut document = store.get(id).await?;
    for op in ops {
        document.operations.get_mut(op.scope).push(op.clone());
    }
    document.refresh_header();
    let header = document.header.clone();
    store.add_operations(id, ops, &header).await
}

pub(crate) async fn run_conformance<S, F>(mut make: F)
where
    S: DocumentStorage,
    F: FnMut() -> S,
{
    create_get_and_slugs(&make()).await;
    create_validation(&make()).await;
    delete_and_cascade(&make()).await;
    child_associations(&make()).await;
    operation_conflicts(&make()).await;
    batch_is_atomic(&make()).await;
    pagination(&make()).await;
    storage_unit_queries(&make()).await;
    sync_unit_revisions(&make()).await;
    resolution_and_cancellation(&make()).await;
    clear_drops_everything(&make()).await;
}

async fn create_get_and_slugs(store: &impl DocumentStorage) {
    assert!(!store.exists("doc-1").await.unwrap());
    store.create(test_document("doc-1", "test/doc")).await.unwrap();
    assert!(store.exists("doc-1").await.unwrap());

    let doc = store.get("doc-1").await.unwrap();
    assert_eq!(doc.header.id, "doc-1");
    // slug defaults to the id
    assert_eq!(doc.header.slug, "doc-1");
    assert_eq!(store.get_by_slug("doc-1").await.unwrap().header.id, "doc-1");

    let mut named = test_document("doc-2", "test/doc");
    named.header.slug = "my-slug".to_string();
    store.create(named).await.unwrap();
    assert_eq!(store.get_by_slug("my-slug").await.unwrap().header.id, "doc-2");

    assert!(matches!(
        store.get("missing").await.unwrap_err(),
        StorageError::NotFound(_)
    ));
    assert!(matches!(
        store.get_by_slug("missing").await.unwrap_err(),
        StorageError::NotFound(_)
    ));
}

async fn create_validation(store: &impl DocumentStorage) {
    store.create(test_document("doc-1", "test/doc")).await.unwrap();

    match store.create(test_document("doc-1", "test/doc")).await.unwrap_err() {
        StorageError::AlreadyExists { reason, .. } => {
            assert_eq!(reason, AlreadyExistsReason::Id)
        }
        other => panic!("expected AlreadyExists, got {other:?}"),
    }

    let mut stolen_slug = test_document("doc-2", "test/doc");
    stolen_slug.header.slug = "doc-1".to_string();
    match store.create(stolen_slug).await.unwrap_err() {
        StorageError::AlreadyExists { reason, .. } => {
            assert_eq!(reason, AlreadyExistsReason::Slug)
        }
        other => panic!("expected AlreadyExists, got {other:?}"),
    }

    assert!(matches!(
        store.create(test_document("bad id", "test/doc")).await.unwrap_err(),
        StorageError::InvalidDocumentId(_)
    ));

    let mut bad_slug = test_document("doc-3", "test/doc");
    bad_slug.header.slug = "no.dots.allowed".to_string();
    assert!(matches!(
        store.create(bad_slug).await.unwrap_err(),
        StorageError::InvalidSlug(_)
    ));
}

async fn delete_and_cascade(store: &impl DocumentStorage) {
    assert!(!store.delete("never-existed").await.unwrap());

    // drive-a and drive-b share "shared"; "solo" belongs to drive-a only
    store.create(test_drive("drive-a")).await.unwrap();
    store.create(test_drive("drive-b")).await.unwrap();
    store.create(test_document("shared", "test/doc")).await.unwrap();
    store.create(test_document("solo", "test/doc")).await.unwrap();
    store.add_child("drive-a", "shared").await.unwrap();
    store.add_child("drive-b", "shared").await.unwrap();
    store.add_child("drive-a", "solo").await.unwrap();

    assert!(store.delete("drive-a").await.unwrap());

    // the single-parent child cascades, the shared one survives
    assert!(!store.exists("solo").await.unwrap());
    assert!(store.exists("shared").await.unwrap());
    assert_eq!(store.get_parents("shared").await.unwrap(), vec!["drive-b"]);
    // the deleted drive's slug is free again
    assert!(matches!(
        store.get_by_slug("drive-a").await.unwrap_err(),
        StorageError::NotFound(_)
    ));

    // deleting a plain member only updates the manifest
    assert!(store.delete("shared").await.unwrap());
    assert!(store.get_children("drive-b").await.unwrap().is_empty());
}

async fn child_associations(store: &impl DocumentStorage) {
    store.create(test_drive("drive-a")).await.unwrap();
    store.create(test_drive("drive-b")).await.unwrap();

    assert!(matches!(
        store.add_child("drive-a", "drive-a").await.unwrap_err(),
        StorageError::InvalidAssociation { .. }
    ));

    store.add_child("drive-a", "drive-b").await.unwrap();
    // one level of ancestry is checked: b already contains a -> reject
    assert!(matches!(
        store.add_child("drive-b", "drive-a").await.unwrap_err(),
        StorageError::InvalidAssociation { .. }
    ));

    // idempotent
    store.add_child("drive-a", "drive-b").await.unwrap();
    assert_eq!(store.get_children("drive-a").await.unwrap(), vec!["drive-b"]);
    assert_eq!(store.get_parents("drive-b").await.unwrap(), vec!["drive-a"]);

    assert!(store.remove_child("drive-a", "drive-b").await.unwrap());
    assert!(!store.remove_child("drive-a", "drive-b").await.unwrap());
}

async fn operation_conflicts(store: &impl DocumentStorage) {
    store.create(test_document("doc-1", "test/doc")).await.unwrap();
    append(store, "doc-1", &[test_operation(0, Scope::Global, "ADD_FILE")])
        .await
        .unwrap();

    let doc = store.get("doc-1").await.unwrap();
    assert_eq!(doc.header.revision(Scope::Global), 1);
    assert_eq!(doc.operations.global.len(), 1);

    // same index again: conflict carrying the true stored operation
    let header = doc.header.clone();
    let err = store
        .add_operations(
            "doc-1",
            &[test_operation(0, Scope::Global, "REMOVE_FILE")],
            &header,
        )
        .await
        .unwrap_err();
    match err {
        StorageError::Conflict(conflict) => {
            assert_eq!(conflict.existing_operation.op_type, "ADD_FILE");
            assert_eq!(conflict.new_operation.op_type, "REMOVE_FILE");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    // log length unchanged
    assert_eq!(store.get("doc-1").await.unwrap().operations.global.len(), 1);

    // scopes are independent streams
    append(store, "doc-1", &[test_operation(0, Scope::Local, "ADD_LISTENER")])
        .await
        .unwrap();
    let doc = store.get("doc-1").await.unwrap();
    assert_eq!(doc.header.revision(Scope::Local), 1);
}

async fn batch_is_atomic(store: &impl DocumentStorage) {
    store.create(test_document("doc-1", "test/doc")).await.unwrap();
    append(store, "doc-1", &[test_operation(0, Scope::Global, "A")])
        .await
        .unwrap();

    // second element of the batch collides; the first must not stick
    let doc = store.get("doc-1").await.unwrap();
    let mut header = doc.header.clone();
    header.revision.insert(Scope::Global, 3);
    let batch = vec![
        test_operation(1, Scope::Global, "B"),
        test_operation(0, Scope::Global, "RACER"),
    ];
    let err = store.add_operations("doc-1", &batch, &header).await.unwrap_err();
    assert!(err.is_conflict(), "got {err:?}");

    let doc = store.get("doc-1").await.unwrap();
    assert_eq!(doc.operations.global.len(), 1);
    assert_eq!(doc.header.revision(Scope::Global), 1);
}

async fn pagination(store: &impl DocumentStorage) {
    for i in 0..10 {
        store
            .create(test_document(&format!("doc-{i:02}"), "test/doc"))
            .await
            .unwrap();
    }
    store.create(test_document("other", "test/other")).await.unwrap();

    let all = store.find_by_type("test/doc", 100, None).await.unwrap();
    assert_eq!(all.items.len(), 10);
    assert!(all.next_cursor.is_none());

    let mut collected = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = store
            .find_by_type("test/doc", 2, cursor.as_deref())
            .await
            .unwrap();
        assert!(page.items.len() <= 2);
        collected.extend(page.items);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(collected, all.items);
}

async fn storage_unit_queries(store: &impl DocumentStorage) {
    store.create(test_drive("drive-a")).await.unwrap();
    store.create(test_document("member", "test/doc")).await.unwrap();
    store.create(test_document("stray", "test/doc")).await.unwrap();
    store.add_child("drive-a", "member").await.unwrap();

    // parent filter covers the drive itself and its children
    let page = store
        .find_storage_units_by(&StorageUnitFilter::for_parents(&["drive-a"]), 100, None)
        .await
        .unwrap();
    let ids: std::collections::BTreeSet<&str> =
        page.items.iter().map(|u| u.document_id.as_str()).collect();
    assert_eq!(ids, ["drive-a", "member"].into_iter().collect());
    // two scopes per document
    assert_eq!(page.items.len(), 4);

    let filter = StorageUnitFilter {
        document_type: Some(["test/doc".to_string()].into_iter().collect()),
        scope: Some(["global".to_string()].into_iter().collect()),
        ..Default::default()
    };
    let page = store.find_storage_units_by(&filter, 100, None).await.unwrap();
    assert_eq!(page.items.len(), 2);
    assert!(page
        .items
        .iter()
        .all(|u| u.scope == Scope::Global && u.document_type == "test/doc"));
}

async fn sync_unit_revisions(store: &impl DocumentStorage) {
    store.create(test_document("doc-1", "test/doc")).await.unwrap();
    append(store, "doc-1", &[test_operation(0, Scope::Global, "A")])
        .await
        .unwrap();

    let units = vec![
        SyncUnitId::main("doc-1", Scope::Global),
        SyncUnitId::main("doc-1", Scope::Local),
        SyncUnitId::main("ghost", Scope::Global),
    ];
    let revisions = store.get_synchronization_units_revision(&units).await.unwrap();
    // the unresolvable unit is dropped, not an error
    assert_eq!(revisions.len(), 2);
    let global = revisions
        .iter()
        .find(|r| r.scope == Scope::Global)
        .expect("global unit resolved");
    assert_eq!(global.revision, 1);
    assert_eq!(global.last_updated_ms, 1_000);
    let local = revisions.iter().find(|r| r.scope == Scope::Local).unwrap();
    assert_eq!(local.revision, 0);
}

async fn resolution_and_cancellation(store: &impl DocumentStorage) {
    let mut doc = test_document("doc-1", "test/doc");
    doc.header.slug = "the-slug".to_string();
    store.create(doc).await.unwrap();

    let live = CancellationToken::new();
    let ids = store
        .resolve_ids(&["the-slug".to_string()], &live)
        .await
        .unwrap();
    assert_eq!(ids, vec!["doc-1"]);
    let slugs = store
        .resolve_slugs(&["doc-1".to_string()], &live)
        .await
        .unwrap();
    assert_eq!(slugs, vec!["the-slug"]);

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert!(matches!(
        store
            .resolve_ids(&["the-slug".to_string()], &cancelled)
            .await
            .unwrap_err(),
        StorageError::Aborted
    ));
    assert!(matches!(
        store
            .resolve_slugs(&["doc-1".to_string()], &cancelled)
            .await
            .unwrap_err(),
        StorageError::Aborted
    ));
}

async fn clear_drops_everything(store: &impl DocumentStorage) {
    store.create(test_drive("drive-a")).await.unwrap();
    store.create(test_document("doc-1", "test/doc")).await.unwrap();
    store.add_child("drive-a", "doc-1").await.unwrap();

    store.clear().await.unwrap();
    assert!(!store.exists("drive-a").await.unwrap());
    assert!(!store.exists("doc-1").await.unwrap());
    assert!(store.get_children("drive-a").await.unwrap().is_empty());
    // a cleared store accepts the same ids again
    store.create(test_drive("drive-a")).await.unwrap();
}

/// Two transactional writers computing "next index" from what they read
/// must end up serialized: indices 0 and 1, never 0 and 0.
pub(crate) async fn transaction_serializes_writers<S>(store: S)
where
    S: DocumentStorage + Clone + Send + Sync + 'static,
{
    store.create(test_document("doc-1", "test/doc")).await.unwrap();

    let mut handles = Vec::new();
    for writer in 0..2u64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .add_operations_with_transaction(
                    "doc-1",
                    Box::new(move |doc| {
                        let index = crate::document::operations_to_revision(&doc.operations.global);
                        let mut op = test_operation(index, Scope::Global, "APPEND");
                        op.input = json!({ "writer": writer });
                        let mut header = doc.header.clone();
                        header.revision.insert(Scope::Global, index + 1);
                        Ok(OperationBatch {
                            operations: vec![op],
                            header,
                        })
                    }),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let doc = store.get("doc-1").await.unwrap();
    let indices: Vec<u64> = doc.operations.global.iter().map(|op| op.index).collect();
    assert_eq!(indices, vec![0, 1]);
    assert_eq!(doc.header.revision(Scope::Global), 2);
}
