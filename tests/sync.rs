//! End-to-end synchronization between in-process reactors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use opdrive::document::{Document, DocumentState, Scope};
use opdrive::drive::{self, new_pull_trigger, new_push_listener, ListenerFilter};
use opdrive::reactor::{AddDriveInput, Reactor, RemoteDriveOptions};
use opdrive::sync::{detach_drive, SyncStatus};
use opdrive::{Event, JobStatus, ReactorRemote, StorageError};

const DRIVE_ID: &str = "drive-main";

fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn source_reactor_with_drive() -> Arc<Reactor> {
    setup_logging();
    let reactor = Reactor::builder().build();
    reactor
        .add_drive(AddDriveInput {
            id: Some(DRIVE_ID.into()),
            name: "shared drive".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    reactor
}

async fn commit_add_file(reactor: &Reactor, drive_id: &str, file_id: &str) {
    let jobs = reactor
        .mutate(
            drive_id,
            vec![drive::actions::add_file(file_id, file_id, "opdrive/drive")],
        )
        .await
        .unwrap();
    for job in &jobs {
        let result = reactor.wait_for_job(&job.id).await;
        assert_eq!(result.status, JobStatus::Success, "{:?}", result.error);
    }
}

/// Waits until the drive reports `target`, collecting the statuses seen on
/// the way.
async fn wait_for_status(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    drive_id: &str,
    target: SyncStatus,
) -> Vec<SyncStatus> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(Event::SyncStatusChanged {
                drive_id: id,
                status,
                ..
            }) = events.recv().await
            {
                if id == drive_id {
                    seen.push(status);
                    if status == target {
                        break;
                    }
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {target}, saw {seen:?}"));
    seen
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_sync_converges_and_reports_status() -> Result<()> {
    let source = source_reactor_with_drive().await;
    commit_add_file(&source, DRIVE_ID, "file-1").await;

    let mirror = Reactor::builder().build();
    mirror.register_remote(
        "remote://source",
        Arc::new(ReactorRemote::new(source.clone(), DRIVE_ID)),
    );

    let mut events = mirror.events().subscribe();
    mirror
        .add_remote_drive(
            "remote://source",
            RemoteDriveOptions {
                pull_interval_ms: 25,
                filter: ListenerFilter::any(),
            },
        )
        .await?;

    let seen = wait_for_status(&mut events, DRIVE_ID, SyncStatus::Success).await;
    assert_eq!(seen.first(), Some(&SyncStatus::Pending));
    assert!(
        seen.contains(&SyncStatus::InitialSync),
        "first cycle is the initial sync: {seen:?}"
    );

    // logs converged
    let source_drive = source.get_drive(DRIVE_ID).await?;
    let mirrored = mirror.get_drive(DRIVE_ID).await?;
    assert_eq!(mirrored.header.revision(Scope::Global), 1);
    assert_eq!(
        mirrored.operations.global[0].hash,
        source_drive.operations.global[0].hash
    );
    assert_eq!(mirrored.state.global, source_drive.state.global);

    // a later commit on the source arrives on the next poll
    commit_add_file(&source, DRIVE_ID, "file-2").await;
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let mirrored = mirror.get_drive(DRIVE_ID).await.unwrap();
            if mirrored.header.revision(Scope::Global) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("mirror caught up");

    // local scope never crosses the wire
    let mirrored = mirror.get_drive(DRIVE_ID).await?;
    assert_eq!(mirrored.header.revision(Scope::Local), 0);

    mirror.shutdown();
    source.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_index_reports_conflict_with_existing_operation() -> Result<()> {
    let reactor = source_reactor_with_drive().await;
    commit_add_file(&reactor, DRIVE_ID, "file-1").await;

    let drive = reactor.get_drive(DRIVE_ID).await?;
    assert_eq!(drive.header.revision(Scope::Global), 1);

    // another writer claims index 0 directly against storage
    let mut racer = drive.operations.global[0].clone();
    racer.op_type = drive::SET_DRIVE_NAME.to_string();
    racer.input = json!({"name": "other"});
    let err = reactor
        .storage()
        .add_operations(DRIVE_ID, &[racer], &drive.header)
        .await
        .unwrap_err();
    match err {
        StorageError::Conflict(conflict) => {
            assert_eq!(conflict.existing_operation.op_type, drive::ADD_FILE);
            assert_eq!(conflict.existing_operation.index, 0);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    // the log is untouched
    let drive = reactor.get_drive(DRIVE_ID).await?;
    assert_eq!(drive.header.revision(Scope::Global), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicting_pull_halts_the_drive_until_reset() -> Result<()> {
    let source = source_reactor_with_drive().await;
    let mirror = Reactor::builder().build();
    mirror.register_remote(
        "remote://source",
        Arc::new(ReactorRemote::new(source.clone(), DRIVE_ID)),
    );
    let mut events = mirror.events().subscribe();
    mirror
        .add_remote_drive(
            "remote://source",
            RemoteDriveOptions {
                pull_interval_ms: 25,
                filter: ListenerFilter::any(),
            },
        )
        .await?;

    // diverge: both sides commit their own operation at index 0
    commit_add_file(&mirror, DRIVE_ID, "mirror-file").await;
    commit_add_file(&source, DRIVE_ID, "source-file").await;

    let seen = wait_for_status(&mut events, DRIVE_ID, SyncStatus::Conflict).await;
    assert!(seen.contains(&SyncStatus::Conflict));

    // the conflicting strand was not applied; the mirror keeps its write
    let mirrored = mirror.get_drive(DRIVE_ID).await?;
    assert_eq!(mirrored.header.revision(Scope::Global), 1);
    let state = drive::drive_state(&mirrored).unwrap();
    assert_eq!(state.nodes[0].id, "mirror-file");

    // conflict is sticky until manually resolved
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        mirror.sync_manager().sync_status(DRIVE_ID),
        Some(SyncStatus::Conflict)
    );

    mirror.sync_manager().reset_sync_status(DRIVE_ID);
    assert_eq!(
        mirror.sync_manager().sync_status(DRIVE_ID),
        Some(SyncStatus::Pending)
    );

    mirror.shutdown();
    source.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn push_listener_forwards_local_commits() -> Result<()> {
    let publisher = source_reactor_with_drive().await;
    let subscriber = Reactor::builder().build();
    // the subscriber needs its own copy of the drive to receive into
    subscriber
        .add_drive(AddDriveInput {
            id: Some(DRIVE_ID.into()),
            name: "shared drive".into(),
            ..Default::default()
        })
        .await?;

    publisher.register_remote(
        "remote://subscriber",
        Arc::new(ReactorRemote::new(subscriber.clone(), DRIVE_ID)),
    );
    publisher
        .add_push_listener(DRIVE_ID, "remote://subscriber", ListenerFilter::any())
        .await?;

    let mut events = publisher.events().subscribe();
    commit_add_file(&publisher, DRIVE_ID, "pushed-file").await;
    wait_for_status(&mut events, DRIVE_ID, SyncStatus::Success).await;

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let received = subscriber.get_drive(DRIVE_ID).await.unwrap();
            if received.header.revision(Scope::Global) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("push delivered");

    let received = subscriber.get_drive(DRIVE_ID).await?;
    let state = drive::drive_state(&received).unwrap();
    assert_eq!(state.nodes[0].id, "pushed-file");

    publisher.shutdown();
    subscriber.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn pulled_file_nodes_materialize_child_documents() -> Result<()> {
    let source = source_reactor_with_drive().await;
    source
        .add_document(DRIVE_ID, "child-doc", "notes", "opdrive/drive")
        .await?;

    let mirror = Reactor::builder().build();
    mirror.register_remote(
        "remote://source",
        Arc::new(ReactorRemote::new(source.clone(), DRIVE_ID)),
    );
    let mut events = mirror.events().subscribe();
    mirror
        .add_remote_drive(
            "remote://source",
            RemoteDriveOptions {
                pull_interval_ms: 25,
                filter: ListenerFilter::any(),
            },
        )
        .await?;
    wait_for_status(&mut events, DRIVE_ID, SyncStatus::Success).await;

    // the drive's ADD_FILE arrived; the child document exists and is a
    // manifest member on the mirror side too
    let mirrored = mirror.get_drive(DRIVE_ID).await?;
    let state = drive::drive_state(&mirrored).unwrap();
    assert_eq!(state.nodes.len(), 1);
    assert_eq!(
        mirror.storage().get_children(DRIVE_ID).await?,
        vec!["child-doc"]
    );
    assert!(mirror.storage().exists("child-doc").await?);

    mirror.shutdown();
    source.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn detach_emits_the_removal_triple_at_the_log_head() -> Result<()> {
    setup_logging();
    let reactor = Reactor::builder().build();

    // a drive whose sync configuration came with its initial state, so the
    // local log starts empty
    let listener = new_push_listener("remote://peer", ListenerFilter::any());
    let trigger = new_pull_trigger("remote://peer", 500, "lst-1");
    let local_state = drive::DriveLocalState {
        listeners: vec![listener],
        triggers: vec![trigger],
        sharing_type: drive::SharingType::Public,
    };
    let initial_state = DocumentState {
        global: serde_json::to_value(drive::DriveState {
            name: "configured".into(),
            ..Default::default()
        })?,
        local: serde_json::to_value(&local_state)?,
    };
    let document = Document::new(
        "configured-drive",
        "",
        opdrive::document::DRIVE_DOCUMENT_TYPE,
        initial_state,
    );
    reactor.storage().create(document).await?;

    detach_drive(&reactor, "configured-drive").await?;

    let document = reactor.get_drive("configured-drive").await?;
    let types: Vec<&str> = document
        .operations
        .local
        .iter()
        .map(|op| op.op_type.as_str())
        .collect();
    assert_eq!(
        types,
        vec![
            drive::REMOVE_LISTENER,
            drive::REMOVE_TRIGGER,
            drive::SET_SHARING_TYPE,
        ]
    );
    let indices: Vec<u64> = document.operations.local.iter().map(|op| op.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    let local = drive::drive_local_state(&document).unwrap();
    assert!(local.listeners.is_empty());
    assert!(local.triggers.is_empty());
    assert_eq!(local.sharing_type, drive::SharingType::Local);

    reactor.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn redelivered_strands_are_no_ops() -> Result<()> {
    let source = source_reactor_with_drive().await;
    commit_add_file(&source, DRIVE_ID, "file-1").await;

    let mirror = Reactor::builder().build();
    mirror
        .add_drive(AddDriveInput {
            id: Some(DRIVE_ID.into()),
            name: "shared drive".into(),
            ..Default::default()
        })
        .await?;

    // deliver the same strand twice, as a flaky transport would
    let listener_id = source.register_pull_listener(DRIVE_ID, ListenerFilter::any());
    let strands = source
        .pull_strands(&listener_id, Default::default())
        .await?;
    assert_eq!(strands.len(), 1);
    for _ in 0..2 {
        for strand in &strands {
            let outcome = mirror.apply_strand(strand).await;
            assert_eq!(outcome.status, JobStatus::Success);
        }
    }

    let mirrored = mirror.get_drive(DRIVE_ID).await?;
    assert_eq!(mirrored.header.revision(Scope::Global), 1);
    assert_eq!(mirrored.operations.global.len(), 1);

    source.shutdown();
    mirror.shutdown();
    Ok(())
}
