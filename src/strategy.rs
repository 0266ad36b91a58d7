//! Startup reconciliation of previously-configured remote drives.
//!
//! When a reactor starts with a new remote-drive configuration, drives left
//! over from an older configuration are reconciled once according to a
//! strategy: "remove" deletes the drive entirely, "detach" strips its sync
//! configuration (listeners, triggers, sharing type back to local) while
//! preserving its content, and "preserve" keeps the listed drives while
//! applying remove or detach to the rest. Only drives that actually carry
//! sync configuration are candidates; purely local drives are never
//! touched.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::drive;
use crate::error::StorageError;
use crate::events::{Event, RemoteDriveInitStatus};
use crate::reactor::{Reactor, RemoteDriveOptions};
use crate::sync::detach_drive;

/// A remote drive this reactor should mirror.
#[derive(Debug, Clone)]
pub struct RemoteDriveConfig {
    pub url: String,
    pub options: RemoteDriveOptions,
}

impl RemoteDriveConfig {
    pub fn new(url: impl Into<String>) -> Self {
        RemoteDriveConfig {
            url: url.into(),
            options: RemoteDriveOptions::default(),
        }
    }
}

/// What to do with drives configured by a previous run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOldRemoteDrives {
    /// Leave everything as it is.
    PreserveAll,
    /// Keep the listed drive ids, remove the other remote drives.
    PreserveById(Vec<String>),
    /// Keep the listed drive ids, detach the other remote drives.
    PreserveByIdAndDetach(Vec<String>),
    /// Keep the drives behind the listed urls, remove the rest.
    PreserveByUrl(Vec<String>),
    /// Keep the drives behind the listed urls, detach the rest.
    PreserveByUrlAndDetach(Vec<String>),
    /// Remove every drive that carries sync configuration.
    RemoveAll,
    RemoveById(Vec<String>),
    RemoveByUrl(Vec<String>),
    DetachById(Vec<String>),
    DetachByUrl(Vec<String>),
}

/// Ids of drives carrying sync configuration (listeners or triggers).
async fn remote_drive_ids(reactor: &Reactor) -> Result<Vec<String>, StorageError> {
    let mut ids = Vec::new();
    for drive_id in reactor.drives().await? {
        let document = reactor.get_drive(&drive_id).await?;
        let local = drive::drive_local_state(&document)
            .map_err(|e| StorageError::backend(anyhow::anyhow!(e.to_string())))?;
        if !local.listeners.is_empty() || !local.triggers.is_empty() {
            ids.push(drive_id);
        }
    }
    Ok(ids)
}

/// Resolves configured urls to drive ids by asking the remotes.
async fn ids_for_urls(reactor: &Reactor, urls: &[String]) -> Vec<String> {
    let mut ids = Vec::new();
    for url in urls {
        match reactor.remote_for(url) {
            Ok(remote) => match remote.drive_info().await {
                Ok(info) => ids.push(info.id),
                Err(err) => warn!(%url, %err, "could not resolve remote drive url"),
            },
            Err(err) => warn!(%url, %err, "no transport for configured url"),
        }
    }
    ids
}

async fn remove_drives(reactor: &Reactor, ids: &[String]) {
    for drive_id in ids {
        if let Err(err) = reactor.delete_drive(drive_id).await {
            warn!(%drive_id, %err, "failed to remove old remote drive");
        }
    }
}

async fn detach_drives(reactor: &Reactor, ids: &[String]) {
    for drive_id in ids {
        if let Err(err) = detach_drive(reactor, drive_id).await {
            warn!(%drive_id, %err, "failed to detach old remote drive");
        }
    }
}

/// Applies a removal strategy to the drives of a previous configuration.
/// Runs once at reactor startup, before new remote drives are added.
pub async fn remove_old_remote_drives(
    reactor: &Reactor,
    strategy: &RemoveOldRemoteDrives,
) -> Result<(), StorageError> {
    use RemoveOldRemoteDrives::*;

    if matches!(strategy, PreserveAll) {
        return Ok(());
    }

    let existing = remote_drive_ids(reactor).await?;
    debug!(count = existing.len(), ?strategy, "reconciling old remote drives");

    match strategy {
        PreserveAll => {}
        PreserveById(keep) => {
            let doomed: Vec<String> = existing
                .iter()
                .filter(|id| !keep.contains(id))
                .cloned()
                .collect();
            remove_drives(reactor, &doomed).await;
        }
        PreserveByIdAndDetach(keep) => {
            let doomed: Vec<String> = existing
                .iter()
                .filter(|id| !keep.contains(id))
                .cloned()
                .collect();
            detach_drives(reactor, &doomed).await;
        }
        PreserveByUrl(urls) => {
            let keep = ids_for_urls(reactor, urls).await;
            let doomed: Vec<String> = existing
                .iter()
                .filter(|id| !keep.contains(id))
                .cloned()
                .collect();
            remove_drives(reactor, &doomed).await;
        }
        PreserveByUrlAndDetach(urls) => {
            let keep = ids_for_urls(reactor, urls).await;
            let doomed: Vec<String> = existing
                .iter()
                .filter(|id| !keep.contains(id))
                .cloned()
                .collect();
            detach_drives(reactor, &doomed).await;
        }
        RemoveAll => {
            remove_drives(reactor, &existing).await;
        }
        RemoveById(ids) => {
            let doomed: Vec<String> = ids
                .iter()
                .filter(|id| existing.contains(id))
                .cloned()
                .collect();
            remove_drives(reactor, &doomed).await;
        }
        RemoveByUrl(urls) => {
            let resolved = ids_for_urls(reactor, urls).await;
            let doomed: Vec<String> = resolved
                .into_iter()
                .filter(|id| existing.contains(id))
                .collect();
            remove_drives(reactor, &doomed).await;
        }
        DetachById(ids) => {
            let doomed: Vec<String> = ids
                .iter()
                .filter(|id| existing.contains(id))
                .cloned()
                .collect();
            detach_drives(reactor, &doomed).await;
        }
        DetachByUrl(urls) => {
            let resolved = ids_for_urls(reactor, urls).await;
            let doomed: Vec<String> = resolved
                .into_iter()
                .filter(|id| existing.contains(id))
                .collect();
            detach_drives(reactor, &doomed).await;
        }
    }
    Ok(())
}

/// Adds the configured remote drives, emitting progress events. Drives
/// already present are reported as such and left alone.
pub async fn initialize_remote_drives(
    reactor: &Arc<Reactor>,
    configs: &[RemoteDriveConfig],
) -> Result<(), StorageError> {
    let events = reactor.events();
    for config in configs {
        events.emit(Event::RemoteDriveInit {
            url: config.url.clone(),
            status: RemoteDriveInitStatus::Pending,
            drive_id: None,
        });

        let already = match reactor.remote_for(&config.url) {
            Ok(remote) => match remote.drive_info().await {
                Ok(info) => {
                    let exists = reactor.storage().exists(&info.id).await?;
                    Some((info.id, exists))
                }
                Err(_) => None,
            },
            Err(_) => None,
        };
        if let Some((drive_id, true)) = already {
            events.emit(Event::RemoteDriveInit {
                url: config.url.clone(),
                status: RemoteDriveInitStatus::AlreadyAdded,
                drive_id: Some(drive_id),
            });
            continue;
        }

        events.emit(Event::RemoteDriveInit {
            url: config.url.clone(),
            status: RemoteDriveInitStatus::Adding,
            drive_id: None,
        });
        match reactor
            .add_remote_drive(&config.url, config.options.clone())
            .await
        {
            Ok(document) => {
                events.emit(Event::RemoteDriveInit {
                    url: config.url.clone(),
                    status: RemoteDriveInitStatus::Success,
                    drive_id: Some(document.header.id),
                });
            }
            Err(err) => {
                warn!(url = %config.url, %err, "failed to add configured remote drive");
                events.emit(Event::RemoteDriveInit {
                    url: config.url.clone(),
                    status: RemoteDriveInitStatus::Error,
                    drive_id: None,
                });
            }
        }
    }
    Ok(())
}

/// Startup entry point: reconcile old drives, then add the configured
/// ones.
pub async fn initialize(
    reactor: &Arc<Reactor>,
    configs: &[RemoteDriveConfig],
    strategy: &RemoveOldRemoteDrives,
) -> Result<(), StorageError> {
    remove_old_remote_drives(reactor, strategy).await?;
    initialize_remote_drives(reactor, configs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Scope;
    use crate::drive::{new_pull_trigger, new_push_listener, ListenerFilter, SharingType};
    use crate::reactor::AddDriveInput;

    async fn drive_with_sync_config(reactor: &Arc<Reactor>, id: &str) {
        reactor
            .add_drive(AddDriveInput {
                id: Some(id.into()),
                name: id.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let listener = new_push_listener("remote://peer", ListenerFilter::any());
        let trigger = new_pull_trigger("remote://peer", 500, "lst");
        let jobs = reactor
            .mutate(
                id,
                vec![
                    drive::actions::add_listener(&listener),
                    drive::actions::add_trigger(&trigger),
                ],
            )
            .await
            .unwrap();
        for job in &jobs {
            reactor.wait_for_job(&job.id).await;
        }
    }

    #[tokio::test]
    async fn preserve_all_touches_nothing() {
        let reactor = Reactor::builder().build();
        drive_with_sync_config(&reactor, "drive-1").await;
        remove_old_remote_drives(&reactor, &RemoveOldRemoteDrives::PreserveAll)
            .await
            .unwrap();
        assert!(reactor.storage().exists("drive-1").await.unwrap());
    }

    #[tokio::test]
    async fn remove_all_deletes_only_remote_drives() {
        let reactor = Reactor::builder().build();
        drive_with_sync_config(&reactor, "remote-drive").await;
        reactor
            .add_drive(AddDriveInput {
                id: Some("local-drive".into()),
                name: "local".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        remove_old_remote_drives(&reactor, &RemoveOldRemoteDrives::RemoveAll)
            .await
            .unwrap();
        assert!(!reactor.storage().exists("remote-drive").await.unwrap());
        // a drive with no listeners or triggers is not a remote drive
        assert!(reactor.storage().exists("local-drive").await.unwrap());
    }

    #[tokio::test]
    async fn preserve_by_id_keeps_the_listed_drive() {
        let reactor = Reactor::builder().build();
        drive_with_sync_config(&reactor, "keep-me").await;
        drive_with_sync_config(&reactor, "drop-me").await;

        remove_old_remote_drives(
            &reactor,
            &RemoveOldRemoteDrives::PreserveById(vec!["keep-me".into()]),
        )
        .await
        .unwrap();
        assert!(reactor.storage().exists("keep-me").await.unwrap());
        assert!(!reactor.storage().exists("drop-me").await.unwrap());
    }

    #[tokio::test]
    async fn detach_by_id_strips_sync_config_in_order() {
        let reactor = Reactor::builder().build();
        drive_with_sync_config(&reactor, "drive-1").await;

        remove_old_remote_drives(
            &reactor,
            &RemoveOldRemoteDrives::DetachById(vec!["drive-1".into()]),
        )
        .await
        .unwrap();

        let document = reactor.get_drive("drive-1").await.unwrap();
        let local = drive::drive_local_state(&document).unwrap();
        assert!(local.listeners.is_empty());
        assert!(local.triggers.is_empty());
        assert_eq!(local.sharing_type, SharingType::Local);

        // ADD_LISTENER, ADD_TRIGGER, then the detach triple
        let types: Vec<&str> = document
            .operations
            .local
            .iter()
            .map(|op| op.op_type.as_str())
            .collect();
        assert_eq!(
            types,
            vec![
                drive::ADD_LISTENER,
                drive::ADD_TRIGGER,
                drive::REMOVE_LISTENER,
                drive::REMOVE_TRIGGER,
                drive::SET_SHARING_TYPE,
            ]
        );
        let indices: Vec<u64> = document
            .operations
            .local
            .iter()
            .map(|op| op.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(document.header.revision(Scope::Local), 5);
    }
}
