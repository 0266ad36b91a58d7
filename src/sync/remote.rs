//! In-process sync transport between two reactors.
//!
//! This is the [`RemoteDrive`] implementation used in tests and for
//! same-process federation: every call lands directly on the remote
//! reactor's server-side sync surface. A network transport implements the
//! same trait against whatever RPC the remote exposes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::drive::ListenerFilter;
use crate::reactor::Reactor;
use crate::sync::{
    DriveInfo, ListenerRevision, RemoteDrive, Strand, StrandsOptions, SyncError,
};

#[derive(Clone)]
pub struct ReactorRemote {
    reactor: Arc<Reactor>,
    drive_id: String,
}

impl ReactorRemote {
    pub fn new(reactor: Arc<Reactor>, drive_id: impl Into<String>) -> Self {
        ReactorRemote {
            reactor,
            drive_id: drive_id.into(),
        }
    }
}

impl std::fmt::Debug for ReactorRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorRemote")
            .field("drive_id", &self.drive_id)
            .finish()
    }
}

#[async_trait]
impl RemoteDrive for ReactorRemote {
    async fn drive_info(&self) -> Result<DriveInfo, SyncError> {
        self.reactor.drive_info(&self.drive_id).await
    }

    async fn register_listener(&self, filter: ListenerFilter) -> Result<String, SyncError> {
        Ok(self.reactor.register_pull_listener(&self.drive_id, filter))
    }

    async fn strands(
        &self,
        listener_id: &str,
        options: StrandsOptions,
    ) -> Result<Vec<Strand>, SyncError> {
        self.reactor.pull_strands(listener_id, options).await
    }

    async fn acknowledge(
        &self,
        listener_id: &str,
        revisions: Vec<ListenerRevision>,
    ) -> Result<bool, SyncError> {
        Ok(self.reactor.acknowledge_listener(listener_id, &revisions))
    }

    async fn push_strands(
        &self,
        strands: Vec<Strand>,
    ) -> Result<Vec<ListenerRevision>, SyncError> {
        Ok(self.reactor.receive_strands(strands).await)
    }
}
