//! Node identity and replication progress, as seen by elections and gossip
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use evstored_api::{now_millis, EpochId, EpochRecord, MemberInfo, NodeId, VNodeState};

use crate::db::ChunkDb;
use crate::epoch::EpochManager;

/// Endpoints and identity of this node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub instance_id: NodeId,
    pub internal_tcp: SocketAddr,
    pub internal_secure_tcp: Option<SocketAddr>,
    pub external_tcp: SocketAddr,
    pub external_secure_tcp: Option<SocketAddr>,
    pub external_http: SocketAddr,
    pub node_priority: i32,
}

impl NodeInfo {
    pub fn member_info(
        &self,
        state: VNodeState,
        is_alive: bool,
        progress: &dyn ReplicationProgress,
    ) -> MemberInfo {
        let epoch = progress.last_epoch();
        MemberInfo {
            instance_id: self.instance_id,
            time_stamp: now_millis(),
            state,
            is_alive,
            internal_tcp: self.internal_tcp,
            internal_secure_tcp: self.internal_secure_tcp,
            external_tcp: self.external_tcp,
            external_secure_tcp: self.external_secure_tcp,
            external_http: self.external_http,
            last_commit_position: progress.last_commit_position(),
            writer_checkpoint: progress.writer_checkpoint(),
            chaser_checkpoint: progress.chaser_checkpoint(),
            epoch_position: epoch.map_or(-1, |e| e.epoch_position),
            epoch_number: epoch.map_or(-1, |e| e.epoch_number),
            epoch_id: epoch.map_or(EpochId::nil(), |e| e.epoch_id),
            node_priority: self.node_priority,
        }
    }
}

/// How far this node's log got, used to rank master candidates
pub trait ReplicationProgress: Send + Sync {
    fn last_epoch(&self) -> Option<EpochRecord>;
    fn writer_checkpoint(&self) -> i64;
    fn chaser_checkpoint(&self) -> i64;
    fn last_commit_position(&self) -> i64;
}

pub struct NodeProgress {
    db: Arc<ChunkDb>,
    epochs: Arc<EpochManager>,
    last_commit_position: AtomicI64,
}

impl NodeProgress {
    pub fn new(db: Arc<ChunkDb>, epochs: Arc<EpochManager>) -> Self {
        Self {
            db,
            epochs,
            last_commit_position: AtomicI64::new(-1),
        }
    }

    /// Never moves backward
    pub fn update_last_commit_position(&self, position: i64) {
        self.last_commit_position
            .fetch_max(position, Ordering::SeqCst);
    }

    /// Reset after the log got truncated below the commit position
    pub fn reset_last_commit_position(&self, position: i64) {
        self.last_commit_position
            .fetch_min(position, Ordering::SeqCst);
    }
}

impl ReplicationProgress for NodeProgress {
    fn last_epoch(&self) -> Option<EpochRecord> {
        self.epochs.last_epoch()
    }

    fn writer_checkpoint(&self) -> i64 {
        self.db.writer_checkpoint().read()
    }

    fn chaser_checkpoint(&self) -> i64 {
        self.db.chaser_checkpoint().read()
    }

    fn last_commit_position(&self) -> i64 {
        self.last_commit_position.load(Ordering::SeqCst)
    }
}
