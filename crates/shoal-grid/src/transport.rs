//! Node-to-node messaging used by replication and migration.
//!
//! The core only needs two request/response exchanges: delivering a backup
//! envelope and pulling a partition snapshot. [`Transport`] is the sending
//! side and [`MessageHandler`] the receiving side. [`LocalNetwork`] connects
//! in-process nodes, round-tripping every message through bincode and letting
//! tests cut links to simulate network partitions.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::container::ContainerSlot;
use crate::error::{GridError, Result};
use crate::replication::{BackupAck, BackupEnvelope};
use crate::types::{NodeId, ObjectId, PartitionId, ReplicaIndex};

/// Asks a replica for a copy of a partition's containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Partition to copy.
    pub partition: PartitionId,
    /// Replica index the requester will hold; filters containers by backup count.
    pub replica_index: ReplicaIndex,
    /// Requesting node.
    pub requester: NodeId,
    /// Register the requester as a catch-up backup target until the migration ends.
    pub catch_up: bool,
}

/// Containers of one partition plus the last sequence they reflect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    /// Partition copied.
    pub partition: PartitionId,
    /// Last backup sequence applied to the copied state.
    pub sequence: u64,
    /// Container slots.
    pub containers: Vec<(ObjectId, ContainerSlot)>,
}

/// Sending side of node-to-node messaging.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivers a backup envelope and returns the replica's acknowledgement.
    async fn send_backup(&self, target: NodeId, envelope: BackupEnvelope) -> Result<BackupAck>;

    /// Pulls a partition snapshot from `target`.
    async fn request_snapshot(
        &self,
        target: NodeId,
        request: SnapshotRequest,
    ) -> Result<PartitionSnapshot>;
}

/// Receiving side of node-to-node messaging.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles an incoming backup envelope.
    async fn on_backup(&self, envelope: BackupEnvelope) -> Result<BackupAck>;

    /// Serves a snapshot request.
    async fn on_snapshot_request(&self, request: SnapshotRequest) -> Result<PartitionSnapshot>;
}

/// In-process network connecting registered handlers.
#[derive(Default)]
pub struct LocalNetwork {
    handlers: RwLock<HashMap<NodeId, Weak<dyn MessageHandler>>>,
    isolated: RwLock<HashSet<NodeId>>,
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
    delays: RwLock<HashMap<(NodeId, NodeId), Duration>>,
}

impl LocalNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the handler receiving messages for `node`.
    pub fn register(&self, node: NodeId, handler: Weak<dyn MessageHandler>) {
        self.handlers.write().insert(node, handler);
    }

    /// Removes a node; messages to it fail from now on.
    pub fn unregister(&self, node: NodeId) {
        self.handlers.write().remove(&node);
    }

    /// Returns a transport sending as `local`.
    pub fn transport(self: &Arc<Self>, local: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            local,
            network: self.clone(),
        })
    }

    /// Cuts every link to and from `node`.
    pub fn isolate(&self, node: NodeId) {
        self.isolated.write().insert(node);
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn block_link(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.write();
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    /// Delays every message from `from` to `to`.
    pub fn delay_link(&self, from: NodeId, to: NodeId, delay: Duration) {
        self.delays.write().insert((from, to), delay);
    }

    /// Restores every link and removes delays.
    pub fn heal(&self) {
        self.isolated.write().clear();
        self.blocked.write().clear();
        self.delays.write().clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<(Arc<dyn MessageHandler>, Option<Duration>)> {
        {
            let isolated = self.isolated.read();
            if isolated.contains(&from) || isolated.contains(&to) {
                return Err(GridError::Transport {
                    msg: format!("{} -> {}: node isolated", from, to),
                });
            }
        }
        if self.blocked.read().contains(&(from, to)) {
            return Err(GridError::Transport {
                msg: format!("{} -> {}: link blocked", from, to),
            });
        }
        let handler = self
            .handlers
            .read()
            .get(&to)
            .and_then(|h| h.upgrade())
            .ok_or_else(|| GridError::Transport {
                msg: format!("{} is not reachable", to),
            })?;
        let delay = self.delays.read().get(&(from, to)).copied();
        Ok((handler, delay))
    }
}

fn round_trip<T: Serialize + for<'de> Deserialize<'de>>(value: &T) -> Result<T> {
    let bytes = bincode::serialize(value)?;
    Ok(bincode::deserialize(&bytes)?)
}

/// [`Transport`] bound to one node of a [`LocalNetwork`].
pub struct LocalTransport {
    local: NodeId,
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    /// Node this transport sends as.
    pub fn local(&self) -> NodeId {
        self.local
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_backup(&self, target: NodeId, envelope: BackupEnvelope) -> Result<BackupAck> {
        let (handler, delay) = self.network.route(self.local, target)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let envelope = round_trip(&envelope)?;
        let ack = handler.on_backup(envelope).await?;
        round_trip(&ack)
    }

    async fn request_snapshot(
        &self,
        target: NodeId,
        request: SnapshotRequest,
    ) -> Result<PartitionSnapshot> {
        let (handler, delay) = self.network.route(self.local, target)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let request = round_trip(&request)?;
        let snapshot = handler.on_snapshot_request(request).await?;
        round_trip(&snapshot)
    }
}
