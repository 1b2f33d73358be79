//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use shoal_grid::container::Container;
use shoal_grid::{
    GridConfig, GridNode, NodeId, ObjectConfig, ObjectId, PartitionId, QuorumConfig,
    ReplicationObserver,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Small, fast config: few partitions and short timeouts.
pub fn test_config() -> GridConfig {
    GridConfig {
        partition_count: 16,
        worker_count: 2,
        backup_ack_timeout_ms: 200,
        migration_timeout_ms: 2_000,
        ..GridConfig::default()
    }
}

/// Test config with object and quorum declarations.
pub fn config_with(objects: Vec<ObjectConfig>, quorums: Vec<QuorumConfig>) -> GridConfig {
    GridConfig {
        objects,
        quorums,
        ..test_config()
    }
}

/// Observer events, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    BackupTimeout { partition: PartitionId, sequence: u64 },
    ReplicaUnreachable { partition: PartitionId, replica: NodeId },
    ResyncRequested { partition: PartitionId, expected: u64, received: u64 },
}

/// Observer that records every callback.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    pub fn backup_timeouts(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ObservedEvent::BackupTimeout { .. }))
            .count()
    }

    pub fn resyncs_requested(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ObservedEvent::ResyncRequested { .. }))
            .count()
    }
}

impl ReplicationObserver for RecordingObserver {
    fn on_backup_timeout(&self, partition: PartitionId, sequence: u64, _acked: usize, _required: usize) {
        self.events
            .lock()
            .push(ObservedEvent::BackupTimeout { partition, sequence });
    }

    fn on_replica_unreachable(&self, partition: PartitionId, replica: NodeId, _failures: u32) {
        self.events
            .lock()
            .push(ObservedEvent::ReplicaUnreachable { partition, replica });
    }

    fn on_resync_requested(&self, partition: PartitionId, expected: u64, received: u64) {
        self.events.lock().push(ObservedEvent::ResyncRequested {
            partition,
            expected,
            received,
        });
    }
}

/// Counter value held locally by `node`, if the container exists.
pub async fn local_counter(node: &GridNode, partition: PartitionId, name: &str) -> Option<i64> {
    match node
        .local_container(partition, &ObjectId::counter(name))
        .await
        .unwrap()
    {
        Some(Container::Counter(c)) => Some(c.get()),
        Some(other) => panic!("{} is not a counter: {:?}", name, other),
        None => None,
    }
}

/// Polls `check` until it returns true or two seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
