//! Partition placement: which node owns each partition and which nodes back it up.
//!
//! The table is an immutable snapshot. Every change produces a new table with a
//! higher version, which nodes swap in wholesale.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::error::{GridError, Result};
use crate::types::{NodeId, PartitionId, ReplicaIndex, MAX_REPLICA_COUNT};

/// Ordered replica list of one partition. Index 0 is the owner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReplicas {
    replicas: Vec<NodeId>,
}

impl PartitionReplicas {
    /// Creates a replica list, validating placement invariants.
    pub fn new(partition: PartitionId, replicas: Vec<NodeId>) -> Result<Self> {
        if replicas.len() > MAX_REPLICA_COUNT {
            return Err(GridError::InvalidReplicaSet {
                partition,
                msg: format!(
                    "{} replicas exceed the maximum of {}",
                    replicas.len(),
                    MAX_REPLICA_COUNT
                ),
            });
        }
        let mut seen = HashSet::with_capacity(replicas.len());
        for node in &replicas {
            if !seen.insert(*node) {
                return Err(GridError::InvalidReplicaSet {
                    partition,
                    msg: format!("{} appears more than once", node),
                });
            }
        }
        Ok(Self { replicas })
    }

    /// The owner (replica index 0), if any.
    pub fn owner(&self) -> Option<NodeId> {
        self.replicas.first().copied()
    }

    /// Backup replicas in replica-index order.
    pub fn backups(&self) -> &[NodeId] {
        if self.replicas.is_empty() {
            &[]
        } else {
            &self.replicas[1..]
        }
    }

    /// All replicas, owner first.
    pub fn nodes(&self) -> &[NodeId] {
        &self.replicas
    }

    /// Replica index of `node`, or `None` if it holds no replica.
    pub fn replica_index(&self, node: NodeId) -> Option<ReplicaIndex> {
        self.replicas.iter().position(|n| *n == node)
    }
}

/// Snapshot mapping every partition to its replica list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    version: u64,
    partitions: Vec<PartitionReplicas>,
}

impl PartitionTable {
    /// Creates a table of `partition_count` unassigned partitions at version 0.
    pub fn new(partition_count: u32) -> Self {
        Self {
            version: 0,
            partitions: vec![PartitionReplicas::default(); partition_count as usize],
        }
    }

    /// Builds a table from per-partition replica lists.
    pub fn from_assignments(version: u64, assignments: Vec<Vec<NodeId>>) -> Result<Self> {
        let partitions = assignments
            .into_iter()
            .enumerate()
            .map(|(i, replicas)| PartitionReplicas::new(PartitionId::new(i as u32), replicas))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            version,
            partitions,
        })
    }

    /// Table version; higher versions supersede lower ones.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Replica list of a partition.
    pub fn replicas(&self, partition: PartitionId) -> Result<&PartitionReplicas> {
        self.partitions
            .get(partition.index())
            .ok_or(GridError::InvalidPartition(partition))
    }

    /// Owner of a partition.
    pub fn owner(&self, partition: PartitionId) -> Option<NodeId> {
        self.partitions.get(partition.index()).and_then(|r| r.owner())
    }

    /// Backups of a partition in replica-index order.
    pub fn backups(&self, partition: PartitionId) -> &[NodeId] {
        self.partitions
            .get(partition.index())
            .map(|r| r.backups())
            .unwrap_or(&[])
    }

    /// Replica index of `node` for `partition`.
    pub fn replica_index(&self, partition: PartitionId, node: NodeId) -> Option<ReplicaIndex> {
        self.partitions
            .get(partition.index())
            .and_then(|r| r.replica_index(node))
    }

    /// Partitions whose owner is `node`.
    pub fn partitions_owned_by(&self, node: NodeId) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.owner() == Some(node))
            .map(|(i, _)| PartitionId::new(i as u32))
            .collect()
    }

    /// Every node that holds at least one replica.
    pub fn members(&self) -> BTreeSet<NodeId> {
        self.partitions
            .iter()
            .flat_map(|r| r.nodes().iter().copied())
            .collect()
    }

    /// Returns a copy with `partition` re-assigned and the version bumped.
    pub fn with_replicas(&self, partition: PartitionId, replicas: Vec<NodeId>) -> Result<Self> {
        if partition.index() >= self.partitions.len() {
            return Err(GridError::InvalidPartition(partition));
        }
        if replicas.is_empty() {
            return Err(GridError::InvalidReplicaSet {
                partition,
                msg: "replica list has no owner".into(),
            });
        }
        let mut next = self.clone();
        next.partitions[partition.index()] = PartitionReplicas::new(partition, replicas)?;
        next.version += 1;
        Ok(next)
    }

    /// Returns a copy without `node`; replicas above it shift down one index.
    pub fn without_member(&self, node: NodeId) -> Self {
        let mut next = self.clone();
        for replicas in &mut next.partitions {
            replicas.replicas.retain(|n| *n != node);
        }
        next.version += 1;
        tracing::debug!(
            "removed {} from partition table, version now {}",
            node,
            next.version
        );
        next
    }
}

/// Computes a balanced initial placement.
pub struct PartitionAssigner;

impl PartitionAssigner {
    /// Distributes `partition_count` partitions over `nodes`.
    ///
    /// Each partition gets `backup_count` backups when enough nodes exist, and
    /// as many as the cluster can hold otherwise. Owners rotate over the node
    /// list and each backup is the next node after the previous replica, so
    /// every node carries the same share of owners and of each backup index.
    ///
    /// # Errors
    ///
    /// Returns an error if `nodes` is empty or contains duplicates.
    pub fn distribute(
        partition_count: u32,
        nodes: &[NodeId],
        backup_count: usize,
    ) -> Result<PartitionTable> {
        if nodes.is_empty() {
            return Err(GridError::Config(
                "no nodes available for partition distribution".into(),
            ));
        }
        let replica_count = (backup_count + 1).min(nodes.len()).min(MAX_REPLICA_COUNT);

        let assignments = (0..partition_count as usize)
            .map(|p| {
                (0..replica_count)
                    .map(|i| nodes[(p + i) % nodes.len()])
                    .collect()
            })
            .collect();

        let table = PartitionTable::from_assignments(1, assignments)?;
        tracing::debug!(
            "distributed {} partitions across {} nodes with {} replicas each",
            partition_count,
            nodes.len(),
            replica_count
        );
        Ok(table)
    }
}

/// Maps object names and entry keys to partitions.
#[derive(Clone, Copy, Debug)]
pub struct PartitionResolver {
    partition_count: u32,
}

impl PartitionResolver {
    /// Creates a resolver for a grid with `partition_count` partitions.
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count: partition_count.max(1),
        }
    }

    /// Partition of an object addressed by name.
    pub fn partition_for_name(&self, name: &str) -> PartitionId {
        self.partition_for_key(name.as_bytes())
    }

    /// Partition of an arbitrary key.
    pub fn partition_for_key(&self, key: &[u8]) -> PartitionId {
        let hash = blake3::hash(key);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        let value = u64::from_le_bytes(prefix);
        PartitionId::new((value % self.partition_count as u64) as u32)
    }
}
