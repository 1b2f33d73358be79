//! Identifiers shared by every Shoal grid component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of backup replicas a partition may carry.
pub const MAX_BACKUP_COUNT: usize = 6;

/// Maximum number of replicas (owner plus backups) for one partition.
pub const MAX_REPLICA_COUNT: usize = MAX_BACKUP_COUNT + 1;

/// Default number of partitions in a grid.
pub const DEFAULT_PARTITION_COUNT: u32 = 271;

/// Represents a unique identifier for a grid member node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Represents a partition identifier in `[0, partition_count)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Creates a new PartitionId from a raw u32 value
    pub fn new(id: u32) -> Self {
        PartitionId(id)
    }

    /// Returns the raw u32 value of this partition ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the partition id as a vector index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a node in a partition's replica list. The owner is index 0.
pub type ReplicaIndex = usize;

/// The kind of distributed object a container or operation belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    /// A 64-bit atomic counter.
    Counter,
    /// An atomic reference holding an optional opaque value.
    Reference,
    /// A key/value map partitioned by entry key.
    Map,
    /// A FIFO queue stored in a single partition.
    Queue,
    /// A reentrant lock.
    Lock,
}

impl ObjectKind {
    /// Returns a short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Counter => "counter",
            ObjectKind::Reference => "reference",
            ObjectKind::Map => "map",
            ObjectKind::Queue => "queue",
            ObjectKind::Lock => "lock",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a distributed object: its kind plus its user-visible name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    /// Object kind.
    pub kind: ObjectKind,
    /// Object name, unique per kind.
    pub name: String,
}

impl ObjectId {
    /// Creates an object id of the given kind.
    pub fn new(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Shorthand for a counter object id.
    pub fn counter(name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Counter, name)
    }

    /// Shorthand for a reference object id.
    pub fn reference(name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Reference, name)
    }

    /// Shorthand for a map object id.
    pub fn map(name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Map, name)
    }

    /// Shorthand for a queue object id.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Queue, name)
    }

    /// Shorthand for a lock object id.
    pub fn lock(name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Lock, name)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId::new(7).to_string(), "node-7");
        assert_eq!(NodeId::new(7).as_u64(), 7);
    }

    #[test]
    fn test_partition_id_index() {
        let pid = PartitionId::new(42);
        assert_eq!(pid.index(), 42);
        assert_eq!(pid.to_string(), "42");
    }

    #[test]
    fn test_object_id_display() {
        let id = ObjectId::counter("ctr");
        assert_eq!(id.to_string(), "counter:ctr");
        assert_ne!(ObjectId::counter("x"), ObjectId::queue("x"));
    }

    #[test]
    fn test_replica_bounds() {
        assert_eq!(MAX_REPLICA_COUNT, 7);
    }
}
