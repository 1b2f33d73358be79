//! Error types for the grid core.

use thiserror::Error;

use crate::types::{NodeId, ObjectKind, PartitionId};

/// Errors that can occur in the grid core.
#[derive(Debug, Error)]
pub enum GridError {
    /// The object's split-brain protection policy rejected the operation.
    #[error("quorum {quorum} not met for {object}: {reachable} reachable member(s)")]
    QuorumNotMet {
        /// Name of the object the operation targeted.
        object: String,
        /// Name of the quorum policy that failed.
        quorum: String,
        /// Number of reachable members at evaluation time.
        reachable: usize,
    },

    /// The local node does not own the partition; the caller must re-resolve.
    #[error("partition {partition} is not owned locally (owner hint: {owner:?})")]
    NotOwner {
        /// Partition the operation targeted.
        partition: PartitionId,
        /// Current owner as known locally, if any.
        owner: Option<NodeId>,
    },

    /// A partition migration failed and was rolled back.
    #[error("migration of partition {partition} failed: {reason}")]
    MigrationFailed {
        /// Partition being migrated.
        partition: PartitionId,
        /// Why the migration failed.
        reason: String,
    },

    /// Sync backup acknowledgements did not arrive in time.
    #[error("backup of partition {partition} seq {sequence} timed out ({acked}/{required} acks)")]
    BackupTimeout {
        /// Partition of the backup.
        partition: PartitionId,
        /// Backup sequence number.
        sequence: u64,
        /// Acks received before the deadline.
        acked: usize,
        /// Acks required by the ack policy.
        required: usize,
    },

    /// A replica received a backup that is not the next in sequence.
    #[error("sequence gap on partition {partition}: expected {expected}, received {received}")]
    SequenceGap {
        /// Partition of the backup.
        partition: PartitionId,
        /// Sequence number the replica expected next.
        expected: u64,
        /// Sequence number actually received.
        received: u64,
    },

    /// The operation does not apply to the container it was routed to.
    #[error("operation for {expected} routed to a {actual} container")]
    WrongObjectKind {
        /// Kind the operation targets.
        expected: ObjectKind,
        /// Kind of the container found.
        actual: ObjectKind,
    },

    /// The operation's precondition does not hold (e.g. unlock by a non-holder).
    #[error("illegal state: {msg}")]
    IllegalState {
        /// Description of the violated precondition.
        msg: String,
    },

    /// A bounded container is full.
    #[error("capacity of {object} exceeded (max {max})")]
    CapacityExceeded {
        /// Object name.
        object: String,
        /// Configured maximum size.
        max: usize,
    },

    /// Partition id outside the table.
    #[error("invalid partition {0}")]
    InvalidPartition(PartitionId),

    /// A replica list violated the placement invariants.
    #[error("invalid replica set for partition {partition}: {msg}")]
    InvalidReplicaSet {
        /// Partition whose replica list was rejected.
        partition: PartitionId,
        /// Which invariant failed.
        msg: String,
    },

    /// Configuration was rejected.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure. Not retried by the core.
    #[error("transport error: {msg}")]
    Transport {
        /// Error message describing the transport issue.
        msg: String,
    },

    /// An internal wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// The node or one of its workers was shut down.
    #[error("grid node shut down")]
    Shutdown,
}

impl GridError {
    /// Returns true if the calling layer may retry after re-resolving.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::NotOwner { .. } | GridError::Transport { .. })
    }
}

/// Result alias used throughout the grid core.
pub type Result<T> = std::result::Result<T, GridError>;
