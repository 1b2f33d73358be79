#![warn(missing_docs)]

//! Shoal grid core: partitioned primary-backup replication, partition migration,
//! and split-brain protection for an in-memory data grid.

pub mod cluster;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod membership;
pub mod metrics;
pub mod migration;
pub mod node;
pub mod operation;
pub mod partition;
pub mod partition_table;
pub mod quorum;
pub mod replication;
pub mod transport;
pub mod types;

pub use cluster::LocalCluster;
pub use config::{AckPolicy, GridConfig, ObjectConfig, QuorumConfig};
pub use error::{GridError, Result};
pub use membership::{MembershipView, NodeState};
pub use metrics::{GridMetrics, LoggingObserver, MetricsSnapshot, ReplicationObserver};
pub use migration::{MigrationCoordinator, MigrationPhase, MigrationPlan};
pub use node::{GridNode, InvocationOptions};
pub use operation::{CounterOp, LockOp, MapOp, Operation, QueueOp, ReferenceOp, Response};
pub use partition_table::{PartitionAssigner, PartitionResolver, PartitionTable};
pub use quorum::{QuorumGate, QuorumScope};
pub use replication::BackupMode;
pub use types::{NodeId, ObjectId, ObjectKind, PartitionId};
