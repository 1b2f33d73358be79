//! Counters and observability hooks for the grid core.
//!
//! Redundancy failures (backup timeouts, unreachable replicas, resyncs) are
//! never surfaced to callers as errors. They are counted here and reported
//! through a [`ReplicationObserver`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use crate::types::{NodeId, PartitionId};

/// Lock-free counters updated on the hot path.
#[derive(Debug, Default)]
pub struct GridMetrics {
    operations_executed: AtomicU64,
    operations_failed: AtomicU64,
    quorum_rejections: AtomicU64,
    not_owner_redirects: AtomicU64,
    backups_sent: AtomicU64,
    backups_acked: AtomicU64,
    backup_timeouts: AtomicU64,
    backups_applied: AtomicU64,
    duplicate_backups: AtomicU64,
    sequence_gaps: AtomicU64,
    resyncs: AtomicU64,
    snapshots_served: AtomicU64,
    snapshots_applied: AtomicU64,
    migrations_started: AtomicU64,
    migrations_committed: AtomicU64,
    migrations_rolled_back: AtomicU64,
}

macro_rules! counter_methods {
    ($($field:ident => $method:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increments `", stringify!($field), "`.")]
            pub fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl GridMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    counter_methods! {
        operations_executed => inc_operations_executed,
        operations_failed => inc_operations_failed,
        quorum_rejections => inc_quorum_rejections,
        not_owner_redirects => inc_not_owner_redirects,
        backups_acked => inc_backups_acked,
        backup_timeouts => inc_backup_timeouts,
        backups_applied => inc_backups_applied,
        duplicate_backups => inc_duplicate_backups,
        sequence_gaps => inc_sequence_gaps,
        resyncs => inc_resyncs,
        snapshots_served => inc_snapshots_served,
        snapshots_applied => inc_snapshots_applied,
        migrations_started => inc_migrations_started,
        migrations_committed => inc_migrations_committed,
        migrations_rolled_back => inc_migrations_rolled_back,
    }

    /// Adds `n` backup sends.
    pub fn add_backups_sent(&self, n: u64) {
        self.backups_sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_executed: self.operations_executed.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            quorum_rejections: self.quorum_rejections.load(Ordering::Relaxed),
            not_owner_redirects: self.not_owner_redirects.load(Ordering::Relaxed),
            backups_sent: self.backups_sent.load(Ordering::Relaxed),
            backups_acked: self.backups_acked.load(Ordering::Relaxed),
            backup_timeouts: self.backup_timeouts.load(Ordering::Relaxed),
            backups_applied: self.backups_applied.load(Ordering::Relaxed),
            duplicate_backups: self.duplicate_backups.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            snapshots_served: self.snapshots_served.load(Ordering::Relaxed),
            snapshots_applied: self.snapshots_applied.load(Ordering::Relaxed),
            migrations_started: self.migrations_started.load(Ordering::Relaxed),
            migrations_committed: self.migrations_committed.load(Ordering::Relaxed),
            migrations_rolled_back: self.migrations_rolled_back.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`GridMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Primary operations that completed.
    pub operations_executed: u64,
    /// Primary operations that returned an error.
    pub operations_failed: u64,
    /// Operations rejected by the quorum gate.
    pub quorum_rejections: u64,
    /// Operations answered with a NotOwner redirect.
    pub not_owner_redirects: u64,
    /// Backup envelopes handed to the transport.
    pub backups_sent: u64,
    /// Backup envelopes acknowledged as delivered.
    pub backups_acked: u64,
    /// Sync invocations whose ack wait expired.
    pub backup_timeouts: u64,
    /// Backups applied on this node as a replica.
    pub backups_applied: u64,
    /// Backups discarded as already applied.
    pub duplicate_backups: u64,
    /// Sequence gaps detected on this node.
    pub sequence_gaps: u64,
    /// Snapshot-based resyncs completed.
    pub resyncs: u64,
    /// Snapshots served to other nodes.
    pub snapshots_served: u64,
    /// Snapshots installed locally.
    pub snapshots_applied: u64,
    /// Migrations started by the coordinator.
    pub migrations_started: u64,
    /// Migrations that committed.
    pub migrations_committed: u64,
    /// Migrations that rolled back.
    pub migrations_rolled_back: u64,
}

/// Receives redundancy failures so the membership layer can re-replicate.
pub trait ReplicationObserver: Send + Sync {
    /// A sync invocation's backup acks did not arrive in time.
    fn on_backup_timeout(&self, partition: PartitionId, sequence: u64, acked: usize, required: usize);

    /// A replica failed `failures` consecutive backup sends.
    fn on_replica_unreachable(&self, partition: PartitionId, replica: NodeId, failures: u32);

    /// A replica detected a sequence gap and asked for a full resync.
    fn on_resync_requested(&self, partition: PartitionId, expected: u64, received: u64);
}

/// Observer that reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ReplicationObserver for LoggingObserver {
    fn on_backup_timeout(&self, partition: PartitionId, sequence: u64, acked: usize, required: usize) {
        warn!(
            partition = %partition,
            sequence,
            acked,
            required,
            "sync backup acknowledgement timed out"
        );
    }

    fn on_replica_unreachable(&self, partition: PartitionId, replica: NodeId, failures: u32) {
        warn!(
            partition = %partition,
            replica = %replica,
            failures,
            "backup replica unreachable"
        );
    }

    fn on_resync_requested(&self, partition: PartitionId, expected: u64, received: u64) {
        info!(
            partition = %partition,
            expected,
            received,
            "replica requested full resync"
        );
    }
}
