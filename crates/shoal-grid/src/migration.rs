//! Partition migration coordinator.
//!
//! A migration copies a partition to a destination node and, on commit, flips
//! the partition table so the destination holds its new replica index. The
//! coordinator drives both endpoints, plus the partition owner when it is
//! neither, through [`MigrationParticipant`]:
//!
//! 1. `before_migration` on both endpoints (`Notified`).
//! 2. The destination pulls a snapshot from the owner, which streams later
//!    backups to it as a catch-up target (`Replicating`).
//! 3. For an ownership transfer the source is fenced, its channel to the
//!    destination flushed, and the destination's sequence must equal the
//!    fenced one. For a backup move the owner's channel is flushed and the
//!    destination must have reached the owner's sequence read before the flush.
//! 4. The destination commits, then the source (`Committed`). An owner that is
//!    not an endpoint then installs the new table and ends the catch-up.
//!
//! Any failure, timeout or cancellation before step 4 rolls the endpoints
//! back (`RolledBack`) and leaves ownership where it was.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::metrics::GridMetrics;
use crate::partition_table::PartitionTable;
use crate::types::{NodeId, PartitionId, ReplicaIndex};

/// Phase of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationPhase {
    /// Endpoints were told a migration is starting.
    Notified,
    /// The destination is copying state.
    Replicating,
    /// The new placement is live.
    Committed,
    /// The migration was undone.
    RolledBack,
}

impl MigrationPhase {
    /// Returns true if the phase ends the migration.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Committed | MigrationPhase::RolledBack)
    }

    /// Returns true if moving from this phase to `next` is allowed.
    pub fn can_transition_to(&self, next: MigrationPhase) -> bool {
        matches!(
            (self, next),
            (MigrationPhase::Notified, MigrationPhase::Replicating)
                | (MigrationPhase::Notified, MigrationPhase::RolledBack)
                | (MigrationPhase::Replicating, MigrationPhase::Committed)
                | (MigrationPhase::Replicating, MigrationPhase::RolledBack)
        )
    }
}

/// Role a node plays in a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationEndpoint {
    /// Node the data comes from.
    Source,
    /// Node the data goes to.
    Destination,
}

/// What one endpoint is told about a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEvent {
    /// Migration id.
    pub id: Uuid,
    /// Phase being signalled.
    pub phase: MigrationPhase,
    /// Partition being migrated.
    pub partition: PartitionId,
    /// Role of the receiving node.
    pub endpoint: MigrationEndpoint,
    /// The other endpoint.
    pub peer: NodeId,
    /// Receiving node's replica index before the migration.
    pub current_replica_index: Option<ReplicaIndex>,
    /// Receiving node's replica index after the migration.
    pub new_replica_index: Option<ReplicaIndex>,
}

/// A requested placement change for one partition.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    /// Partition to migrate.
    pub partition: PartitionId,
    /// Owner of the partition before the migration.
    pub owner: NodeId,
    /// Node currently holding the data.
    pub source: NodeId,
    /// Node receiving the data.
    pub destination: NodeId,
    /// Source's replica index before.
    pub source_current_index: Option<ReplicaIndex>,
    /// Source's replica index after.
    pub source_new_index: Option<ReplicaIndex>,
    /// Destination's replica index before.
    pub destination_current_index: Option<ReplicaIndex>,
    /// Destination's replica index after.
    pub destination_new_index: Option<ReplicaIndex>,
    /// Table installed on commit.
    pub new_table: Arc<PartitionTable>,
}

impl MigrationPlan {
    /// Derives a plan from the table before and after the move.
    pub fn between(
        partition: PartitionId,
        source: NodeId,
        destination: NodeId,
        current: &PartitionTable,
        new_table: Arc<PartitionTable>,
    ) -> Result<Self> {
        let destination_new_index = new_table.replica_index(partition, destination);
        if destination_new_index.is_none() {
            return Err(GridError::MigrationFailed {
                partition,
                reason: format!("{} holds no replica in the target table", destination),
            });
        }
        if new_table.version() <= current.version() {
            return Err(GridError::MigrationFailed {
                partition,
                reason: "target table is not newer than the current one".into(),
            });
        }
        let owner = current.owner(partition).ok_or_else(|| GridError::MigrationFailed {
            partition,
            reason: "partition has no owner to copy from".into(),
        })?;
        Ok(Self {
            partition,
            owner,
            source,
            destination,
            source_current_index: current.replica_index(partition, source),
            source_new_index: new_table.replica_index(partition, source),
            destination_current_index: current.replica_index(partition, destination),
            destination_new_index,
            new_table,
        })
    }

    /// Replica list of the partition after the migration.
    pub fn new_replicas(&self) -> Vec<NodeId> {
        self.new_table
            .replicas(self.partition)
            .map(|r| r.nodes().to_vec())
            .unwrap_or_default()
    }

    /// Returns true if the source owns the partition now and hands ownership over.
    pub fn transfers_ownership(&self) -> bool {
        self.source_current_index == Some(0) && self.destination_new_index == Some(0)
    }

    fn event(&self, id: Uuid, phase: MigrationPhase, endpoint: MigrationEndpoint) -> MigrationEvent {
        let (peer, current, new) = match endpoint {
            MigrationEndpoint::Source => (
                self.destination,
                self.source_current_index,
                self.source_new_index,
            ),
            MigrationEndpoint::Destination => (
                self.source,
                self.destination_current_index,
                self.destination_new_index,
            ),
        };
        MigrationEvent {
            id,
            phase,
            partition: self.partition,
            endpoint,
            peer,
            current_replica_index: current,
            new_replica_index: new,
        }
    }
}

/// A node taking part in migrations.
#[async_trait]
pub trait MigrationParticipant: Send + Sync {
    /// Node id of the participant.
    fn node_id(&self) -> NodeId;

    /// Advisory start signal. Destinations start buffering backups here.
    async fn before_migration(&self, event: &MigrationEvent) -> Result<()>;

    /// Destination only: pulls and installs the snapshot, returning its sequence.
    async fn replicate_partition(&self, event: &MigrationEvent) -> Result<u64>;

    /// Source only: parks new primary operations and returns the last committed sequence.
    async fn fence_partition(&self, partition: PartitionId) -> Result<u64>;

    /// Source only: waits until every backup queued for `target` was sent.
    async fn flush_backups(&self, partition: PartitionId, target: NodeId) -> Result<()>;

    /// Last sequence applied locally for `partition`.
    async fn partition_sequence(&self, partition: PartitionId) -> Result<u64>;

    /// Makes the new placement live on this endpoint.
    async fn commit_migration(&self, event: &MigrationEvent, table: Arc<PartitionTable>) -> Result<()>;

    /// Undoes the migration on this endpoint.
    async fn rollback_migration(&self, event: &MigrationEvent) -> Result<()>;

    /// Owner only: installs `table` if given, then stops streaming backups of
    /// `partition` to `target` outside the partition table.
    async fn finish_catch_up(
        &self,
        partition: PartitionId,
        target: NodeId,
        table: Option<Arc<PartitionTable>>,
    ) -> Result<()>;
}

/// Bookkeeping for one migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    /// Migration id.
    pub id: Uuid,
    /// Partition migrated.
    pub partition: PartitionId,
    /// Source node.
    pub source: NodeId,
    /// Destination node.
    pub destination: NodeId,
    /// Current phase.
    pub phase: MigrationPhase,
    /// Unix seconds at start.
    pub started_at: u64,
    /// Unix seconds when a terminal phase was reached.
    pub completed_at: Option<u64>,
    /// Failure reason for rolled-back migrations.
    pub error: Option<String>,
}

impl MigrationRecord {
    fn transition(&mut self, next: MigrationPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(GridError::IllegalState {
                msg: format!(
                    "migration {} cannot move from {:?} to {:?}",
                    self.id, self.phase, next
                ),
            });
        }
        self.phase = next;
        if next.is_terminal() {
            self.completed_at = Some(unix_now());
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Drives migrations, one at a time per partition.
pub struct MigrationCoordinator {
    timeout: Duration,
    records: DashMap<Uuid, MigrationRecord>,
    active: DashMap<PartitionId, (Uuid, CancellationToken)>,
    metrics: Arc<GridMetrics>,
}

impl MigrationCoordinator {
    /// Creates a coordinator whose transfers are bounded by `timeout`.
    pub fn new(timeout: Duration, metrics: Arc<GridMetrics>) -> Self {
        Self {
            timeout,
            records: DashMap::new(),
            active: DashMap::new(),
            metrics,
        }
    }

    /// Record of a migration.
    pub fn record(&self, id: Uuid) -> Option<MigrationRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// Id of the migration running on `partition`, if any.
    pub fn active_migration(&self, partition: PartitionId) -> Option<Uuid> {
        self.active.get(&partition).map(|entry| entry.0)
    }

    /// Cancels the in-flight migration of `partition`; it then rolls back.
    ///
    /// Returns false if nothing is in flight or the migration is already committing.
    pub fn cancel(&self, partition: PartitionId) -> bool {
        match self.active.get(&partition) {
            Some(entry) => {
                info!(partition = %partition, migration = %entry.0, "cancelling migration");
                entry.1.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight migration with `node` as an endpoint.
    ///
    /// Returns how many were cancelled.
    pub fn cancel_involving(&self, node: NodeId) -> usize {
        let mut cancelled = 0;
        for entry in self.active.iter() {
            let (id, token) = entry.value();
            let involved = self
                .records
                .get(id)
                .map_or(false, |r| r.source == node || r.destination == node);
            if involved {
                info!(partition = %entry.key(), migration = %id, node = %node, "cancelling migration of departed endpoint");
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    fn set_phase(&self, id: Uuid, phase: MigrationPhase) -> Result<()> {
        match self.records.get_mut(&id) {
            Some(mut record) => record.transition(phase),
            None => Err(GridError::IllegalState {
                msg: format!("unknown migration {}", id),
            }),
        }
    }

    /// Runs a migration to completion.
    ///
    /// `owner` is the partition's current owner; for an ownership transfer it
    /// is the source itself. Returns the migration id on commit, or
    /// `MigrationFailed` after rolling back.
    pub async fn migrate(
        &self,
        plan: MigrationPlan,
        source: Arc<dyn MigrationParticipant>,
        destination: Arc<dyn MigrationParticipant>,
        owner: Arc<dyn MigrationParticipant>,
    ) -> Result<Uuid> {
        let partition = plan.partition;
        if owner.node_id() != plan.owner {
            return Err(GridError::MigrationFailed {
                partition,
                reason: format!("{} is not the owner {}", owner.node_id(), plan.owner),
            });
        }
        let id = Uuid::new_v4();
        let token = CancellationToken::new();

        match self.active.entry(partition) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                return Err(GridError::MigrationFailed {
                    partition,
                    reason: format!("migration {} already in flight", existing.get().0),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert((id, token.clone()));
            }
        }
        self.records.insert(
            id,
            MigrationRecord {
                id,
                partition,
                source: plan.source,
                destination: plan.destination,
                phase: MigrationPhase::Notified,
                started_at: unix_now(),
                completed_at: None,
                error: None,
            },
        );
        self.metrics.inc_migrations_started();
        info!(
            partition = %partition,
            migration = %id,
            source = %plan.source,
            destination = %plan.destination,
            "migration started"
        );

        let result = self
            .run_until_commit(id, &plan, &token, source.as_ref(), destination.as_ref(), owner.as_ref())
            .await;
        self.active.remove(&partition);

        match result {
            Ok(()) => {
                self.set_phase(id, MigrationPhase::Committed)?;
                self.metrics.inc_migrations_committed();
                info!(partition = %partition, migration = %id, "migration committed");
                Ok(id)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(partition = %partition, migration = %id, "migration failed, rolling back: {}", reason);
                self.rollback(id, &plan, source.as_ref(), destination.as_ref(), owner.as_ref())
                    .await;
                if let Some(mut record) = self.records.get_mut(&id) {
                    record.error = Some(reason.clone());
                }
                self.set_phase(id, MigrationPhase::RolledBack)?;
                self.metrics.inc_migrations_rolled_back();
                Err(GridError::MigrationFailed { partition, reason })
            }
        }
    }

    async fn run_until_commit(
        &self,
        id: Uuid,
        plan: &MigrationPlan,
        token: &CancellationToken,
        source: &dyn MigrationParticipant,
        destination: &dyn MigrationParticipant,
        owner: &dyn MigrationParticipant,
    ) -> Result<()> {
        let src_event = plan.event(id, MigrationPhase::Notified, MigrationEndpoint::Source);
        let dst_event = plan.event(id, MigrationPhase::Notified, MigrationEndpoint::Destination);
        source.before_migration(&src_event).await?;
        destination.before_migration(&dst_event).await?;

        self.set_phase(id, MigrationPhase::Replicating)?;
        let dst_event = plan.event(id, MigrationPhase::Replicating, MigrationEndpoint::Destination);

        let transfer = self.transfer(plan, &dst_event, source, destination, owner);
        tokio::select! {
            _ = token.cancelled() => {
                return Err(GridError::MigrationFailed {
                    partition: plan.partition,
                    reason: "cancelled".into(),
                });
            }
            outcome = tokio::time::timeout(self.timeout, transfer) => match outcome {
                Ok(result) => result?,
                Err(_) => {
                    return Err(GridError::MigrationFailed {
                        partition: plan.partition,
                        reason: format!("transfer timed out after {:?}", self.timeout),
                    });
                }
            },
        }

        // Past this point the migration can no longer be cancelled.
        self.active.remove(&plan.partition);

        let dst_commit = plan.event(id, MigrationPhase::Committed, MigrationEndpoint::Destination);
        destination
            .commit_migration(&dst_commit, plan.new_table.clone())
            .await?;
        let src_commit = plan.event(id, MigrationPhase::Committed, MigrationEndpoint::Source);
        if let Err(e) = source.commit_migration(&src_commit, plan.new_table.clone()).await {
            // The destination is already live; the source catches up through the table push.
            error!(partition = %plan.partition, migration = %id, "source commit failed: {}", e);
        }
        if owner.node_id() != plan.source {
            if let Err(e) = owner
                .finish_catch_up(plan.partition, plan.destination, Some(plan.new_table.clone()))
                .await
            {
                error!(partition = %plan.partition, migration = %id, "owner failed to end catch-up: {}", e);
            }
        }
        Ok(())
    }

    async fn transfer(
        &self,
        plan: &MigrationPlan,
        dst_event: &MigrationEvent,
        source: &dyn MigrationParticipant,
        destination: &dyn MigrationParticipant,
        owner: &dyn MigrationParticipant,
    ) -> Result<()> {
        let snapshot_seq = destination.replicate_partition(dst_event).await?;
        info!(
            partition = %plan.partition,
            sequence = snapshot_seq,
            "destination installed snapshot"
        );

        if !plan.transfers_ownership() {
            // every backup up to `committed` is queued once the owner reports it
            let committed = owner.partition_sequence(plan.partition).await?;
            owner.flush_backups(plan.partition, plan.destination).await?;
            let caught_up = destination.partition_sequence(plan.partition).await?;
            if caught_up < committed {
                return Err(GridError::MigrationFailed {
                    partition: plan.partition,
                    reason: format!(
                        "destination at sequence {} but owner committed {}",
                        caught_up, committed
                    ),
                });
            }
            return Ok(());
        }

        let fenced_at = source.fence_partition(plan.partition).await?;
        source.flush_backups(plan.partition, plan.destination).await?;
        let caught_up = destination.partition_sequence(plan.partition).await?;
        if caught_up != fenced_at {
            return Err(GridError::MigrationFailed {
                partition: plan.partition,
                reason: format!(
                    "destination at sequence {} but source fenced at {}",
                    caught_up, fenced_at
                ),
            });
        }
        Ok(())
    }

    async fn rollback(
        &self,
        id: Uuid,
        plan: &MigrationPlan,
        source: &dyn MigrationParticipant,
        destination: &dyn MigrationParticipant,
        owner: &dyn MigrationParticipant,
    ) {
        let dst_event = plan.event(id, MigrationPhase::RolledBack, MigrationEndpoint::Destination);
        if let Err(e) = destination.rollback_migration(&dst_event).await {
            error!(partition = %plan.partition, migration = %id, "destination rollback failed: {}", e);
        }
        let src_event = plan.event(id, MigrationPhase::RolledBack, MigrationEndpoint::Source);
        if let Err(e) = source.rollback_migration(&src_event).await {
            error!(partition = %plan.partition, migration = %id, "source rollback failed: {}", e);
        }
        if owner.node_id() != plan.source {
            if let Err(e) = owner
                .finish_catch_up(plan.partition, plan.destination, None)
                .await
            {
                error!(partition = %plan.partition, migration = %id, "owner failed to end catch-up: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Participant that records calls and can be told to fail or stall.
    struct ScriptedParticipant {
        id: NodeId,
        calls: Mutex<Vec<String>>,
        sequence: u64,
        fail_replicate: bool,
        stall_replicate: bool,
    }

    impl ScriptedParticipant {
        fn new(id: u64, sequence: u64) -> Self {
            Self {
                id: NodeId::new(id),
                calls: Mutex::new(Vec::new()),
                sequence,
                fail_replicate: false,
                stall_replicate: false,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl MigrationParticipant for ScriptedParticipant {
        fn node_id(&self) -> NodeId {
            self.id
        }

        async fn before_migration(&self, _event: &MigrationEvent) -> Result<()> {
            self.calls.lock().push("before".into());
            Ok(())
        }

        async fn replicate_partition(&self, event: &MigrationEvent) -> Result<u64> {
            self.calls.lock().push("replicate".into());
            if self.stall_replicate {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail_replicate {
                return Err(GridError::Transport {
                    msg: "source unreachable".into(),
                });
            }
            assert_eq!(event.endpoint, MigrationEndpoint::Destination);
            Ok(self.sequence)
        }

        async fn fence_partition(&self, _partition: PartitionId) -> Result<u64> {
            self.calls.lock().push("fence".into());
            Ok(self.sequence)
        }

        async fn flush_backups(&self, _partition: PartitionId, _target: NodeId) -> Result<()> {
            self.calls.lock().push("flush".into());
            Ok(())
        }

        async fn partition_sequence(&self, _partition: PartitionId) -> Result<u64> {
            self.calls.lock().push("sequence".into());
            Ok(self.sequence)
        }

        async fn commit_migration(&self, _event: &MigrationEvent, _table: Arc<PartitionTable>) -> Result<()> {
            self.calls.lock().push("commit".into());
            Ok(())
        }

        async fn rollback_migration(&self, _event: &MigrationEvent) -> Result<()> {
            self.calls.lock().push("rollback".into());
            Ok(())
        }

        async fn finish_catch_up(
            &self,
            _partition: PartitionId,
            _target: NodeId,
            table: Option<Arc<PartitionTable>>,
        ) -> Result<()> {
            let call = if table.is_some() { "finish" } else { "release" };
            self.calls.lock().push(call.into());
            Ok(())
        }
    }

    fn ownership_plan() -> MigrationPlan {
        let p7 = PartitionId::new(7);
        let current = PartitionTable::new(8)
            .with_replicas(p7, vec![NodeId::new(1), NodeId::new(2)])
            .unwrap();
        let next = current
            .with_replicas(p7, vec![NodeId::new(3), NodeId::new(2)])
            .unwrap();
        MigrationPlan::between(p7, NodeId::new(1), NodeId::new(3), &current, Arc::new(next)).unwrap()
    }

    fn coordinator(timeout: Duration) -> (MigrationCoordinator, Arc<GridMetrics>) {
        let metrics = Arc::new(GridMetrics::new());
        (MigrationCoordinator::new(timeout, metrics.clone()), metrics)
    }

    #[test]
    fn test_phase_transitions() {
        assert!(MigrationPhase::Notified.can_transition_to(MigrationPhase::Replicating));
        assert!(MigrationPhase::Notified.can_transition_to(MigrationPhase::RolledBack));
        assert!(!MigrationPhase::Notified.can_transition_to(MigrationPhase::Committed));
        assert!(MigrationPhase::Replicating.can_transition_to(MigrationPhase::Committed));
        assert!(!MigrationPhase::Committed.can_transition_to(MigrationPhase::RolledBack));
        assert!(!MigrationPhase::RolledBack.can_transition_to(MigrationPhase::Replicating));
    }

    #[test]
    fn test_plan_indices() {
        let plan = ownership_plan();
        assert_eq!(plan.source_current_index, Some(0));
        assert_eq!(plan.source_new_index, None);
        assert_eq!(plan.destination_current_index, None);
        assert_eq!(plan.destination_new_index, Some(0));
        assert!(plan.transfers_ownership());
        assert_eq!(plan.new_replicas(), vec![NodeId::new(3), NodeId::new(2)]);
    }

    #[test]
    fn test_plan_rejects_stale_table() {
        let p7 = PartitionId::new(7);
        let table = PartitionTable::new(8)
            .with_replicas(p7, vec![NodeId::new(1)])
            .unwrap();
        let err = MigrationPlan::between(p7, NodeId::new(1), NodeId::new(1), &table, Arc::new(table.clone()))
            .unwrap_err();
        assert!(matches!(err, GridError::MigrationFailed { .. }));
    }

    #[tokio::test]
    async fn test_ownership_transfer_commits_destination_first() {
        let (coordinator, metrics) = coordinator(Duration::from_secs(5));
        let source = Arc::new(ScriptedParticipant::new(1, 42));
        let destination = Arc::new(ScriptedParticipant::new(3, 42));

        let id = coordinator
            .migrate(ownership_plan(), source.clone(), destination.clone(), source.clone())
            .await
            .unwrap();

        assert_eq!(source.calls(), vec!["before", "fence", "flush", "commit"]);
        assert_eq!(destination.calls(), vec!["before", "replicate", "sequence", "commit"]);
        let record = coordinator.record(id).unwrap();
        assert_eq!(record.phase, MigrationPhase::Committed);
        assert!(record.completed_at.is_some());
        assert_eq!(metrics.snapshot().migrations_committed, 1);
        assert!(coordinator.active_migration(PartitionId::new(7)).is_none());
    }

    #[tokio::test]
    async fn test_lagging_destination_rolls_back() {
        let (coordinator, metrics) = coordinator(Duration::from_secs(5));
        let source = Arc::new(ScriptedParticipant::new(1, 43));
        let destination = Arc::new(ScriptedParticipant::new(3, 42));

        let err = coordinator
            .migrate(ownership_plan(), source.clone(), destination.clone(), source.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::MigrationFailed { .. }));
        assert!(source.calls().contains(&"rollback".to_string()));
        assert!(destination.calls().contains(&"rollback".to_string()));
        assert!(!destination.calls().contains(&"commit".to_string()));
        assert_eq!(metrics.snapshot().migrations_rolled_back, 1);
    }

    #[tokio::test]
    async fn test_replication_failure_rolls_back() {
        let (coordinator, _) = coordinator(Duration::from_secs(5));
        let source = Arc::new(ScriptedParticipant::new(1, 0));
        let mut destination = ScriptedParticipant::new(3, 0);
        destination.fail_replicate = true;
        let destination = Arc::new(destination);

        assert!(coordinator
            .migrate(ownership_plan(), source.clone(), destination.clone(), source.clone())
            .await
            .is_err());
        // never fenced, so nothing was parked
        assert!(!source.calls().contains(&"fence".to_string()));
        assert_eq!(source.calls().last().map(String::as_str), Some("rollback"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rolls_back() {
        let (coordinator, _) = coordinator(Duration::from_millis(100));
        let source = Arc::new(ScriptedParticipant::new(1, 0));
        let mut destination = ScriptedParticipant::new(3, 0);
        destination.stall_replicate = true;
        let destination = Arc::new(destination);

        let err = coordinator
            .migrate(ownership_plan(), source.clone(), destination.clone(), source)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(destination.calls().contains(&"rollback".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rolls_back() {
        let (coordinator, _) = coordinator(Duration::from_secs(3600));
        let coordinator = Arc::new(coordinator);
        let source = Arc::new(ScriptedParticipant::new(1, 0));
        let mut destination = ScriptedParticipant::new(3, 0);
        destination.stall_replicate = true;
        let destination = Arc::new(destination);

        let running = {
            let coordinator = coordinator.clone();
            let destination = destination.clone();
            tokio::spawn(async move {
                coordinator
                    .migrate(ownership_plan(), source.clone(), destination, source)
                    .await
            })
        };
        while coordinator.active_migration(PartitionId::new(7)).is_none() {
            tokio::task::yield_now().await;
        }
        assert!(coordinator.cancel(PartitionId::new(7)));
        let err = running.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(!coordinator.cancel(PartitionId::new(7)));
    }

    #[tokio::test]
    async fn test_cancel_involving_endpoint() {
        let (coordinator, _) = coordinator(Duration::from_secs(3600));
        let coordinator = Arc::new(coordinator);
        let source = Arc::new(ScriptedParticipant::new(1, 0));
        let mut destination = ScriptedParticipant::new(3, 0);
        destination.stall_replicate = true;
        let destination = Arc::new(destination);

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .migrate(ownership_plan(), source.clone(), destination, source)
                    .await
            })
        };
        while coordinator.active_migration(PartitionId::new(7)).is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.cancel_involving(NodeId::new(2)), 0);
        assert_eq!(coordinator.cancel_involving(NodeId::new(3)), 1);
        assert!(running.await.unwrap().is_err());
    }

    fn backup_move_plan() -> MigrationPlan {
        let p7 = PartitionId::new(7);
        let current = PartitionTable::new(8)
            .with_replicas(p7, vec![NodeId::new(1), NodeId::new(2)])
            .unwrap();
        let next = current
            .with_replicas(p7, vec![NodeId::new(1), NodeId::new(3)])
            .unwrap();
        MigrationPlan::between(p7, NodeId::new(2), NodeId::new(3), &current, Arc::new(next)).unwrap()
    }

    #[tokio::test]
    async fn test_backup_move_catches_up_from_owner() {
        let plan = backup_move_plan();
        assert!(!plan.transfers_ownership());
        assert_eq!(plan.owner, NodeId::new(1));

        let (coordinator, _) = coordinator(Duration::from_secs(5));
        let owner = Arc::new(ScriptedParticipant::new(1, 5));
        let source = Arc::new(ScriptedParticipant::new(2, 5));
        let destination = Arc::new(ScriptedParticipant::new(3, 5));
        coordinator
            .migrate(plan, source.clone(), destination.clone(), owner.clone())
            .await
            .unwrap();
        assert_eq!(owner.calls(), vec!["sequence", "flush", "finish"]);
        assert_eq!(source.calls(), vec!["before", "commit"]);
        assert_eq!(destination.calls(), vec!["before", "replicate", "sequence", "commit"]);
    }

    #[tokio::test]
    async fn test_backup_move_behind_owner_rolls_back() {
        let (coordinator, _) = coordinator(Duration::from_secs(5));
        let owner = Arc::new(ScriptedParticipant::new(1, 9));
        let source = Arc::new(ScriptedParticipant::new(2, 9));
        let destination = Arc::new(ScriptedParticipant::new(3, 6));
        let err = coordinator
            .migrate(backup_move_plan(), source.clone(), destination.clone(), owner.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("owner committed 9"));
        assert_eq!(owner.calls().last().map(String::as_str), Some("release"));
        assert!(destination.calls().contains(&"rollback".to_string()));
        assert!(!source.calls().contains(&"commit".to_string()));
    }

    #[tokio::test]
    async fn test_wrong_owner_is_refused() {
        let (coordinator, _) = coordinator(Duration::from_secs(5));
        let source = Arc::new(ScriptedParticipant::new(2, 0));
        let destination = Arc::new(ScriptedParticipant::new(3, 0));
        let err = coordinator
            .migrate(backup_move_plan(), source.clone(), destination.clone(), source.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::MigrationFailed { .. }));
        assert!(destination.calls().is_empty());
    }
}
