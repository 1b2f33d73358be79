//! State a partition worker keeps for one partition.
//!
//! Everything here is touched only from the worker that owns the partition,
//! so none of it is synchronized. The replica-side sequence discipline lives
//! here: in-order backups apply, old ones are discarded, and a gap switches
//! the partition into "awaiting snapshot" mode until a full copy lands.

use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::oneshot;

use crate::container::ContainerArena;
use crate::error::{GridError, Result};
use crate::operation::{Operation, Response};
use crate::replication::{AckWaiter, BackupEnvelope, BackupMode};
use crate::transport::PartitionSnapshot;
use crate::types::{NodeId, ObjectId, PartitionId, ReplicaIndex};

/// What the primary run hands back to the dispatching caller.
pub struct PrimaryOutcome {
    /// Value for the caller.
    pub response: Response,
    /// Sync acknowledgement tracker, when the caller must wait for backups.
    pub waiter: Option<AckWaiter>,
}

/// A primary operation waiting for, or undergoing, execution.
pub struct Invocation {
    /// Target object.
    pub object: ObjectId,
    /// Operation to run.
    pub operation: Operation,
    /// Backup delivery mode chosen for this call.
    pub mode: BackupMode,
    /// Where the outcome goes.
    pub reply: oneshot::Sender<Result<PrimaryOutcome>>,
}

impl Invocation {
    /// Completes the invocation; a caller that gave up is ignored.
    pub fn respond(self, outcome: Result<PrimaryOutcome>) {
        let _ = self.reply.send(outcome);
    }
}

/// Whether the replica applies backups as they come.
#[derive(Debug, Default)]
pub enum SyncState {
    /// Backups apply in sequence.
    #[default]
    Live,
    /// A snapshot is being pulled; backups are held until it lands.
    AwaitingSnapshot {
        /// Envelopes received meanwhile, keyed by sequence.
        buffered: BTreeMap<u64, BackupEnvelope>,
    },
}

/// How [`PartitionState::receive_backup`] handled an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Applied, or sequence advanced for a replica beyond the object's backup count.
    Applied,
    /// At or below the last applied sequence.
    Duplicate,
    /// Held until the pending snapshot lands.
    Buffered,
    /// Not the next sequence; the partition now awaits a snapshot.
    Gap {
        /// Sequence the replica expected.
        expected: u64,
        /// Sequence that arrived.
        received: u64,
    },
}

/// Per-partition state owned by one worker.
pub struct PartitionState {
    id: PartitionId,
    /// Object containers.
    pub arena: ContainerArena,
    /// Last committed (primary) or applied (replica) backup sequence.
    pub sequence: u64,
    /// Replica sync mode.
    pub sync: SyncState,
    /// Operations parked while a migration fences the partition.
    pub fence: Option<Vec<Invocation>>,
    /// Migration destinations receiving backups before they appear in the table.
    pub catch_up_targets: BTreeSet<NodeId>,
    /// Replica index this node is catching up to during a migration.
    pub pending_index: Option<ReplicaIndex>,
    /// Primary that produced the last applied backup.
    last_origin: Option<NodeId>,
}

impl PartitionState {
    /// Creates empty state for `id`.
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            arena: ContainerArena::new(),
            sequence: 0,
            sync: SyncState::Live,
            fence: None,
            catch_up_targets: BTreeSet::new(),
            pending_index: None,
            last_origin: None,
        }
    }

    /// Partition id.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Returns true while primary operations are being parked.
    pub fn is_fenced(&self) -> bool {
        self.fence.is_some()
    }

    /// Returns true while a snapshot is expected.
    pub fn awaiting_snapshot(&self) -> bool {
        matches!(self.sync, SyncState::AwaitingSnapshot { .. })
    }

    /// Starts buffering backups until a snapshot is installed.
    pub fn begin_snapshot_wait(&mut self) {
        if !self.awaiting_snapshot() {
            self.sync = SyncState::AwaitingSnapshot {
                buffered: BTreeMap::new(),
            };
        }
    }

    /// Stops waiting for a snapshot and drops anything buffered.
    pub fn abandon_snapshot_wait(&mut self) {
        self.sync = SyncState::Live;
    }

    /// Stamps the next primary commit.
    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Handles one backup envelope as the replica at `replica_index`.
    pub fn receive_backup(
        &mut self,
        envelope: BackupEnvelope,
        replica_index: ReplicaIndex,
    ) -> Result<ReceiveOutcome> {
        if let SyncState::AwaitingSnapshot { buffered } = &mut self.sync {
            buffered.insert(envelope.sequence, envelope);
            return Ok(ReceiveOutcome::Buffered);
        }

        let expected = self.sequence + 1;
        // an older sequence from a different primary means the histories diverged
        let diverged = envelope.sequence < expected
            && self.last_origin.map_or(false, |origin| origin != envelope.origin);
        if envelope.sequence < expected && !diverged {
            return Ok(ReceiveOutcome::Duplicate);
        }
        if envelope.sequence != expected {
            let received = envelope.sequence;
            let mut buffered = BTreeMap::new();
            buffered.insert(received, envelope);
            self.sync = SyncState::AwaitingSnapshot { buffered };
            return Ok(ReceiveOutcome::Gap { expected, received });
        }

        self.apply_in_sequence(envelope, replica_index)?;
        Ok(ReceiveOutcome::Applied)
    }

    fn apply_in_sequence(&mut self, envelope: BackupEnvelope, replica_index: ReplicaIndex) -> Result<()> {
        if replica_index <= envelope.backup_count {
            let slot = self
                .arena
                .get_or_create(&envelope.object, envelope.backup_count, envelope.max_size);
            envelope.operation.apply(&mut slot.container)?;
        }
        self.sequence = envelope.sequence;
        self.last_origin = Some(envelope.origin);
        Ok(())
    }

    /// Builds a snapshot for a replica at `replica_index`.
    pub fn snapshot(&self, replica_index: ReplicaIndex) -> Result<PartitionSnapshot> {
        if self.awaiting_snapshot() {
            return Err(GridError::IllegalState {
                msg: format!("partition {} is itself awaiting a snapshot", self.id),
            });
        }
        Ok(PartitionSnapshot {
            partition: self.id,
            sequence: self.sequence,
            containers: self.arena.snapshot(replica_index),
        })
    }

    /// Installs a snapshot and replays buffered backups past it.
    ///
    /// Returns `Some((expected, received))` if the buffer has a hole after the
    /// snapshot, in which case the partition keeps awaiting a snapshot.
    pub fn install_snapshot(
        &mut self,
        snapshot: PartitionSnapshot,
        replica_index: ReplicaIndex,
    ) -> Result<Option<(u64, u64)>> {
        let buffered = match std::mem::take(&mut self.sync) {
            SyncState::AwaitingSnapshot { buffered } => buffered,
            SyncState::Live => BTreeMap::new(),
        };
        let base = snapshot.sequence;
        self.arena.replace(snapshot.containers);
        self.sequence = base;
        self.last_origin = None;

        let mut pending = buffered.into_iter().filter(|(seq, _)| *seq > base);
        while let Some((seq, envelope)) = pending.next() {
            if seq != self.sequence + 1 {
                let expected = self.sequence + 1;
                let mut rest: BTreeMap<u64, BackupEnvelope> = BTreeMap::new();
                rest.insert(seq, envelope);
                rest.extend(pending);
                self.sync = SyncState::AwaitingSnapshot { buffered: rest };
                return Ok(Some((expected, seq)));
            }
            self.apply_in_sequence(envelope, replica_index)?;
        }
        Ok(None)
    }

    /// Drops containers a replica at `replica_index` no longer needs.
    ///
    /// `None` means the node holds no replica: all state and the sequence go.
    pub fn clear_beyond(&mut self, replica_index: Option<ReplicaIndex>) -> usize {
        let removed = self.arena.clear_beyond(replica_index);
        if replica_index.is_none() {
            self.sequence = 0;
            self.sync = SyncState::Live;
            self.last_origin = None;
        }
        removed
    }

    /// Takes the parked invocations and lifts the fence.
    pub fn unfence(&mut self) -> Vec<Invocation> {
        self.fence.take().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::BackupOperation;

    fn envelope(sequence: u64, value: i64, backup_count: usize) -> BackupEnvelope {
        envelope_from(NodeId::new(1), sequence, value, backup_count)
    }

    fn envelope_from(origin: NodeId, sequence: u64, value: i64, backup_count: usize) -> BackupEnvelope {
        BackupEnvelope {
            partition: PartitionId::new(5),
            sequence,
            origin,
            object: ObjectId::counter("ctr"),
            backup_count,
            max_size: None,
            operation: BackupOperation::CounterSet(value),
        }
    }

    fn counter_value(state: &PartitionState) -> Option<i64> {
        state
            .arena
            .get(&ObjectId::counter("ctr"))
            .map(|slot| match &slot.container {
                crate::container::Container::Counter(c) => c.get(),
                _ => panic!("not a counter"),
            })
    }

    #[test]
    fn test_in_order_backups_apply() {
        let mut state = PartitionState::new(PartitionId::new(5));
        assert_eq!(
            state.receive_backup(envelope(1, 1, 1), 1).unwrap(),
            ReceiveOutcome::Applied
        );
        assert_eq!(
            state.receive_backup(envelope(2, 2, 1), 1).unwrap(),
            ReceiveOutcome::Applied
        );
        assert_eq!(state.sequence, 2);
        assert_eq!(counter_value(&state), Some(2));
    }

    #[test]
    fn test_duplicate_is_discarded() {
        let mut state = PartitionState::new(PartitionId::new(5));
        state.receive_backup(envelope(1, 1, 1), 1).unwrap();
        assert_eq!(
            state.receive_backup(envelope(1, 9, 1), 1).unwrap(),
            ReceiveOutcome::Duplicate
        );
        assert_eq!(counter_value(&state), Some(1));
    }

    #[test]
    fn test_older_sequence_from_new_primary_is_a_gap() {
        let mut state = PartitionState::new(PartitionId::new(5));
        state.receive_backup(envelope(1, 1, 1), 1).unwrap();
        state.receive_backup(envelope(2, 2, 1), 1).unwrap();
        let outcome = state
            .receive_backup(envelope_from(NodeId::new(2), 2, 5, 1), 1)
            .unwrap();
        assert_eq!(
            outcome,
            ReceiveOutcome::Gap {
                expected: 3,
                received: 2
            }
        );
        assert_eq!(counter_value(&state), Some(2));
    }

    #[test]
    fn test_gap_requests_resync_without_applying() {
        let mut state = PartitionState::new(PartitionId::new(5));
        state.receive_backup(envelope(1, 1, 1), 1).unwrap();
        let outcome = state.receive_backup(envelope(3, 3, 1), 1).unwrap();
        assert_eq!(
            outcome,
            ReceiveOutcome::Gap {
                expected: 2,
                received: 3
            }
        );
        assert_eq!(state.sequence, 1);
        assert_eq!(counter_value(&state), Some(1));
        assert!(state.awaiting_snapshot());

        // later backups are held, not applied
        assert_eq!(
            state.receive_backup(envelope(4, 4, 1), 1).unwrap(),
            ReceiveOutcome::Buffered
        );
        assert_eq!(counter_value(&state), Some(1));
    }

    #[test]
    fn test_snapshot_install_replays_buffer() {
        let mut primary = PartitionState::new(PartitionId::new(5));
        primary
            .arena
            .get_or_create(&ObjectId::counter("ctr"), 1, None)
            .container
            .counter_mut()
            .unwrap()
            .set(3);
        primary.sequence = 3;
        let snapshot = primary.snapshot(1).unwrap();

        let mut replica = PartitionState::new(PartitionId::new(5));
        replica.receive_backup(envelope(1, 1, 1), 1).unwrap();
        replica.receive_backup(envelope(3, 3, 1), 1).unwrap();
        replica.receive_backup(envelope(4, 4, 1), 1).unwrap();

        assert_eq!(replica.install_snapshot(snapshot, 1).unwrap(), None);
        assert_eq!(replica.sequence, 4);
        assert_eq!(counter_value(&replica), Some(4));
        assert!(!replica.awaiting_snapshot());
    }

    #[test]
    fn test_snapshot_install_keeps_waiting_on_hole() {
        let mut replica = PartitionState::new(PartitionId::new(5));
        replica.begin_snapshot_wait();
        replica.receive_backup(envelope(7, 7, 1), 1).unwrap();

        let snapshot = PartitionSnapshot {
            partition: PartitionId::new(5),
            sequence: 5,
            containers: Vec::new(),
        };
        assert_eq!(replica.install_snapshot(snapshot, 1).unwrap(), Some((6, 7)));
        assert!(replica.awaiting_snapshot());
    }

    #[test]
    fn test_replica_beyond_backup_count_only_advances_sequence() {
        let mut state = PartitionState::new(PartitionId::new(5));
        state.receive_backup(envelope(1, 1, 1), 2).unwrap();
        assert_eq!(state.sequence, 1);
        assert!(state.arena.is_empty());
    }

    #[test]
    fn test_clear_beyond_none_resets_sequence() {
        let mut state = PartitionState::new(PartitionId::new(5));
        state.receive_backup(envelope(1, 1, 1), 1).unwrap();
        assert_eq!(state.clear_beyond(Some(1)), 0);
        assert_eq!(state.clear_beyond(None), 1);
        assert_eq!(state.sequence, 0);
    }

    #[test]
    fn test_awaiting_partition_refuses_to_serve_snapshot() {
        let mut state = PartitionState::new(PartitionId::new(5));
        state.begin_snapshot_wait();
        assert!(state.snapshot(1).is_err());
        state.abandon_snapshot_wait();
        assert!(state.snapshot(1).is_ok());
    }
}
