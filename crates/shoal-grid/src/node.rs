//! A grid member: invocation dispatch, replica handling and migration endpoints.
//!
//! [`GridNode`] owns the partition workers and wires the pieces together. A
//! primary operation passes the quorum gate, runs on its partition's worker,
//! and hands the resulting backup to the [`BackupReplicator`]; the caller's
//! response is released according to the backup mode. The same node receives
//! backups and snapshot requests as a [`MessageHandler`] and takes part in
//! migrations as a [`MigrationParticipant`].

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{GridConfig, ObjectConfig, QuorumConfig};
use crate::container::Container;
use crate::error::{GridError, Result};
use crate::executor::PartitionExecutor;
use crate::membership::MembershipView;
use crate::metrics::{GridMetrics, MetricsSnapshot, ReplicationObserver};
use crate::migration::{MigrationEndpoint, MigrationEvent, MigrationParticipant};
use crate::operation::{Operation, Response};
use crate::partition::{Invocation, PartitionState, PrimaryOutcome, ReceiveOutcome};
use crate::partition_table::{PartitionResolver, PartitionTable};
use crate::quorum::{QuorumGate, QuorumPredicate};
use crate::replication::{BackupAck, BackupEnvelope, BackupMode, BackupReplicator};
use crate::transport::{MessageHandler, PartitionSnapshot, SnapshotRequest, Transport};
use crate::types::{NodeId, ObjectId, PartitionId, ReplicaIndex};

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvocationOptions {
    /// Backup mode; defaults to sync when the object has sync backups.
    pub backup_mode: Option<BackupMode>,
}

impl InvocationOptions {
    /// Forces `mode` for this call.
    pub fn with_mode(mode: BackupMode) -> Self {
        Self {
            backup_mode: Some(mode),
        }
    }
}

/// One member of the grid.
pub struct GridNode {
    id: NodeId,
    me: Weak<GridNode>,
    config: RwLock<Arc<GridConfig>>,
    table: RwLock<Arc<PartitionTable>>,
    membership: RwLock<Arc<MembershipView>>,
    resolver: PartitionResolver,
    executor: PartitionExecutor,
    replicator: BackupReplicator,
    quorum: QuorumGate,
    transport: Arc<dyn Transport>,
    metrics: Arc<GridMetrics>,
    observer: Arc<dyn ReplicationObserver>,
}

impl GridNode {
    /// Starts a node with an empty partition table and a membership of itself.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        id: NodeId,
        config: GridConfig,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn ReplicationObserver>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = Arc::new(GridMetrics::new());
        let executor = PartitionExecutor::start(config.worker_count, config.partition_count);
        let replicator = BackupReplicator::new(
            id,
            transport.clone(),
            config.backup_ack_timeout(),
            config.unreachable_threshold,
            metrics.clone(),
            observer.clone(),
        );
        let resolver = PartitionResolver::new(config.partition_count);
        let table = PartitionTable::new(config.partition_count);

        info!(
            node = %id,
            partitions = config.partition_count,
            workers = config.worker_count,
            "grid node started"
        );
        Ok(Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            config: RwLock::new(Arc::new(config)),
            table: RwLock::new(Arc::new(table)),
            membership: RwLock::new(Arc::new(MembershipView::new(id))),
            resolver,
            executor,
            replicator,
            quorum: QuorumGate::new(),
            transport,
            metrics,
            observer,
        }))
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current configuration.
    pub fn config(&self) -> Arc<GridConfig> {
        self.config.read().clone()
    }

    /// Current configuration and the quorum cache generation it belongs to.
    fn config_snapshot(&self) -> (Arc<GridConfig>, u64) {
        let config = self.config.read();
        (config.clone(), self.quorum.generation())
    }

    /// Current partition table.
    pub fn partition_table(&self) -> Arc<PartitionTable> {
        self.table.read().clone()
    }

    /// Current membership view.
    pub fn membership(&self) -> Arc<MembershipView> {
        self.membership.read().clone()
    }

    /// Maps keys to partitions.
    pub fn resolver(&self) -> &PartitionResolver {
        &self.resolver
    }

    /// Quorum policy cache.
    pub fn quorum_gate(&self) -> &QuorumGate {
        &self.quorum
    }

    /// Point-in-time copy of the node's counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shared handle to the node's counters.
    pub fn metrics_handle(&self) -> Arc<GridMetrics> {
        self.metrics.clone()
    }

    /// Partition `operation` on `object` is routed to.
    pub fn partition_for(&self, object: &ObjectId, operation: &Operation) -> PartitionId {
        self.resolver
            .partition_for_key(operation.partition_key(object))
    }

    // ---- invocation ----

    /// Runs `operation` on `object` with default options.
    pub async fn invoke(&self, object: ObjectId, operation: Operation) -> Result<Response> {
        self.invoke_with(object, operation, InvocationOptions::default())
            .await
    }

    /// Runs `operation` on `object`, resolving the partition from its key.
    pub async fn invoke_with(
        &self,
        object: ObjectId,
        operation: Operation,
        options: InvocationOptions,
    ) -> Result<Response> {
        let partition = self.partition_for(&object, &operation);
        self.dispatch_with(partition, object, operation, options)
            .await
    }

    /// Runs `operation` on an explicit partition.
    pub async fn dispatch(
        &self,
        partition: PartitionId,
        object: ObjectId,
        operation: Operation,
    ) -> Result<Response> {
        self.dispatch_with(partition, object, operation, InvocationOptions::default())
            .await
    }

    /// Runs `operation` on an explicit partition with per-call options.
    ///
    /// Fails with `QuorumNotMet` before touching the partition if the object's
    /// policy is absent, and with `NotOwner` if this node is not the primary.
    /// A sync backup that misses its deadline is reported to the observer but
    /// does not fail the call.
    pub async fn dispatch_with(
        &self,
        partition: PartitionId,
        object: ObjectId,
        operation: Operation,
        options: InvocationOptions,
    ) -> Result<Response> {
        if operation.kind() != object.kind {
            return Err(GridError::WrongObjectKind {
                expected: operation.kind(),
                actual: object.kind,
            });
        }

        let (config, generation) = self.config_snapshot();
        let view = self.membership();
        if let Err(e) = self
            .quorum
            .check_at(generation, &object.name, operation.scope(), &view, &config)
        {
            if matches!(e, GridError::QuorumNotMet { .. }) {
                self.metrics.inc_quorum_rejections();
            }
            return Err(e);
        }

        let mode = options.backup_mode.unwrap_or_else(|| {
            if config.object_config(&object.name).backup_count > 0 {
                BackupMode::Sync
            } else {
                BackupMode::Async
            }
        });

        let (reply, rx) = oneshot::channel();
        let invocation = Invocation {
            object,
            operation,
            mode,
            reply,
        };
        let node = self.me.clone();
        self.executor.submit(partition, move |state| match node.upgrade() {
            Some(node) => node.run_primary(state, invocation),
            None => invocation.respond(Err(GridError::Shutdown)),
        })?;

        let outcome = rx.await.map_err(|_| GridError::Shutdown)?;
        let PrimaryOutcome { response, waiter } = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                match &e {
                    GridError::NotOwner { owner, .. } => {
                        self.metrics.inc_not_owner_redirects();
                        debug!(partition = %partition, owner = ?owner, "not the partition owner");
                    }
                    _ => self.metrics.inc_operations_failed(),
                }
                return Err(e);
            }
        };

        if let Some(waiter) = waiter {
            if let Err(GridError::BackupTimeout {
                partition,
                sequence,
                acked,
                required,
            }) = waiter.wait(config.backup_ack_timeout()).await
            {
                self.metrics.inc_backup_timeouts();
                self.observer
                    .on_backup_timeout(partition, sequence, acked, required);
            }
        }
        Ok(response)
    }

    /// Runs an invocation on the partition worker, or parks it behind a fence.
    fn run_primary(&self, state: &mut PartitionState, invocation: Invocation) {
        let partition = state.id();
        let table = self.partition_table();
        if table.owner(partition) != Some(self.id) {
            let owner = table.owner(partition);
            invocation.respond(Err(GridError::NotOwner { partition, owner }));
            return;
        }
        if let Some(parked) = state.fence.as_mut() {
            debug!(partition = %partition, "partition fenced, parking {}", invocation.operation.name());
            parked.push(invocation);
            return;
        }
        let outcome = self.execute_primary(
            state,
            &table,
            &invocation.object,
            &invocation.operation,
            invocation.mode,
        );
        invocation.respond(outcome);
    }

    fn execute_primary(
        &self,
        state: &mut PartitionState,
        table: &PartitionTable,
        object: &ObjectId,
        operation: &Operation,
        mode: BackupMode,
    ) -> Result<PrimaryOutcome> {
        let partition = state.id();
        let config = self.config();
        let object_config = config.object_config(&object.name);
        let total_backups = object_config.total_backup_count();

        let slot = state
            .arena
            .get_or_create(object, total_backups, object_config.max_size);
        let run = operation.run(object, &mut slot.container)?;
        self.metrics.inc_operations_executed();

        let backup = match run.backup {
            Some(backup) => backup,
            None => {
                return Ok(PrimaryOutcome {
                    response: run.response,
                    waiter: None,
                })
            }
        };

        let sequence = state.next_sequence();
        let table_backups = table.backups(partition);
        let mut targets: Vec<NodeId> = table_backups.to_vec();
        for target in &state.catch_up_targets {
            if *target != self.id && !targets.contains(target) {
                targets.push(*target);
            }
        }
        if targets.is_empty() {
            return Ok(PrimaryOutcome {
                response: run.response,
                waiter: None,
            });
        }

        let sync_count = match mode {
            BackupMode::Sync => object_config.backup_count.min(table_backups.len()),
            BackupMode::Async => 0,
        };
        let required = config.ack_policy.required(sync_count);
        let envelope = BackupEnvelope {
            partition,
            sequence,
            origin: self.id,
            object: object.clone(),
            backup_count: total_backups,
            max_size: object_config.max_size,
            operation: backup,
        };
        let waiter = self
            .replicator
            .replicate(envelope, &targets, sync_count, required);
        Ok(PrimaryOutcome {
            response: run.response,
            waiter,
        })
    }

    // ---- replica side ----

    async fn handle_backup(&self, envelope: BackupEnvelope) -> Result<BackupAck> {
        let node = self.me.clone();
        self.executor
            .execute(envelope.partition, move |state| match node.upgrade() {
                Some(node) => node.receive_backup(state, envelope),
                None => BackupAck::Rejected,
            })
            .await
    }

    fn receive_backup(&self, state: &mut PartitionState, envelope: BackupEnvelope) -> BackupAck {
        let partition = envelope.partition;
        let origin = envelope.origin;
        let table = self.partition_table();
        let index = match (state.pending_index, table.replica_index(partition, self.id)) {
            (Some(pending), _) => pending,
            (None, Some(index)) if index > 0 => index,
            (None, _) => {
                debug!(partition = %partition, origin = %origin, "backup for a partition without a local replica");
                return BackupAck::Rejected;
            }
        };

        match state.receive_backup(envelope, index) {
            Ok(ReceiveOutcome::Applied) => {
                self.metrics.inc_backups_applied();
                BackupAck::Applied
            }
            Ok(ReceiveOutcome::Duplicate) => {
                self.metrics.inc_duplicate_backups();
                BackupAck::Duplicate
            }
            Ok(ReceiveOutcome::Buffered) => BackupAck::Buffered,
            Ok(ReceiveOutcome::Gap { expected, received }) => {
                self.metrics.inc_sequence_gaps();
                self.observer
                    .on_resync_requested(partition, expected, received);
                // a migrating destination is verified by the coordinator instead
                if state.pending_index.is_none() {
                    self.spawn_resync(partition, origin, index);
                }
                BackupAck::ResyncRequested
            }
            Err(e) => {
                warn!(partition = %partition, origin = %origin, "failed to apply backup: {}", e);
                BackupAck::Rejected
            }
        }
    }

    fn spawn_resync(&self, partition: PartitionId, from: NodeId, index: ReplicaIndex) {
        if let Some(node) = self.me.upgrade() {
            tokio::spawn(async move { node.resync(partition, from, index).await });
        }
    }

    async fn resync(&self, partition: PartitionId, from: NodeId, index: ReplicaIndex) {
        let request = SnapshotRequest {
            partition,
            replica_index: index,
            requester: self.id,
            catch_up: false,
        };
        let timeout = self.config().migration_timeout();
        let pulled = match tokio::time::timeout(timeout, self.transport.request_snapshot(from, request)).await {
            Ok(result) => result,
            Err(_) => Err(GridError::Timeout(format!(
                "snapshot of partition {} from {}",
                partition, from
            ))),
        };

        let node = self.me.clone();
        let submitted = match pulled {
            Ok(snapshot) => self.executor.submit(partition, move |state| {
                if let Some(node) = node.upgrade() {
                    node.install_resync_snapshot(state, snapshot, from, index);
                }
            }),
            Err(e) => {
                warn!(partition = %partition, from = %from, "resync snapshot pull failed: {}", e);
                self.executor
                    .submit(partition, |state| state.abandon_snapshot_wait())
            }
        };
        if let Err(e) = submitted {
            debug!(partition = %partition, "dropping resync result: {}", e);
        }
    }

    fn install_resync_snapshot(
        &self,
        state: &mut PartitionState,
        snapshot: PartitionSnapshot,
        from: NodeId,
        index: ReplicaIndex,
    ) {
        let partition = state.id();
        if !state.awaiting_snapshot() || state.pending_index.is_some() {
            debug!(partition = %partition, "discarding stale resync snapshot");
            return;
        }
        match state.install_snapshot(snapshot, index) {
            Ok(None) => {
                self.metrics.inc_resyncs();
                self.metrics.inc_snapshots_applied();
                info!(partition = %partition, from = %from, sequence = state.sequence, "replica resynchronized");
            }
            Ok(Some((expected, received))) => {
                self.metrics.inc_snapshots_applied();
                self.metrics.inc_sequence_gaps();
                self.observer
                    .on_resync_requested(partition, expected, received);
                self.spawn_resync(partition, from, index);
            }
            Err(e) => {
                warn!(partition = %partition, "failed to install resync snapshot: {}", e);
                state.abandon_snapshot_wait();
            }
        }
    }

    async fn handle_snapshot_request(&self, request: SnapshotRequest) -> Result<PartitionSnapshot> {
        let node = self.me.clone();
        self.executor
            .execute(request.partition, move |state| match node.upgrade() {
                Some(node) => node.serve_snapshot(state, request),
                None => Err(GridError::Shutdown),
            })
            .await?
    }

    fn serve_snapshot(&self, state: &mut PartitionState, request: SnapshotRequest) -> Result<PartitionSnapshot> {
        let partition = request.partition;
        let table = self.partition_table();
        let local_index = table.replica_index(partition, self.id);
        let allowed = if request.catch_up {
            local_index == Some(0)
        } else {
            local_index.is_some()
        };
        if !allowed {
            return Err(GridError::NotOwner {
                partition,
                owner: table.owner(partition),
            });
        }

        let snapshot = state.snapshot(request.replica_index)?;
        if request.catch_up {
            state.catch_up_targets.insert(request.requester);
        }
        self.metrics.inc_snapshots_served();
        debug!(
            partition = %partition,
            requester = %request.requester,
            sequence = snapshot.sequence,
            containers = snapshot.containers.len(),
            "served partition snapshot"
        );
        Ok(snapshot)
    }

    // ---- cluster state ----

    /// Installs a newer partition table and reconciles local replicas.
    ///
    /// Returns false if `table` is not newer than the current one. Partitions
    /// whose local replica index changed drop state the new index no longer
    /// covers; a promoted backup keeps its sequence and continues from it.
    pub fn apply_partition_table(&self, table: Arc<PartitionTable>) -> Result<bool> {
        let partition_count = self.executor.partition_count();
        if table.partition_count() != partition_count {
            return Err(GridError::Config(format!(
                "partition table has {} partitions, node serves {}",
                table.partition_count(),
                partition_count
            )));
        }

        let previous = {
            let mut current = self.table.write();
            if table.version() <= current.version() {
                return Ok(false);
            }
            std::mem::replace(&mut *current, table.clone())
        };

        let remaining = table.members();
        for gone in previous.members().difference(&remaining) {
            self.replicator.retire_node(*gone);
        }

        let mut changed = 0;
        for p in 0..partition_count {
            let partition = PartitionId::new(p);
            let before = previous.replica_index(partition, self.id);
            let after = table.replica_index(partition, self.id);
            if before == after {
                continue;
            }
            changed += 1;
            self.executor
                .submit(partition, move |state| reconcile_replica(state, before, after))?;
        }
        info!(
            node = %self.id,
            version = table.version(),
            changed_partitions = changed,
            "installed partition table"
        );
        Ok(true)
    }

    /// Installs a newer membership view. Returns false for stale views.
    pub fn apply_membership_view(&self, view: Arc<MembershipView>) -> bool {
        let mut current = self.membership.write();
        if view.version() <= current.version() {
            return false;
        }
        debug!(
            node = %self.id,
            version = view.version(),
            reachable = view.reachable_count(),
            "installed membership view"
        );
        *current = view;
        true
    }

    /// Adds or replaces an object's settings and drops its cached quorum policy.
    pub fn update_object_config(&self, object: ObjectConfig) -> Result<()> {
        let name = object.name.clone();
        let mut config = self.config.write();
        let mut updated = (**config).clone();
        updated.upsert_object(object);
        updated.validate()?;
        *config = Arc::new(updated);
        if name.contains('*') {
            self.quorum.invalidate_all();
        } else {
            self.quorum.invalidate(&name);
        }
        Ok(())
    }

    /// Adds or replaces a quorum declaration.
    pub fn update_quorum_config(&self, quorum: QuorumConfig) -> Result<()> {
        let mut config = self.config.write();
        let mut updated = (**config).clone();
        updated.upsert_quorum(quorum);
        updated.validate()?;
        *config = Arc::new(updated);
        self.quorum.invalidate_all();
        Ok(())
    }

    /// Registers the predicate behind a quorum declared without a member count.
    pub fn register_quorum_predicate(&self, quorum: impl Into<String>, predicate: QuorumPredicate) {
        self.quorum.register_predicate(quorum, predicate);
    }

    /// Drops `object`'s containers from every local partition.
    ///
    /// The next operation on the same name starts from empty state and a
    /// freshly resolved quorum policy. Returns the number of containers removed.
    pub async fn destroy_object(&self, object: &ObjectId) -> Result<usize> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for p in 0..self.executor.partition_count() {
            let tx = tx.clone();
            let object = object.clone();
            self.executor.submit(PartitionId::new(p), move |state| {
                let _ = tx.send(state.arena.remove(&object));
            })?;
        }
        drop(tx);

        let mut removed = 0;
        while let Some(was_present) = rx.recv().await {
            if was_present {
                removed += 1;
            }
        }
        self.quorum.invalidate(&object.name);
        info!(node = %self.id, object = %object, removed, "destroyed object");
        Ok(removed)
    }

    // ---- inspection ----

    /// Copy of the local container of `object` in `partition`.
    pub async fn local_container(
        &self,
        partition: PartitionId,
        object: &ObjectId,
    ) -> Result<Option<Container>> {
        let object = object.clone();
        self.executor
            .execute(partition, move |state| {
                state.arena.get(&object).map(|slot| slot.container.clone())
            })
            .await
    }

    /// Last committed or applied backup sequence of `partition`.
    pub async fn sequence(&self, partition: PartitionId) -> Result<u64> {
        self.executor
            .execute(partition, |state| state.sequence)
            .await
    }

    /// Names of objects with local state in `partition`.
    pub async fn local_objects(&self, partition: PartitionId) -> Result<BTreeSet<ObjectId>> {
        self.executor
            .execute(partition, |state| state.arena.object_ids().cloned().collect())
            .await
    }

    async fn snapshot_from_replicas(
        &self,
        partition: PartitionId,
        skip: NodeId,
        index: ReplicaIndex,
    ) -> Result<PartitionSnapshot> {
        let table = self.partition_table();
        let view = self.membership();
        let candidates: Vec<NodeId> = table
            .replicas(partition)?
            .nodes()
            .iter()
            .copied()
            .filter(|n| *n != skip && *n != self.id && view.is_reachable(*n))
            .collect();

        for candidate in candidates {
            let request = SnapshotRequest {
                partition,
                replica_index: index,
                requester: self.id,
                catch_up: false,
            };
            match self.transport.request_snapshot(candidate, request).await {
                Ok(snapshot) => {
                    info!(partition = %partition, replica = %candidate, "copied partition from replica");
                    return Ok(snapshot);
                }
                Err(e) => debug!(partition = %partition, replica = %candidate, "replica snapshot failed: {}", e),
            }
        }
        Err(GridError::MigrationFailed {
            partition,
            reason: "no reachable replica to copy from".into(),
        })
    }
}

/// Adjusts a partition's local state after its replica index changed.
fn reconcile_replica(
    state: &mut PartitionState,
    before: Option<ReplicaIndex>,
    after: Option<ReplicaIndex>,
) {
    // a migration in progress owns this partition's state until it ends
    if state.pending_index.is_some() {
        return;
    }
    let partition = state.id();
    match after {
        None => {
            let removed = state.clear_beyond(None);
            state.catch_up_targets.clear();
            debug!(partition = %partition, removed, "dropped replica");
        }
        Some(0) => {
            if state.awaiting_snapshot() {
                state.abandon_snapshot_wait();
            }
            debug!(partition = %partition, ?before, sequence = state.sequence, "promoted to owner");
        }
        Some(index) => {
            let removed = state.clear_beyond(Some(index));
            state.catch_up_targets.clear();
            debug!(partition = %partition, ?before, index, removed, "replica index changed");
        }
    }
}

#[async_trait]
impl MessageHandler for GridNode {
    async fn on_backup(&self, envelope: BackupEnvelope) -> Result<BackupAck> {
        self.handle_backup(envelope).await
    }

    async fn on_snapshot_request(&self, request: SnapshotRequest) -> Result<PartitionSnapshot> {
        self.handle_snapshot_request(request).await
    }
}

#[async_trait]
impl MigrationParticipant for GridNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn before_migration(&self, event: &MigrationEvent) -> Result<()> {
        info!(
            node = %self.id,
            partition = %event.partition,
            migration = %event.id,
            endpoint = ?event.endpoint,
            "migration starting"
        );
        if event.endpoint == MigrationEndpoint::Destination {
            let pending = event.new_replica_index;
            self.executor
                .execute(event.partition, move |state| {
                    state.pending_index = pending;
                    state.begin_snapshot_wait();
                })
                .await?;
        }
        Ok(())
    }

    async fn replicate_partition(&self, event: &MigrationEvent) -> Result<u64> {
        let partition = event.partition;
        let index = event.new_replica_index.ok_or_else(|| GridError::MigrationFailed {
            partition,
            reason: "destination has no target replica index".into(),
        })?;

        // the owner streams every later backup to a catch-up requester
        let owner = self.partition_table().owner(partition).unwrap_or(event.peer);
        let request = SnapshotRequest {
            partition,
            replica_index: index,
            requester: self.id,
            catch_up: true,
        };
        let snapshot = match self.transport.request_snapshot(owner, request).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(partition = %partition, owner = %owner, "owner snapshot failed, trying replicas: {}", e);
                self.snapshot_from_replicas(partition, owner, index)
                    .await?
            }
        };

        let sequence = self
            .executor
            .execute(partition, move |state| -> Result<u64> {
                match state.install_snapshot(snapshot, index)? {
                    None => Ok(state.sequence),
                    Some((expected, received)) => Err(GridError::SequenceGap {
                        partition,
                        expected,
                        received,
                    }),
                }
            })
            .await??;
        self.metrics.inc_snapshots_applied();
        info!(partition = %partition, sequence, "partition copied");
        Ok(sequence)
    }

    async fn fence_partition(&self, partition: PartitionId) -> Result<u64> {
        self.executor
            .execute(partition, |state| {
                if state.fence.is_none() {
                    state.fence = Some(Vec::new());
                }
                state.sequence
            })
            .await
    }

    async fn flush_backups(&self, partition: PartitionId, target: NodeId) -> Result<()> {
        self.replicator.flush(partition, target).await
    }

    async fn partition_sequence(&self, partition: PartitionId) -> Result<u64> {
        self.executor
            .execute(partition, move |state| {
                if state.awaiting_snapshot() {
                    return Err(GridError::IllegalState {
                        msg: format!("partition {} is still awaiting a snapshot", partition),
                    });
                }
                Ok(state.sequence)
            })
            .await?
    }

    async fn commit_migration(&self, event: &MigrationEvent, table: Arc<PartitionTable>) -> Result<()> {
        let partition = event.partition;
        let endpoint = event.endpoint;
        let peer = event.peer;
        let new_index = event.new_replica_index;
        let owner = table.owner(partition);
        self.apply_partition_table(table)?;

        self.executor
            .execute(partition, move |state| {
                state.pending_index = None;
                if endpoint == MigrationEndpoint::Source {
                    state.catch_up_targets.remove(&peer);
                    for parked in state.unfence() {
                        parked.respond(Err(GridError::NotOwner { partition, owner }));
                    }
                    state.clear_beyond(new_index);
                }
            })
            .await?;
        info!(node = %self.id, partition = %partition, migration = %event.id, endpoint = ?endpoint, "migration committed locally");
        Ok(())
    }

    async fn rollback_migration(&self, event: &MigrationEvent) -> Result<()> {
        let partition = event.partition;
        let endpoint = event.endpoint;
        let peer = event.peer;
        let current = event.current_replica_index;
        let node = self.me.clone();

        self.executor
            .execute(partition, move |state| match endpoint {
                MigrationEndpoint::Destination => {
                    state.pending_index = None;
                    state.abandon_snapshot_wait();
                    state.clear_beyond(current);
                }
                MigrationEndpoint::Source => {
                    state.catch_up_targets.remove(&peer);
                    let parked = state.unfence();
                    match node.upgrade() {
                        Some(node) => {
                            for invocation in parked {
                                node.run_primary(state, invocation);
                            }
                        }
                        None => {
                            for invocation in parked {
                                invocation.respond(Err(GridError::Shutdown));
                            }
                        }
                    }
                }
            })
            .await?;
        info!(node = %self.id, partition = %partition, migration = %event.id, endpoint = ?endpoint, "migration rolled back locally");
        Ok(())
    }

    async fn finish_catch_up(
        &self,
        partition: PartitionId,
        target: NodeId,
        table: Option<Arc<PartitionTable>>,
    ) -> Result<()> {
        if let Some(table) = table {
            self.apply_partition_table(table)?;
        }
        self.executor
            .execute(partition, move |state| {
                state.catch_up_targets.remove(&target);
            })
            .await?;
        debug!(node = %self.id, partition = %partition, target = %target, "catch-up ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AckPolicy;
    use crate::metrics::LoggingObserver;
    use crate::operation::CounterOp;
    use crate::transport::LocalNetwork;

    fn config() -> GridConfig {
        GridConfig {
            partition_count: 8,
            worker_count: 2,
            backup_ack_timeout_ms: 500,
            ack_policy: AckPolicy::All,
            ..GridConfig::default()
        }
    }

    fn start(network: &Arc<LocalNetwork>, id: u64) -> Arc<GridNode> {
        let node_id = NodeId::new(id);
        let node = GridNode::start(
            node_id,
            config(),
            network.transport(node_id),
            Arc::new(LoggingObserver),
        )
        .unwrap();
        let handler: Weak<dyn MessageHandler> = Arc::downgrade(&node) as Weak<dyn MessageHandler>;
        network.register(node_id, handler);
        node
    }

    fn table(assignment: &[u64]) -> Arc<PartitionTable> {
        let replicas: Vec<NodeId> = assignment.iter().map(|n| NodeId::new(*n)).collect();
        Arc::new(PartitionTable::from_assignments(1, vec![replicas; 8]).unwrap())
    }

    #[tokio::test]
    async fn test_not_owner_is_rejected() {
        let network = LocalNetwork::new();
        let node = start(&network, 1);
        node.apply_partition_table(table(&[2, 1])).unwrap();

        let err = node
            .dispatch(
                PartitionId::new(3),
                ObjectId::counter("ctr"),
                Operation::Counter(CounterOp::Get),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GridError::NotOwner {
                owner: Some(owner),
                ..
            } if owner == NodeId::new(2)
        ));
        assert_eq!(node.metrics().not_owner_redirects, 1);
    }

    #[tokio::test]
    async fn test_wrong_kind_rejected_before_dispatch() {
        let network = LocalNetwork::new();
        let node = start(&network, 1);
        node.apply_partition_table(table(&[1])).unwrap();
        let err = node
            .invoke(ObjectId::map("m"), Operation::Counter(CounterOp::Get))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::WrongObjectKind { .. }));
    }

    #[tokio::test]
    async fn test_owner_replicates_to_backup() {
        let network = LocalNetwork::new();
        let a = start(&network, 1);
        let b = start(&network, 2);
        let t = table(&[1, 2]);
        a.apply_partition_table(t.clone()).unwrap();
        b.apply_partition_table(t).unwrap();

        let object = ObjectId::counter("ctr");
        let partition = PartitionId::new(2);
        let response = a
            .dispatch(partition, object.clone(), Operation::Counter(CounterOp::AddAndGet(5)))
            .await
            .unwrap();
        assert_eq!(response, Response::Long(5));

        // the default mode is sync, so the backup landed before the response
        match b.local_container(partition, &object).await.unwrap() {
            Some(Container::Counter(c)) => assert_eq!(c.get(), 5),
            other => panic!("unexpected backup state: {:?}", other),
        }
        assert_eq!(b.sequence(partition).await.unwrap(), 1);
        assert_eq!(a.metrics().backups_acked, 1);
    }

    #[tokio::test]
    async fn test_reads_do_not_advance_sequence() {
        let network = LocalNetwork::new();
        let a = start(&network, 1);
        a.apply_partition_table(table(&[1])).unwrap();
        let partition = PartitionId::new(4);
        a.dispatch(partition, ObjectId::counter("c"), Operation::Counter(CounterOp::Get))
            .await
            .unwrap();
        assert_eq!(a.sequence(partition).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backup_for_unknown_partition_is_rejected() {
        let network = LocalNetwork::new();
        let node = start(&network, 1);
        node.apply_partition_table(table(&[3, 4])).unwrap();
        let ack = node
            .on_backup(BackupEnvelope {
                partition: PartitionId::new(1),
                sequence: 1,
                origin: NodeId::new(3),
                object: ObjectId::counter("ctr"),
                backup_count: 1,
                max_size: None,
                operation: crate::operation::BackupOperation::CounterSet(1),
            })
            .await
            .unwrap();
        assert_eq!(ack, BackupAck::Rejected);
    }

    #[tokio::test]
    async fn test_stale_table_and_view_are_ignored() {
        let network = LocalNetwork::new();
        let node = start(&network, 1);
        assert!(node.apply_partition_table(table(&[1])).unwrap());
        assert!(!node.apply_partition_table(table(&[1])).unwrap());

        let view = Arc::new(MembershipView::with_alive(NodeId::new(1), 3, &[NodeId::new(1)]));
        assert!(node.apply_membership_view(view.clone()));
        assert!(!node.apply_membership_view(view));
    }

    #[tokio::test]
    async fn test_mismatched_partition_count_rejected() {
        let network = LocalNetwork::new();
        let node = start(&network, 1);
        let wrong = Arc::new(PartitionTable::from_assignments(1, vec![vec![NodeId::new(1)]; 4]).unwrap());
        assert!(matches!(
            node.apply_partition_table(wrong),
            Err(GridError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_fenced_partition_parks_then_redirects_on_commit() {
        let network = LocalNetwork::new();
        let a = start(&network, 1);
        a.apply_partition_table(table(&[1])).unwrap();
        let partition = PartitionId::new(0);
        a.fence_partition(partition).await.unwrap();

        let node = a.clone();
        let pending = tokio::spawn(async move {
            node.dispatch(partition, ObjectId::counter("c"), Operation::Counter(CounterOp::AddAndGet(1)))
                .await
        });
        tokio::task::yield_now().await;

        let moved = Arc::new(
            PartitionTable::from_assignments(2, vec![vec![NodeId::new(2)]; 8]).unwrap(),
        );
        let event = MigrationEvent {
            id: uuid::Uuid::new_v4(),
            phase: crate::migration::MigrationPhase::Committed,
            partition,
            endpoint: MigrationEndpoint::Source,
            peer: NodeId::new(2),
            current_replica_index: Some(0),
            new_replica_index: None,
        };
        a.commit_migration(&event, moved).await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, GridError::NotOwner { owner: Some(o), .. } if o == NodeId::new(2)));
    }

    #[tokio::test]
    async fn test_rollback_reruns_parked_operations() {
        let network = LocalNetwork::new();
        let a = start(&network, 1);
        a.apply_partition_table(table(&[1])).unwrap();
        let partition = PartitionId::new(6);
        a.fence_partition(partition).await.unwrap();

        let node = a.clone();
        let pending = tokio::spawn(async move {
            node.dispatch(partition, ObjectId::counter("c"), Operation::Counter(CounterOp::AddAndGet(4)))
                .await
        });
        tokio::task::yield_now().await;

        let event = MigrationEvent {
            id: uuid::Uuid::new_v4(),
            phase: crate::migration::MigrationPhase::RolledBack,
            partition,
            endpoint: MigrationEndpoint::Source,
            peer: NodeId::new(2),
            current_replica_index: Some(0),
            new_replica_index: None,
        };
        a.rollback_migration(&event).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), Response::Long(4));
        assert_eq!(a.sequence(partition).await.unwrap(), 1);
    }
}
