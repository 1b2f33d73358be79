//! In-process cluster of grid nodes.
//!
//! [`LocalCluster`] plays the roles an external membership service and
//! partition master would: it assigns partitions, pushes tables and views to
//! every node, and drives migrations through a [`MigrationCoordinator`].
//! Nodes talk over a shared [`LocalNetwork`], so links can be cut to produce
//! split-brain scenarios.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{GridConfig, ObjectConfig};
use crate::error::{GridError, Result};
use crate::membership::MembershipView;
use crate::metrics::{GridMetrics, LoggingObserver, ReplicationObserver};
use crate::migration::{MigrationCoordinator, MigrationParticipant, MigrationPlan};
use crate::node::GridNode;
use crate::operation::{Operation, Response};
use crate::partition_table::{PartitionAssigner, PartitionTable};
use crate::transport::{LocalNetwork, MessageHandler};
use crate::types::{NodeId, ObjectId, PartitionId, MAX_BACKUP_COUNT};

/// A set of nodes sharing one in-process network.
pub struct LocalCluster {
    config: RwLock<GridConfig>,
    network: Arc<LocalNetwork>,
    observer: Arc<dyn ReplicationObserver>,
    nodes: RwLock<BTreeMap<NodeId, Arc<GridNode>>>,
    table: RwLock<Arc<PartitionTable>>,
    view_version: AtomicU64,
    next_id: AtomicU64,
    coordinator: MigrationCoordinator,
    migration_lock: tokio::sync::Mutex<()>,
}

impl LocalCluster {
    /// Starts `size` nodes and distributes partitions over them.
    pub fn start(size: usize, config: GridConfig) -> Result<Self> {
        Self::with_observer(size, config, Arc::new(LoggingObserver))
    }

    /// Same as [`LocalCluster::start`] with a custom replication observer.
    pub fn with_observer(
        size: usize,
        config: GridConfig,
        observer: Arc<dyn ReplicationObserver>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(GridError::Config("a cluster needs at least one node".into()));
        }
        config.validate()?;
        let coordinator =
            MigrationCoordinator::new(config.migration_timeout(), Arc::new(GridMetrics::new()));
        let partition_count = config.partition_count;
        let cluster = Self {
            table: RwLock::new(Arc::new(PartitionTable::new(partition_count))),
            config: RwLock::new(config),
            network: LocalNetwork::new(),
            observer,
            nodes: RwLock::new(BTreeMap::new()),
            view_version: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            coordinator,
            migration_lock: tokio::sync::Mutex::new(()),
        };

        let mut ids = Vec::with_capacity(size);
        for _ in 0..size {
            ids.push(cluster.spawn_node()?.id());
        }
        let table = PartitionAssigner::distribute(
            partition_count,
            &ids,
            cluster.replica_backups(),
        )?;
        cluster.push_table(Arc::new(table))?;
        cluster.push_membership();
        info!(nodes = size, partitions = partition_count, "local cluster started");
        Ok(cluster)
    }

    /// Backups per partition: the highest total backup count any object asks for.
    fn replica_backups(&self) -> usize {
        self.config
            .read()
            .objects
            .iter()
            .map(ObjectConfig::total_backup_count)
            .max()
            .unwrap_or(1)
            .clamp(1, MAX_BACKUP_COUNT)
    }

    fn spawn_node(&self) -> Result<Arc<GridNode>> {
        let id = NodeId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let node = GridNode::start(
            id,
            self.config.read().clone(),
            self.network.transport(id),
            self.observer.clone(),
        )?;
        let handler: Weak<dyn MessageHandler> = Arc::downgrade(&node) as Weak<dyn MessageHandler>;
        self.network.register(id, handler);
        self.nodes.write().insert(id, node.clone());
        Ok(node)
    }

    /// Shared in-process network.
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Migration coordinator.
    pub fn coordinator(&self) -> &MigrationCoordinator {
        &self.coordinator
    }

    /// Node with `id`, if it is a member.
    pub fn node(&self, id: NodeId) -> Option<Arc<GridNode>> {
        self.nodes.read().get(&id).cloned()
    }

    /// All members in id order.
    pub fn nodes(&self) -> Vec<Arc<GridNode>> {
        self.nodes.read().values().cloned().collect()
    }

    /// Member ids in order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().keys().copied().collect()
    }

    /// Authoritative partition table.
    pub fn partition_table(&self) -> Arc<PartitionTable> {
        self.table.read().clone()
    }

    /// Current owner of `partition`.
    pub fn owner_of(&self, partition: PartitionId) -> Result<Arc<GridNode>> {
        let table = self.partition_table();
        table
            .owner(partition)
            .and_then(|owner| self.node(owner))
            .ok_or(GridError::NotOwner {
                partition,
                owner: None,
            })
    }

    /// Routes an operation to its partition owner, following one redirect.
    pub async fn invoke(&self, object: ObjectId, operation: Operation) -> Result<Response> {
        let any = self
            .nodes()
            .into_iter()
            .next()
            .ok_or_else(|| GridError::IllegalState {
                msg: "cluster has no members".into(),
            })?;
        let partition = any.partition_for(&object, &operation);

        let owner = self.owner_of(partition)?;
        match owner.dispatch(partition, object.clone(), operation.clone()).await {
            Err(GridError::NotOwner {
                owner: Some(hint), ..
            }) => {
                let redirected = self.node(hint).ok_or(GridError::NotOwner {
                    partition,
                    owner: Some(hint),
                })?;
                redirected.dispatch(partition, object, operation).await
            }
            other => other,
        }
    }

    /// Makes `table` authoritative and installs it on every member.
    pub fn push_table(&self, table: Arc<PartitionTable>) -> Result<()> {
        *self.table.write() = table.clone();
        for node in self.nodes() {
            node.apply_partition_table(table.clone())?;
        }
        Ok(())
    }

    /// Gives every member a view in which all members are alive.
    pub fn push_membership(&self) {
        let ids = self.node_ids();
        self.push_views(&[ids]);
    }

    /// Gives each node a view containing only the nodes of its own group.
    fn push_views(&self, groups: &[Vec<NodeId>]) {
        let version = self.view_version.fetch_add(1, Ordering::SeqCst) + 1;
        for group in groups {
            for id in group {
                if let Some(node) = self.node(*id) {
                    node.apply_membership_view(Arc::new(MembershipView::with_alive(
                        *id, version, group,
                    )));
                }
            }
        }
    }

    /// Splits the network in two: `side` and everyone else.
    ///
    /// Links across the split are cut and each side's members only see their
    /// own side as reachable. Partition ownership is left untouched.
    pub fn split(&self, side: &[NodeId]) {
        let side: BTreeSet<NodeId> = side.iter().copied().collect();
        let (a, b): (Vec<NodeId>, Vec<NodeId>) =
            self.node_ids().into_iter().partition(|id| side.contains(id));
        for x in &a {
            for y in &b {
                self.network.block_link(*x, *y);
            }
        }
        for id in &a {
            self.coordinator.cancel_involving(*id);
        }
        warn!(side_a = ?a, side_b = ?b, "network split");
        self.push_views(&[a, b]);
    }

    /// Restores every link and the full membership view.
    pub fn heal(&self) {
        self.network.heal();
        self.push_membership();
        info!("network healed");
    }

    /// Starts a new member. It holds no replicas until a migration moves one to it.
    pub fn add_node(&self) -> Result<Arc<GridNode>> {
        let node = self.spawn_node()?;
        node.apply_partition_table(self.partition_table())?;
        self.push_membership();
        info!(node = %node.id(), "node joined");
        Ok(node)
    }

    /// Removes a member abruptly; its replicas shift down and backups get promoted.
    pub fn remove_node(&self, id: NodeId) -> Result<()> {
        let removed = self.nodes.write().remove(&id);
        if removed.is_none() {
            return Err(GridError::IllegalState {
                msg: format!("{} is not a member", id),
            });
        }
        self.network.unregister(id);
        self.coordinator.cancel_involving(id);
        let table = self.partition_table().without_member(id);
        self.push_table(Arc::new(table))?;
        self.push_membership();
        info!(node = %id, "node removed");
        Ok(())
    }

    /// Moves `from`'s replica of `partition` to `to`, keeping its replica index.
    ///
    /// Moving the owner's replica transfers ownership. On success the new
    /// table is pushed to every member.
    pub async fn move_replica(&self, partition: PartitionId, from: NodeId, to: NodeId) -> Result<Uuid> {
        let _serialized = self.migration_lock.lock().await;
        let current = self.partition_table();
        let mut replicas = current.replicas(partition)?.nodes().to_vec();
        let slot = replicas
            .iter()
            .position(|n| *n == from)
            .ok_or_else(|| GridError::InvalidReplicaSet {
                partition,
                msg: format!("{} holds no replica", from),
            })?;
        replicas[slot] = to;
        let new_table = Arc::new(current.with_replicas(partition, replicas)?);
        self.migrate(partition, from, to, new_table).await
    }

    async fn migrate(
        &self,
        partition: PartitionId,
        source: NodeId,
        destination: NodeId,
        new_table: Arc<PartitionTable>,
    ) -> Result<Uuid> {
        let current = self.partition_table();
        let plan = MigrationPlan::between(partition, source, destination, &current, new_table.clone())?;
        let source_node = self.node(source).ok_or_else(|| GridError::IllegalState {
            msg: format!("{} is not a member", source),
        })?;
        let destination_node = self.node(destination).ok_or_else(|| GridError::IllegalState {
            msg: format!("{} is not a member", destination),
        })?;
        let owner_node = self.node(plan.owner).ok_or_else(|| GridError::IllegalState {
            msg: format!("owner {} is not a member", plan.owner),
        })?;

        let id = self
            .coordinator
            .migrate(
                plan,
                source_node as Arc<dyn MigrationParticipant>,
                destination_node as Arc<dyn MigrationParticipant>,
                owner_node as Arc<dyn MigrationParticipant>,
            )
            .await?;
        self.push_table(new_table)?;
        Ok(id)
    }

    /// Adds or replaces an object's settings on every member and on nodes added later.
    pub fn update_object_config(&self, object: ObjectConfig) -> Result<()> {
        {
            let mut config = self.config.write();
            let mut updated = config.clone();
            updated.upsert_object(object.clone());
            updated.validate()?;
            *config = updated;
        }
        for node in self.nodes() {
            node.update_object_config(object.clone())?;
        }
        Ok(())
    }

    /// Destroys `object` on every member. Returns containers removed cluster-wide.
    pub async fn destroy_object(&self, object: &ObjectId) -> Result<usize> {
        let mut removed = 0;
        for node in self.nodes() {
            removed += node.destroy_object(object).await?;
        }
        Ok(removed)
    }
}
