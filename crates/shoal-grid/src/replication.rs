//! Primary-to-backup replication.
//!
//! Every committed mutation is stamped with the partition's next sequence
//! number and pushed onto one ordered channel per (partition, replica). A
//! dedicated task drains each channel, so backups reach a replica in commit
//! order while the partition worker moves on. Callers in sync mode hold an
//! [`AckWaiter`] that resolves once enough sync replicas acknowledged.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{GridError, Result};
use crate::metrics::{GridMetrics, ReplicationObserver};
use crate::operation::BackupOperation;
use crate::transport::Transport;
use crate::types::{NodeId, ObjectId, PartitionId};

/// Whether the caller's response waits for backup acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupMode {
    /// Release the response after enough sync replicas acknowledged, or the timeout.
    Sync,
    /// Release the response immediately; backups are best effort.
    Async,
}

/// A backup operation on its way to one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEnvelope {
    /// Partition the backup belongs to.
    pub partition: PartitionId,
    /// Per-partition sequence number of the primary commit.
    pub sequence: u64,
    /// Node that ran the primary operation.
    pub origin: NodeId,
    /// Target object.
    pub object: ObjectId,
    /// Object's total backup count; replicas beyond it only advance the sequence.
    pub backup_count: usize,
    /// Object's container bound, used if the replica creates the container.
    pub max_size: Option<usize>,
    /// Operation replaying the primary's result.
    pub operation: BackupOperation,
}

/// How a replica handled a backup envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupAck {
    /// Applied in sequence.
    Applied,
    /// Already applied earlier; discarded.
    Duplicate,
    /// Held until an in-progress snapshot lands.
    Buffered,
    /// A gap was detected; the replica is pulling a snapshot.
    ResyncRequested,
    /// The receiver holds no replica of the partition.
    Rejected,
}

impl BackupAck {
    /// Returns true if the backup is (or will be) reflected on the replica.
    pub fn is_delivered(&self) -> bool {
        matches!(self, BackupAck::Applied | BackupAck::Duplicate | BackupAck::Buffered)
    }
}

enum ChannelMessage {
    Backup {
        envelope: BackupEnvelope,
        ack: Option<mpsc::UnboundedSender<bool>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Collects acknowledgements from the sync replicas of one commit.
pub struct AckWaiter {
    partition: PartitionId,
    sequence: u64,
    expected: usize,
    required: usize,
    rx: mpsc::UnboundedReceiver<bool>,
}

impl AckWaiter {
    /// Partition of the commit being waited on.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Sequence of the commit being waited on.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of acks that release the caller.
    pub fn required(&self) -> usize {
        self.required
    }

    /// Waits until `required` replicas acknowledged.
    ///
    /// Fails with `BackupTimeout` when the deadline passes or every sync
    /// replica answered without enough of them delivering.
    pub async fn wait(mut self, timeout: Duration) -> Result<usize> {
        if self.required == 0 {
            return Ok(0);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let mut acked = 0;
        let mut answered = 0;
        while answered < self.expected {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(delivered)) => {
                    answered += 1;
                    if delivered {
                        acked += 1;
                        if acked >= self.required {
                            return Ok(acked);
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        Err(GridError::BackupTimeout {
            partition: self.partition,
            sequence: self.sequence,
            acked,
            required: self.required,
        })
    }
}

/// Shared state of the per-channel sender tasks.
struct SenderContext {
    transport: Arc<dyn Transport>,
    ack_timeout: Duration,
    unreachable_threshold: u32,
    failures: DashMap<NodeId, u32>,
    metrics: Arc<GridMetrics>,
    observer: Arc<dyn ReplicationObserver>,
}

impl SenderContext {
    async fn deliver(&self, target: NodeId, envelope: BackupEnvelope) -> bool {
        let partition = envelope.partition;
        let sequence = envelope.sequence;
        let send = self.transport.send_backup(target, envelope);
        let reachable_ack = match tokio::time::timeout(self.ack_timeout, send).await {
            Ok(Ok(ack)) => Some(ack),
            Ok(Err(e)) => {
                debug!(partition = %partition, sequence, target = %target, "backup send failed: {}", e);
                None
            }
            Err(_) => {
                debug!(partition = %partition, sequence, target = %target, "backup send timed out");
                None
            }
        };

        match reachable_ack {
            Some(ack) => {
                self.failures.remove(&target);
                if ack.is_delivered() {
                    self.metrics.inc_backups_acked();
                }
                trace!(partition = %partition, sequence, target = %target, ?ack, "backup acknowledged");
                ack.is_delivered()
            }
            None => {
                let failures = {
                    let mut entry = self.failures.entry(target).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if failures == self.unreachable_threshold {
                    self.observer.on_replica_unreachable(partition, target, failures);
                }
                false
            }
        }
    }
}

async fn run_channel(
    target: NodeId,
    ctx: Arc<SenderContext>,
    mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            ChannelMessage::Backup { envelope, ack } => {
                let delivered = ctx.deliver(target, envelope).await;
                if let Some(ack) = ack {
                    let _ = ack.send(delivered);
                }
            }
            ChannelMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Fans committed backups out to replicas over ordered channels.
pub struct BackupReplicator {
    local: NodeId,
    ctx: Arc<SenderContext>,
    channels: DashMap<(PartitionId, NodeId), mpsc::UnboundedSender<ChannelMessage>>,
}

impl BackupReplicator {
    /// Creates a replicator sending as `local`.
    pub fn new(
        local: NodeId,
        transport: Arc<dyn Transport>,
        ack_timeout: Duration,
        unreachable_threshold: u32,
        metrics: Arc<GridMetrics>,
        observer: Arc<dyn ReplicationObserver>,
    ) -> Self {
        Self {
            local,
            ctx: Arc::new(SenderContext {
                transport,
                ack_timeout,
                unreachable_threshold: unreachable_threshold.max(1),
                failures: DashMap::new(),
                metrics,
                observer,
            }),
            channels: DashMap::new(),
        }
    }

    /// Node this replicator sends as.
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Consecutive failed sends to `node`.
    pub fn consecutive_failures(&self, node: NodeId) -> u32 {
        self.ctx.failures.get(&node).map(|f| *f).unwrap_or(0)
    }

    fn channel(&self, partition: PartitionId, target: NodeId) -> mpsc::UnboundedSender<ChannelMessage> {
        self.channels
            .entry((partition, target))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_channel(target, self.ctx.clone(), rx));
                tx
            })
            .clone()
    }

    /// Queues `envelope` for every target in replica-index order.
    ///
    /// The first `sync_count` targets are sync replicas; the returned waiter
    /// resolves once `required` of them acknowledged. Never blocks.
    pub fn replicate(
        &self,
        envelope: BackupEnvelope,
        targets: &[NodeId],
        sync_count: usize,
        required: usize,
    ) -> Option<AckWaiter> {
        let sync_count = sync_count.min(targets.len());
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        for (i, target) in targets.iter().enumerate() {
            let ack = if i < sync_count { Some(ack_tx.clone()) } else { None };
            let message = ChannelMessage::Backup {
                envelope: envelope.clone(),
                ack,
            };
            if self.channel(envelope.partition, *target).send(message).is_err() {
                debug!(partition = %envelope.partition, target = %target, "backup channel closed");
            }
        }
        self.ctx.metrics.add_backups_sent(targets.len() as u64);
        drop(ack_tx);

        if sync_count == 0 {
            return None;
        }
        Some(AckWaiter {
            partition: envelope.partition,
            sequence: envelope.sequence,
            expected: sync_count,
            required: required.min(sync_count),
            rx: ack_rx,
        })
    }

    /// Resolves once everything queued for `target` on `partition` was sent.
    pub async fn flush(&self, partition: PartitionId, target: NodeId) -> Result<()> {
        let sender = match self.channels.get(&(partition, target)) {
            Some(sender) => sender.clone(),
            None => return Ok(()),
        };
        let (done_tx, done_rx) = oneshot::channel();
        if sender.send(ChannelMessage::Flush(done_tx)).is_err() {
            return Ok(());
        }
        done_rx.await.map_err(|_| GridError::Shutdown)
    }

    /// Closes every channel to `node`; queued backups still drain.
    pub fn retire_node(&self, node: NodeId) {
        self.channels.retain(|(_, target), _| *target != node);
        self.ctx.failures.remove(&node);
    }
}
