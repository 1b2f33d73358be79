//! Per-partition execution queues.
//!
//! Partitions are spread over a fixed set of worker tasks (`partition % workers`).
//! A worker drains its queue one task at a time and owns the [`PartitionState`]
//! of every partition mapped to it, so tasks for one partition never overlap
//! while different workers run in parallel. Tasks are synchronous closures:
//! anything that waits on the network is spawned elsewhere.

use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{GridError, Result};
use crate::partition::PartitionState;
use crate::types::PartitionId;

type Task = Box<dyn FnOnce(&mut PartitionState) + Send>;

struct Job {
    partition: PartitionId,
    task: Task,
}

/// Fixed pool of partition workers.
pub struct PartitionExecutor {
    workers: Vec<mpsc::UnboundedSender<Job>>,
    partition_count: u32,
}

impl PartitionExecutor {
    /// Spawns `worker_count` workers serving `partition_count` partitions.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(worker_count: usize, partition_count: u32) -> Self {
        let worker_count = worker_count.max(1);
        let workers = (0..worker_count)
            .map(|index| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_worker(index, rx));
                tx
            })
            .collect();
        Self {
            workers,
            partition_count,
        }
    }

    /// Number of partitions served.
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Worker index serving `partition`.
    pub fn worker_for(&self, partition: PartitionId) -> usize {
        partition.index() % self.workers.len()
    }

    /// Queues `task` behind everything already submitted for the partition.
    pub fn submit<F>(&self, partition: PartitionId, task: F) -> Result<()>
    where
        F: FnOnce(&mut PartitionState) + Send + 'static,
    {
        if partition.as_u32() >= self.partition_count {
            return Err(GridError::InvalidPartition(partition));
        }
        let job = Job {
            partition,
            task: Box::new(task),
        };
        self.workers[self.worker_for(partition)]
            .send(job)
            .map_err(|_| GridError::Shutdown)
    }

    /// Runs `task` on the partition's worker and returns its result.
    pub async fn execute<F, T>(&self, partition: PartitionId, task: F) -> Result<T>
    where
        F: FnOnce(&mut PartitionState) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(partition, move |state| {
            let _ = tx.send(task(state));
        })?;
        rx.await.map_err(|_| GridError::Shutdown)
    }
}

async fn run_worker(index: usize, mut rx: mpsc::UnboundedReceiver<Job>) {
    let mut partitions: HashMap<PartitionId, PartitionState> = HashMap::new();
    while let Some(job) = rx.recv().await {
        trace!(worker = index, partition = %job.partition, "running partition task");
        let state = partitions
            .entry(job.partition)
            .or_insert_with(|| PartitionState::new(job.partition));
        (job.task)(state);
    }
    debug!(worker = index, "partition worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_execute_returns_value() {
        let executor = PartitionExecutor::start(2, 8);
        let seq = executor
            .execute(PartitionId::new(3), |state| state.next_sequence())
            .await
            .unwrap();
        assert_eq!(seq, 1);
        let seq = executor
            .execute(PartitionId::new(3), |state| state.next_sequence())
            .await
            .unwrap();
        assert_eq!(seq, 2);
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let executor = PartitionExecutor::start(2, 8);
        executor
            .execute(PartitionId::new(1), |state| state.next_sequence())
            .await
            .unwrap();
        let seq = executor
            .execute(PartitionId::new(3), |state| state.sequence)
            .await
            .unwrap();
        assert_eq!(seq, 0);
    }

    #[tokio::test]
    async fn test_invalid_partition_rejected() {
        let executor = PartitionExecutor::start(1, 4);
        let err = executor
            .execute(PartitionId::new(4), |_| ())
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::InvalidPartition(_)));
    }

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let executor = Arc::new(PartitionExecutor::start(4, 16));
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..100u64 {
            let tx = tx.clone();
            executor
                .submit(PartitionId::new(7), move |state| {
                    state.next_sequence();
                    let _ = tx.send((i, state.sequence));
                })
                .unwrap();
        }
        drop(tx);
        let mut seen = Vec::new();
        while let Some(entry) = rx.recv().await {
            seen.push(entry);
        }
        let expected: Vec<(u64, u64)> = (0..100).map(|i| (i, i + 1)).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_worker_never_overlaps() {
        let executor = Arc::new(PartitionExecutor::start(2, 4));
        let busy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let executor = executor.clone();
            let busy = busy.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .execute(PartitionId::new(2), move |_| {
                        assert!(!busy.swap(true, std::sync::atomic::Ordering::SeqCst));
                        std::thread::sleep(Duration::from_micros(50));
                        busy.store(false, std::sync::atomic::Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
