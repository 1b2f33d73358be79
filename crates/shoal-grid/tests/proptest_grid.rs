//! Property-based tests for shoal-grid using proptest.
//!
//! These tests check invariants of replication and placement over generated
//! operation sequences and cluster shapes.

use proptest::prelude::*;
use shoal_grid::container::{Container, ContainerArena};
use shoal_grid::metrics::LoggingObserver;
use shoal_grid::transport::LocalNetwork;
use shoal_grid::{
    CounterOp, GridConfig, GridNode, LockOp, MapOp, MembershipView, NodeId, ObjectConfig,
    ObjectId, ObjectKind, Operation, PartitionAssigner, PartitionId, PartitionResolver,
    PartitionTable, QueueOp, QuorumConfig, QuorumGate, QuorumScope, ReferenceOp, Response,
};
use std::sync::Arc;
use uuid::Uuid;

fn any_bytes() -> impl Strategy<Value = Vec<u8>> + Clone {
    proptest::collection::vec(any::<u8>(), 0..4)
}

fn counter_op() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(CounterOp::Get),
        (-5i64..5).prop_map(CounterOp::Set),
        (-5i64..5).prop_map(CounterOp::AddAndGet),
        (-5i64..5).prop_map(CounterOp::GetAndAdd),
        (-2i64..2, -2i64..2).prop_map(|(expect, update)| CounterOp::CompareAndSet { expect, update }),
    ]
    .prop_map(Operation::Counter)
}

fn reference_op() -> impl Strategy<Value = Operation> {
    let value = proptest::option::of(any_bytes());
    prop_oneof![
        Just(ReferenceOp::Get),
        value.clone().prop_map(ReferenceOp::Set),
        value.clone().prop_map(ReferenceOp::GetAndSet),
        (value.clone(), value).prop_map(|(expect, update)| ReferenceOp::CompareAndSet { expect, update }),
        Just(ReferenceOp::IsNull),
    ]
    .prop_map(Operation::Reference)
}

fn map_op() -> impl Strategy<Value = Operation> {
    let key = proptest::collection::vec(0u8..4, 1..2);
    prop_oneof![
        (key.clone(), any_bytes()).prop_map(|(key, value)| MapOp::Put { key, value }),
        key.clone().prop_map(|key| MapOp::Get { key }),
        key.clone().prop_map(|key| MapOp::Remove { key }),
        key.prop_map(|key| MapOp::ContainsKey { key }),
    ]
    .prop_map(Operation::Map)
}

fn queue_op() -> impl Strategy<Value = Operation> {
    prop_oneof![
        any_bytes().prop_map(QueueOp::Offer),
        Just(QueueOp::Poll),
        Just(QueueOp::Peek),
        Just(QueueOp::Size),
    ]
    .prop_map(Operation::Queue)
}

fn lock_op() -> impl Strategy<Value = Operation> {
    let owners = [Uuid::from_u128(1), Uuid::from_u128(2)];
    prop_oneof![
        (0usize..2).prop_map(move |i| LockOp::TryLock { owner: owners[i] }),
        (0usize..2).prop_map(move |i| LockOp::Unlock { owner: owners[i] }),
        Just(LockOp::ForceUnlock),
        Just(LockOp::IsLocked),
    ]
    .prop_map(Operation::Lock)
}

/// An object kind plus a sequence of operations on it.
fn object_script() -> impl Strategy<Value = (ObjectKind, Vec<Operation>)> {
    prop_oneof![
        proptest::collection::vec(counter_op(), 1..40).prop_map(|ops| (ObjectKind::Counter, ops)),
        proptest::collection::vec(reference_op(), 1..40).prop_map(|ops| (ObjectKind::Reference, ops)),
        proptest::collection::vec(map_op(), 1..40).prop_map(|ops| (ObjectKind::Map, ops)),
        proptest::collection::vec(queue_op(), 1..40).prop_map(|ops| (ObjectKind::Queue, ops)),
        proptest::collection::vec(lock_op(), 1..40).prop_map(|ops| (ObjectKind::Lock, ops)),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    /// Replaying every backup on a replica that started from the same state
    /// leaves it identical to the primary.
    #[test]
    fn test_backups_converge_with_primary((kind, ops) in object_script(), max_size in proptest::option::of(1usize..4)) {
        let object = ObjectId::new(kind, "obj");
        let mut primary = Container::new(kind, max_size);
        let mut replica = Container::new(kind, max_size);
        for op in &ops {
            match op.run(&object, &mut primary) {
                Ok(outcome) => {
                    if let Some(backup) = outcome.backup {
                        backup.apply(&mut replica).unwrap();
                    }
                }
                // failed operations leave the primary untouched
                Err(_) => {}
            }
            prop_assert_eq!(&primary, &replica);
        }
    }

    /// Reads never produce a backup.
    #[test]
    fn test_reads_produce_no_backup((kind, ops) in object_script()) {
        let object = ObjectId::new(kind, "obj");
        let mut container = Container::new(kind, None);
        for op in &ops {
            if let Ok(outcome) = op.run(&object, &mut container) {
                if op.scope() == shoal_grid::operation::OperationScope::Read {
                    prop_assert!(outcome.backup.is_none());
                }
            }
        }
    }

    /// Concurrent increments on one partition are applied one at a time:
    /// every caller sees a distinct value and the total is exact.
    #[test]
    fn test_partition_serializes_concurrent_callers(callers in 1usize..6, per_caller in 1usize..20) {
        let rt = runtime();
        let (values, total) = rt.block_on(async move {
            let network = LocalNetwork::new();
            let id = NodeId::new(1);
            let config = GridConfig { partition_count: 4, worker_count: 2, ..GridConfig::default() };
            let node = GridNode::start(id, config, network.transport(id), Arc::new(LoggingObserver)).unwrap();
            let table = PartitionTable::from_assignments(1, vec![vec![id]; 4]).unwrap();
            node.apply_partition_table(Arc::new(table)).unwrap();

            let mut handles = Vec::new();
            for _ in 0..callers {
                let node = node.clone();
                handles.push(tokio::spawn(async move {
                    let mut seen = Vec::new();
                    for _ in 0..per_caller {
                        let response = node
                            .dispatch(PartitionId::new(2), ObjectId::counter("c"), Operation::Counter(CounterOp::AddAndGet(1)))
                            .await
                            .unwrap();
                        if let Response::Long(v) = response {
                            seen.push(v);
                        }
                    }
                    seen
                }));
            }
            let mut values = Vec::new();
            for handle in handles {
                let seen = handle.await.unwrap();
                // each caller observes its own increments in order
                assert!(seen.windows(2).all(|w| w[0] < w[1]));
                values.extend(seen);
            }
            let total = node.sequence(PartitionId::new(2)).await.unwrap();
            (values, total)
        });

        let mut sorted = values.clone();
        sorted.sort_unstable();
        let expected: Vec<i64> = (1..=(callers * per_caller) as i64).collect();
        prop_assert_eq!(sorted, expected);
        prop_assert_eq!(total, (callers * per_caller) as u64);
    }

    /// Every partition gets distinct replicas, and owners are spread evenly.
    #[test]
    fn test_distribution_is_balanced(node_count in 1usize..9, backups in 0usize..4, partitions in 1u32..300) {
        let nodes: Vec<NodeId> = (1..=node_count as u64).map(NodeId::new).collect();
        let table = PartitionAssigner::distribute(partitions, &nodes, backups).unwrap();
        let replicas = (backups + 1).min(node_count);

        let mut owned = vec![0u32; node_count];
        for p in 0..partitions {
            let set = table.replicas(PartitionId::new(p)).unwrap().nodes().to_vec();
            prop_assert_eq!(set.len(), replicas);
            let mut unique = set.clone();
            unique.sort();
            unique.dedup();
            prop_assert_eq!(unique.len(), set.len());
            let owner = table.owner(PartitionId::new(p)).unwrap();
            owned[(owner.as_u64() - 1) as usize] += 1;
        }
        let max = *owned.iter().max().unwrap();
        let min = *owned.iter().min().unwrap();
        prop_assert!(max - min <= 1);
    }

    /// Removing a member keeps the relative order of the remaining replicas.
    #[test]
    fn test_member_removal_shifts_down(node_count in 2usize..7, victim in 0usize..7) {
        let nodes: Vec<NodeId> = (1..=node_count as u64).map(NodeId::new).collect();
        let victim = nodes[victim % node_count];
        let table = PartitionAssigner::distribute(32, &nodes, 2).unwrap();
        let next = table.without_member(victim);
        prop_assert_eq!(next.version(), table.version() + 1);
        for p in 0..32 {
            let pid = PartitionId::new(p);
            let before: Vec<NodeId> = table.replicas(pid).unwrap().nodes().iter().copied().filter(|n| *n != victim).collect();
            let after = next.replicas(pid).unwrap().nodes().to_vec();
            prop_assert_eq!(before, after);
        }
    }

    /// Keys always land in range and always on the same partition.
    #[test]
    fn test_resolver_is_stable(key in proptest::collection::vec(any::<u8>(), 0..64), count in 1u32..1000) {
        let resolver = PartitionResolver::new(count);
        let partition = resolver.partition_for_key(&key);
        prop_assert!(partition.as_u32() < count);
        prop_assert_eq!(partition, resolver.partition_for_key(&key));
    }

    /// The gate rejects exactly when fewer members than the minimum are reachable.
    #[test]
    fn test_quorum_threshold(reachable in 1usize..8, min in 1usize..8) {
        let config = GridConfig {
            objects: vec![ObjectConfig::new("guarded").with_quorum("q")],
            quorums: vec![QuorumConfig::min_members("q", min, QuorumScope::ReadWrite)],
            ..GridConfig::default()
        };
        let nodes: Vec<NodeId> = (1..=reachable as u64).map(NodeId::new).collect();
        let view = MembershipView::with_alive(nodes[0], 1, &nodes);
        let gate = QuorumGate::new();
        let result = gate.check("guarded", shoal_grid::operation::OperationScope::Write, &view, &config);
        prop_assert_eq!(result.is_err(), reachable < min);
    }

    /// After clearing beyond an index, only containers that index still backs remain.
    #[test]
    fn test_clear_beyond_keeps_covered_containers(counts in proptest::collection::vec(0usize..4, 1..10), index in 0usize..5) {
        let mut arena = ContainerArena::new();
        for (i, backup_count) in counts.iter().enumerate() {
            arena.get_or_create(&ObjectId::counter(format!("c{}", i)), *backup_count, None);
        }
        arena.clear_beyond(Some(index));
        let expected = counts.iter().filter(|c| **c >= index).count();
        prop_assert_eq!(arena.len(), expected);
    }
}
