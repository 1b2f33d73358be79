//! Membership view snapshots consumed by the grid core.
//!
//! Failure detection lives outside the core. It publishes an immutable
//! [`MembershipView`] whenever a member changes state (Alive -> Suspect -> Dead),
//! and components read the latest view without ever mutating it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::NodeId;

/// State of a cluster member as reported by failure detection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Member is alive and reachable.
    Alive,
    /// Member is suspected to be unreachable.
    Suspect,
    /// Member is confirmed dead.
    Dead,
}

/// Information about a cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Unique node identifier.
    pub node_id: NodeId,
    /// Network address of the node.
    pub address: String,
    /// Current state of the node.
    pub state: NodeState,
}

/// An immutable snapshot of cluster membership as seen from one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    version: u64,
    local: NodeId,
    members: BTreeMap<NodeId, MemberInfo>,
}

impl MembershipView {
    /// Creates a view containing only the local node, alive.
    pub fn new(local: NodeId) -> Self {
        let mut members = BTreeMap::new();
        members.insert(
            local,
            MemberInfo {
                node_id: local,
                address: String::new(),
                state: NodeState::Alive,
            },
        );
        Self {
            version: 0,
            local,
            members,
        }
    }

    /// Creates a view in which every listed node is alive.
    pub fn with_alive(local: NodeId, version: u64, nodes: &[NodeId]) -> Self {
        let mut view = Self::new(local);
        view.version = version;
        for &node in nodes {
            view.members.insert(
                node,
                MemberInfo {
                    node_id: node,
                    address: String::new(),
                    state: NodeState::Alive,
                },
            );
        }
        view
    }

    /// Version of this view; higher versions supersede lower ones.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The node this view was produced for.
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Returns a copy with `node` in the given state and the version bumped.
    pub fn with_state(&self, node: NodeId, state: NodeState) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.members
            .entry(node)
            .and_modify(|m| m.state = state)
            .or_insert(MemberInfo {
                node_id: node,
                address: String::new(),
                state,
            });
        next
    }

    /// Returns a copy without `node` and the version bumped.
    pub fn without(&self, node: NodeId) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next.members.remove(&node);
        next
    }

    /// Looks up a member.
    pub fn member(&self, node: NodeId) -> Option<&MemberInfo> {
        self.members.get(&node)
    }

    /// All members in node-id order.
    pub fn members(&self) -> impl Iterator<Item = &MemberInfo> {
        self.members.values()
    }

    /// Returns true if `node` is currently alive in this view.
    pub fn is_reachable(&self, node: NodeId) -> bool {
        self.members
            .get(&node)
            .map(|m| m.state == NodeState::Alive)
            .unwrap_or(false)
    }

    /// Number of reachable members, the local node included.
    pub fn reachable_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.state == NodeState::Alive)
            .count()
    }

    /// Reachable member ids in node-id order.
    pub fn reachable_members(&self) -> Vec<NodeId> {
        self.members
            .values()
            .filter(|m| m.state == NodeState::Alive)
            .map(|m| m.node_id)
            .collect()
    }

    /// Total members tracked, whatever their state.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the view tracks no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_view_has_local_alive() {
        let view = MembershipView::new(NodeId::new(1));
        assert_eq!(view.reachable_count(), 1);
        assert!(view.is_reachable(NodeId::new(1)));
        assert_eq!(view.version(), 0);
    }

    #[test]
    fn test_with_state_copies_on_change() {
        let view = MembershipView::with_alive(
            NodeId::new(1),
            1,
            &[NodeId::new(2), NodeId::new(3)],
        );
        assert_eq!(view.reachable_count(), 3);

        let suspect = view.with_state(NodeId::new(2), NodeState::Suspect);
        assert_eq!(suspect.reachable_count(), 2);
        assert!(!suspect.is_reachable(NodeId::new(2)));
        assert_eq!(suspect.version(), 2);

        // The original snapshot is untouched
        assert!(view.is_reachable(NodeId::new(2)));
        assert_eq!(view.version(), 1);
    }

    #[test]
    fn test_dead_and_removed_members() {
        let view = MembershipView::with_alive(NodeId::new(1), 1, &[NodeId::new(2)]);
        let dead = view.with_state(NodeId::new(2), NodeState::Dead);
        assert_eq!(dead.len(), 2);
        assert_eq!(dead.reachable_members(), vec![NodeId::new(1)]);

        let removed = dead.without(NodeId::new(2));
        assert_eq!(removed.len(), 1);
        assert!(removed.member(NodeId::new(2)).is_none());
    }

    #[test]
    fn test_unknown_member_is_unreachable() {
        let view = MembershipView::new(NodeId::new(1));
        assert!(!view.is_reachable(NodeId::new(99)));
    }
}
