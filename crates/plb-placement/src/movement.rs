//! Result surface: per-partition actions.
//!
//! A finished search is turned into one `PartitionMovement` per partition
//! whose slots differ from the snapshot. Primary swaps come first, then
//! relocations (typed by the role the replica ends up with), then added and
//! dropped replicas. New replicas that could not be placed are reported as
//! `RequestedPlacementNotPossible`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use plb_state::{NodeId, PartitionId, ReplicaRole};

use crate::snapshot::Snapshot;
use crate::solution::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveKind {
    MovePrimary,
    MoveSecondary,
    MoveInstance,
    SwapPrimary,
    AddPrimary,
    AddSecondary,
    AddInstance,
    DropPrimary,
    DropSecondary,
    DropInstance,
    RequestedPlacementNotPossible,
}

impl MoveKind {
    /// Relocations and swaps, as opposed to adds, drops and failures.
    pub fn is_move(self) -> bool {
        matches!(
            self,
            MoveKind::MovePrimary | MoveKind::MoveSecondary | MoveKind::MoveInstance | MoveKind::SwapPrimary
        )
    }

    pub fn is_add(self) -> bool {
        matches!(self, MoveKind::AddPrimary | MoveKind::AddSecondary | MoveKind::AddInstance)
    }

    pub fn is_drop(self) -> bool {
        matches!(self, MoveKind::DropPrimary | MoveKind::DropSecondary | MoveKind::DropInstance)
    }

    fn relocate(role: ReplicaRole) -> Self {
        match role {
            ReplicaRole::Primary => MoveKind::MovePrimary,
            ReplicaRole::Secondary => MoveKind::MoveSecondary,
            ReplicaRole::Instance => MoveKind::MoveInstance,
        }
    }

    fn add(role: ReplicaRole) -> Self {
        match role {
            ReplicaRole::Primary => MoveKind::AddPrimary,
            ReplicaRole::Secondary => MoveKind::AddSecondary,
            ReplicaRole::Instance => MoveKind::AddInstance,
        }
    }

    fn drop(role: ReplicaRole) -> Self {
        match role {
            ReplicaRole::Primary => MoveKind::DropPrimary,
            ReplicaRole::Secondary => MoveKind::DropSecondary,
            ReplicaRole::Instance => MoveKind::DropInstance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub kind: MoveKind,
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMovement {
    pub partition: PartitionId,
    pub service: String,
    pub actions: Vec<Movement>,
    pub cost: f64,
}

impl PartitionMovement {
    pub fn move_count(&self) -> usize {
        self.actions.iter().filter(|a| a.kind.is_move()).count()
    }

    /// Actions that change the cluster (everything but placement failures).
    pub fn action_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.kind != MoveKind::RequestedPlacementNotPossible)
            .count()
    }

    pub fn has_placement_failure(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.kind == MoveKind::RequestedPlacementNotPossible)
    }
}

/// Actions turning partition `p` of the snapshot into `slots`.
pub fn partition_movement(snap: &Snapshot, p: usize, slots: &[Slot]) -> Option<PartitionMovement> {
    let part = &snap.partitions[p];
    let node_id = |n: usize| snap.nodes[n].id;
    let mut actions = Vec::new();
    let mut cost = 0.0;

    let old_primary = part
        .replicas
        .iter()
        .find(|r| !r.is_new && r.role == ReplicaRole::Primary)
        .and_then(|r| r.node);
    let new_primary = slots
        .iter()
        .zip(&part.replicas)
        .find(|(s, r)| !r.is_new && !s.dropped && s.role == ReplicaRole::Primary && r.role != ReplicaRole::Primary);
    if let (Some(from), Some((_, entry))) = (old_primary, new_primary) {
        actions.push(Movement {
            kind: MoveKind::SwapPrimary,
            source: Some(node_id(from)),
            target: entry.node.map(node_id),
        });
        cost += snap.cost.swap;
    }

    for (slot, entry) in slots.iter().zip(&part.replicas) {
        if entry.is_new || slot.dropped || slot.node == entry.node {
            continue;
        }
        actions.push(Movement {
            kind: MoveKind::relocate(slot.role),
            source: entry.node.map(node_id),
            target: slot.node.map(node_id),
        });
        cost += part.move_cost(slot.role);
    }

    for (slot, entry) in slots.iter().zip(&part.replicas) {
        if !entry.is_new || slot.dropped {
            continue;
        }
        actions.push(match slot.node {
            Some(n) => Movement {
                kind: MoveKind::add(slot.role),
                source: None,
                target: Some(node_id(n)),
            },
            None => Movement {
                kind: MoveKind::RequestedPlacementNotPossible,
                source: None,
                target: None,
            },
        });
    }

    for (slot, entry) in slots.iter().zip(&part.replicas) {
        if entry.is_new || !slot.dropped {
            continue;
        }
        actions.push(Movement {
            kind: MoveKind::drop(entry.role),
            source: entry.node.map(node_id),
            target: None,
        });
    }

    if actions.is_empty() {
        return None;
    }
    Some(PartitionMovement {
        partition: part.id,
        service: snap.services[part.service].name.clone(),
        actions,
        cost,
    })
}

/// Movements of every partition that differs from the snapshot.
pub fn diff(snap: &Snapshot, slots: &[Vec<Slot>]) -> BTreeMap<PartitionId, PartitionMovement> {
    slots
        .iter()
        .enumerate()
        .filter_map(|(p, s)| partition_movement(snap, p, s))
        .map(|m| (m.partition, m))
        .collect()
}
