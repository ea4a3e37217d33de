//! Simulated fail-over layer.
//!
//! Applies a partition's actions to its description the way the
//! orchestrator would once the moves complete, and bumps the version so
//! the result can be fed back through `update_failover_unit`.

use plb_placement::{MoveKind, PartitionMovement};
use plb_state::{FailoverUnitDescription, NodeId, ReplicaDescription, ReplicaRole};
use tracing::warn;

fn live_replica_on(fu: &mut FailoverUnitDescription, node: NodeId) -> Option<&mut ReplicaDescription> {
    fu.replicas
        .iter_mut()
        .find(|r| r.node == node && r.is_up && !r.is_standby && !r.is_disappearing())
}

pub fn apply_movements(fu: &FailoverUnitDescription, movement: &PartitionMovement) -> FailoverUnitDescription {
    let mut next = fu.clone();
    for action in &movement.actions {
        match (action.kind, action.source, action.target) {
            (MoveKind::SwapPrimary, Some(from), Some(to)) => {
                if let Some(old) = live_replica_on(&mut next, from) {
                    old.role = ReplicaRole::Secondary;
                }
                if let Some(new) = live_replica_on(&mut next, to) {
                    new.role = ReplicaRole::Primary;
                }
            }
            (MoveKind::MovePrimary | MoveKind::MoveSecondary | MoveKind::MoveInstance, Some(from), Some(to)) => {
                if let Some(replica) = live_replica_on(&mut next, from) {
                    replica.node = to;
                }
            }
            (MoveKind::AddPrimary | MoveKind::AddSecondary | MoveKind::AddInstance, _, Some(to)) => {
                let role = match action.kind {
                    MoveKind::AddPrimary => ReplicaRole::Primary,
                    MoveKind::AddSecondary => ReplicaRole::Secondary,
                    _ => ReplicaRole::Instance,
                };
                next.replicas.push(ReplicaDescription::new(to, role));
                if next.replica_diff > 0 {
                    next.replica_diff -= 1;
                }
            }
            (MoveKind::DropPrimary | MoveKind::DropSecondary | MoveKind::DropInstance, Some(from), _) => {
                let before = next.replicas.len();
                next.replicas
                    .retain(|r| !(r.node == from && r.is_up && !r.is_standby && !r.is_disappearing()));
                if next.replicas.len() < before && next.replica_diff < 0 {
                    next.replica_diff += 1;
                }
            }
            (MoveKind::RequestedPlacementNotPossible, _, _) => {}
            (kind, source, target) => {
                warn!(partition = %fu.id, ?kind, ?source, ?target, "action without the nodes it needs, skipped");
            }
        }
    }
    next.version += 1;
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use plb_placement::Movement;
    use uuid::Uuid;

    fn movement(actions: Vec<Movement>) -> PartitionMovement {
        PartitionMovement {
            partition: Uuid::from_u128(1),
            service: "svc".into(),
            actions,
            cost: 0.0,
        }
    }

    fn act(kind: MoveKind, source: Option<NodeId>, target: Option<NodeId>) -> Movement {
        Movement { kind, source, target }
    }

    #[test]
    fn swap_then_move_lands_roles_correctly() {
        let fu = FailoverUnitDescription::new(Uuid::from_u128(1), "svc", 3).with_replicas(vec![
            ReplicaDescription::primary(0),
            ReplicaDescription::secondary(1),
        ]);
        let next = apply_movements(
            &fu,
            &movement(vec![
                act(MoveKind::SwapPrimary, Some(0), Some(1)),
                act(MoveKind::MoveSecondary, Some(0), Some(2)),
            ]),
        );
        assert_eq!(next.version, 4);
        assert_eq!(next.primary_node(), Some(1));
        assert!(next.replicas.iter().any(|r| r.node == 2 && r.role == ReplicaRole::Secondary));
        assert!(next.replicas.iter().all(|r| r.node != 0));
    }

    #[test]
    fn adds_and_drops_resolve_replica_diff() {
        let mut fu = FailoverUnitDescription::new(Uuid::from_u128(1), "svc", 1);
        fu.replica_diff = 2;
        let next = apply_movements(
            &fu,
            &movement(vec![
                act(MoveKind::AddPrimary, None, Some(0)),
                act(MoveKind::AddSecondary, None, Some(1)),
            ]),
        );
        assert_eq!(next.replica_diff, 0);
        assert_eq!(next.primary_node(), Some(0));

        let mut extra = next.clone();
        extra.replica_diff = -1;
        let dropped = apply_movements(&extra, &movement(vec![act(MoveKind::DropSecondary, Some(1), None)]));
        assert_eq!(dropped.replicas.len(), 1);
        assert_eq!(dropped.replica_diff, 0);
    }

    #[test]
    fn placement_failure_only_bumps_version() {
        let mut fu = FailoverUnitDescription::new(Uuid::from_u128(1), "svc", 1);
        fu.replica_diff = 1;
        let next = apply_movements(
            &fu,
            &movement(vec![act(MoveKind::RequestedPlacementNotPossible, None, None)]),
        );
        assert_eq!(next.replica_diff, 1);
        assert_eq!(next.version, 2);
    }
}
