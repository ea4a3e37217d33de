//! Restricted defragmentation moves.
//!
//! Instead of relocating random replicas to random nodes, only move
//! replicas off the nodes that are cheapest to empty onto nodes that stay
//! occupied. Sources are ranked by how many replicas they host, then by
//! the summed move cost of those replicas, then by load. On the chosen
//! source the cheapest move-cost class goes first.

use rand::Rng;
use rand::rngs::StdRng;

use crate::solution::{Move, Solution};

/// Empty-node metrics currently scored by `solution`.
pub(super) fn defrag_metrics(solution: &Solution<'_>) -> Vec<usize> {
    let snap = solution.snapshot();
    (0..snap.metrics.len())
        .filter(|&m| snap.metrics[m].settings.is_defrag() && solution.is_metric_scored(m))
        .collect()
}

fn slot_cost(solution: &Solution<'_>, partition: usize, slot: usize) -> f64 {
    let role = solution.slots()[partition][slot].role;
    solution.snapshot().partitions[partition].move_cost(role)
}

/// Live replica count and summed move cost per node.
fn node_occupancy(solution: &Solution<'_>) -> Vec<(usize, f64)> {
    let mut occupancy = vec![(0, 0.0); solution.snapshot().nodes.len()];
    for (p, slots) in solution.slots().iter().enumerate() {
        for (i, slot) in slots.iter().enumerate() {
            if let Some(n) = slot.live_node() {
                occupancy[n].0 += 1;
                occupancy[n].1 += slot_cost(solution, p, i);
            }
        }
    }
    occupancy
}

pub(super) fn propose(solution: &Solution<'_>, movable: &[(usize, usize)], rng: &mut StdRng) -> Option<Move> {
    let snap = solution.snapshot();
    let metrics = defrag_metrics(solution);
    if metrics.is_empty() || movable.is_empty() {
        return None;
    }
    let metric = metrics[rng.gen_range(0..metrics.len())];
    let settings = &snap.metrics[metric].settings;

    let threshold = settings.empty_node_threshold as f64;
    let occupancy = node_occupancy(solution);
    let mut occupied: Vec<usize> = snap
        .eligible_nodes()
        .filter(|&n| solution.node_load(n, metric) > threshold)
        .collect();
    if occupied.len() < 2 {
        return None;
    }
    occupied.sort_by(|&a, &b| {
        occupancy[a]
            .0
            .cmp(&occupancy[b].0)
            .then(occupancy[a].1.total_cmp(&occupancy[b].1))
            .then(solution.node_load(a, metric).total_cmp(&solution.node_load(b, metric)))
            .then(a.cmp(&b))
    });
    let light = settings.empty_nodes_wanted(snap.eligible_nodes().count()).clamp(1, occupied.len() - 1);
    let source = occupied[rng.gen_range(0..light)];
    let target = occupied[rng.gen_range(light..occupied.len())];

    let candidates: Vec<(usize, usize, f64)> = movable
        .iter()
        .filter(|(p, i)| solution.slots()[*p][*i].live_node() == Some(source))
        .filter(|(p, i)| solution.can_relocate(*p, *i, target))
        .map(|&(p, i)| (p, i, slot_cost(solution, p, i)))
        .collect();
    let cheapest = candidates.iter().map(|c| c.2).min_by(f64::total_cmp)?;
    let tier: Vec<&(usize, usize, f64)> = candidates.iter().filter(|c| c.2 <= cheapest + 1e-9).collect();
    let &(partition, slot, _) = tier[rng.gen_range(0..tier.len())];
    Some(Move::Relocate {
        partition,
        slot,
        to: target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::ScoreScope;
    use crate::snapshot::test_support::*;
    use plb_core::PlbConfig;
    use plb_state::*;
    use rand::SeedableRng;

    #[test]
    fn proposals_move_from_light_to_heavy_nodes() {
        let mut state = ClusterState::new();
        for id in 0..3 {
            let mut node = make_node(id);
            node.capacities.insert("Disk".into(), 100);
            state.update_node(node).unwrap();
        }
        state
            .update_service(make_service("svc", false, &[("Disk", 1.0, 10, 10)]))
            .unwrap();
        // Loads: node 0 = 10, node 1 = 20, node 2 = 30.
        let mut id = 0;
        for (node, count) in [(0u64, 1), (1, 2), (2, 3)] {
            for _ in 0..count {
                state.update_failover_unit(make_fu(id, "svc", false, &[node])).unwrap();
                id += 1;
            }
        }
        let mut config = PlbConfig::default();
        config.defragmentation_metrics.insert("Disk".into(), true);
        let snap = snapshot_of(&state, config);
        let solution = Solution::new(&snap, ScoreScope::All);
        let movable: Vec<(usize, usize)> = (0..snap.partitions.len()).map(|p| (p, 0)).collect();

        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = 0;
        for _ in 0..50 {
            if let Some(Move::Relocate { partition, to, .. }) = propose(&solution, &movable, &mut rng) {
                assert_eq!(solution.slots()[partition][0].node, Some(0));
                assert_ne!(to, 0);
                seen += 1;
            }
        }
        assert!(seen > 0);
    }

    fn disk_nodes(state: &mut ClusterState, count: u64) {
        for id in 0..count {
            let mut node = make_node(id);
            node.capacities.insert("Disk".into(), 100);
            state.update_node(node).unwrap();
        }
    }

    fn defrag_config() -> PlbConfig {
        let mut config = PlbConfig::default();
        config.defragmentation_metrics.insert("Disk".into(), true);
        config
    }

    fn proposed_sources(solution: &Solution<'_>, movable: &[(usize, usize)], rounds: usize) -> Vec<(usize, usize)> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..rounds)
            .filter_map(|_| match propose(solution, movable, &mut rng) {
                Some(Move::Relocate { partition, slot, .. }) => Some((partition, slot)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn cheapest_replica_leaves_first() {
        let mut state = ClusterState::new();
        disk_nodes(&mut state, 3);
        let mut cheap = make_service("cheap", false, &[("Disk", 1.0, 10, 10)]);
        cheap.move_cost = MoveCostClass::Zero;
        let mut pricey = make_service("pricey", false, &[("Disk", 1.0, 10, 10)]);
        pricey.move_cost = MoveCostClass::High;
        state.update_service(cheap).unwrap();
        state.update_service(pricey).unwrap();

        // Node 0 hosts one replica of each; nodes 1 and 2 are heavier.
        state.update_failover_unit(make_fu(0, "cheap", false, &[0])).unwrap();
        state.update_failover_unit(make_fu(1, "pricey", false, &[0])).unwrap();
        let mut id = 2;
        for (node, count) in [(1u64, 3), (2, 4)] {
            for _ in 0..count {
                state.update_failover_unit(make_fu(id, "cheap", false, &[node])).unwrap();
                id += 1;
            }
        }

        let snap = snapshot_of(&state, defrag_config());
        let solution = Solution::new(&snap, ScoreScope::All);
        let movable: Vec<(usize, usize)> = (0..snap.partitions.len()).map(|p| (p, 0)).collect();

        let picks = proposed_sources(&solution, &movable, 200);
        assert!(!picks.is_empty());
        for (partition, _) in picks {
            assert_eq!(snap.partitions[partition].id, pid(0), "high-cost replica proposed");
        }
    }

    #[test]
    fn nodes_with_fewer_replicas_are_emptied_first() {
        let mut state = ClusterState::new();
        disk_nodes(&mut state, 3);
        state
            .update_service(make_service("small", false, &[("Disk", 1.0, 5, 5)]))
            .unwrap();
        state
            .update_service(make_service("big", false, &[("Disk", 1.0, 30, 30)]))
            .unwrap();

        // Node 0: two small replicas (10). Node 1: one big replica (30).
        // Node 2: four small replicas (20).
        state.update_failover_unit(make_fu(0, "small", false, &[0])).unwrap();
        state.update_failover_unit(make_fu(1, "small", false, &[0])).unwrap();
        state.update_failover_unit(make_fu(2, "big", false, &[1])).unwrap();
        for id in 3..7 {
            state.update_failover_unit(make_fu(id, "small", false, &[2])).unwrap();
        }

        let snap = snapshot_of(&state, defrag_config());
        let solution = Solution::new(&snap, ScoreScope::All);
        let movable: Vec<(usize, usize)> = (0..snap.partitions.len()).map(|p| (p, 0)).collect();

        let picks = proposed_sources(&solution, &movable, 50);
        assert!(!picks.is_empty());
        for (partition, slot) in picks {
            assert_eq!(solution.slots()[partition][slot].node, Some(1));
        }
    }
}
