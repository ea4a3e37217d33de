//! Deterministic greedy searches: constraint repair and quick balancing.
//!
//! Both evaluate every candidate move in a fixed order (partition, slot,
//! target node) and apply the best one per iteration, so the same input
//! always yields the same moves.

use std::collections::BTreeSet;

use plb_state::ReplicaRole;

use crate::constraints::{ConstraintKind, Violations};
use crate::error::SearchResult;
use crate::score::ScoreScope;
use crate::solution::{Move, Solution};

use super::SearchContext;

const IMPROVEMENT_EPSILON: f64 = 1e-12;

struct Candidate {
    violations: Violations,
    energy: f64,
    moves: Vec<Move>,
}

/// Whether `candidate` adds an unavailable-node or capacity violation over `current`.
fn breaks_hard_limits(candidate: &Violations, current: &Violations) -> bool {
    [ConstraintKind::NodeAvailability, ConstraintKind::Capacity]
        .into_iter()
        .any(|kind| candidate.get(kind) > current.get(kind))
}

/// Evaluate `mv` (with affinity followers) and keep it if it beats `best`.
///
/// With a `guard`, candidates that break the node availability or capacity
/// limits of the guarded state are ignored.
fn consider(solution: &mut Solution<'_>, mv: Move, guard: Option<&Violations>, best: &mut Option<Candidate>) {
    let moves = solution.with_followers(mv);
    let (violations, energy) = solution.evaluate(&moves);
    if guard.is_some_and(|g| breaks_hard_limits(&violations, g)) {
        return;
    }
    let better = match best {
        None => true,
        Some(b) => {
            violations < b.violations || (violations == b.violations && energy < b.energy - IMPROVEMENT_EPSILON)
        }
    };
    if better {
        *best = Some(Candidate {
            violations,
            energy,
            moves,
        });
    }
}

/// Relocations of `partition`'s movable slots to `targets`, plus its primary swaps.
fn partition_candidates(
    solution: &Solution<'_>,
    partition: usize,
    sources: Option<&BTreeSet<usize>>,
    targets: &[usize],
) -> Vec<Move> {
    let mut moves = Vec::new();
    let slots = &solution.slots()[partition];
    for (i, slot) in slots.iter().enumerate() {
        let Some(node) = slot.live_node() else {
            continue;
        };
        if sources.is_some_and(|s| !s.contains(&node)) {
            continue;
        }
        for &to in targets {
            if solution.can_relocate(partition, i, to) {
                moves.push(Move::Relocate {
                    partition,
                    slot: i,
                    to,
                });
            }
        }
        if slot.role == ReplicaRole::Primary {
            for (b, other) in slots.iter().enumerate() {
                let Some(target) = other.live_node() else {
                    continue;
                };
                if targets.contains(&target) && solution.can_swap(partition, i, b) {
                    moves.push(Move::Swap { partition, a: i, b });
                }
            }
        }
    }
    moves
}

// ── Constraint check ───────────────────────────────────────────────

/// Partitions involved in some violation.
fn violating_partitions(solution: &Solution<'_>) -> Vec<usize> {
    let snap = solution.snapshot();
    let bad_nodes: BTreeSet<usize> = (0..snap.nodes.len())
        .filter(|&n| !solution.node_violations(n).is_empty())
        .collect();
    (0..snap.partitions.len())
        .filter(|&p| {
            if !solution.partition_violations(p).is_empty() {
                return true;
            }
            let service = &snap.services[snap.partitions[p].service];
            if service
                .application
                .is_some_and(|a| !solution.app_violations(a).is_empty())
            {
                return true;
            }
            solution.slots()[p]
                .iter()
                .filter_map(|s| s.live_node())
                .any(|n| bad_nodes.contains(&n))
        })
        .collect()
}

/// Fix hard constraint violations one best move at a time.
///
/// A move is taken only when it strictly lowers the violation vector.
pub(crate) fn constraint_check<'a>(ctx: &mut SearchContext<'a>) -> SearchResult<Solution<'a>> {
    let snap = ctx.snap;
    let mut solution = Solution::new(snap, ScoreScope::All);
    let targets: Vec<usize> = snap.eligible_nodes().collect();

    for _ in 0..ctx.limits.total_iterations() {
        ctx.tick()?;
        let current = solution.violations();
        if current.is_empty() || ctx.moves_exhausted(&solution) {
            break;
        }
        let mut best = None;
        for p in violating_partitions(&solution) {
            for mv in partition_candidates(&solution, p, None, &targets) {
                consider(&mut solution, mv, Some(&current), &mut best);
            }
        }
        match best {
            Some(c) if c.violations < current => {
                solution.apply(&c.moves);
            }
            _ => break,
        }
    }
    Ok(solution)
}

// ── Quick balancing ────────────────────────────────────────────────

/// Nodes above and below the mean on any scored metric.
fn load_classes(solution: &Solution<'_>) -> (BTreeSet<usize>, Vec<usize>) {
    let snap = solution.snapshot();
    let nodes: Vec<usize> = snap.eligible_nodes().collect();
    let mut over = BTreeSet::new();
    let mut under = BTreeSet::new();
    for m in 0..snap.metrics.len() {
        if !solution.is_metric_scored(m) || nodes.is_empty() {
            continue;
        }
        let mean = nodes.iter().map(|&n| solution.node_load(n, m)).sum::<f64>() / nodes.len() as f64;
        for &n in &nodes {
            let load = solution.node_load(n, m);
            if load > mean + 1e-9 {
                over.insert(n);
            } else if load < mean - 1e-9 {
                under.insert(n);
            }
        }
    }
    // Nodes that must be evacuated are always sources.
    for (n, node) in snap.nodes.iter().enumerate() {
        if !node.accepts_replicas() {
            over.insert(n);
        }
    }
    (over, under.into_iter().collect())
}

fn best_balancing_move(
    solution: &mut Solution<'_>,
    sources: Option<&BTreeSet<usize>>,
    targets: &[usize],
) -> Option<Vec<Move>> {
    let current_violations = solution.violations();
    let current_energy = solution.energy();
    let mut best = None;
    for p in 0..solution.snapshot().partitions.len() {
        for mv in partition_candidates(solution, p, sources, targets) {
            consider(solution, mv, Some(&current_violations), &mut best);
        }
    }
    best.filter(|c| c.violations <= current_violations && c.energy < current_energy - IMPROVEMENT_EPSILON)
        .map(|c| c.moves)
}

/// Steepest descent from overloaded to underloaded nodes.
///
/// Each iteration applies the single move that lowers the energy most
/// without adding violations. Moves between overloaded and underloaded
/// nodes are tried first; all nodes are tried when none helps.
pub(crate) fn quick_balance<'a>(ctx: &mut SearchContext<'a>) -> SearchResult<Solution<'a>> {
    let snap = ctx.snap;
    let mut solution = Solution::new(snap, ScoreScope::Active).respect_node_buffer(true);
    if !snap.has_active_metric() {
        return Ok(solution);
    }
    let all_targets: Vec<usize> = snap.eligible_nodes().collect();

    for _ in 0..ctx.limits.total_iterations() {
        ctx.tick()?;
        if ctx.moves_exhausted(&solution) {
            break;
        }
        let (over, under) = load_classes(&solution);
        let moves = best_balancing_move(&mut solution, Some(&over), &under)
            .or_else(|| best_balancing_move(&mut solution, None, &all_targets));
        match moves {
            Some(moves) => {
                solution.apply(&moves);
            }
            None => break,
        }
    }
    Ok(solution)
}
