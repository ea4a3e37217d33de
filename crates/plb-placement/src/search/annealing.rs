//! Simulated annealing.
//!
//! Full balancing runs several annealing variants from the same starting
//! point and keeps the best result:
//!
//! - swap-only (primary/secondary role swaps, the cheapest moves)
//! - general with fast temperature decay, repeated with slow decay when
//!   fast decay found nothing or slow balancing is configured
//! - restricted defragmentation, when enabled and an empty-node metric is active
//!
//! A candidate is accepted when it lowers the violation vector, or keeps
//! it equal and passes the Metropolis test on energy. The best solution
//! seen is kept as a copy of its slots. Afterwards every partition whose
//! actions do not pay for themselves is reverted.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use plb_state::ReplicaRole;

use crate::constraints::Violations;
use crate::error::SearchResult;
use crate::score::ScoreScope;
use crate::solution::{Move, Slot, Solution};

use super::{SearchContext, defrag};

/// Iterations between two temperature decays.
const DECAY_PERIOD: u32 = 10;
/// Initial temperature as a fraction of the starting energy.
const DEFAULT_TEMPERATURE_FACTOR: f64 = 0.1;
const MIN_TEMPERATURE: f64 = 1e-9;
const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    SwapOnly,
    General,
    RestrictedDefrag,
    Placement,
}

#[derive(Debug, Clone, Copy)]
struct Key {
    violations: Violations,
    energy: f64,
    actions: u32,
}

impl Key {
    fn of(solution: &Solution<'_>) -> Self {
        Self {
            violations: solution.violations(),
            energy: solution.energy(),
            actions: solution.action_count(),
        }
    }

    fn beats(&self, other: &Key) -> bool {
        if self.violations != other.violations {
            return self.violations < other.violations;
        }
        if (self.energy - other.energy).abs() > EPSILON {
            return self.energy < other.energy;
        }
        self.actions < other.actions
    }
}

struct Attempt {
    variant: Variant,
    key: Key,
    slots: Vec<Vec<Slot>>,
}

/// Slots that annealing may relocate.
fn movable_slots(solution: &Solution<'_>) -> Vec<(usize, usize)> {
    let snap = solution.snapshot();
    snap.partitions
        .iter()
        .enumerate()
        .flat_map(|(p, part)| {
            part.replicas
                .iter()
                .enumerate()
                .filter(|(_, r)| r.movable)
                .map(move |(i, _)| (p, i))
        })
        .collect()
}

fn propose_swap(solution: &Solution<'_>, movable: &[(usize, usize)], rng: &mut StdRng) -> Option<Move> {
    if movable.is_empty() {
        return None;
    }
    let (partition, _) = movable[rng.gen_range(0..movable.len())];
    let slots = &solution.slots()[partition];
    let a = slots.iter().position(|s| s.role == ReplicaRole::Primary && !s.dropped)?;
    let secondaries: Vec<usize> = (0..slots.len())
        .filter(|&b| slots[b].role == ReplicaRole::Secondary)
        .collect();
    if secondaries.is_empty() {
        return None;
    }
    let b = secondaries[rng.gen_range(0..secondaries.len())];
    solution.can_swap(partition, a, b).then_some(Move::Swap { partition, a, b })
}

fn propose_relocation(
    solution: &Solution<'_>,
    movable: &[(usize, usize)],
    targets: &[usize],
    rng: &mut StdRng,
) -> Option<Move> {
    if movable.is_empty() || targets.is_empty() {
        return None;
    }
    let (partition, slot) = movable[rng.gen_range(0..movable.len())];
    let to = targets[rng.gen_range(0..targets.len())];
    solution
        .can_relocate(partition, slot, to)
        .then_some(Move::Relocate { partition, slot, to })
}

fn propose_placement(solution: &Solution<'_>, targets: &[usize], rng: &mut StdRng) -> Option<Move> {
    let snap = solution.snapshot();
    let unplaced: Vec<(usize, usize)> = snap
        .partitions
        .iter()
        .enumerate()
        .flat_map(|(p, part)| {
            part.replicas
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_new)
                .map(move |(i, _)| (p, i))
        })
        .filter(|&(p, i)| {
            let slot = solution.slots()[p][i];
            slot.node.is_none() && !slot.dropped
        })
        .collect();
    if unplaced.is_empty() || targets.is_empty() {
        return None;
    }
    let (partition, slot) = unplaced[rng.gen_range(0..unplaced.len())];
    let to = targets[rng.gen_range(0..targets.len())];
    solution
        .can_relocate(partition, slot, to)
        .then_some(Move::Relocate { partition, slot, to })
}

fn propose(
    solution: &Solution<'_>,
    variant: Variant,
    movable: &[(usize, usize)],
    targets: &[usize],
    rng: &mut StdRng,
) -> Option<Move> {
    match variant {
        Variant::SwapOnly => propose_swap(solution, movable, rng),
        Variant::General => {
            let swap_probability = solution.snapshot().config.swap_primary_probability;
            if rng.gen_bool(swap_probability.clamp(0.0, 1.0)) {
                propose_swap(solution, movable, rng)
            } else {
                propose_relocation(solution, movable, targets, rng)
            }
        }
        Variant::RestrictedDefrag => defrag::propose(solution, movable, rng),
        Variant::Placement => {
            if rng.gen_bool(0.5) {
                propose_placement(solution, targets, rng)
            } else {
                propose_relocation(solution, movable, targets, rng)
            }
        }
    }
}

fn initial_temperature(
    solution: &mut Solution<'_>,
    variant: Variant,
    movable: &[(usize, usize)],
    targets: &[usize],
    rng: &mut StdRng,
) -> f64 {
    let config = solution.snapshot().config.clone();
    let base = solution.energy();
    if config.enable_cluster_specific_initial_temperature {
        let mut total = 0.0;
        let mut probes = 0u32;
        for _ in 0..config.initial_temperature_probe_count {
            if let Some(mv) = propose(solution, variant, movable, targets, rng) {
                let moves = solution.with_followers(mv);
                let (_, energy) = solution.evaluate(&moves);
                total += (energy - base).abs();
                probes += 1;
            }
        }
        if probes > 0 && total > 0.0 {
            let t = total / probes as f64 * config.cluster_specific_temperature_coefficient / 100.0;
            return t.max(MIN_TEMPERATURE);
        }
    }
    (base * DEFAULT_TEMPERATURE_FACTOR).max(MIN_TEMPERATURE)
}

/// Anneal `solution` in place and leave it at the best solution seen.
fn anneal(
    ctx: &mut SearchContext<'_>,
    solution: &mut Solution<'_>,
    variant: Variant,
    decay: f64,
    rng: &mut StdRng,
) -> SearchResult<()> {
    let snap = ctx.snap;
    let movable = movable_slots(solution);
    let targets: Vec<usize> = snap.eligible_nodes().collect();
    let mut best = Key::of(solution);
    let mut best_slots = solution.slots().to_vec();
    let t0 = initial_temperature(solution, variant, &movable, &targets, rng);

    for _ in 0..ctx.limits.rounds.max(1) {
        let mut temperature = t0;
        for i in 0..ctx.limits.iterations_per_round {
            ctx.tick()?;
            if i > 0 && i % DECAY_PERIOD == 0 {
                temperature = (temperature * decay).max(MIN_TEMPERATURE);
            }
            let Some(mv) = propose(solution, variant, &movable, &targets, rng) else {
                continue;
            };
            let moves = solution.with_followers(mv);
            let current = Key::of(solution);
            let undo = solution.apply(&moves);
            if ctx
                .limits
                .max_moves
                .is_some_and(|max| solution.action_count() as usize > max)
            {
                solution.undo(undo);
                continue;
            }
            let next = Key::of(solution);
            let accept = if next.violations != current.violations {
                next.violations < current.violations
            } else {
                let delta = next.energy - current.energy;
                delta <= 0.0 || rng.gen_range(0.0..1.0) < (-delta / temperature).exp()
            };
            if !accept {
                solution.undo(undo);
                continue;
            }
            if next.beats(&best) {
                best = next;
                best_slots = solution.slots().to_vec();
            }
        }
        solution.restore(&best_slots);
    }
    Ok(())
}

fn run_variant(
    ctx: &mut SearchContext<'_>,
    solution: &mut Solution<'_>,
    initial: &[Vec<Slot>],
    variant: Variant,
    decay: f64,
    rng: &mut StdRng,
) -> SearchResult<Attempt> {
    solution.restore(initial);
    anneal(ctx, solution, variant, decay, rng)?;
    Ok(Attempt {
        variant,
        key: Key::of(solution),
        slots: solution.slots().to_vec(),
    })
}

/// Revert partitions whose actions do not lower the energy.
fn prune(solution: &mut Solution<'_>) {
    for p in 0..solution.snapshot().partitions.len() {
        if solution.partition_actions(p) == 0 {
            continue;
        }
        let (violations, energy) = (solution.violations(), solution.energy());
        let undo = solution.revert_partition(p);
        if solution.violations() > violations || solution.energy() > energy + EPSILON {
            solution.undo(undo);
        }
    }
}

pub(crate) fn balance<'a>(ctx: &mut SearchContext<'a>) -> SearchResult<Solution<'a>> {
    let snap = ctx.snap;
    let config = snap.config.clone();
    let mut solution = Solution::new(snap, ScoreScope::Active).respect_node_buffer(true);
    if !snap.has_active_metric() || !snap.has_movable_replicas() {
        return Ok(solution);
    }
    let initial = solution.slots().to_vec();
    let initial_score = solution.score();
    let mut rng = StdRng::seed_from_u64(ctx.limits.seed);
    let fast = config.fast_balancing_temperature_decay_rate;
    let slow = config.slow_balancing_temperature_decay_rate;

    let mut attempts = Vec::new();
    let has_swaps = snap
        .partitions
        .iter()
        .any(|p| snap.services[p.service].stateful && p.replicas.iter().any(|r| r.movable));
    if has_swaps {
        attempts.push(run_variant(ctx, &mut solution, &initial, Variant::SwapOnly, fast, &mut rng)?);
    }
    let general = run_variant(ctx, &mut solution, &initial, Variant::General, fast, &mut rng)?;
    let general_found_nothing = general.key.actions == 0;
    attempts.push(general);
    if general_found_nothing || config.use_slow_balancing {
        attempts.push(run_variant(ctx, &mut solution, &initial, Variant::General, slow, &mut rng)?);
    }
    if config.restricted_defragmentation_heuristic_enabled && !defrag::defrag_metrics(&solution).is_empty() {
        attempts.push(run_variant(
            ctx,
            &mut solution,
            &initial,
            Variant::RestrictedDefrag,
            fast,
            &mut rng,
        )?);
    }

    let Some(best) = attempts
        .into_iter()
        .reduce(|a, b| if b.key.beats(&a.key) { b } else { a })
    else {
        return Ok(solution);
    };
    solution.restore(&best.slots);
    prune(&mut solution);

    debug!(
        domain = %snap.domain,
        variant = ?best.variant,
        initial_score,
        new_score = solution.score(),
        actions = solution.action_count(),
        "balancing settled"
    );
    Ok(solution)
}

/// Annealing over unplaced replicas and movable ones, with unplaced slots penalized.
pub(crate) fn place_leftovers(ctx: &mut SearchContext<'_>, solution: &mut Solution<'_>) -> SearchResult<()> {
    let mut rng = StdRng::seed_from_u64(ctx.limits.seed);
    let decay = ctx.snap.config.fast_balancing_temperature_decay_rate;
    anneal(ctx, solution, Variant::Placement, decay, &mut rng)?;
    prune(solution);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{CancelToken, SearchContext, SearchKind, SearchLimits, run_search};
    use super::{Variant, run_variant};
    use crate::score::ScoreScope;
    use crate::snapshot::test_support::*;
    use crate::solution::Solution;
    use plb_core::PlbConfig;
    use plb_state::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn skewed_state() -> ClusterState {
        let mut state = ClusterState::new();
        for id in 0..3 {
            state.update_node(make_node(id)).unwrap();
        }
        state
            .update_service(make_service("svc", false, &[("Cpu", 1.0, 10, 10)]))
            .unwrap();
        for id in 0..6 {
            state.update_failover_unit(make_fu(id, "svc", false, &[0])).unwrap();
        }
        state
    }

    fn balance(config: PlbConfig) -> crate::SearchOutcome {
        let snap = snapshot_of(&skewed_state(), config);
        let limits = SearchLimits::from_config(&snap.config, SearchKind::LoadBalancing);
        run_search(&snap, SearchKind::LoadBalancing, &limits, &CancelToken::new()).unwrap()
    }

    #[test]
    fn annealing_improves_skewed_cluster() {
        let outcome = balance(PlbConfig::default());
        assert!(outcome.score_after < outcome.score_before);
        assert!(outcome.move_count() > 0);
        assert!(outcome.violations_after.is_empty());
    }

    #[test]
    fn annealing_is_deterministic_for_a_seed() {
        let mut config = PlbConfig::default();
        config.initial_random_seed = 42;
        assert_eq!(balance(config.clone()).movements, balance(config).movements);
    }

    #[test]
    fn unreachable_threshold_discards_result() {
        let mut config = PlbConfig::default();
        config.score_improvement_threshold = 10.0;
        let outcome = balance(config);
        assert!(outcome.is_empty());
    }

    #[test]
    fn balanced_cluster_yields_nothing() {
        let mut state = ClusterState::new();
        for id in 0..2 {
            state.update_node(make_node(id)).unwrap();
        }
        state
            .update_service(make_service("svc", false, &[("Cpu", 1.0, 10, 10)]))
            .unwrap();
        state.update_failover_unit(make_fu(0, "svc", false, &[0])).unwrap();
        state.update_failover_unit(make_fu(1, "svc", false, &[1])).unwrap();
        let snap = snapshot_of(&state, PlbConfig::default());
        let limits = SearchLimits::from_config(&snap.config, SearchKind::LoadBalancing);
        let outcome = run_search(&snap, SearchKind::LoadBalancing, &limits, &CancelToken::new()).unwrap();
        assert!(outcome.is_empty());
    }

    /// Disk loads 10 / 20 / 30 / 30 over four nodes, one node wanted empty.
    fn fragmented() -> (ClusterState, PlbConfig) {
        let mut state = ClusterState::new();
        for id in 0..4 {
            let mut node = make_node(id);
            node.capacities.insert("Disk".into(), 100);
            state.update_node(node).unwrap();
        }
        state
            .update_service(make_service("store", false, &[("Disk", 1.0, 10, 10)]))
            .unwrap();
        let mut id = 0;
        for (node, count) in [(0u64, 1), (1, 2), (2, 3), (3, 3)] {
            for _ in 0..count {
                state.update_failover_unit(make_fu(id, "store", false, &[node])).unwrap();
                id += 1;
            }
        }

        let mut config = PlbConfig::default();
        config.restricted_defragmentation_heuristic_enabled = true;
        config.defragmentation_metrics.insert("Disk".into(), true);
        config.defragmentation_empty_nodes_threshold.insert("Disk".into(), 1.0);
        config.defragmentation_empty_node_weight.insert("Disk".into(), 1.0);
        config.defragmentation_fds_std_dev_factor = 0.0;
        config.defragmentation_uds_std_dev_factor = 0.0;
        (state, config)
    }

    #[test]
    fn restricted_defrag_variant_empties_lightest_node() {
        let (state, config) = fragmented();
        let snap = snapshot_of(&state, config);
        assert!(snap.metrics[0].active);
        let limits = SearchLimits::from_config(&snap.config, SearchKind::LoadBalancing);
        let cancel = CancelToken::new();
        let mut ctx = SearchContext::new(&snap, &limits, &cancel);

        let mut solution = Solution::new(&snap, ScoreScope::Active).respect_node_buffer(true);
        let initial = solution.slots().to_vec();
        let violations_before = solution.violations();
        let mut rng = StdRng::seed_from_u64(limits.seed);
        let decay = snap.config.fast_balancing_temperature_decay_rate;
        let attempt = run_variant(
            &mut ctx,
            &mut solution,
            &initial,
            Variant::RestrictedDefrag,
            decay,
            &mut rng,
        )
        .unwrap();

        assert_eq!(attempt.variant, Variant::RestrictedDefrag);
        assert!(attempt.key.violations <= violations_before);
        assert_eq!(attempt.key.energy, 0.0);
        solution.restore(&attempt.slots);
        assert_eq!(solution.node_load(0, 0), 0.0);
        assert_eq!((0..4).map(|n| solution.node_load(n, 0)).sum::<f64>(), 90.0);
    }

    #[test]
    fn load_balancing_with_defrag_metric_leaves_a_node_empty() {
        let (state, config) = fragmented();
        let snap = snapshot_of(&state, config);
        let limits = SearchLimits::from_config(&snap.config, SearchKind::LoadBalancing);
        let outcome = run_search(&snap, SearchKind::LoadBalancing, &limits, &CancelToken::new()).unwrap();

        assert!(outcome.move_count() > 0);
        assert!(outcome.violations_after <= outcome.violations_before);
        assert!(outcome.score_after < outcome.score_before);

        let mut replicas: Vec<i64> = vec![1, 2, 3, 3];
        for movement in outcome.movements.values() {
            for action in &movement.actions {
                if let (Some(source), Some(target)) = (action.source, action.target) {
                    replicas[source as usize] -= 1;
                    replicas[target as usize] += 1;
                }
            }
        }
        assert_eq!(replicas.iter().sum::<i64>(), 9);
        assert!(replicas.contains(&0), "no node emptied: {replicas:?}");
    }
}
