//! Search entry point.
//!
//! Every search kind starts from a fresh `Solution` of the snapshot and
//! returns the per-partition actions that turn the snapshot into the
//! solution it settled on. A balancing result that does not lower the
//! score by `score_improvement_threshold` is discarded. Searches check a
//! shared `CancelToken` at every iteration and abandon their work with
//! `SearchError::Interrupted` when a critical update arrives.

mod annealing;
mod defrag;
mod greedy;
mod placement;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use plb_core::PlbConfig;
use plb_state::PartitionId;

use crate::constraints::Violations;
use crate::error::{SearchError, SearchResult};
use crate::movement::{self, MoveKind, PartitionMovement};
use crate::score::ScoreScope;
use crate::snapshot::Snapshot;
use crate::solution::Solution;

/// Cooperative cancellation flag shared between a search and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchKind {
    NewReplicaPlacement,
    NewReplicaPlacementWithMove,
    ConstraintCheck,
    QuickLoadBalancing,
    LoadBalancing,
}

impl SearchKind {
    pub fn name(self) -> &'static str {
        match self {
            SearchKind::NewReplicaPlacement => "placement",
            SearchKind::NewReplicaPlacementWithMove => "placement_with_move",
            SearchKind::ConstraintCheck => "constraint_check",
            SearchKind::QuickLoadBalancing => "quick_load_balancing",
            SearchKind::LoadBalancing => "load_balancing",
        }
    }

    pub fn is_placement(self) -> bool {
        matches!(self, SearchKind::NewReplicaPlacement | SearchKind::NewReplicaPlacementWithMove)
    }

    pub fn is_balancing(self) -> bool {
        matches!(self, SearchKind::QuickLoadBalancing | SearchKind::LoadBalancing)
    }

    fn scope(self) -> ScoreScope {
        if self.is_balancing() {
            ScoreScope::Active
        } else {
            ScoreScope::All
        }
    }
}

impl fmt::Display for SearchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Budgets of one search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchLimits {
    pub iterations_per_round: u32,
    pub rounds: u32,
    /// Stop adding actions beyond this many.
    pub max_moves: Option<usize>,
    pub seed: u64,
}

impl SearchLimits {
    pub fn from_config(config: &PlbConfig, kind: SearchKind) -> Self {
        let iterations_per_round = match kind {
            SearchKind::NewReplicaPlacement | SearchKind::NewReplicaPlacementWithMove => {
                config.placement_search_iterations_per_round
            }
            SearchKind::ConstraintCheck => config.constraint_check_iterations_per_round,
            SearchKind::QuickLoadBalancing => config.quick_load_balancing_iterations,
            SearchKind::LoadBalancing => config.simulated_annealing_iterations_per_round,
        }
        .max(1);
        let rounds = match kind {
            SearchKind::LoadBalancing if config.max_simulated_annealing_iterations > 0 => {
                (config.max_simulated_annealing_iterations as u64).div_ceil(iterations_per_round as u64) as u32
            }
            _ => 1,
        };
        Self {
            iterations_per_round,
            rounds,
            max_moves: None,
            seed: config.initial_random_seed,
        }
    }

    pub fn with_max_moves(mut self, max_moves: usize) -> Self {
        self.max_moves = Some(max_moves);
        self
    }

    pub fn total_iterations(&self) -> u64 {
        self.iterations_per_round as u64 * self.rounds.max(1) as u64
    }
}

/// Result of one search over one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub kind: SearchKind,
    pub domain: String,
    pub movements: BTreeMap<PartitionId, PartitionMovement>,
    pub score_before: f64,
    pub score_after: f64,
    #[serde(skip)]
    pub violations_before: Violations,
    #[serde(skip)]
    pub violations_after: Violations,
    pub iterations: u64,
}

impl SearchOutcome {
    pub fn is_empty(&self) -> bool {
        self.movements.is_empty()
    }

    /// Relocations and swaps.
    pub fn move_count(&self) -> usize {
        self.movements.values().map(|m| m.move_count()).sum()
    }

    /// Every action that changes the cluster.
    pub fn action_count(&self) -> usize {
        self.movements.values().map(|m| m.action_count()).sum()
    }

    pub fn placement_failures(&self) -> usize {
        self.movements
            .values()
            .flat_map(|m| m.actions.iter())
            .filter(|a| a.kind == MoveKind::RequestedPlacementNotPossible)
            .count()
    }
}

/// Shared state of a running search.
pub(crate) struct SearchContext<'a> {
    pub snap: &'a Snapshot,
    pub limits: &'a SearchLimits,
    cancel: &'a CancelToken,
    pub iterations: u64,
}

impl<'a> SearchContext<'a> {
    fn new(snap: &'a Snapshot, limits: &'a SearchLimits, cancel: &'a CancelToken) -> Self {
        Self {
            snap,
            limits,
            cancel,
            iterations: 0,
        }
    }

    /// Count one iteration and bail out if the search was cancelled.
    pub fn tick(&mut self) -> SearchResult<()> {
        self.iterations += 1;
        if self.cancel.is_cancelled() {
            return Err(SearchError::Interrupted {
                iterations: self.iterations,
            });
        }
        Ok(())
    }

    pub fn moves_exhausted(&self, solution: &Solution<'_>) -> bool {
        self.limits
            .max_moves
            .is_some_and(|max| solution.action_count() as usize >= max)
    }
}

/// Run one search over a snapshot.
pub fn run_search(
    snap: &Snapshot,
    kind: SearchKind,
    limits: &SearchLimits,
    cancel: &CancelToken,
) -> SearchResult<SearchOutcome> {
    let before = Solution::new(snap, kind.scope());
    let (score_before, violations_before) = (before.score(), before.violations());

    let mut ctx = SearchContext::new(snap, limits, cancel);
    ctx.tick()?;
    let mut solution = match kind {
        SearchKind::NewReplicaPlacement => placement::place(&mut ctx, false)?,
        SearchKind::NewReplicaPlacementWithMove => placement::place(&mut ctx, true)?,
        SearchKind::ConstraintCheck => greedy::constraint_check(&mut ctx)?,
        SearchKind::QuickLoadBalancing => greedy::quick_balance(&mut ctx)?,
        SearchKind::LoadBalancing => annealing::balance(&mut ctx)?,
    };
    if kind.is_balancing() && solution.action_count() > 0 {
        let score_after = solution.score();
        let threshold = snap.config.score_improvement_threshold;
        if score_after > score_before || score_before - score_after < threshold {
            debug!(
                domain = %snap.domain,
                kind = %kind,
                score_before,
                score_after,
                threshold,
                "balancing improvement below threshold, discarding"
            );
            solution.restore(before.slots());
        }
    }

    let movements = movement::diff(snap, solution.slots());
    let outcome = SearchOutcome {
        kind,
        domain: snap.domain.clone(),
        movements,
        score_before,
        score_after: solution.score(),
        violations_before,
        violations_after: solution.violations(),
        iterations: ctx.iterations,
    };
    debug!(
        domain = %outcome.domain,
        kind = %kind,
        partitions = outcome.movements.len(),
        moves = outcome.move_count(),
        score_before = outcome.score_before,
        score_after = outcome.score_after,
        violations = %outcome.violations_after,
        iterations = outcome.iterations,
        "search finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::test_support::*;
    use plb_state::*;

    #[test]
    fn cancelled_search_is_interrupted() {
        let mut state = ClusterState::new();
        for id in 0..3 {
            state.update_node(make_node(id)).unwrap();
        }
        state
            .update_service(make_service("svc", true, &[("Cpu", 1.0, 10, 5)]))
            .unwrap();
        state.update_failover_unit(make_fu(1, "svc", true, &[0, 1])).unwrap();
        let snap = snapshot_of(&state, PlbConfig::default());

        let cancel = CancelToken::new();
        cancel.cancel();
        let limits = SearchLimits::from_config(&snap.config, SearchKind::LoadBalancing);
        let err = run_search(&snap, SearchKind::LoadBalancing, &limits, &cancel).unwrap_err();
        assert!(matches!(err, SearchError::Interrupted { .. }));
    }

    #[test]
    fn limits_follow_config() {
        let mut config = PlbConfig::default();
        config.simulated_annealing_iterations_per_round = 100;
        config.max_simulated_annealing_iterations = 250;
        let limits = SearchLimits::from_config(&config, SearchKind::LoadBalancing);
        assert_eq!(limits.rounds, 3);
        assert_eq!(limits.total_iterations(), 300);

        let quick = SearchLimits::from_config(&config, SearchKind::QuickLoadBalancing);
        assert_eq!(quick.iterations_per_round, config.quick_load_balancing_iterations);
        assert_eq!(quick.rounds, 1);
    }
}
