//! Movement throttling.
//!
//! Emitted actions are recorded in rolling windows: one for every phase,
//! one for placement and one for balancing. Each window is pruned to its
//! counting interval before an allowance is computed. Partitions that
//! moved too often within their own window are frozen for balancing.
//!
//! Truncation keeps whole partitions, cheapest first, so a partition's
//! actions are never split across refreshes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use tracing::debug;

use plb_core::PlbConfig;
use plb_placement::{SearchKind, SearchOutcome};
use plb_state::PartitionId;

/// Rounding slack so that `0.3 * 10` caps at 3, not 4.
const PERCENT_EPSILON: f64 = 1e-9;

/// `ceil(pct * total)`, or `None` when the percentage is disabled.
pub fn percentage_cap(pct: f64, total: usize) -> Option<usize> {
    (pct > 0.0).then(|| (pct * total as f64 - PERCENT_EPSILON).ceil().max(0.0) as usize)
}

#[derive(Debug, Default, Clone)]
struct Window {
    events: VecDeque<(Duration, usize)>,
    used: usize,
}

impl Window {
    fn prune(&mut self, now: Duration, span: Duration) {
        while let Some(&(at, count)) = self.events.front() {
            if now.saturating_sub(at) < span {
                break;
            }
            self.events.pop_front();
            self.used -= count;
        }
    }

    fn record(&mut self, now: Duration, count: usize) {
        if count == 0 {
            return;
        }
        self.events.push_back((now, count));
        self.used += count;
    }

    /// Remaining room under an absolute and a percentage threshold.
    fn remaining(&self, absolute: u64, pct: f64, total_replicas: usize) -> Option<usize> {
        let abs = (absolute > 0).then_some(absolute as usize);
        let pct = percentage_cap(pct, total_replicas);
        [abs, pct]
            .into_iter()
            .flatten()
            .min()
            .map(|cap| cap.saturating_sub(self.used))
    }
}

#[derive(Debug, Default, Clone)]
pub struct MovementThrottle {
    global: Window,
    placement: Window,
    balancing: Window,
    partitions: BTreeMap<PartitionId, VecDeque<Duration>>,
}

impl MovementThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self, now: Duration, config: &PlbConfig) {
        let span = config.global_movement_throttle_counting_interval();
        self.global.prune(now, span);
        self.placement.prune(now, span);
        self.balancing.prune(now, span);

        let span = config.movement_per_partition_throttle_counting_interval();
        self.partitions.retain(|_, moves| {
            while moves.front().is_some_and(|&at| now.saturating_sub(at) >= span) {
                moves.pop_front();
            }
            !moves.is_empty()
        });
    }

    /// How many more actions `kind` may emit cluster-wide, `None` if unthrottled.
    pub fn allowance(
        &mut self,
        now: Duration,
        config: &PlbConfig,
        kind: SearchKind,
        total_replicas: usize,
    ) -> Option<usize> {
        let throttled = match kind {
            SearchKind::NewReplicaPlacement | SearchKind::NewReplicaPlacementWithMove => {
                config.throttle_placement_phase
            }
            SearchKind::ConstraintCheck => config.throttle_constraint_check_phase,
            SearchKind::QuickLoadBalancing | SearchKind::LoadBalancing => config.throttle_balancing_phase,
        };
        if !throttled {
            return None;
        }
        self.prune(now, config);

        let global = self.global.remaining(
            config.global_movement_throttle_threshold,
            config.global_movement_throttle_threshold_percentage,
            total_replicas,
        );
        let phase = if kind.is_placement() {
            self.placement.remaining(
                config.global_movement_throttle_threshold_for_placement,
                config.global_movement_throttle_threshold_percentage_for_placement,
                total_replicas,
            )
        } else if kind.is_balancing() {
            self.balancing.remaining(
                config.global_movement_throttle_threshold_for_balancing,
                config.global_movement_throttle_threshold_percentage_for_balancing,
                total_replicas,
            )
        } else {
            None
        };
        [global, phase].into_iter().flatten().min()
    }

    /// Count the actions of an emitted outcome against every window.
    pub fn record(&mut self, now: Duration, outcome: &SearchOutcome) {
        let count = outcome.action_count();
        self.global.record(now, count);
        if outcome.kind.is_placement() {
            self.placement.record(now, count);
        } else if outcome.kind.is_balancing() {
            self.balancing.record(now, count);
        }
        for movement in outcome.movements.values() {
            let moves = movement.move_count();
            if moves == 0 {
                continue;
            }
            let history = self.partitions.entry(movement.partition).or_default();
            history.extend(std::iter::repeat_n(now, moves));
        }
    }

    /// Partitions that reached their per-partition move budget.
    pub fn throttled_partitions(&mut self, now: Duration, config: &PlbConfig) -> BTreeSet<PartitionId> {
        let threshold = config.movement_per_partition_throttle_threshold;
        if threshold == 0 {
            return BTreeSet::new();
        }
        self.prune(now, config);
        self.partitions
            .iter()
            .filter(|(_, moves)| moves.len() as u64 >= threshold)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn global_used(&self) -> usize {
        self.global.used
    }
}

/// Keep the cheapest partitions whose actions fit in `cap`.
///
/// Placement failures carry no action and are always kept.
pub fn truncate(mut outcome: SearchOutcome, cap: usize) -> SearchOutcome {
    if outcome.action_count() <= cap {
        return outcome;
    }
    let before = outcome.action_count();
    let mut order: Vec<(f64, PartitionId)> = outcome
        .movements
        .values()
        .map(|m| (m.cost, m.partition))
        .collect();
    order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut used = 0;
    let mut dropped = Vec::new();
    for (_, id) in order {
        let actions = outcome.movements[&id].action_count();
        if actions == 0 {
            continue;
        }
        if used + actions <= cap {
            used += actions;
        } else {
            dropped.push(id);
        }
    }
    for id in dropped {
        outcome.movements.remove(&id);
    }
    debug!(
        domain = %outcome.domain,
        kind = %outcome.kind,
        before,
        after = used,
        cap,
        "movements truncated by throttle"
    );
    outcome
}
