//! Per-domain scheduler state machine.
//!
//! Each service domain keeps its own phase timers and dirty flags. On
//! every refresh the phases are considered in priority order:
//!
//! ```text
//! NewReplicaPlacement(WithMove) → ConstraintCheck → QuickLoadBalancing → LoadBalancing → NoActionNeeded
//! ```
//!
//! A phase is eligible when its dirty flag is set and its minimum interval
//! has elapsed since it last ran. Node availability, deactivation and
//! block list changes set the `force` flag, which lifts the placement and
//! constraint check timers. A phase that produced actions or ran clean
//! clears its flag; an interrupted or throttled run leaves it set.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use plb_core::PlbConfig;
use plb_placement::{SearchKind, SearchOutcome};
use plb_state::{DomainId, ServiceDomainLayout};

/// The action a domain's scheduler settled on in the last refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerAction {
    #[default]
    NoActionNeeded,
    NewReplicaPlacement,
    NewReplicaPlacementWithMove,
    ConstraintCheck,
    QuickLoadBalancing,
    LoadBalancing,
}

impl SchedulerAction {
    pub fn search_kind(self) -> Option<SearchKind> {
        match self {
            SchedulerAction::NoActionNeeded => None,
            SchedulerAction::NewReplicaPlacement => Some(SearchKind::NewReplicaPlacement),
            SchedulerAction::NewReplicaPlacementWithMove => Some(SearchKind::NewReplicaPlacementWithMove),
            SchedulerAction::ConstraintCheck => Some(SearchKind::ConstraintCheck),
            SchedulerAction::QuickLoadBalancing => Some(SearchKind::QuickLoadBalancing),
            SchedulerAction::LoadBalancing => Some(SearchKind::LoadBalancing),
        }
    }

    pub fn from_kind(kind: SearchKind) -> Self {
        match kind {
            SearchKind::NewReplicaPlacement => SchedulerAction::NewReplicaPlacement,
            SearchKind::NewReplicaPlacementWithMove => SchedulerAction::NewReplicaPlacementWithMove,
            SearchKind::ConstraintCheck => SchedulerAction::ConstraintCheck,
            SearchKind::QuickLoadBalancing => SchedulerAction::QuickLoadBalancing,
            SearchKind::LoadBalancing => SchedulerAction::LoadBalancing,
        }
    }
}

impl fmt::Display for SchedulerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.search_kind() {
            Some(kind) => f.write_str(kind.name()),
            None => f.write_str("no_action_needed"),
        }
    }
}

/// What the snapshot of a domain currently needs, as seen by the planner.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainNeeds {
    pub placement: bool,
    pub constraint_violations: bool,
    pub movable: bool,
    pub active_metrics: bool,
    pub upgrading: bool,
    /// Active-metric score of the current placement.
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct DomainScheduler {
    layout: ServiceDomainLayout,
    action: SchedulerAction,
    last_placement: Option<Duration>,
    last_constraint_check: Option<Duration>,
    last_balancing: Option<Duration>,
    placement_dirty: bool,
    constraint_dirty: bool,
    balancing_dirty: bool,
    force: bool,
    with_move_next: bool,
    quick_next: bool,
    /// Score left behind by the last balancing run.
    balanced_score: Option<f64>,
}

impl DomainScheduler {
    /// A fresh domain needs every phase checked.
    pub fn new(layout: ServiceDomainLayout) -> Self {
        Self {
            layout,
            action: SchedulerAction::NoActionNeeded,
            last_placement: None,
            last_constraint_check: None,
            last_balancing: None,
            placement_dirty: true,
            constraint_dirty: true,
            balancing_dirty: true,
            force: false,
            with_move_next: false,
            quick_next: true,
            balanced_score: None,
        }
    }

    /// Fold several schedulers into one for a merged domain.
    ///
    /// Timers take the soonest-eligible value and flags are combined.
    pub fn merge(layout: ServiceDomainLayout, parts: Vec<DomainScheduler>) -> Self {
        let mut merged = Self::new(layout);
        if parts.is_empty() {
            return merged;
        }
        let earliest = |f: fn(&DomainScheduler) -> Option<Duration>| {
            parts.iter().map(f).reduce(|a, b| match (a, b) {
                (Some(a), Some(b)) => Some(a.min(b)),
                _ => None,
            })?
        };
        merged.last_placement = earliest(|s| s.last_placement);
        merged.last_constraint_check = earliest(|s| s.last_constraint_check);
        merged.last_balancing = earliest(|s| s.last_balancing);
        merged.placement_dirty = parts.iter().any(|s| s.placement_dirty);
        merged.constraint_dirty = parts.iter().any(|s| s.constraint_dirty);
        merged.balancing_dirty = parts.iter().any(|s| s.balancing_dirty);
        merged.force = parts.iter().any(|s| s.force);
        merged.with_move_next = parts.iter().any(|s| s.with_move_next);
        merged.quick_next = parts.iter().any(|s| s.quick_next);
        merged
    }

    pub fn id(&self) -> &DomainId {
        &self.layout.id
    }

    pub fn layout(&self) -> &ServiceDomainLayout {
        &self.layout
    }

    pub fn set_layout(&mut self, layout: ServiceDomainLayout) {
        self.layout = layout;
    }

    pub fn action(&self) -> SchedulerAction {
        self.action
    }

    pub fn is_dirty(&self) -> bool {
        self.placement_dirty || self.constraint_dirty || self.balancing_dirty
    }

    /// Something in the domain changed.
    pub fn touch(&mut self, force: bool) {
        self.placement_dirty = true;
        self.constraint_dirty = true;
        self.balancing_dirty = true;
        self.force |= force;
    }

    fn due(last: Option<Duration>, interval: Duration, now: Duration) -> bool {
        last.is_none_or(|at| now.saturating_sub(at) >= interval)
    }

    /// Phases to try this refresh, highest priority first.
    ///
    /// The caller runs them in order and stops at the first that produces
    /// actions. `balancing_allowed` folds in the cluster-wide balancing
    /// delay after node changes.
    pub fn plan(
        &mut self,
        now: Duration,
        config: &PlbConfig,
        needs: &DomainNeeds,
        balancing_allowed: bool,
    ) -> Vec<SearchKind> {
        let mut phases = Vec::new();

        if self.placement_dirty {
            if !needs.placement {
                self.placement_dirty = false;
                self.with_move_next = false;
            } else if self.force || Self::due(self.last_placement, config.min_placement_interval(), now) {
                phases.push(if self.with_move_next {
                    SearchKind::NewReplicaPlacementWithMove
                } else {
                    SearchKind::NewReplicaPlacement
                });
            }
        }

        if self.constraint_dirty {
            if !config.constraint_check_enabled || !needs.constraint_violations || !needs.movable {
                self.constraint_dirty = false;
            } else if self.force || Self::due(self.last_constraint_check, config.min_constraint_check_interval(), now) {
                phases.push(SearchKind::ConstraintCheck);
            }
        }

        if self.balancing_dirty && self.balancing_eligible(now, config, needs, balancing_allowed) {
            if self.quick_next {
                phases.push(SearchKind::QuickLoadBalancing);
            }
            phases.push(SearchKind::LoadBalancing);
        }
        phases
    }

    fn balancing_eligible(
        &mut self,
        now: Duration,
        config: &PlbConfig,
        needs: &DomainNeeds,
        balancing_allowed: bool,
    ) -> bool {
        if !config.load_balancing_enabled || !needs.active_metrics || !needs.movable {
            self.balancing_dirty = false;
            return false;
        }
        if needs.upgrading && !config.allow_balancing_during_application_upgrade {
            return false;
        }
        if !balancing_allowed || !Self::due(self.last_balancing, config.min_load_balancing_interval(), now) {
            return false;
        }
        let threshold = config.avg_std_dev_delta_throttle_threshold;
        if threshold >= 0.0 {
            if let Some(previous) = self.balanced_score {
                if needs.score <= previous * (1.0 + threshold) {
                    return false;
                }
            }
        }
        true
    }

    /// Record the result of one phase. `throttled` means the result was truncated.
    pub fn complete(&mut self, now: Duration, outcome: &SearchOutcome, throttled: bool) {
        let acted = outcome.action_count() > 0;
        match outcome.kind {
            SearchKind::NewReplicaPlacement | SearchKind::NewReplicaPlacementWithMove => {
                self.last_placement = Some(now);
                let failed = outcome.placement_failures() > 0;
                self.placement_dirty = failed || throttled;
                // Alternate the two modes while replicas stay unplaced.
                self.with_move_next = failed && outcome.kind == SearchKind::NewReplicaPlacement;
            }
            SearchKind::ConstraintCheck => {
                self.last_constraint_check = Some(now);
                self.constraint_dirty = throttled;
            }
            SearchKind::QuickLoadBalancing | SearchKind::LoadBalancing => {
                self.last_balancing = Some(now);
                self.balancing_dirty = throttled;
                self.quick_next = outcome.kind == SearchKind::LoadBalancing;
                self.balanced_score = Some(if acted {
                    outcome.score_after
                } else {
                    outcome.score_before
                });
            }
        }
        if acted {
            self.action = SchedulerAction::from_kind(outcome.kind);
        }
        if !outcome.kind.is_balancing() {
            self.force = false;
        }
    }

    /// No phase produced actions this refresh.
    pub fn settle(&mut self) {
        self.action = SchedulerAction::NoActionNeeded;
        self.force = false;
    }
}
