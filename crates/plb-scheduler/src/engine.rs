//! The `Plb` engine: mutation, refresh and query surface.
//!
//! Mutations are queued and committed at `process_pending_updates`. A
//! refresh commits the queue, reconciles service domains, asks every
//! dirty domain's scheduler which phases to try, and runs them against a
//! fresh snapshot. The split form (`begin_refresh`, `SearchTask::run`,
//! `finish_refresh`) lets the searches run off the engine while new
//! mutations keep arriving; a critical mutation cancels the in-flight
//! search of its domain.
//!
//! All timing is relative to the `now` handed in by the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use plb_core::PlbConfig;
use plb_placement::score::ScoreScope;
use plb_placement::{
    CancelToken, PartitionMovement, SearchError, SearchKind, SearchLimits, SearchOutcome, SearchResult,
    Snapshot, SnapshotBuilder, Solution, run_search,
};
use plb_state::*;

use crate::error::SchedulerResult;
use crate::scheduler::{DomainNeeds, DomainScheduler, SchedulerAction};
use crate::throttle::{MovementThrottle, percentage_cap, truncate};

// ── Results ────────────────────────────────────────────────────────

/// Per-domain summary of one refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainRefresh {
    pub domain: DomainId,
    pub action: SchedulerAction,
    pub actions: usize,
    pub score_before: f64,
    pub score_after: f64,
    pub interrupted: bool,
}

/// Everything one refresh decided.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshResult {
    pub movements: BTreeMap<PartitionId, PartitionMovement>,
    pub domains: Vec<DomainRefresh>,
}

impl RefreshResult {
    pub fn is_empty(&self) -> bool {
        self.movements.is_empty()
    }

    pub fn move_count(&self) -> usize {
        self.movements.values().map(|m| m.move_count()).sum()
    }

    pub fn action_count(&self) -> usize {
        self.movements.values().map(|m| m.action_count()).sum()
    }

    pub fn placement_failures(&self) -> usize {
        self.movements
            .values()
            .filter(|m| m.has_placement_failure())
            .count()
    }

    fn merge(&mut self, outcome: SearchOutcome) {
        for (id, movement) in outcome.movements {
            match self.movements.get_mut(&id) {
                Some(existing) => {
                    existing.actions.extend(movement.actions);
                    existing.cost += movement.cost;
                }
                None => {
                    self.movements.insert(id, movement);
                }
            }
        }
    }
}

/// Diagnostic view of a service domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainInfo {
    pub id: DomainId,
    pub services: BTreeSet<String>,
    pub metrics: BTreeSet<String>,
    pub action: SchedulerAction,
}

// ── Search tasks ───────────────────────────────────────────────────

#[derive(Debug)]
struct PlannedSearch {
    kind: SearchKind,
    snapshot: Arc<Snapshot>,
    limits: SearchLimits,
    domain_cap: Option<usize>,
}

/// One phase's outcome, after the domain cap was applied.
#[derive(Debug, Clone)]
pub struct PhaseResult {
    pub outcome: SearchOutcome,
    pub truncated: bool,
}

/// The searches one domain runs in a refresh. Owns its snapshots.
#[derive(Debug)]
pub struct SearchTask {
    domain: DomainId,
    phases: Vec<PlannedSearch>,
    cancel: CancelToken,
}

#[derive(Debug)]
pub struct TaskResult {
    pub domain: DomainId,
    pub phases: SearchResult<Vec<PhaseResult>>,
}

impl SearchTask {
    pub fn domain(&self) -> &DomainId {
        &self.domain
    }

    pub fn kinds(&self) -> Vec<SearchKind> {
        self.phases.iter().map(|p| p.kind).collect()
    }

    /// Run the planned phases in order until one produces actions.
    pub fn run(self) -> TaskResult {
        let mut results = Vec::new();
        for phase in &self.phases {
            let mut outcome = match run_search(&phase.snapshot, phase.kind, &phase.limits, &self.cancel) {
                Ok(outcome) => outcome,
                Err(e) => {
                    return TaskResult {
                        domain: self.domain,
                        phases: Err(e),
                    };
                }
            };
            let truncated = phase.domain_cap.is_some_and(|cap| outcome.action_count() > cap);
            if let Some(cap) = phase.domain_cap {
                outcome = truncate(outcome, cap);
            }
            let acted = outcome.action_count() > 0;
            results.push(PhaseResult { outcome, truncated });
            if acted {
                break;
            }
        }
        TaskResult {
            domain: self.domain,
            phases: Ok(results),
        }
    }
}

// ── Engine ─────────────────────────────────────────────────────────

pub struct Plb {
    config: Arc<PlbConfig>,
    state: ClusterState,
    pending: PendingQueue,
    domains: BTreeMap<DomainId, DomainScheduler>,
    service_domain: BTreeMap<String, DomainId>,
    throttle: MovementThrottle,
    in_flight: BTreeMap<DomainId, CancelToken>,
    last_commit: Option<Duration>,
    refreshed: bool,
    balancing_blocked_until: Option<Duration>,
}

impl Plb {
    pub fn new(config: PlbConfig) -> SchedulerResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            state: ClusterState::new(),
            pending: PendingQueue::new(),
            domains: BTreeMap::new(),
            service_domain: BTreeMap::new(),
            throttle: MovementThrottle::new(),
            in_flight: BTreeMap::new(),
            last_commit: None,
            refreshed: false,
            balancing_blocked_until: None,
        })
    }

    pub fn config(&self) -> &PlbConfig {
        &self.config
    }

    /// Replace the configuration; every domain is re-evaluated on the next refresh.
    pub fn update_config(&mut self, config: PlbConfig) -> SchedulerResult<()> {
        config.validate()?;
        self.config = Arc::new(config);
        for token in self.in_flight.values() {
            token.cancel();
        }
        self.reconcile_domains();
        for sched in self.domains.values_mut() {
            sched.touch(true);
        }
        info!(domains = self.domains.len(), "configuration updated");
        Ok(())
    }

    // ── Mutation API ───────────────────────────────────────────────

    /// Queue an update. Critical updates cancel the search of their domain.
    pub fn submit(&mut self, update: PendingUpdate) {
        let service = update.service().map(str::to_string);
        if !self.pending.push(update, &self.state) {
            return;
        }
        let domain = service.as_deref().and_then(|s| self.service_domain.get(s));
        match domain {
            Some(domain) => {
                if let Some(token) = self.in_flight.get(domain) {
                    info!(%domain, "critical update, cancelling search");
                    token.cancel();
                }
            }
            None => {
                for (domain, token) in &self.in_flight {
                    info!(%domain, "critical update, cancelling search");
                    token.cancel();
                }
            }
        }
    }

    pub fn update_node(&mut self, desc: NodeDescription) {
        self.submit(PendingUpdate::Node(desc));
    }

    pub fn delete_node(&mut self, id: NodeId) {
        self.submit(PendingUpdate::DeleteNode(id));
    }

    pub fn update_service_type(&mut self, desc: ServiceTypeDescription) {
        self.submit(PendingUpdate::ServiceType(desc));
    }

    pub fn delete_service_type(&mut self, name: &str) {
        self.submit(PendingUpdate::DeleteServiceType(name.to_string()));
    }

    pub fn update_application(&mut self, desc: ApplicationDescription) {
        self.submit(PendingUpdate::Application(desc));
    }

    pub fn delete_application(&mut self, name: &str) {
        self.submit(PendingUpdate::DeleteApplication(name.to_string()));
    }

    pub fn update_service(&mut self, desc: ServiceDescription) {
        self.submit(PendingUpdate::Service(desc));
    }

    pub fn delete_service(&mut self, name: &str) {
        self.submit(PendingUpdate::DeleteService(name.to_string()));
    }

    pub fn update_failover_unit(&mut self, desc: FailoverUnitDescription) {
        self.submit(PendingUpdate::FailoverUnit(desc));
    }

    pub fn delete_failover_unit(&mut self, service: &str, id: PartitionId) {
        self.submit(PendingUpdate::DeleteFailoverUnit {
            service: service.to_string(),
            id,
        });
    }

    pub fn update_load_or_move_cost(&mut self, desc: LoadOrMoveCostDescription) {
        self.submit(PendingUpdate::Load(desc));
    }

    pub fn reset_partition_load(&mut self, service: &str, id: PartitionId) {
        self.submit(PendingUpdate::ResetLoad {
            service: service.to_string(),
            id,
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ── Commit ─────────────────────────────────────────────────────

    /// Commit every queued update. Returns the number of effective changes.
    pub fn process_pending_updates(&mut self, now: Duration) -> usize {
        self.last_commit = Some(now);
        if self.pending.is_empty() {
            return 0;
        }
        let changes = self.pending.commit(&mut self.state);
        self.apply_changes(now, &changes);
        debug!(changes = changes.len(), "pending updates committed");
        changes.len()
    }

    /// Commit when the batching interval elapsed or a critical update is waiting.
    pub fn process_pending_updates_periodic_task(&mut self, now: Duration) -> bool {
        let due = self
            .last_commit
            .is_none_or(|at| now.saturating_sub(at) >= self.config.process_pending_updates_interval());
        if !due && !self.pending.has_critical() {
            return false;
        }
        self.process_pending_updates(now);
        true
    }

    fn apply_changes(&mut self, now: Duration, changes: &[Change]) {
        let structural = changes.iter().any(|c| {
            matches!(
                c,
                Change::Node { .. }
                    | Change::NodeDeleted { .. }
                    | Change::Application { .. }
                    | Change::ApplicationDeleted { .. }
                    | Change::Service { .. }
                    | Change::ServiceDeleted { .. }
            )
        });
        if structural {
            self.reconcile_domains();
        }

        for change in changes {
            match change {
                Change::Unchanged => {}
                Change::Node {
                    id,
                    added,
                    went_down,
                    availability_changed,
                    ..
                } => {
                    let delay = if *went_down {
                        Some(self.config.balancing_delay_after_node_down())
                    } else if *added && self.refreshed {
                        Some(self.config.balancing_delay_after_new_node())
                    } else {
                        None
                    };
                    if let Some(delay) = delay {
                        let until = now + delay;
                        self.balancing_blocked_until = Some(self.balancing_blocked_until.map_or(until, |t| t.max(until)));
                        debug!(node = id, delay_secs = delay.as_secs_f64(), "balancing delayed after node change");
                    }
                    self.touch_all(*availability_changed);
                }
                Change::NodeDeleted { .. } => self.touch_all(true),
                Change::ServiceType {
                    name,
                    block_list_changed,
                } => {
                    let services: Vec<String> = self
                        .state
                        .services()
                        .filter(|s| &s.service_type == name)
                        .map(|s| s.name.clone())
                        .collect();
                    for service in services {
                        self.touch_service(&service, *block_list_changed);
                    }
                }
                Change::ServiceTypeDeleted { .. } => {}
                Change::Application { name } | Change::ApplicationDeleted { name } => {
                    let services: Vec<String> = self
                        .state
                        .services()
                        .filter(|s| s.application.as_deref() == Some(name.as_str()))
                        .map(|s| s.name.clone())
                        .collect();
                    for service in services {
                        self.touch_service(&service, false);
                    }
                }
                Change::Service { name, .. } => self.touch_service(name, false),
                Change::ServiceDeleted { .. } => {}
                Change::FailoverUnit { service, critical, .. } => self.touch_service(service, *critical),
                Change::FailoverUnitDeleted { service, .. } | Change::Load { service, .. } => {
                    self.touch_service(service, false)
                }
            }
        }
    }

    fn touch_all(&mut self, force: bool) {
        for sched in self.domains.values_mut() {
            sched.touch(force);
        }
    }

    fn touch_service(&mut self, service: &str, force: bool) {
        if let Some(sched) = self
            .service_domain
            .get(service)
            .and_then(|d| self.domains.get_mut(d))
        {
            sched.touch(force);
        }
    }

    /// Recompute domains and carry scheduler state over.
    ///
    /// An unchanged domain keeps its scheduler. Domains that merged fold
    /// their schedulers together; a split or otherwise reshaped domain
    /// starts fresh.
    fn reconcile_domains(&mut self) {
        let layouts = compute_domains(&self.state, &self.config);
        let mut old = std::mem::take(&mut self.domains);
        let mut next = BTreeMap::new();

        for layout in layouts {
            let overlapping: Vec<DomainId> = old
                .iter()
                .filter(|(_, s)| !s.layout().services.is_disjoint(&layout.services))
                .map(|(id, _)| id.clone())
                .collect();

            let same = overlapping.len() == 1
                && old
                    .get(&overlapping[0])
                    .is_some_and(|s| s.layout().services == layout.services);
            let merged = !overlapping.is_empty()
                && overlapping.iter().all(|id| {
                    old.get(id)
                        .is_some_and(|s| s.layout().services.is_subset(&layout.services))
                });

            let id = layout.id.clone();
            let sched = if same {
                let Some(mut sched) = old.remove(&overlapping[0]) else {
                    continue;
                };
                if sched.layout().metrics != layout.metrics {
                    sched.touch(false);
                }
                if sched.id() != &layout.id {
                    self.rekey_in_flight(&overlapping[0], &layout.id);
                }
                sched.set_layout(layout);
                sched
            } else if merged {
                let parts: Vec<DomainScheduler> = overlapping
                    .iter()
                    .filter_map(|d| {
                        self.cancel_in_flight(d);
                        old.remove(d)
                    })
                    .collect();
                info!(domain = %id, merged = parts.len(), "service domains merged");
                let mut sched = DomainScheduler::merge(layout, parts);
                sched.touch(false);
                sched
            } else {
                if overlapping.is_empty() {
                    debug!(domain = %id, "service domain created");
                } else {
                    info!(domain = %id, "service domain split");
                }
                DomainScheduler::new(layout)
            };
            next.insert(id, sched);
        }

        for id in old.keys() {
            self.cancel_in_flight(id);
            debug!(domain = %id, "service domain removed");
        }
        self.service_domain = next
            .iter()
            .flat_map(|(id, s)| s.layout().services.iter().map(move |svc| (svc.clone(), id.clone())))
            .collect();
        self.domains = next;
    }

    fn cancel_in_flight(&mut self, domain: &DomainId) {
        if let Some(token) = self.in_flight.remove(domain) {
            token.cancel();
        }
    }

    fn rekey_in_flight(&mut self, from: &DomainId, to: &DomainId) {
        if let Some(token) = self.in_flight.remove(from) {
            self.in_flight.insert(to.clone(), token);
        }
    }

    // ── Refresh ────────────────────────────────────────────────────

    /// Run one scheduling pass synchronously.
    pub fn refresh(&mut self, now: Duration) -> RefreshResult {
        let tasks = self.begin_refresh(now);
        let results = tasks.into_iter().map(SearchTask::run).collect();
        self.finish_refresh(now, results)
    }

    /// Commit pending updates and plan the searches of every dirty domain.
    pub fn begin_refresh(&mut self, now: Duration) -> Vec<SearchTask> {
        self.process_pending_updates(now);
        self.refreshed = true;

        let config = Arc::clone(&self.config);
        let throttled = self.throttle.throttled_partitions(now, &config);
        let total_replicas = self.state.active_replica_count();
        let balancing_allowed = self.balancing_blocked_until.is_none_or(|until| now >= until);
        let builder = SnapshotBuilder::new(&self.state, Arc::clone(&config));
        let balancing_builder = SnapshotBuilder::new(&self.state, Arc::clone(&config)).throttled(&throttled);

        let mut tasks = Vec::new();
        for (id, sched) in self.domains.iter_mut() {
            if self.in_flight.contains_key(id) {
                continue;
            }
            if !sched.is_dirty() {
                sched.settle();
                continue;
            }
            let snap = Arc::new(builder.build(sched.layout()));
            let needs = if snap.is_empty() {
                DomainNeeds::default()
            } else {
                domain_needs(&snap)
            };
            let kinds = sched.plan(now, &config, &needs, balancing_allowed);
            if kinds.is_empty() {
                sched.settle();
                continue;
            }

            let mut balancing_snap: Option<Arc<Snapshot>> = None;
            let mut phases = Vec::new();
            for kind in kinds {
                let snapshot = if kind.is_balancing() && !throttled.is_empty() {
                    balancing_snap
                        .get_or_insert_with(|| Arc::new(balancing_builder.build(sched.layout())))
                        .clone()
                } else {
                    Arc::clone(&snap)
                };
                let global = self.throttle.allowance(now, &config, kind, total_replicas);
                let domain_cap = domain_cap(&config, kind, &snapshot);
                let cap = [global, domain_cap].into_iter().flatten().min();
                if cap == Some(0) {
                    debug!(domain = %id, %kind, "phase fully throttled");
                    continue;
                }
                let mut limits = SearchLimits::from_config(&config, kind);
                if let Some(cap) = cap {
                    limits = limits.with_max_moves(cap);
                }
                phases.push(PlannedSearch {
                    kind,
                    snapshot,
                    limits,
                    domain_cap,
                });
            }
            if phases.is_empty() {
                continue;
            }
            let cancel = CancelToken::new();
            self.in_flight.insert(id.clone(), cancel.clone());
            tasks.push(SearchTask {
                domain: id.clone(),
                phases,
                cancel,
            });
        }
        tasks
    }

    /// Apply throttles to finished searches and update domain schedulers.
    pub fn finish_refresh(&mut self, now: Duration, results: Vec<TaskResult>) -> RefreshResult {
        let config = Arc::clone(&self.config);
        let mut refresh = RefreshResult::default();

        for result in results {
            let domain = result.domain;
            if self.in_flight.remove(&domain).is_none() {
                debug!(%domain, "stale search result discarded");
                continue;
            }
            let Some(sched) = self.domains.get_mut(&domain) else {
                continue;
            };
            let phases = match result.phases {
                Ok(phases) => phases,
                Err(SearchError::Interrupted { iterations }) => {
                    info!(%domain, iterations, "search interrupted, candidate discarded");
                    sched.touch(false);
                    refresh.domains.push(DomainRefresh {
                        domain,
                        action: SchedulerAction::NoActionNeeded,
                        actions: 0,
                        score_before: 0.0,
                        score_after: 0.0,
                        interrupted: true,
                    });
                    continue;
                }
            };

            let mut summary = DomainRefresh {
                domain: domain.clone(),
                action: SchedulerAction::NoActionNeeded,
                actions: 0,
                score_before: 0.0,
                score_after: 0.0,
                interrupted: false,
            };
            for (i, phase) in phases.into_iter().enumerate() {
                let total_replicas = self.state.active_replica_count();
                let kind = phase.outcome.kind;
                let allowance = self.throttle.allowance(now, &config, kind, total_replicas);
                let over = allowance.is_some_and(|a| phase.outcome.action_count() > a);
                let outcome = match allowance {
                    Some(a) => truncate(phase.outcome, a),
                    None => phase.outcome,
                };
                self.throttle.record(now, &outcome);
                sched.complete(now, &outcome, phase.truncated || over);

                if i == 0 {
                    summary.score_before = outcome.score_before;
                }
                summary.score_after = outcome.score_after;
                if outcome.action_count() > 0 {
                    summary.action = SchedulerAction::from_kind(kind);
                    summary.actions += outcome.action_count();
                }
                refresh.merge(outcome);
            }
            if summary.actions == 0 {
                sched.settle();
            }
            debug!(
                %domain,
                action = %summary.action,
                moves = summary.actions,
                score_before = summary.score_before,
                score_after = summary.score_after,
                "domain refreshed"
            );
            refresh.domains.push(summary);
        }

        if !refresh.is_empty() {
            info!(
                partitions = refresh.movements.len(),
                actions = refresh.action_count(),
                "refresh produced movements"
            );
        }
        refresh
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn node_load(&self, node: NodeId, metric: &str) -> u64 {
        self.state.node_load(node, metric)
    }

    pub fn node_loads(&self, node: NodeId) -> BTreeMap<String, u64> {
        self.state
            .metric_names()
            .into_iter()
            .map(|metric| {
                let load = self.state.node_load(node, &metric);
                (metric, load)
            })
            .collect()
    }

    pub fn cluster_load(&self, metric: &str) -> u64 {
        self.state.nodes().map(|n| self.state.node_load(n.id, metric)).sum()
    }

    pub fn service_domains(&self) -> Vec<DomainInfo> {
        self.domains
            .values()
            .map(|s| DomainInfo {
                id: s.id().clone(),
                services: s.layout().services.clone(),
                metrics: s.layout().metrics.clone(),
                action: s.action(),
            })
            .collect()
    }

    pub fn domain_of(&self, service: &str) -> Option<&DomainId> {
        self.service_domain.get(service)
    }

    pub fn partition(&self, id: PartitionId) -> Option<&FailoverUnitDescription> {
        self.state.failover_unit(id)
    }
}

fn domain_needs(snap: &Snapshot) -> DomainNeeds {
    let placement = snap.has_new_replicas() || snap.has_extra_replicas();
    let constraint_violations = !Solution::new(snap, ScoreScope::All).violations().is_empty();
    let score = Solution::new(snap, ScoreScope::Active).score();
    DomainNeeds {
        placement,
        constraint_violations,
        movable: snap.has_movable_replicas(),
        active_metrics: snap.has_active_metric(),
        upgrading: snap.has_upgrading_partition(),
        score,
    }
}

/// Per-domain cap from `max_percentage_to_move`.
///
/// Placement with moves may add every new replica plus its own
/// percentage of relocations. Plain placement and constraint check are
/// not capped here.
fn domain_cap(config: &PlbConfig, kind: SearchKind, snap: &Snapshot) -> Option<usize> {
    let existing = snap.existing_replica_count();
    match kind {
        SearchKind::QuickLoadBalancing | SearchKind::LoadBalancing => {
            percentage_cap(config.max_percentage_to_move, existing)
        }
        SearchKind::NewReplicaPlacementWithMove => {
            let resolving: usize = snap
                .partitions
                .iter()
                .map(|p| p.replicas.iter().filter(|r| r.is_new).count() + p.extra_replicas as usize)
                .sum();
            percentage_cap(config.max_percentage_to_move_for_placement, existing).map(|cap| cap + resolving)
        }
        SearchKind::NewReplicaPlacement | SearchKind::ConstraintCheck => None,
    }
}

impl std::fmt::Debug for Plb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plb")
            .field("domains", &self.domains.len())
            .field("pending", &self.pending.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

/// Reject a configuration without constructing an engine.
pub fn check_config(config: &PlbConfig) -> SchedulerResult<()> {
    if let Err(e) = config.validate() {
        warn!(error = %e, "invalid configuration");
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn node(id: NodeId) -> NodeDescription {
        let mut node = NodeDescription::new(id);
        node.fault_domain = vec![format!("fd{id}")];
        node.upgrade_domain = format!("ud{id}");
        node
    }

    fn service(name: &str, metric: &str) -> ServiceDescription {
        let mut svc = ServiceDescription::new(name, "T", false);
        svc.metrics = vec![ServiceMetric::new(metric, 1.0, 10, 10)];
        svc
    }

    fn instance(id: u128, service: &str, node: NodeId) -> FailoverUnitDescription {
        FailoverUnitDescription::new(Uuid::from_u128(id), service, 1)
            .with_replicas(vec![ReplicaDescription::instance(node)])
    }

    #[test]
    fn updates_are_invisible_until_committed() {
        let mut plb = Plb::new(PlbConfig::default()).unwrap();
        plb.update_node(node(0));
        assert_eq!(plb.pending_count(), 1);
        assert!(plb.state().node(0).is_none());

        assert_eq!(plb.process_pending_updates(Duration::ZERO), 1);
        assert!(plb.state().node(0).is_some());
    }

    #[test]
    fn periodic_commit_waits_for_interval_unless_critical() {
        let mut plb = Plb::new(PlbConfig::default()).unwrap();
        plb.update_service(service("svc", "Cpu"));
        assert!(plb.process_pending_updates_periodic_task(Duration::ZERO));

        plb.update_node(node(0));
        assert!(!plb.process_pending_updates_periodic_task(Duration::from_millis(100)));
        assert!(plb.process_pending_updates_periodic_task(Duration::from_millis(300)));

        // A new partition is critical and is committed right away.
        plb.update_failover_unit(instance(1, "svc", 0));
        assert!(plb.process_pending_updates_periodic_task(Duration::from_millis(310)));
        assert!(plb.partition(Uuid::from_u128(1)).is_some());
    }

    #[test]
    fn rejected_updates_do_not_surface() {
        let mut plb = Plb::new(PlbConfig::default()).unwrap();
        plb.update_failover_unit(instance(1, "missing", 0));
        plb.delete_service("missing");
        assert_eq!(plb.process_pending_updates(Duration::ZERO), 0);
        assert!(plb.partition(Uuid::from_u128(1)).is_none());
    }

    #[test]
    fn domains_track_service_metrics() {
        let mut plb = Plb::new(PlbConfig::default()).unwrap();
        plb.update_service(service("a", "Cpu"));
        plb.update_service(service("b", "Mem"));
        plb.process_pending_updates(Duration::ZERO);
        assert_eq!(plb.service_domains().len(), 2);

        let mut b = service("b", "Mem");
        b.metrics.push(ServiceMetric::new("Cpu", 1.0, 1, 1));
        plb.update_service(b);
        plb.process_pending_updates(Duration::ZERO);
        let domains = plb.service_domains();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].services.len(), 2);
        assert_eq!(plb.domain_of("a"), plb.domain_of("b"));
    }

    #[test]
    fn loads_are_queryable() {
        let mut plb = Plb::new(PlbConfig::default()).unwrap();
        plb.update_node(node(0));
        plb.update_node(node(1));
        plb.update_service(service("svc", "Cpu"));
        plb.update_failover_unit(instance(1, "svc", 0));
        plb.update_failover_unit(instance(2, "svc", 0));
        plb.update_failover_unit(instance(3, "svc", 1));
        plb.process_pending_updates(Duration::ZERO);

        assert_eq!(plb.node_load(0, "Cpu"), 20);
        assert_eq!(plb.node_loads(1).get("Cpu"), Some(&10));
        assert_eq!(plb.cluster_load("Cpu"), 30);
    }

    #[test]
    fn refresh_result_serializes_with_snake_case_actions() {
        let mut plb = Plb::new(PlbConfig::default()).unwrap();
        plb.update_node(node(0));
        plb.update_node(node(1));
        plb.update_service(service("svc", "Cpu"));
        for id in 1..=3 {
            plb.update_failover_unit(instance(id, "svc", 0));
        }
        let result = plb.refresh(Duration::ZERO);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["domains"][0]["action"], "quick_load_balancing");
        assert_eq!(json["domains"][0]["interrupted"], false);
        assert!(json["movements"].as_object().is_some_and(|m| !m.is_empty()));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = PlbConfig::default();
        config.max_percentage_to_move = 2.0;
        assert!(Plb::new(config.clone()).is_err());
        assert!(check_config(&config).is_err());

        let mut plb = Plb::new(PlbConfig::default()).unwrap();
        assert!(plb.update_config(config).is_err());
        assert_eq!(plb.config().max_percentage_to_move, 0.3);
    }
}
