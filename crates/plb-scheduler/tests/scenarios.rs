//! End-to-end refresh scenarios driven through the synchronous engine API.

use std::collections::BTreeSet;
use std::time::Duration;

use plb_core::PlbConfig;
use plb_placement::MoveKind;
use plb_scheduler::{Plb, RefreshResult, SchedulerAction, apply_movements};
use plb_state::*;
use uuid::Uuid;

// ── Helpers ────────────────────────────────────────────────────────

struct Cluster {
    plb: Plb,
    now: Duration,
}

impl Cluster {
    fn new(config: PlbConfig) -> Self {
        Self {
            plb: Plb::new(config).unwrap(),
            now: Duration::ZERO,
        }
    }

    fn refresh(&mut self) -> RefreshResult {
        self.plb.refresh(self.now)
    }

    fn advance(&mut self, secs: u64) {
        self.now += Duration::from_secs(secs);
    }

    /// Complete every move the way the fail-over layer would.
    fn apply(&mut self, result: &RefreshResult) {
        for (id, movement) in &result.movements {
            let fu = self.plb.partition(*id).unwrap().clone();
            self.plb.update_failover_unit(apply_movements(&fu, movement));
        }
        self.plb.process_pending_updates(self.now);
    }
}

fn node(id: NodeId) -> NodeDescription {
    let mut node = NodeDescription::new(id);
    node.fault_domain = vec![format!("fd{id}")];
    node.upgrade_domain = format!("ud{id}");
    node
}

fn pid(n: u128) -> PartitionId {
    Uuid::from_u128(n)
}

fn stateful(id: u128, service: &str, primary: NodeId, secondary: NodeId) -> FailoverUnitDescription {
    FailoverUnitDescription::new(pid(id), service, 1).with_replicas(vec![
        ReplicaDescription::primary(primary),
        ReplicaDescription::secondary(secondary),
    ])
}

fn instance(id: u128, service: &str, node: NodeId) -> FailoverUnitDescription {
    FailoverUnitDescription::new(pid(id), service, 1).with_replicas(vec![ReplicaDescription::instance(node)])
}

fn assert_replicas_on_distinct_nodes(plb: &Plb) {
    for fu in plb.state().failover_units() {
        let nodes: BTreeSet<NodeId> = fu.replicas.iter().map(|r| r.node).collect();
        assert_eq!(nodes.len(), fu.replicas.len(), "partition {} stacks replicas", fu.id);
    }
}

// ── Primary balancing ──────────────────────────────────────────────

fn skewed_primaries(config: PlbConfig) -> Cluster {
    let mut cluster = Cluster::new(config);
    for id in 0..5 {
        cluster.plb.update_node(node(id));
    }
    let mut svc = ServiceDescription::new("svc", "T", true);
    svc.target_replica_set_size = 2;
    cluster.plb.update_service(svc);
    for (i, (p, s)) in [(0, 3), (1, 2), (3, 1), (3, 1), (1, 4)].into_iter().enumerate() {
        cluster.plb.update_failover_unit(stateful(i as u128 + 1, "svc", p, s));
    }
    cluster
}

#[test]
fn skewed_primaries_balance_within_domain_cap() {
    let mut cluster = skewed_primaries(PlbConfig::default());
    let first = cluster.refresh();

    // Ten replicas, 30% of them may move per refresh.
    assert_eq!(first.action_count(), 3);
    assert_eq!(first.domains.len(), 1);
    assert_eq!(first.domains[0].action, SchedulerAction::QuickLoadBalancing);
    assert!(first.domains[0].score_after < first.domains[0].score_before);

    let mut result = first;
    for _ in 0..20 {
        if result.is_empty() {
            break;
        }
        cluster.apply(&result);
        assert_replicas_on_distinct_nodes(&cluster.plb);
        cluster.advance(6);
        result = cluster.refresh();
        assert!(result.action_count() <= 3);
    }
    assert!(result.is_empty(), "balancing did not converge");

    let primaries: Vec<u64> = (0..5).map(|n| cluster.plb.node_load(n, "PrimaryCount")).collect();
    assert_eq!(primaries.iter().sum::<u64>(), 5);
    assert!(primaries.iter().all(|&p| p <= 2), "primaries still skewed: {primaries:?}");
}

// ── Capacity-bounded balancing ─────────────────────────────────────

#[test]
fn balancing_fills_capped_node_up_to_capacity() {
    let mut cluster = Cluster::new(PlbConfig::default());
    let mut capped = node(0);
    capped.capacities.insert("Count".into(), 25);
    cluster.plb.update_node(capped);
    cluster.plb.update_node(node(1));
    cluster.plb.update_service(ServiceDescription::new("web", "T", false));
    for id in 0..100 {
        cluster.plb.update_failover_unit(instance(id + 1, "web", 1));
    }

    let result = cluster.refresh();
    let moved: Vec<_> = result.movements.values().flat_map(|m| m.actions.iter()).collect();
    assert_eq!(moved.len(), 25);
    for action in moved {
        assert_eq!(action.kind, MoveKind::MoveInstance);
        assert_eq!(action.source, Some(1));
        assert_eq!(action.target, Some(0));
    }

    cluster.apply(&result);
    assert_eq!(cluster.plb.node_load(0, "Count"), 25);
    assert_eq!(cluster.plb.cluster_load("Count"), 100);
}

// ── Balancing thresholds ───────────────────────────────────────────

fn cpu_cluster(config: PlbConfig) -> Cluster {
    let mut cluster = Cluster::new(config);
    cluster.plb.update_node(node(0));
    cluster.plb.update_node(node(1));
    let mut svc = ServiceDescription::new("svc", "T", false);
    svc.metrics = vec![ServiceMetric::new("Cpu", 1.0, 10, 10)];
    cluster.plb.update_service(svc);
    for id in 1..=3 {
        cluster.plb.update_failover_unit(instance(id, "svc", 0));
    }
    cluster.plb.update_failover_unit(instance(4, "svc", 1));
    cluster
}

fn with_cpu_threshold(threshold: f64) -> PlbConfig {
    let mut config = PlbConfig::default();
    config.metric_balancing_thresholds.insert("Cpu".into(), threshold);
    config
}

#[test]
fn zero_balancing_threshold_disables_balancing() {
    let mut cluster = cpu_cluster(with_cpu_threshold(0.0));
    let result = cluster.refresh();
    assert!(result.is_empty());
    assert_eq!(cluster.plb.node_load(0, "Cpu"), 30);
    assert_eq!(cluster.plb.service_domains()[0].action, SchedulerAction::NoActionNeeded);
}

#[test]
fn raising_threshold_turns_balancing_on() {
    let mut cluster = cpu_cluster(with_cpu_threshold(0.0));
    assert!(cluster.refresh().is_empty());

    cluster.plb.update_config(with_cpu_threshold(2.0)).unwrap();
    let result = cluster.refresh();
    assert!(!result.is_empty());

    // A fresh engine with the same settings decides the same way.
    let mut fresh = cpu_cluster(with_cpu_threshold(2.0));
    assert!(!fresh.refresh().is_empty());
}

#[test]
fn threshold_above_ratio_keeps_cluster_still() {
    // 30 against 10 is a ratio of 3.
    let mut cluster = cpu_cluster(with_cpu_threshold(4.0));
    assert!(cluster.refresh().is_empty());
}

// ── Frozen partitions ──────────────────────────────────────────────

#[test]
fn quorum_lost_partition_is_never_moved() {
    let mut slow = PlbConfig::default();
    slow.use_slow_balancing = true;
    let mut seeded = PlbConfig::default();
    seeded.initial_random_seed = 7;
    seeded.swap_primary_probability = 0.0;

    for config in [PlbConfig::default(), slow, seeded] {
        let mut cluster = Cluster::new(config);
        for id in 0..3 {
            cluster.plb.update_node(node(id));
        }
        let mut svc = ServiceDescription::new("svc", "T", true);
        svc.target_replica_set_size = 2;
        cluster.plb.update_service(svc);

        let mut lost = stateful(1, "svc", 0, 1);
        lost.flags.quorum_lost = true;
        cluster.plb.update_failover_unit(lost);
        for id in 2..=6 {
            cluster.plb.update_failover_unit(stateful(id, "svc", 0, 1));
        }

        let mut moved_any = false;
        for _ in 0..5 {
            let result = cluster.refresh();
            assert!(!result.movements.contains_key(&pid(1)));
            moved_any |= !result.is_empty();
            cluster.apply(&result);
            cluster.advance(6);
        }
        assert!(moved_any);
        let lost = cluster.plb.partition(pid(1)).unwrap();
        assert_eq!(lost.version, 1);
        assert_eq!(lost.primary_node(), Some(0));
    }
}
