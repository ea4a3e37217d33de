//! Properties every sequence of refreshes has to keep.

use std::collections::BTreeSet;
use std::time::Duration;

use plb_core::PlbConfig;
use plb_scheduler::{Plb, RefreshResult, SchedulerAction, apply_movements};
use plb_state::*;
use uuid::Uuid;

fn node(id: NodeId) -> NodeDescription {
    let mut node = NodeDescription::new(id);
    node.fault_domain = vec![format!("fd{id}")];
    node.upgrade_domain = format!("ud{id}");
    node
}

fn service(name: &str, metrics: &[&str]) -> ServiceDescription {
    let mut svc = ServiceDescription::new(name, "T", false);
    svc.metrics = metrics.iter().map(|m| ServiceMetric::new(m, 1.0, 10, 10)).collect();
    svc
}

fn instance(id: u128, service: &str, node: NodeId) -> FailoverUnitDescription {
    FailoverUnitDescription::new(Uuid::from_u128(id), service, 1).with_replicas(vec![ReplicaDescription::instance(node)])
}

fn apply(plb: &mut Plb, now: Duration, result: &RefreshResult) {
    for (id, movement) in &result.movements {
        let fu = plb.partition(*id).unwrap().clone();
        plb.update_failover_unit(apply_movements(&fu, movement));
    }
    plb.process_pending_updates(now);
}

/// Forty instances piled on one of four nodes.
fn piled_up(config: PlbConfig) -> Plb {
    let mut plb = Plb::new(config).unwrap();
    for id in 0..4 {
        plb.update_node(node(id));
    }
    plb.update_service(service("svc", &["Cpu"]));
    for id in 1..=40 {
        plb.update_failover_unit(instance(id, "svc", 0));
    }
    plb
}

#[test]
fn global_throttle_bounds_actions_in_window() {
    let mut config = PlbConfig::default();
    config.global_movement_throttle_threshold = 5;
    config.global_movement_throttle_counting_interval = 600.0;
    let mut plb = piled_up(config);

    let mut now = Duration::ZERO;
    let mut total = 0;
    for _ in 0..10 {
        let result = plb.refresh(now);
        // 30% of forty replicas per domain and refresh.
        assert!(result.action_count() <= 12);
        total += result.action_count();
        apply(&mut plb, now, &result);
        now += Duration::from_secs(6);
    }
    assert!(total > 0);
    assert!(total <= 5, "{total} actions inside one counting interval");

    // Once the window has passed the throttle opens again.
    now += Duration::from_secs(600);
    assert!(!plb.refresh(now).is_empty());
}

#[test]
fn refresh_without_changes_is_quiet() {
    let mut plb = Plb::new(PlbConfig::default()).unwrap();
    plb.update_node(node(0));
    plb.update_node(node(1));
    plb.update_service(service("svc", &["Cpu"]));
    for id in 1..=3 {
        plb.update_failover_unit(instance(id, "svc", 0));
    }
    plb.update_failover_unit(instance(4, "svc", 1));

    let first = plb.refresh(Duration::ZERO);
    assert!(!first.is_empty());
    // The moves were never carried out; nothing changed since.
    assert!(plb.refresh(Duration::ZERO).is_empty());
    assert!(plb.refresh(Duration::from_secs(60)).is_empty());
    assert_eq!(plb.service_domains()[0].action, SchedulerAction::NoActionNeeded);
}

fn domain_members(plb: &Plb) -> BTreeSet<BTreeSet<String>> {
    plb.service_domains().into_iter().map(|d| d.services).collect()
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn domains_are_closed_under_shared_metrics() {
    let mut plb = Plb::new(PlbConfig::default()).unwrap();
    plb.update_service(service("a", &["Cpu"]));
    plb.update_service(service("b", &["Mem"]));
    plb.update_service(service("c", &["Cpu", "Disk"]));
    plb.update_service(service("d", &["Disk"]));
    plb.update_service(service("e", &["Net"]));
    plb.process_pending_updates(Duration::ZERO);

    assert_eq!(
        domain_members(&plb),
        BTreeSet::from([set(&["a", "c", "d"]), set(&["b"]), set(&["e"])])
    );
    assert_eq!(plb.domain_of("a"), plb.domain_of("d"));

    // Dropping the bridge splits the domain; picking up Mem joins b.
    plb.update_service(service("c", &["Mem"]));
    plb.process_pending_updates(Duration::from_secs(1));
    assert_eq!(
        domain_members(&plb),
        BTreeSet::from([set(&["a"]), set(&["b", "c"]), set(&["d"]), set(&["e"])])
    );

    plb.delete_service("c");
    plb.process_pending_updates(Duration::from_secs(2));
    assert_eq!(plb.domain_of("c"), None);
    assert_eq!(domain_members(&plb).len(), 4);

    for info in plb.service_domains() {
        for svc in &info.services {
            assert_eq!(plb.domain_of(svc), Some(&info.id));
        }
    }
}

#[test]
fn deactivated_node_is_evacuated_within_capacity() {
    let mut plb = Plb::new(PlbConfig::default()).unwrap();
    for id in 0..4 {
        let mut n = node(id);
        n.capacities.insert("Cpu".into(), 100);
        if id == 2 {
            n.deactivation_intent = DeactivationIntent::RemoveNode;
            n.deactivation_status = DeactivationStatus::SafetyCheckInProgress;
        }
        plb.update_node(n);
    }
    let mut svc = ServiceDescription::new("svc", "T", true);
    svc.metrics = vec![ServiceMetric::new("Cpu", 1.0, 10, 5)];
    svc.target_replica_set_size = 3;
    plb.update_service(svc);
    let layouts: [[NodeId; 3]; 3] = [[2, 0, 1], [0, 2, 3], [1, 2, 3]];
    for (i, nodes) in layouts.iter().enumerate() {
        let replicas = nodes
            .iter()
            .enumerate()
            .map(|(j, &n)| {
                if j == 0 {
                    ReplicaDescription::primary(n)
                } else {
                    ReplicaDescription::secondary(n)
                }
            })
            .collect();
        plb.update_failover_unit(FailoverUnitDescription::new(Uuid::from_u128(i as u128 + 1), "svc", 1).with_replicas(replicas));
    }

    let mut now = Duration::ZERO;
    let first = plb.refresh(now);
    assert!(!first.is_empty());
    assert_eq!(first.domains[0].action, SchedulerAction::ConstraintCheck);

    let mut result = first;
    for _ in 0..5 {
        for action in result.movements.values().flat_map(|m| m.actions.iter()) {
            assert_ne!(action.target, Some(2), "replica placed on a deactivated node");
        }
        apply(&mut plb, now, &result);
        for id in 0..4 {
            assert!(plb.node_load(id, "Cpu") <= 100);
        }
        if plb.node_load(2, "Cpu") == 0 {
            break;
        }
        now += Duration::from_secs(2);
        result = plb.refresh(now);
    }
    assert_eq!(plb.node_load(2, "Cpu"), 0);
    for fu in plb.state().failover_units() {
        let nodes: BTreeSet<NodeId> = fu.replicas.iter().map(|r| r.node).collect();
        assert_eq!(nodes.len(), 3);
        assert!(!nodes.contains(&2));
    }
}

#[test]
fn balancing_never_raises_the_score() {
    for seed in [0, 1, 42] {
        let mut config = PlbConfig::default();
        config.initial_random_seed = seed;
        let mut plb = piled_up(config);
        let mut now = Duration::ZERO;
        for _ in 0..6 {
            let result = plb.refresh(now);
            for domain in &result.domains {
                if matches!(
                    domain.action,
                    SchedulerAction::QuickLoadBalancing | SchedulerAction::LoadBalancing
                ) {
                    assert!(domain.actions > 0);
                    assert!(domain.score_after <= domain.score_before + 1e-9);
                }
            }
            apply(&mut plb, now, &result);
            now += Duration::from_secs(6);
        }
    }
}
