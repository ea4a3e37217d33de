//! Mutations arriving while a domain's search is running.

use std::time::Duration;

use plb_core::PlbConfig;
use plb_scheduler::{ManualClock, Plb, PlbService, SearchTask};
use plb_state::*;
use uuid::Uuid;

fn node(id: NodeId) -> NodeDescription {
    let mut node = NodeDescription::new(id);
    node.fault_domain = vec![format!("fd{id}")];
    node.upgrade_domain = format!("ud{id}");
    node
}

fn instance(id: u128, node: NodeId) -> FailoverUnitDescription {
    FailoverUnitDescription::new(Uuid::from_u128(id), "svc", 1).with_replicas(vec![ReplicaDescription::instance(node)])
}

fn updates() -> Vec<PendingUpdate> {
    let mut svc = ServiceDescription::new("svc", "T", false);
    svc.metrics = vec![ServiceMetric::new("Cpu", 1.0, 10, 10)];
    let mut updates = vec![
        PendingUpdate::Node(node(0)),
        PendingUpdate::Node(node(1)),
        PendingUpdate::Service(svc),
    ];
    updates.extend((1..=3).map(|id| PendingUpdate::FailoverUnit(instance(id, 0))));
    updates.push(PendingUpdate::FailoverUnit(instance(4, 1)));
    updates
}

fn imbalanced() -> Plb {
    let mut plb = Plb::new(PlbConfig::default()).unwrap();
    for update in updates() {
        plb.submit(update);
    }
    plb
}

#[test]
fn critical_update_discards_running_search() {
    let mut plb = imbalanced();
    let now = Duration::ZERO;
    let tasks = plb.begin_refresh(now);
    assert_eq!(tasks.len(), 1);

    // A new partition lands in the domain while its search runs.
    plb.update_failover_unit(instance(5, 0));
    let results = tasks.into_iter().map(SearchTask::run).collect();
    let result = plb.finish_refresh(now, results);

    assert!(result.is_empty());
    assert_eq!(result.domains.len(), 1);
    assert!(result.domains[0].interrupted);

    // The next pass sees the new partition and balances.
    let next = plb.refresh(now + Duration::from_secs(1));
    assert!(!next.is_empty());
    assert!(!next.domains[0].interrupted);
    assert_eq!(plb.node_load(0, "Cpu"), 40);
}

#[test]
fn load_report_does_not_interrupt() {
    let mut plb = imbalanced();
    let now = Duration::ZERO;
    let tasks = plb.begin_refresh(now);

    plb.update_load_or_move_cost(LoadOrMoveCostDescription {
        partition_id: Uuid::from_u128(4),
        service_name: "svc".into(),
        reports: vec![LoadReport {
            metric: "Cpu".into(),
            role: ReplicaRole::Instance,
            node: Some(1),
            value: 12,
        }],
    });
    let results = tasks.into_iter().map(SearchTask::run).collect();
    let result = plb.finish_refresh(now, results);

    assert!(!result.is_empty());
    assert!(!result.domains[0].interrupted);
    assert_eq!(plb.pending_count(), 1);
}

#[test]
fn domain_with_search_in_flight_is_not_planned_twice() {
    let mut plb = imbalanced();
    let now = Duration::ZERO;
    let tasks = plb.begin_refresh(now);
    assert_eq!(tasks.len(), 1);
    assert!(plb.begin_refresh(now).is_empty());

    let results = tasks.into_iter().map(SearchTask::run).collect();
    assert!(!plb.finish_refresh(now, results).is_empty());
}

#[tokio::test]
async fn service_accepts_updates_while_searching() {
    let service = PlbService::new(Plb::new(PlbConfig::default()).unwrap(), ManualClock::new());
    for update in updates() {
        service.submit(update).await;
    }

    let pending = service.begin().await;
    assert_eq!(pending.len(), 1);
    service.submit(PendingUpdate::FailoverUnit(instance(5, 1))).await;
    let result = service.finish(pending).await.unwrap();
    assert_eq!(result.domains.len(), 1);

    service.clock().advance(Duration::from_secs(1));
    service.process_pending_updates().await;
    assert_eq!(service.cluster_load("Cpu").await, 50);
}
