//! The committed cluster state.
//!
//! `ClusterState` owns every entity the engine knows about. All mutation
//! methods are idempotent upserts or guarded deletes that either apply
//! fully or leave the store untouched, and report what changed so the
//! engine can decide which domains need rescheduling.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use plb_core::expression::Expression;
use plb_core::metrics::MOVE_COST;

use crate::error::{StateError, StateResult};
use crate::pending::is_critical;
use crate::types::*;

/// What a committed mutation changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The mutation was a no-op (equal or stale description).
    Unchanged,
    Node {
        id: NodeId,
        added: bool,
        went_down: bool,
        came_up: bool,
        /// Up/down or deactivation changed.
        availability_changed: bool,
    },
    NodeDeleted {
        id: NodeId,
    },
    ServiceType {
        name: String,
        block_list_changed: bool,
    },
    ServiceTypeDeleted {
        name: String,
    },
    Application {
        name: String,
    },
    ApplicationDeleted {
        name: String,
    },
    Service {
        name: String,
        added: bool,
        /// Metrics, affinity or application changed; domains must be recomputed.
        domain_changed: bool,
    },
    ServiceDeleted {
        name: String,
    },
    FailoverUnit {
        id: PartitionId,
        service: String,
        critical: bool,
    },
    FailoverUnitDeleted {
        id: PartitionId,
        service: String,
    },
    Load {
        id: PartitionId,
        service: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    nodes: BTreeMap<NodeId, NodeDescription>,
    service_types: BTreeMap<String, ServiceTypeDescription>,
    applications: BTreeMap<String, ApplicationDescription>,
    services: BTreeMap<String, ServiceDescription>,
    failover_units: BTreeMap<PartitionId, FailoverUnitDescription>,
    partitions_by_service: BTreeMap<String, BTreeSet<PartitionId>>,
    loads: BTreeMap<PartitionId, PartitionLoad>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn update_node(&mut self, desc: NodeDescription) -> StateResult<Change> {
        let id = desc.id;
        let change = match self.nodes.get(&id) {
            Some(old) if *old == desc => return Ok(Change::Unchanged),
            Some(old) => Change::Node {
                id,
                added: false,
                went_down: old.is_up && !desc.is_up,
                came_up: !old.is_up && desc.is_up,
                availability_changed: old.is_up != desc.is_up
                    || old.is_deactivated() != desc.is_deactivated()
                    || old.deactivation_intent != desc.deactivation_intent,
            },
            None => Change::Node {
                id,
                added: true,
                went_down: false,
                came_up: desc.is_up,
                availability_changed: true,
            },
        };
        self.nodes.insert(id, desc);
        Ok(change)
    }

    pub fn delete_node(&mut self, id: NodeId) -> StateResult<Change> {
        if !self.nodes.contains_key(&id) {
            return Err(StateError::NotFound(format!("node {id}")));
        }
        let referenced = self
            .failover_units
            .values()
            .any(|fu| fu.replicas.iter().any(|r| r.node == id));
        if referenced {
            return Err(StateError::InvalidOperation(format!(
                "node {id} still hosts replicas"
            )));
        }
        self.nodes.remove(&id);
        Ok(Change::NodeDeleted { id })
    }

    // ── Service types ──────────────────────────────────────────────

    pub fn update_service_type(&mut self, desc: ServiceTypeDescription) -> StateResult<Change> {
        let block_list_changed = match self.service_types.get(&desc.name) {
            Some(old) if *old == desc => return Ok(Change::Unchanged),
            Some(old) => old.block_list != desc.block_list,
            None => !desc.block_list.is_empty(),
        };
        let name = desc.name.clone();
        self.service_types.insert(name.clone(), desc);
        Ok(Change::ServiceType {
            name,
            block_list_changed,
        })
    }

    pub fn delete_service_type(&mut self, name: &str) -> StateResult<Change> {
        if !self.service_types.contains_key(name) {
            return Err(StateError::NotFound(format!("service type {name}")));
        }
        if let Some(svc) = self.services.values().find(|s| s.service_type == name) {
            return Err(StateError::InvalidOperation(format!(
                "service type {name} is used by service {}",
                svc.name
            )));
        }
        self.service_types.remove(name);
        Ok(Change::ServiceTypeDeleted {
            name: name.to_string(),
        })
    }

    // ── Applications ───────────────────────────────────────────────

    pub fn update_application(&mut self, desc: ApplicationDescription) -> StateResult<Change> {
        if self.applications.get(&desc.name) == Some(&desc) {
            return Ok(Change::Unchanged);
        }
        let name = desc.name.clone();
        self.applications.insert(name.clone(), desc);
        Ok(Change::Application { name })
    }

    pub fn delete_application(&mut self, name: &str) -> StateResult<Change> {
        if !self.applications.contains_key(name) {
            return Err(StateError::NotFound(format!("application {name}")));
        }
        if let Some(svc) = self
            .services
            .values()
            .find(|s| s.application.as_deref() == Some(name))
        {
            return Err(StateError::InvalidOperation(format!(
                "application {name} still owns service {}",
                svc.name
            )));
        }
        self.applications.remove(name);
        Ok(Change::ApplicationDeleted {
            name: name.to_string(),
        })
    }

    // ── Services ───────────────────────────────────────────────────

    pub fn update_service(&mut self, desc: ServiceDescription) -> StateResult<Change> {
        Expression::parse(&desc.placement_constraints).map_err(|source| {
            StateError::InvalidConstraint {
                service: desc.name.clone(),
                source,
            }
        })?;

        let (added, domain_changed) = match self.services.get(&desc.name) {
            Some(old) if *old == desc => return Ok(Change::Unchanged),
            Some(old) => (
                false,
                old.effective_metrics() != desc.effective_metrics()
                    || old.affinity != desc.affinity
                    || old.application != desc.application,
            ),
            None => (true, true),
        };
        let name = desc.name.clone();
        self.partitions_by_service.entry(name.clone()).or_default();
        self.services.insert(name.clone(), desc);
        Ok(Change::Service {
            name,
            added,
            domain_changed,
        })
    }

    pub fn delete_service(&mut self, name: &str) -> StateResult<Change> {
        if !self.services.contains_key(name) {
            return Err(StateError::NotFound(format!("service {name}")));
        }
        let partitions = self.partitions_by_service.get(name).map_or(0, |p| p.len());
        if partitions > 0 {
            return Err(StateError::InvalidOperation(format!(
                "service {name} still has {partitions} partitions"
            )));
        }
        self.services.remove(name);
        self.partitions_by_service.remove(name);
        Ok(Change::ServiceDeleted {
            name: name.to_string(),
        })
    }

    // ── Failover units ─────────────────────────────────────────────

    pub fn update_failover_unit(&mut self, desc: FailoverUnitDescription) -> StateResult<Change> {
        if !self.services.contains_key(&desc.service) {
            return Err(StateError::NotFound(format!(
                "service {} for partition {}",
                desc.service, desc.id
            )));
        }
        let old = self.failover_units.get(&desc.id);
        if let Some(old) = old {
            if desc.version <= old.version {
                debug!(partition = %desc.id, stored = old.version, received = desc.version, "ignoring stale failover unit update");
                return Ok(Change::Unchanged);
            }
            if old.service != desc.service {
                return Err(StateError::InvalidOperation(format!(
                    "partition {} cannot move from service {} to {}",
                    desc.id, old.service, desc.service
                )));
            }
        }
        let critical = is_critical(old, &desc);
        let id = desc.id;
        let service = desc.service.clone();
        self.partitions_by_service
            .entry(service.clone())
            .or_default()
            .insert(id);
        self.failover_units.insert(id, desc);
        Ok(Change::FailoverUnit {
            id,
            service,
            critical,
        })
    }

    pub fn delete_failover_unit(&mut self, service: &str, id: PartitionId) -> StateResult<Change> {
        match self.failover_units.get(&id) {
            Some(fu) if fu.service == service => {}
            _ => return Err(StateError::NotFound(format!("partition {id} of {service}"))),
        }
        self.failover_units.remove(&id);
        self.loads.remove(&id);
        if let Some(set) = self.partitions_by_service.get_mut(service) {
            set.remove(&id);
        }
        Ok(Change::FailoverUnitDeleted {
            id,
            service: service.to_string(),
        })
    }

    // ── Loads ──────────────────────────────────────────────────────

    pub fn update_load_or_move_cost(&mut self, desc: LoadOrMoveCostDescription) -> StateResult<Change> {
        if !self.services.contains_key(&desc.service_name) {
            return Err(StateError::NotFound(format!("service {}", desc.service_name)));
        }
        let entry = self.loads.entry(desc.partition_id).or_default();
        let before = entry.clone();
        for report in &desc.reports {
            if report.metric == MOVE_COST {
                let cost = MoveCostClass::from_report(report.value);
                match report.role {
                    ReplicaRole::Secondary => entry.secondary_move_cost = Some(cost),
                    ReplicaRole::Primary | ReplicaRole::Instance => {
                        entry.primary_move_cost = Some(cost)
                    }
                }
                continue;
            }
            match (report.role, report.node) {
                (ReplicaRole::Secondary, Some(node)) => {
                    entry
                        .secondary_by_node
                        .entry(node)
                        .or_default()
                        .insert(report.metric.clone(), report.value);
                }
                (ReplicaRole::Secondary, None) => {
                    entry.secondary.insert(report.metric.clone(), report.value);
                }
                (ReplicaRole::Primary | ReplicaRole::Instance, _) => {
                    entry.primary.insert(report.metric.clone(), report.value);
                }
            }
        }
        if *entry == before {
            return Ok(Change::Unchanged);
        }
        Ok(Change::Load {
            id: desc.partition_id,
            service: desc.service_name,
        })
    }

    pub fn reset_partition_load(&mut self, id: PartitionId, service: &str) -> StateResult<Change> {
        if !self.services.contains_key(service) {
            return Err(StateError::NotFound(format!("service {service}")));
        }
        if self.loads.remove(&id).is_none() {
            return Ok(Change::Unchanged);
        }
        Ok(Change::Load {
            id,
            service: service.to_string(),
        })
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn node(&self, id: NodeId) -> Option<&NodeDescription> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescription> {
        self.nodes.values()
    }

    pub fn service_type(&self, name: &str) -> Option<&ServiceTypeDescription> {
        self.service_types.get(name)
    }

    pub fn service_types(&self) -> impl Iterator<Item = &ServiceTypeDescription> {
        self.service_types.values()
    }

    pub fn application(&self, name: &str) -> Option<&ApplicationDescription> {
        self.applications.get(name)
    }

    pub fn applications(&self) -> impl Iterator<Item = &ApplicationDescription> {
        self.applications.values()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescription> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDescription> {
        self.services.values()
    }

    pub fn services_by_name(&self) -> &BTreeMap<String, ServiceDescription> {
        &self.services
    }

    pub fn failover_unit(&self, id: PartitionId) -> Option<&FailoverUnitDescription> {
        self.failover_units.get(&id)
    }

    pub fn failover_units(&self) -> impl Iterator<Item = &FailoverUnitDescription> {
        self.failover_units.values()
    }

    /// Partitions of a service, in id order.
    pub fn partitions_of<'a>(
        &'a self,
        service: &str,
    ) -> impl Iterator<Item = &'a FailoverUnitDescription> + 'a {
        self.partitions_by_service
            .get(service)
            .into_iter()
            .flatten()
            .filter_map(|id| self.failover_units.get(id))
    }

    pub fn partition_load(&self, id: PartitionId) -> Option<&PartitionLoad> {
        self.loads.get(&id)
    }

    /// Replicas that currently count towards balancing, across all partitions.
    pub fn active_replica_count(&self) -> usize {
        self.failover_units
            .values()
            .map(|fu| fu.active_replica_count())
            .sum()
    }

    /// Load one replica contributes for `metric`: reported value or the service default.
    pub fn replica_load(
        &self,
        fu: &FailoverUnitDescription,
        replica: &ReplicaDescription,
        metric: &str,
    ) -> u64 {
        let Some(svc) = self.services.get(&fu.service) else {
            return 0;
        };
        let reported = self.loads.get(&fu.id);
        let default = svc.effective_metrics().into_iter().find(|m| m.name == metric);

        match replica.role {
            ReplicaRole::Primary | ReplicaRole::Instance => reported
                .and_then(|l| l.primary.get(metric).copied())
                .or_else(|| default.map(|m| m.primary_default_load))
                .unwrap_or(0),
            ReplicaRole::Secondary => reported
                .and_then(|l| {
                    l.secondary_by_node
                        .get(&replica.node)
                        .and_then(|m| m.get(metric))
                        .or_else(|| l.secondary.get(metric))
                        .copied()
                })
                .or_else(|| default.map(|m| m.secondary_default_load))
                .unwrap_or(0),
        }
    }

    /// Current load on a node for one metric, excluding replicas that are leaving.
    pub fn node_load(&self, node: NodeId, metric: &str) -> u64 {
        self.failover_units
            .values()
            .flat_map(|fu| fu.replicas.iter().map(move |r| (fu, r)))
            .filter(|(_, r)| r.node == node && r.is_up && !r.is_standby && !r.is_disappearing())
            .map(|(fu, r)| self.replica_load(fu, r, metric))
            .sum()
    }

    /// Every metric name known to services or node capacities.
    pub fn metric_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self
            .services
            .values()
            .flat_map(|s| s.effective_metrics().into_iter().map(|m| m.name))
            .collect();
        for node in self.nodes.values() {
            names.extend(node.capacities.keys().cloned());
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn pid(n: u128) -> PartitionId {
        Uuid::from_u128(n)
    }

    fn state_with_service() -> ClusterState {
        let mut state = ClusterState::new();
        state.update_node(NodeDescription::new(0)).unwrap();
        state.update_node(NodeDescription::new(1)).unwrap();
        state
            .update_service_type(ServiceTypeDescription {
                name: "T".into(),
                block_list: BTreeSet::new(),
            })
            .unwrap();
        let mut svc = ServiceDescription::new("svc", "T", true);
        svc.metrics.push(ServiceMetric::new("Cpu", 1.0, 10, 4));
        state.update_service(svc).unwrap();
        state
    }

    fn fu(id: u128, version: u64, replicas: Vec<ReplicaDescription>) -> FailoverUnitDescription {
        FailoverUnitDescription::new(pid(id), "svc", version).with_replicas(replicas)
    }

    #[test]
    fn node_updates_report_availability_changes() {
        let mut state = ClusterState::new();
        let change = state.update_node(NodeDescription::new(3)).unwrap();
        assert!(matches!(change, Change::Node { added: true, .. }));

        assert_eq!(state.update_node(NodeDescription::new(3)).unwrap(), Change::Unchanged);

        let mut down = NodeDescription::new(3);
        down.is_up = false;
        match state.update_node(down).unwrap() {
            Change::Node {
                went_down,
                availability_changed,
                ..
            } => {
                assert!(went_down);
                assert!(availability_changed);
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn stale_failover_unit_version_is_noop() {
        let mut state = state_with_service();
        state
            .update_failover_unit(fu(1, 5, vec![ReplicaDescription::primary(0)]))
            .unwrap();

        let stale = fu(1, 5, vec![ReplicaDescription::primary(1)]);
        assert_eq!(state.update_failover_unit(stale).unwrap(), Change::Unchanged);
        let older = fu(1, 3, vec![ReplicaDescription::primary(1)]);
        assert_eq!(state.update_failover_unit(older).unwrap(), Change::Unchanged);
        assert_eq!(state.failover_unit(pid(1)).unwrap().primary_node(), Some(0));
    }

    #[test]
    fn zero_replicas_keep_placeholder() {
        let mut state = state_with_service();
        state
            .update_failover_unit(fu(1, 1, vec![ReplicaDescription::primary(0)]))
            .unwrap();
        state.update_failover_unit(fu(1, 2, vec![])).unwrap();

        let stored = state.failover_unit(pid(1)).unwrap();
        assert!(stored.replicas.is_empty());
        assert_eq!(state.partitions_of("svc").count(), 1);
    }

    #[test]
    fn deletes_are_guarded() {
        let mut state = state_with_service();
        state
            .update_failover_unit(fu(1, 1, vec![ReplicaDescription::primary(0)]))
            .unwrap();

        assert!(matches!(
            state.delete_service_type("T"),
            Err(StateError::InvalidOperation(_))
        ));
        assert!(matches!(
            state.delete_service("svc"),
            Err(StateError::InvalidOperation(_))
        ));
        assert!(matches!(state.delete_node(0), Err(StateError::InvalidOperation(_))));

        state.delete_failover_unit("svc", pid(1)).unwrap();
        state.delete_service("svc").unwrap();
        state.delete_service_type("T").unwrap();
        state.delete_node(0).unwrap();
        assert!(state.service("svc").is_none());
    }

    #[test]
    fn application_delete_requires_no_services() {
        let mut state = state_with_service();
        state.update_application(ApplicationDescription::new("app")).unwrap();
        let mut svc = ServiceDescription::new("child", "T", false);
        svc.application = Some("app".into());
        state.update_service(svc).unwrap();

        assert!(state.delete_application("app").is_err());
        state.delete_service("child").unwrap();
        state.delete_application("app").unwrap();
    }

    #[test]
    fn invalid_placement_constraint_is_rejected() {
        let mut state = state_with_service();
        let mut svc = ServiceDescription::new("bad", "T", true);
        svc.placement_constraints = "NodeType ==".into();
        assert!(matches!(
            state.update_service(svc),
            Err(StateError::InvalidConstraint { .. })
        ));
        assert!(state.service("bad").is_none());
    }

    #[test]
    fn loads_fall_back_to_defaults_and_reset() {
        let mut state = state_with_service();
        state
            .update_failover_unit(fu(
                1,
                1,
                vec![ReplicaDescription::primary(0), ReplicaDescription::secondary(1)],
            ))
            .unwrap();
        assert_eq!(state.node_load(0, "Cpu"), 10);
        assert_eq!(state.node_load(1, "Cpu"), 4);

        state
            .update_load_or_move_cost(LoadOrMoveCostDescription {
                partition_id: pid(1),
                service_name: "svc".into(),
                reports: vec![
                    LoadReport {
                        metric: "Cpu".into(),
                        role: ReplicaRole::Primary,
                        node: None,
                        value: 30,
                    },
                    LoadReport {
                        metric: "Cpu".into(),
                        role: ReplicaRole::Secondary,
                        node: Some(1),
                        value: 7,
                    },
                    LoadReport {
                        metric: MOVE_COST.into(),
                        role: ReplicaRole::Primary,
                        node: None,
                        value: 3,
                    },
                ],
            })
            .unwrap();
        assert_eq!(state.node_load(0, "Cpu"), 30);
        assert_eq!(state.node_load(1, "Cpu"), 7);
        assert_eq!(
            state.partition_load(pid(1)).unwrap().primary_move_cost,
            Some(MoveCostClass::High)
        );

        state.reset_partition_load(pid(1), "svc").unwrap();
        assert_eq!(state.node_load(0, "Cpu"), 10);
    }

    #[test]
    fn disappearing_replicas_carry_no_node_load() {
        let mut state = state_with_service();
        let mut dropped = ReplicaDescription::secondary(1);
        dropped.to_be_dropped_by_fm = true;
        state
            .update_failover_unit(fu(1, 1, vec![ReplicaDescription::primary(0), dropped]))
            .unwrap();
        assert_eq!(state.node_load(1, "Cpu"), 0);
    }
}
