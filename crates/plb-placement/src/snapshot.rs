//! Placement snapshot: an immutable projection of one service domain.
//!
//! The builder copies everything a search needs out of `ClusterState`
//! into dense, index-addressed vectors: nodes, metrics, services,
//! applications and partitions. Relationships are plain indices, so the
//! search can clone and mutate its own candidate assignment without ever
//! aliasing the live store.
//!
//! Loads of replicas that are about to disappear (to be dropped, move in
//! progress) or are still being built are excluded from node loads.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use plb_core::metrics::{MetricSettings, default_metrics};
use plb_core::{Expression, PlbConfig};
use plb_state::{
    ApplicationCapacity, ClusterState, DeactivationIntent, FailoverUnitDescription, NodeDescription,
    NodeId, PartitionId, PlacementPolicy, ReplicaRole, ServiceDescription, ServiceDomainLayout,
};

use crate::cost::MoveCostModel;

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub is_up: bool,
    /// Deactivation intent in effect (`None` unless deactivation is active).
    pub deactivation: DeactivationIntent,
    pub fault_domain: usize,
    pub upgrade_domain: usize,
    /// Capacity per snapshot metric; `None` is unbounded.
    pub capacity: Vec<Option<f64>>,
}

impl NodeEntry {
    /// Node can receive new replicas and takes part in balancing.
    pub fn accepts_replicas(&self) -> bool {
        self.is_up && self.deactivation == DeactivationIntent::None
    }

    /// A replica with this role has to leave the node.
    pub fn must_evacuate(&self, role: ReplicaRole) -> bool {
        match self.deactivation {
            DeactivationIntent::RemoveData | DeactivationIntent::RemoveNode => true,
            DeactivationIntent::Restart => role == ReplicaRole::Primary,
            DeactivationIntent::Pause | DeactivationIntent::None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricEntry {
    pub name: String,
    pub settings: MetricSettings,
    pub weight: f64,
    /// Metric needed balancing when the snapshot was taken.
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityEntry {
    pub parent: usize,
    pub aligned: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub name: String,
    pub stateful: bool,
    pub target_size: u32,
    pub application: Option<usize>,
    /// `(metric index, weight)` for every metric the service uses.
    pub metric_weights: Vec<(usize, f64)>,
    /// Placement expression and domain policies allow this node.
    pub allowed: Vec<bool>,
    pub blocked: Vec<bool>,
    pub preferred_primary: Option<Vec<bool>>,
    /// Nodes per fault domain (and upgrade domain) the service may use.
    pub fd_eligible: Vec<usize>,
    pub ud_eligible: Vec<usize>,
    pub affinity: Option<AffinityEntry>,
    pub children: Vec<usize>,
    pub partitions: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct ApplicationEntry {
    pub name: String,
    pub scaleout: u32,
    /// `(metric index, limits)` for metrics the application caps.
    pub capacities: Vec<(usize, ApplicationCapacity)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaEntry {
    /// `None` for a replica that still has to be placed.
    pub node: Option<usize>,
    pub role: ReplicaRole,
    pub movable: bool,
    pub counts_load: bool,
    pub counts_domain: bool,
    pub is_new: bool,
    pub droppable: bool,
}

#[derive(Debug, Clone)]
pub struct PartitionEntry {
    pub id: PartitionId,
    pub service: usize,
    pub replicas: Vec<ReplicaEntry>,
    /// In a transition or throttled; nothing may move.
    pub frozen: bool,
    pub upgrading: bool,
    pub extra_replicas: u32,
    pub primary_load: Vec<f64>,
    pub secondary_load: Vec<f64>,
    pub secondary_load_by_node: BTreeMap<usize, Vec<f64>>,
    pub primary_move_cost: f64,
    pub secondary_move_cost: f64,
}

impl PartitionEntry {
    /// Load vector a replica with `role` carries when placed on `node`.
    pub fn load(&self, role: ReplicaRole, node: usize) -> &[f64] {
        match role {
            ReplicaRole::Primary | ReplicaRole::Instance => &self.primary_load,
            ReplicaRole::Secondary => self
                .secondary_load_by_node
                .get(&node)
                .unwrap_or(&self.secondary_load),
        }
    }

    pub fn move_cost(&self, role: ReplicaRole) -> f64 {
        match role {
            ReplicaRole::Primary | ReplicaRole::Instance => self.primary_move_cost,
            ReplicaRole::Secondary => self.secondary_move_cost,
        }
    }

    pub fn has_new_replicas(&self) -> bool {
        self.replicas.iter().any(|r| r.is_new)
    }
}

/// Frozen input of one search.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub domain: String,
    pub config: Arc<PlbConfig>,
    pub cost: MoveCostModel,
    pub nodes: Vec<NodeEntry>,
    pub metrics: Vec<MetricEntry>,
    pub services: Vec<ServiceEntry>,
    pub applications: Vec<ApplicationEntry>,
    pub partitions: Vec<PartitionEntry>,
    pub fault_domain_count: usize,
    pub upgrade_domain_count: usize,
    node_index: BTreeMap<NodeId, usize>,
}

impl Snapshot {
    pub fn node_index(&self, id: NodeId) -> Option<usize> {
        self.node_index.get(&id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty() || self.nodes.is_empty()
    }

    pub fn has_new_replicas(&self) -> bool {
        self.partitions.iter().any(|p| p.has_new_replicas())
    }

    pub fn has_extra_replicas(&self) -> bool {
        self.partitions.iter().any(|p| p.extra_replicas > 0 && !p.frozen)
    }

    pub fn has_movable_replicas(&self) -> bool {
        self.partitions
            .iter()
            .any(|p| p.replicas.iter().any(|r| r.movable))
    }

    pub fn movable_replica_count(&self) -> usize {
        self.partitions
            .iter()
            .flat_map(|p| p.replicas.iter())
            .filter(|r| r.movable)
            .count()
    }

    /// Replicas currently placed and counted in the domain.
    pub fn existing_replica_count(&self) -> usize {
        self.partitions
            .iter()
            .flat_map(|p| p.replicas.iter())
            .filter(|r| !r.is_new && r.counts_domain)
            .count()
    }

    pub fn has_upgrading_partition(&self) -> bool {
        self.partitions.iter().any(|p| p.upgrading)
    }

    pub fn has_active_metric(&self) -> bool {
        self.metrics.iter().any(|m| m.active)
    }

    /// Indices of nodes that accept replicas.
    pub fn eligible_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.accepts_replicas())
            .map(|(i, _)| i)
    }
}

// ── Builder ────────────────────────────────────────────────────────

pub struct SnapshotBuilder<'a> {
    state: &'a ClusterState,
    config: Arc<PlbConfig>,
    throttled: Option<&'a BTreeSet<PartitionId>>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(state: &'a ClusterState, config: Arc<PlbConfig>) -> Self {
        Self {
            state,
            config,
            throttled: None,
        }
    }

    /// Partitions that exceeded their movement budget and must stay put.
    pub fn throttled(mut self, partitions: &'a BTreeSet<PartitionId>) -> Self {
        self.throttled = Some(partitions);
        self
    }

    pub fn build(&self, domain: &ServiceDomainLayout) -> Snapshot {
        let config = &self.config;

        // Metrics.
        let metric_names: Vec<String> = domain.metrics.iter().cloned().collect();
        let metric_index: BTreeMap<&str, usize> = metric_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        // Nodes.
        let mut fd_index: BTreeMap<String, usize> = BTreeMap::new();
        let mut ud_index: BTreeMap<String, usize> = BTreeMap::new();
        let mut nodes = Vec::new();
        let mut node_index = BTreeMap::new();
        for node in self.state.nodes() {
            let next_fd = fd_index.len();
            let fault_domain = *fd_index.entry(node.fault_domain_path()).or_insert(next_fd);
            let next_ud = ud_index.len();
            let upgrade_domain = *ud_index.entry(node.upgrade_domain.clone()).or_insert(next_ud);
            node_index.insert(node.id, nodes.len());
            nodes.push(NodeEntry {
                id: node.id,
                is_up: node.is_up,
                deactivation: if node.is_deactivated() {
                    node.deactivation_intent
                } else {
                    DeactivationIntent::None
                },
                fault_domain,
                upgrade_domain,
                capacity: metric_names
                    .iter()
                    .map(|m| node.capacities.get(m).map(|c| *c as f64))
                    .collect(),
            });
        }

        // Services.
        let service_descs: Vec<&ServiceDescription> = domain
            .services
            .iter()
            .filter_map(|name| self.state.service(name))
            .collect();
        let service_index: BTreeMap<&str, usize> = service_descs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut applications: Vec<ApplicationEntry> = Vec::new();
        let mut app_index: BTreeMap<String, usize> = BTreeMap::new();
        let mut services: Vec<ServiceEntry> = Vec::with_capacity(service_descs.len());
        let all_nodes: Vec<&NodeDescription> = self.state.nodes().collect();

        for svc in &service_descs {
            let application = svc.application.as_deref().and_then(|name| {
                let app = self.state.application(name).filter(|a| a.has_constraints())?;
                if let Some(&i) = app_index.get(name) {
                    return Some(i);
                }
                let entry = ApplicationEntry {
                    name: name.to_string(),
                    scaleout: app.scaleout_count,
                    capacities: app
                        .capacities
                        .iter()
                        .filter_map(|(m, c)| metric_index.get(m.as_str()).map(|&i| (i, *c)))
                        .collect(),
                };
                app_index.insert(name.to_string(), applications.len());
                applications.push(entry);
                Some(applications.len() - 1)
            });

            let expression = Expression::parse(&svc.placement_constraints).unwrap_or_else(|e| {
                debug!(service = %svc.name, error = %e, "unparsable placement constraint");
                Expression::Always
            });
            let block_list = self
                .state
                .service_type(&svc.service_type)
                .map(|t| t.block_list.clone())
                .unwrap_or_default();
            let allowed = all_nodes
                .iter()
                .map(|n| expression.matches(*n) && policies_allow(&svc.policies, n))
                .collect();
            let blocked = all_nodes.iter().map(|n| block_list.contains(&n.id)).collect();
            let preferred_primary = svc.policies.iter().find_map(|p| match p {
                PlacementPolicy::PreferredPrimaryDomain(prefix) => Some(
                    all_nodes
                        .iter()
                        .map(|n| n.fault_domain_path().starts_with(prefix.as_str()))
                        .collect(),
                ),
                _ => None,
            });

            services.push(ServiceEntry {
                name: svc.name.clone(),
                stateful: svc.is_stateful,
                target_size: svc.target_replica_set_size,
                application,
                metric_weights: svc
                    .effective_metrics()
                    .iter()
                    .filter_map(|m| metric_index.get(m.name.as_str()).map(|&i| (i, m.weight)))
                    .collect(),
                allowed,
                blocked,
                preferred_primary,
                fd_eligible: Vec::new(),
                ud_eligible: Vec::new(),
                affinity: None,
                children: Vec::new(),
                partitions: Vec::new(),
            });
        }

        for service in services.iter_mut() {
            service.fd_eligible = vec![0; fd_index.len()];
            service.ud_eligible = vec![0; ud_index.len()];
            for (ni, node) in nodes.iter().enumerate() {
                if node.accepts_replicas() && service.allowed[ni] && !service.blocked[ni] {
                    service.fd_eligible[node.fault_domain] += 1;
                    service.ud_eligible[node.upgrade_domain] += 1;
                }
            }
        }

        for (i, svc) in service_descs.iter().enumerate() {
            if let Some(affinity) = &svc.affinity {
                if let Some(&parent) = service_index.get(affinity.parent.as_str()) {
                    services[i].affinity = Some(AffinityEntry {
                        parent,
                        aligned: affinity.aligned,
                    });
                    services[parent].children.push(i);
                }
            }
        }

        // Partitions.
        let cost = MoveCostModel::from_config(config);
        let mut partitions = Vec::new();
        for (si, svc) in service_descs.iter().enumerate() {
            for fu in self.state.partitions_of(&svc.name) {
                let entry = self.partition_entry(fu, svc, si, &nodes, &node_index, &metric_names, &cost);
                services[si].partitions.push(partitions.len());
                partitions.push(entry);
            }
        }

        // Metric weights: a global weight wins, otherwise the mean service weight.
        let metrics = metric_names
            .iter()
            .enumerate()
            .map(|(mi, name)| {
                let settings = MetricSettings::resolve(config, name);
                let weights: Vec<f64> = services
                    .iter()
                    .flat_map(|s| s.metric_weights.iter())
                    .filter(|(m, _)| *m == mi)
                    .map(|(_, w)| *w)
                    .collect();
                let weight = settings.global_weight.unwrap_or_else(|| {
                    if weights.is_empty() {
                        default_metrics()
                            .iter()
                            .find(|d| d.name == name)
                            .map_or(0.0, |d| d.weight)
                    } else {
                        weights.iter().sum::<f64>() / weights.len() as f64
                    }
                });
                MetricEntry {
                    name: name.clone(),
                    settings,
                    weight,
                    active: false,
                }
            })
            .collect();

        let mut snapshot = Snapshot {
            domain: domain.id.clone(),
            config: Arc::clone(&self.config),
            cost,
            nodes,
            metrics,
            services,
            applications,
            partitions,
            fault_domain_count: fd_index.len(),
            upgrade_domain_count: ud_index.len(),
            node_index,
        };
        let active = crate::score::active_metrics(&snapshot);
        for (metric, active) in snapshot.metrics.iter_mut().zip(active) {
            metric.active = active;
        }
        snapshot
    }

    #[allow(clippy::too_many_arguments)]
    fn partition_entry(
        &self,
        fu: &FailoverUnitDescription,
        svc: &ServiceDescription,
        service: usize,
        nodes: &[NodeEntry],
        node_index: &BTreeMap<NodeId, usize>,
        metric_names: &[String],
        cost: &MoveCostModel,
    ) -> PartitionEntry {
        let throttled = self.throttled.is_some_and(|t| t.contains(&fu.id));
        let frozen = fu.is_in_transition() || throttled;
        let reported = self.state.partition_load(fu.id);
        let service_metrics = svc.effective_metrics();

        let load_for = |role: ReplicaRole, node: Option<NodeId>| -> Vec<f64> {
            metric_names
                .iter()
                .map(|name| {
                    let Some(default) = service_metrics.iter().find(|m| &m.name == name) else {
                        return 0.0;
                    };
                    let value = match role {
                        ReplicaRole::Primary | ReplicaRole::Instance => reported
                            .and_then(|l| l.primary.get(name).copied())
                            .unwrap_or(default.primary_default_load),
                        ReplicaRole::Secondary => reported
                            .and_then(|l| {
                                node.and_then(|n| l.secondary_by_node.get(&n))
                                    .and_then(|m| m.get(name))
                                    .or_else(|| l.secondary.get(name))
                                    .copied()
                            })
                            .unwrap_or(default.secondary_default_load),
                    };
                    value as f64
                })
                .collect()
        };

        let primary_role = if svc.is_stateful {
            ReplicaRole::Primary
        } else {
            ReplicaRole::Instance
        };
        let primary_load = load_for(primary_role, None);
        let secondary_load = load_for(ReplicaRole::Secondary, None);
        let mut secondary_load_by_node = BTreeMap::new();
        if let Some(l) = reported {
            for node in l.secondary_by_node.keys() {
                if let Some(&ni) = node_index.get(node) {
                    secondary_load_by_node.insert(ni, load_for(ReplicaRole::Secondary, Some(*node)));
                }
            }
        }

        let class_cost = |reported_class: Option<plb_state::MoveCostClass>| {
            let class = if self.config.use_move_cost_reports {
                reported_class.unwrap_or(svc.move_cost)
            } else {
                svc.move_cost
            };
            cost.value(class)
        };
        let primary_move_cost = class_cost(reported.and_then(|l| l.primary_move_cost));
        let secondary_move_cost = class_cost(reported.and_then(|l| l.secondary_move_cost));

        let mut replicas = Vec::new();
        for r in &fu.replicas {
            if !r.is_up || r.is_standby {
                continue;
            }
            let Some(&ni) = node_index.get(&r.node) else {
                continue;
            };
            let counts_load = !r.is_disappearing() && !r.in_build;
            replicas.push(ReplicaEntry {
                node: Some(ni),
                role: r.role,
                movable: !frozen && counts_load && !r.to_be_promoted && nodes[ni].is_up,
                counts_load,
                counts_domain: !r.is_to_be_dropped(),
                is_new: false,
                droppable: !frozen && counts_load && r.role != ReplicaRole::Primary,
            });
        }

        let mut new_count = fu.replica_diff.max(0) as usize;
        if svc.on_every_node && !svc.is_stateful {
            let hosted: BTreeSet<usize> = replicas.iter().filter_map(|r| r.node).collect();
            let missing = nodes
                .iter()
                .enumerate()
                .filter(|(i, n)| n.accepts_replicas() && !hosted.contains(i))
                .count();
            new_count = new_count.max(missing);
        }
        if fu.flags.to_be_deleted || fu.flags.quorum_lost {
            new_count = 0;
        }
        let mut has_primary = replicas
            .iter()
            .any(|r| r.role == ReplicaRole::Primary && r.counts_domain);
        for _ in 0..new_count {
            let role = if !svc.is_stateful {
                ReplicaRole::Instance
            } else if !has_primary {
                has_primary = true;
                ReplicaRole::Primary
            } else {
                ReplicaRole::Secondary
            };
            replicas.push(ReplicaEntry {
                node: None,
                role,
                movable: false,
                counts_load: true,
                counts_domain: true,
                is_new: true,
                droppable: false,
            });
        }

        PartitionEntry {
            id: fu.id,
            service,
            replicas,
            frozen,
            upgrading: fu.flags.upgrading,
            extra_replicas: if frozen { 0 } else { fu.replica_diff.min(0).unsigned_abs() },
            primary_load,
            secondary_load,
            secondary_load_by_node,
            primary_move_cost,
            secondary_move_cost,
        }
    }
}

fn policies_allow(policies: &[PlacementPolicy], node: &NodeDescription) -> bool {
    let path = node.fault_domain_path();
    policies.iter().all(|p| match p {
        PlacementPolicy::InvalidDomain(prefix) => !path.starts_with(prefix.as_str()),
        PlacementPolicy::RequiredDomain(prefix) => path.starts_with(prefix.as_str()),
        PlacementPolicy::PreferredPrimaryDomain(_) => true,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders shared by the search tests.

    use super::*;
    use plb_state::*;
    use uuid::Uuid;

    pub fn pid(n: u128) -> PartitionId {
        Uuid::from_u128(n)
    }

    pub fn make_node(id: NodeId) -> NodeDescription {
        let mut node = NodeDescription::new(id);
        node.fault_domain = vec![format!("fd{id}")];
        node.upgrade_domain = format!("ud{id}");
        node
    }

    pub fn make_service(name: &str, stateful: bool, metrics: &[(&str, f64, u64, u64)]) -> ServiceDescription {
        let mut svc = ServiceDescription::new(name, "T", stateful);
        svc.metrics = metrics
            .iter()
            .map(|(n, w, p, s)| ServiceMetric::new(n, *w, *p, *s))
            .collect();
        svc
    }

    /// First node hosts the primary (or an instance), the rest secondaries.
    pub fn make_fu(id: u128, service: &str, stateful: bool, nodes: &[NodeId]) -> FailoverUnitDescription {
        let replicas = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| match (stateful, i) {
                (false, _) => ReplicaDescription::instance(*n),
                (true, 0) => ReplicaDescription::primary(*n),
                (true, _) => ReplicaDescription::secondary(*n),
            })
            .collect();
        FailoverUnitDescription::new(pid(id), service, 1).with_replicas(replicas)
    }

    pub fn snapshot_of(state: &ClusterState, config: PlbConfig) -> Snapshot {
        let config = Arc::new(config);
        let domains = compute_domains(state, &config);
        assert_eq!(domains.len(), 1, "test state should form one domain");
        SnapshotBuilder::new(state, config).build(&domains[0])
    }
}
