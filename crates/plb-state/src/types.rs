//! Entity types held by the cluster state store.
//!
//! These are the descriptions the caller hands to the mutation API. All
//! types are plain data with public fields and serialize to JSON/TOML, so
//! the simulator and tests can build them directly.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use plb_core::expression::NodeView;
use plb_core::metrics::default_metrics;

/// Unique identifier for a node in the cluster.
pub type NodeId = u64;

/// Unique identifier for a partition (failover unit).
pub type PartitionId = Uuid;

// ── Node ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationIntent {
    #[default]
    None,
    Pause,
    Restart,
    RemoveData,
    RemoveNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationStatus {
    #[default]
    None,
    SafetyCheckInProgress,
    SafetyCheckComplete,
    Complete,
    ActivationInProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub id: NodeId,
    #[serde(default = "default_true")]
    pub is_up: bool,
    /// Fault domain path segments, outermost first (`["dc0", "rack1"]`).
    #[serde(default)]
    pub fault_domain: Vec<String>,
    #[serde(default)]
    pub upgrade_domain: String,
    #[serde(default)]
    pub deactivation_intent: DeactivationIntent,
    #[serde(default)]
    pub deactivation_status: DeactivationStatus,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Capacity per metric. Metrics absent here are unbounded on this node.
    #[serde(default)]
    pub capacities: BTreeMap<String, u64>,
}

fn default_true() -> bool {
    true
}

impl NodeDescription {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            is_up: true,
            fault_domain: Vec::new(),
            upgrade_domain: String::new(),
            deactivation_intent: DeactivationIntent::None,
            deactivation_status: DeactivationStatus::None,
            properties: BTreeMap::new(),
            capacities: BTreeMap::new(),
        }
    }

    /// Deactivation has been requested and is not being undone.
    pub fn is_deactivated(&self) -> bool {
        self.deactivation_intent != DeactivationIntent::None
            && matches!(
                self.deactivation_status,
                DeactivationStatus::SafetyCheckInProgress
                    | DeactivationStatus::SafetyCheckComplete
                    | DeactivationStatus::Complete
            )
    }

    /// Full fault domain path, e.g. `fd:/dc0/rack1`.
    pub fn fault_domain_path(&self) -> String {
        format!("fd:/{}", self.fault_domain.join("/"))
    }
}

impl NodeView for NodeDescription {
    fn property(&self, name: &str) -> Option<Cow<'_, str>> {
        match name {
            "NodeId" | "NodeName" => Some(Cow::Owned(self.id.to_string())),
            "FaultDomain" => Some(Cow::Owned(self.fault_domain_path())),
            "UpgradeDomain" => Some(Cow::Borrowed(self.upgrade_domain.as_str())),
            _ => self.properties.get(name).map(|v| Cow::Borrowed(v.as_str())),
        }
    }
}

// ── Service type and application ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTypeDescription {
    pub name: String,
    /// Nodes on which services of this type must not be placed.
    #[serde(default)]
    pub block_list: BTreeSet<NodeId>,
}

/// Per-metric capacity limits for an application. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ApplicationCapacity {
    pub total: u64,
    pub per_node: u64,
    /// Load a node hosting the application accounts for at minimum.
    pub reservation: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDescription {
    pub name: String,
    /// Max number of nodes the application may occupy; zero means unlimited.
    #[serde(default)]
    pub scaleout_count: u32,
    #[serde(default)]
    pub capacities: BTreeMap<String, ApplicationCapacity>,
}

impl ApplicationDescription {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scaleout_count: 0,
            capacities: BTreeMap::new(),
        }
    }

    /// Whether placing this application's services depends on each other.
    pub fn has_constraints(&self) -> bool {
        self.scaleout_count > 0
            || self
                .capacities
                .values()
                .any(|c| c.total > 0 || c.per_node > 0 || c.reservation > 0)
    }
}

// ── Service ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MoveCostClass {
    Zero,
    #[default]
    Low,
    Medium,
    High,
}

impl MoveCostClass {
    /// Interpret a reported move-cost value.
    pub fn from_report(value: u64) -> Self {
        match value {
            0 => MoveCostClass::Zero,
            1 => MoveCostClass::Low,
            2 => MoveCostClass::Medium,
            _ => MoveCostClass::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetric {
    pub name: String,
    pub weight: f64,
    pub primary_default_load: u64,
    pub secondary_default_load: u64,
}

impl ServiceMetric {
    pub fn new(name: &str, weight: f64, primary: u64, secondary: u64) -> Self {
        Self {
            name: name.to_string(),
            weight,
            primary_default_load: primary,
            secondary_default_load: secondary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAffinity {
    /// Name of the service this service must be co-located with.
    pub parent: String,
    /// Aligned affinity co-locates primaries with primaries and secondaries with secondaries.
    #[serde(default)]
    pub aligned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// No replica may be placed under this fault domain path prefix.
    InvalidDomain(String),
    /// Every replica must be placed under this fault domain path prefix.
    RequiredDomain(String),
    /// The primary should be placed under this fault domain path prefix.
    PreferredPrimaryDomain(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    pub service_type: String,
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default = "default_true")]
    pub is_stateful: bool,
    #[serde(default)]
    pub placement_constraints: String,
    #[serde(default)]
    pub affinity: Option<ServiceAffinity>,
    #[serde(default)]
    pub metrics: Vec<ServiceMetric>,
    #[serde(default)]
    pub policies: Vec<PlacementPolicy>,
    #[serde(default)]
    pub move_cost: MoveCostClass,
    #[serde(default = "default_one")]
    pub partition_count: u32,
    #[serde(default = "default_one")]
    pub target_replica_set_size: u32,
    #[serde(default)]
    pub on_every_node: bool,
}

fn default_one() -> u32 {
    1
}

impl ServiceDescription {
    pub fn new(name: &str, service_type: &str, is_stateful: bool) -> Self {
        Self {
            name: name.to_string(),
            service_type: service_type.to_string(),
            application: None,
            is_stateful,
            placement_constraints: String::new(),
            affinity: None,
            metrics: Vec::new(),
            policies: Vec::new(),
            move_cost: MoveCostClass::Low,
            partition_count: 1,
            target_replica_set_size: 1,
            on_every_node: false,
        }
    }

    /// The declared metrics, or the default metric set when none are declared.
    pub fn effective_metrics(&self) -> Vec<ServiceMetric> {
        if !self.metrics.is_empty() {
            return self.metrics.clone();
        }
        default_metrics()
            .iter()
            .map(|m| ServiceMetric::new(m.name, m.weight, m.primary_load, m.secondary_load))
            .collect()
    }

    pub fn uses_default_metrics(&self) -> bool {
        self.metrics.is_empty()
    }
}

// ── Partition and replicas ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaRole {
    Primary,
    Secondary,
    Instance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescription {
    pub node: NodeId,
    pub role: ReplicaRole,
    #[serde(default = "default_true")]
    pub is_up: bool,
    #[serde(default)]
    pub is_standby: bool,
    #[serde(default)]
    pub to_be_dropped_by_fm: bool,
    #[serde(default)]
    pub to_be_dropped_by_plb: bool,
    #[serde(default)]
    pub in_build: bool,
    #[serde(default)]
    pub move_in_progress: bool,
    #[serde(default)]
    pub to_be_promoted: bool,
}

impl ReplicaDescription {
    pub fn new(node: NodeId, role: ReplicaRole) -> Self {
        Self {
            node,
            role,
            is_up: true,
            is_standby: false,
            to_be_dropped_by_fm: false,
            to_be_dropped_by_plb: false,
            in_build: false,
            move_in_progress: false,
            to_be_promoted: false,
        }
    }

    pub fn primary(node: NodeId) -> Self {
        Self::new(node, ReplicaRole::Primary)
    }

    pub fn secondary(node: NodeId) -> Self {
        Self::new(node, ReplicaRole::Secondary)
    }

    pub fn instance(node: NodeId) -> Self {
        Self::new(node, ReplicaRole::Instance)
    }

    pub fn is_to_be_dropped(&self) -> bool {
        self.to_be_dropped_by_fm || self.to_be_dropped_by_plb
    }

    /// Replica is leaving its node and its load must not be counted there.
    pub fn is_disappearing(&self) -> bool {
        self.is_to_be_dropped() || self.move_in_progress
    }

    /// Replica counts towards the partition's replica set.
    pub fn is_active(&self) -> bool {
        self.is_up && !self.is_standby && !self.is_to_be_dropped()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FailoverUnitFlags {
    pub upgrading: bool,
    pub to_be_deleted: bool,
    pub swapping_primary: bool,
    pub quorum_lost: bool,
    pub reconfiguration_in_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverUnitDescription {
    pub id: PartitionId,
    pub service: String,
    pub version: u64,
    #[serde(default)]
    pub replicas: Vec<ReplicaDescription>,
    /// Replicas still to be created; negative means excess replicas.
    #[serde(default)]
    pub replica_diff: i32,
    #[serde(default)]
    pub flags: FailoverUnitFlags,
}

impl FailoverUnitDescription {
    pub fn new(id: PartitionId, service: &str, version: u64) -> Self {
        Self {
            id,
            service: service.to_string(),
            version,
            replicas: Vec::new(),
            replica_diff: 0,
            flags: FailoverUnitFlags::default(),
        }
    }

    pub fn with_replicas(mut self, replicas: Vec<ReplicaDescription>) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn primary_node(&self) -> Option<NodeId> {
        self.replicas
            .iter()
            .find(|r| r.role == ReplicaRole::Primary && r.is_up && !r.is_standby)
            .map(|r| r.node)
    }

    pub fn active_replica_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_active()).count()
    }

    pub fn standby_replica_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_standby).count()
    }

    /// Partition is in a transition during which no replica may be moved.
    pub fn is_in_transition(&self) -> bool {
        let f = &self.flags;
        f.upgrading
            || f.to_be_deleted
            || f.swapping_primary
            || f.quorum_lost
            || f.reconfiguration_in_progress
            || self.replicas.iter().any(|r| r.in_build || r.to_be_promoted)
    }
}

// ── Loads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub metric: String,
    pub role: ReplicaRole,
    /// Secondary loads may be reported for a specific node.
    #[serde(default)]
    pub node: Option<NodeId>,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOrMoveCostDescription {
    pub partition_id: PartitionId,
    pub service_name: String,
    pub reports: Vec<LoadReport>,
}

/// Reported loads and move costs of one partition, merged across reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PartitionLoad {
    pub primary: BTreeMap<String, u64>,
    pub secondary: BTreeMap<String, u64>,
    pub secondary_by_node: BTreeMap<NodeId, BTreeMap<String, u64>>,
    pub primary_move_cost: Option<MoveCostClass>,
    pub secondary_move_cost: Option<MoveCostClass>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deactivation_requires_intent_and_active_status() {
        let mut node = NodeDescription::new(1);
        assert!(!node.is_deactivated());

        node.deactivation_intent = DeactivationIntent::RemoveData;
        assert!(!node.is_deactivated());

        node.deactivation_status = DeactivationStatus::SafetyCheckInProgress;
        assert!(node.is_deactivated());

        node.deactivation_status = DeactivationStatus::ActivationInProgress;
        assert!(!node.is_deactivated());
    }

    #[test]
    fn node_exposes_implicit_properties() {
        let mut node = NodeDescription::new(7);
        node.fault_domain = vec!["dc0".into(), "r1".into()];
        node.upgrade_domain = "ud2".into();
        node.properties.insert("NodeType".into(), "Front".into());

        assert_eq!(node.property("NodeId").as_deref(), Some("7"));
        assert_eq!(node.property("FaultDomain").as_deref(), Some("fd:/dc0/r1"));
        assert_eq!(node.property("UpgradeDomain").as_deref(), Some("ud2"));
        assert_eq!(node.property("NodeType").as_deref(), Some("Front"));
        assert_eq!(node.property("Missing"), None);
    }

    #[test]
    fn service_without_metrics_gets_defaults() {
        let svc = ServiceDescription::new("svc", "type", true);
        let names: Vec<_> = svc.effective_metrics().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["PrimaryCount", "ReplicaCount", "Count"]);
        assert!(svc.uses_default_metrics());
    }

    #[test]
    fn in_build_replica_puts_partition_in_transition() {
        let mut fu = FailoverUnitDescription::new(Uuid::from_u128(1), "svc", 1)
            .with_replicas(vec![ReplicaDescription::primary(0), ReplicaDescription::secondary(1)]);
        assert!(!fu.is_in_transition());
        assert_eq!(fu.primary_node(), Some(0));

        fu.replicas[1].in_build = true;
        assert!(fu.is_in_transition());
    }

    #[test]
    fn descriptions_deserialize_with_defaults() {
        let fu: FailoverUnitDescription = serde_json::from_str(
            r#"{"id":"00000000-0000-0000-0000-000000000001","service":"svc","version":3,
                "replicas":[{"node":4,"role":"primary"}]}"#,
        )
        .unwrap();
        assert_eq!(fu.replicas[0].node, 4);
        assert!(fu.replicas[0].is_up);
        assert_eq!(fu.replica_diff, 0);
        assert!(!fu.flags.quorum_lost);
    }
}
