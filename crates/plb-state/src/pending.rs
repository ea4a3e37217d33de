//! Queue of mutations waiting to be committed.
//!
//! The mutation API never touches `ClusterState` directly. Updates are
//! queued here and applied in arrival order at a commit point, so a
//! search running against the previous snapshot never sees a partially
//! applied batch. Each queued update is classified as critical or not on
//! arrival; a critical update cancels any search in flight for its domain.

use tracing::{debug, warn};

use crate::store::{Change, ClusterState};
use crate::types::*;

/// A mutation waiting for the next commit.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingUpdate {
    Node(NodeDescription),
    DeleteNode(NodeId),
    ServiceType(ServiceTypeDescription),
    DeleteServiceType(String),
    Application(ApplicationDescription),
    DeleteApplication(String),
    Service(ServiceDescription),
    DeleteService(String),
    FailoverUnit(FailoverUnitDescription),
    DeleteFailoverUnit { service: String, id: PartitionId },
    Load(LoadOrMoveCostDescription),
    ResetLoad { service: String, id: PartitionId },
}

impl PendingUpdate {
    /// Service whose domain this update affects, when it is a single service.
    pub fn service(&self) -> Option<&str> {
        match self {
            PendingUpdate::Service(s) => Some(&s.name),
            PendingUpdate::DeleteService(name) => Some(name),
            PendingUpdate::FailoverUnit(fu) => Some(&fu.service),
            PendingUpdate::DeleteFailoverUnit { service, .. } => Some(service),
            PendingUpdate::Load(load) => Some(&load.service_name),
            PendingUpdate::ResetLoad { service, .. } => Some(service),
            _ => None,
        }
    }

    fn apply(self, state: &mut ClusterState) -> crate::error::StateResult<Change> {
        match self {
            PendingUpdate::Node(desc) => state.update_node(desc),
            PendingUpdate::DeleteNode(id) => state.delete_node(id),
            PendingUpdate::ServiceType(desc) => state.update_service_type(desc),
            PendingUpdate::DeleteServiceType(name) => state.delete_service_type(&name),
            PendingUpdate::Application(desc) => state.update_application(desc),
            PendingUpdate::DeleteApplication(name) => state.delete_application(&name),
            PendingUpdate::Service(desc) => state.update_service(desc),
            PendingUpdate::DeleteService(name) => state.delete_service(&name),
            PendingUpdate::FailoverUnit(desc) => state.update_failover_unit(desc),
            PendingUpdate::DeleteFailoverUnit { service, id } => {
                state.delete_failover_unit(&service, id)
            }
            PendingUpdate::Load(desc) => state.update_load_or_move_cost(desc),
            PendingUpdate::ResetLoad { service, id } => state.reset_partition_load(id, &service),
        }
    }
}

/// Whether a failover unit update must interrupt an in-flight search.
///
/// Critical: a new partition, deletion, a replica deficit, a moved
/// primary, a changed active or standby replica count, or a change in
/// any transition flag. Other changes (extra, standby, dropped or
/// move-in-progress replica flags) are folded in at the next pass.
pub fn is_critical(old: Option<&FailoverUnitDescription>, new: &FailoverUnitDescription) -> bool {
    let Some(old) = old else {
        return true;
    };
    if new.version <= old.version {
        return false;
    }
    if new.flags.to_be_deleted && !old.flags.to_be_deleted {
        return true;
    }
    if new.replica_diff > 0 && new.replica_diff != old.replica_diff {
        return true;
    }
    if new.primary_node() != old.primary_node() {
        return true;
    }
    if new.active_replica_count() != old.active_replica_count()
        || new.standby_replica_count() != old.standby_replica_count()
    {
        return true;
    }
    let (a, b) = (&old.flags, &new.flags);
    if a.upgrading != b.upgrading
        || a.swapping_primary != b.swapping_primary
        || a.quorum_lost != b.quorum_lost
        || a.reconfiguration_in_progress != b.reconfiguration_in_progress
    {
        return true;
    }
    let transitioning = |fu: &FailoverUnitDescription| {
        fu.replicas
            .iter()
            .filter(|r| r.in_build || r.to_be_promoted)
            .map(|r| (r.node, r.in_build, r.to_be_promoted))
            .collect::<Vec<_>>()
    };
    transitioning(old) != transitioning(new)
}

/// Mutations accepted since the last commit.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: Vec<PendingUpdate>,
    has_critical: bool,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an update and return whether it is critical against `state`.
    ///
    /// Failover unit updates are compared with the newest queued version
    /// of the same partition, falling back to the committed one.
    pub fn push(&mut self, update: PendingUpdate, state: &ClusterState) -> bool {
        let critical = match &update {
            PendingUpdate::FailoverUnit(desc) => {
                let queued = self.items.iter().rev().find_map(|u| match u {
                    PendingUpdate::FailoverUnit(q) if q.id == desc.id => Some(q),
                    _ => None,
                });
                is_critical(queued.or_else(|| state.failover_unit(desc.id)), desc)
            }
            PendingUpdate::DeleteFailoverUnit { .. } => true,
            PendingUpdate::Node(desc) => state
                .node(desc.id)
                .is_some_and(|old| old.is_up != desc.is_up || old.is_deactivated() != desc.is_deactivated()),
            _ => false,
        };
        self.has_critical |= critical;
        self.items.push(update);
        critical
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        self.has_critical
    }

    /// Apply every queued update in order. Rejected updates are logged and skipped.
    pub fn commit(&mut self, state: &mut ClusterState) -> Vec<Change> {
        self.has_critical = false;
        let items = std::mem::take(&mut self.items);
        let mut changes = Vec::with_capacity(items.len());
        for update in items {
            let label = format!("{update:?}");
            match update.apply(state) {
                Ok(Change::Unchanged) => {}
                Ok(change) => changes.push(change),
                Err(e) => {
                    warn!(error = %e, "rejected update");
                    debug!(update = %label, "rejected update detail");
                }
            }
        }
        changes
    }
}
