//! Hard constraints.
//!
//! A candidate solution carries one violation count per constraint kind.
//! Kinds are ordered by priority and counts compare lexicographically, so
//! fixing a node availability problem always outranks any number of
//! fault domain or affinity violations.
//!
//! Violations are attributed to three kinds of entities so a solution can
//! recompute only what a move touched:
//!
//! - partitions (availability, domains, placement, affinity, block list, primary placement)
//! - nodes (capacity, including unused application reservations)
//! - applications (total and per-node capacity, scale-out)

use std::fmt;
use std::ops::{AddAssign, SubAssign};

use plb_state::ReplicaRole;

use crate::snapshot::Snapshot;
use crate::solution::Slot;

const LOAD_EPSILON: f64 = 1e-9;

/// Constraint kinds in descending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintKind {
    NodeAvailability,
    Capacity,
    FaultDomain,
    UpgradeDomain,
    PlacementConstraint,
    Affinity,
    BlockList,
    PrimaryPlacement,
}

impl ConstraintKind {
    pub const ALL: [ConstraintKind; 8] = [
        ConstraintKind::NodeAvailability,
        ConstraintKind::Capacity,
        ConstraintKind::FaultDomain,
        ConstraintKind::UpgradeDomain,
        ConstraintKind::PlacementConstraint,
        ConstraintKind::Affinity,
        ConstraintKind::BlockList,
        ConstraintKind::PrimaryPlacement,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConstraintKind::NodeAvailability => "node_availability",
            ConstraintKind::Capacity => "capacity",
            ConstraintKind::FaultDomain => "fault_domain",
            ConstraintKind::UpgradeDomain => "upgrade_domain",
            ConstraintKind::PlacementConstraint => "placement_constraint",
            ConstraintKind::Affinity => "affinity",
            ConstraintKind::BlockList => "block_list",
            ConstraintKind::PrimaryPlacement => "primary_placement",
        }
    }
}

/// Violation counts indexed by `ConstraintKind`, compared lexicographically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Violations([u32; 8]);

impl Violations {
    pub fn get(&self, kind: ConstraintKind) -> u32 {
        self.0[kind as usize]
    }

    pub fn add(&mut self, kind: ConstraintKind, count: u32) {
        self.0[kind as usize] += count;
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }
}

impl AddAssign for Violations {
    fn add_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0) {
            *a += b;
        }
    }
}

impl SubAssign for Violations {
    fn sub_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0) {
            *a = a.saturating_sub(b);
        }
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for kind in ConstraintKind::ALL {
            let count = self.get(kind);
            if count > 0 {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{}={}", kind.name(), count)?;
                first = false;
            }
        }
        Ok(())
    }
}

// ── Load view ──────────────────────────────────────────────────────

/// Borrowed accounting of a solution, laid out `node * metrics + metric`.
pub(crate) struct LoadView<'s> {
    pub metric_count: usize,
    pub node_loads: &'s [f64],
    pub departed: &'s [f64],
    pub app_node_loads: &'s [Vec<f64>],
    pub app_node_counts: &'s [Vec<i32>],
}

impl LoadView<'_> {
    /// Load that will sit on the node while in-flight moves complete.
    pub fn transient_load(&self, node: usize, metric: usize) -> f64 {
        let i = node * self.metric_count + metric;
        self.node_loads[i] + self.departed[i]
    }

    /// Reserved but unused application load on a node.
    pub fn reservation_shortfall(&self, snap: &Snapshot, node: usize, metric: usize) -> f64 {
        let mut shortfall = 0.0;
        for (a, app) in snap.applications.iter().enumerate() {
            if self.app_node_counts[a][node] <= 0 {
                continue;
            }
            for (m, cap) in &app.capacities {
                if *m == metric && cap.reservation > 0 {
                    let used = self.app_node_loads[a][node * self.metric_count + metric];
                    shortfall += (cap.reservation as f64 - used).max(0.0);
                }
            }
        }
        shortfall
    }
}

// ── Entity violations ──────────────────────────────────────────────

pub(crate) fn node_violations(snap: &Snapshot, node: usize, view: &LoadView<'_>) -> Violations {
    let mut v = Violations::default();
    let entry = &snap.nodes[node];
    for metric in 0..view.metric_count {
        let Some(capacity) = entry.capacity[metric] else {
            continue;
        };
        let load = if snap.config.prevent_transient_overcommit {
            view.transient_load(node, metric)
        } else {
            view.node_loads[node * view.metric_count + metric]
        };
        if load + view.reservation_shortfall(snap, node, metric) > capacity + LOAD_EPSILON {
            v.add(ConstraintKind::Capacity, 1);
        }
    }
    v
}

pub(crate) fn app_violations(snap: &Snapshot, app: usize, view: &LoadView<'_>) -> Violations {
    let mut v = Violations::default();
    let entry = &snap.applications[app];
    let loads = &view.app_node_loads[app];
    let counts = &view.app_node_counts[app];
    let m_count = view.metric_count;

    for (metric, cap) in &entry.capacities {
        let per_node = (0..snap.nodes.len()).map(|n| loads[n * m_count + metric]);
        if cap.total > 0 && per_node.clone().sum::<f64>() > cap.total as f64 + LOAD_EPSILON {
            v.add(ConstraintKind::Capacity, 1);
        }
        if cap.per_node > 0 {
            let over = per_node
                .filter(|l| *l > cap.per_node as f64 + LOAD_EPSILON)
                .count();
            v.add(ConstraintKind::Capacity, over as u32);
        }
    }
    if entry.scaleout > 0 {
        let used = counts.iter().filter(|c| **c > 0).count() as u32;
        v.add(ConstraintKind::Capacity, used.saturating_sub(entry.scaleout));
    }
    v
}

/// Excess over the allowed per-domain replica count.
///
/// Standard policy tolerates the "+1" imbalance: every domain with eligible
/// nodes holds between `floor(k/D)` and `ceil(k/D)` replicas. The quorum
/// policy only caps each domain at a minority of the replica set. When
/// auto-switch is on and some domain is too small to hold `floor(k/D)`
/// replicas, the quorum policy is used instead.
pub fn domain_violations(counts: &[u32], eligible: &[usize], quorum: bool, auto_switch: bool) -> u32 {
    let k: u32 = counts.iter().sum();
    let domains = eligible.iter().filter(|e| **e > 0).count() as u32;
    if k == 0 || domains == 0 {
        return 0;
    }
    let floor = k / domains;
    let ceil = k.div_ceil(domains);
    let quorum = quorum
        || (auto_switch && eligible.iter().any(|e| *e > 0 && (*e as u32) < floor));

    if quorum {
        let limit = ((k - 1) / 2).max(1);
        return counts.iter().map(|c| c.saturating_sub(limit)).sum();
    }
    counts
        .iter()
        .zip(eligible)
        .map(|(c, e)| {
            let under = if *e > 0 { floor.saturating_sub(*c) } else { 0 };
            c.saturating_sub(ceil) + under
        })
        .sum()
}

/// Violations of one partition given its slots and the slots of its affinity parent.
pub(crate) fn partition_violations(
    snap: &Snapshot,
    partition: usize,
    slots: &[Slot],
    parent: Option<&[Slot]>,
) -> Violations {
    let mut v = Violations::default();
    let part = &snap.partitions[partition];
    if part.frozen {
        return v;
    }
    let service = &snap.services[part.service];
    let mut fd_counts = vec![0u32; snap.fault_domain_count];
    let mut ud_counts = vec![0u32; snap.upgrade_domain_count];

    for (slot, entry) in slots.iter().zip(&part.replicas) {
        let Some(n) = slot.live_node() else {
            continue;
        };
        if !entry.counts_domain {
            continue;
        }
        let node = &snap.nodes[n];
        if !node.is_up || node.must_evacuate(slot.role) {
            v.add(ConstraintKind::NodeAvailability, 1);
        }
        if !service.allowed[n] {
            v.add(ConstraintKind::PlacementConstraint, 1);
        }
        if service.blocked[n] {
            v.add(ConstraintKind::BlockList, 1);
        }
        fd_counts[node.fault_domain] += 1;
        ud_counts[node.upgrade_domain] += 1;
    }

    let config = &snap.config;
    v.add(
        ConstraintKind::FaultDomain,
        domain_violations(
            &fd_counts,
            &service.fd_eligible,
            config.quorum_based_replica_distribution_per_fault_domains,
            config.quorum_based_logic_auto_switch,
        ),
    );
    v.add(
        ConstraintKind::UpgradeDomain,
        domain_violations(
            &ud_counts,
            &service.ud_eligible,
            config.quorum_based_replica_distribution_per_upgrade_domains,
            config.quorum_based_logic_auto_switch,
        ),
    );

    if let (Some(affinity), Some(parent)) = (service.affinity, parent) {
        let parent_primary = parent
            .iter()
            .find(|s| s.role == ReplicaRole::Primary)
            .and_then(|s| s.live_node());
        let hosts_parent = |n: usize| parent.iter().any(|s| s.live_node() == Some(n));
        for slot in slots {
            let Some(n) = slot.live_node() else {
                continue;
            };
            let ok = if affinity.aligned && slot.role == ReplicaRole::Primary && parent_primary.is_some() {
                parent_primary == Some(n)
            } else {
                hosts_parent(n)
            };
            if !ok {
                v.add(ConstraintKind::Affinity, 1);
            }
        }
    }

    if let Some(preferred) = &service.preferred_primary {
        let any_preferred = snap
            .nodes
            .iter()
            .enumerate()
            .any(|(i, n)| preferred[i] && n.accepts_replicas());
        let misplaced = slots
            .iter()
            .filter(|s| s.role == ReplicaRole::Primary)
            .filter_map(|s| s.live_node())
            .any(|n| !preferred[n]);
        if any_preferred && misplaced {
            v.add(ConstraintKind::PrimaryPlacement, 1);
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_is_lexicographic() {
        let mut availability = Violations::default();
        availability.add(ConstraintKind::NodeAvailability, 1);
        let mut many = Violations::default();
        many.add(ConstraintKind::FaultDomain, 10);
        many.add(ConstraintKind::Affinity, 10);
        assert!(availability > many);
        assert!(many > Violations::default());
    }

    #[test]
    fn add_and_sub_are_componentwise() {
        let mut a = Violations::default();
        a.add(ConstraintKind::Capacity, 2);
        let mut b = Violations::default();
        b.add(ConstraintKind::Capacity, 1);
        b.add(ConstraintKind::BlockList, 1);
        a += b;
        assert_eq!(a.get(ConstraintKind::Capacity), 3);
        a -= b;
        assert_eq!(a.get(ConstraintKind::Capacity), 2);
        assert_eq!(a.get(ConstraintKind::BlockList), 0);
        assert_eq!(a.to_string(), "capacity=2");
    }

    #[test]
    fn plus_one_imbalance_is_tolerated() {
        // 3 replicas over 2 domains: 2/1 is fine, 3/0 is not.
        assert_eq!(domain_violations(&[2, 1], &[3, 3], false, false), 0);
        assert_eq!(domain_violations(&[3, 0], &[3, 3], false, false), 2);
    }

    #[test]
    fn empty_eligible_domain_counts_as_under_floor() {
        // 4 replicas, 4 domains with eligible nodes, one domain empty.
        assert_eq!(domain_violations(&[2, 1, 1, 0], &[2, 2, 2, 2], false, false), 2);
    }

    #[test]
    fn quorum_policy_caps_minority() {
        // 5 replicas may put 2 per domain under quorum.
        assert_eq!(domain_violations(&[2, 2, 1], &[1, 1, 1], true, false), 0);
        assert_eq!(domain_violations(&[3, 1, 1], &[5, 5, 5], true, false), 1);
    }

    #[test]
    fn auto_switch_kicks_in_for_small_domains() {
        // 6 replicas over 2 domains, floor 3; one domain has 1 node.
        assert_eq!(domain_violations(&[5, 1], &[6, 1], false, false), 4);
        assert_eq!(domain_violations(&[5, 1], &[6, 1], false, true), 3);
    }
}
