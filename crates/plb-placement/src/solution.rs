//! Candidate solution with incremental accounting.
//!
//! A `Solution` assigns every replica slot of the snapshot to a node (or
//! to nothing, for a new replica not yet placed) and keeps node loads,
//! per-service loads, application loads and cached violations up to date
//! as moves are applied and undone. Only the partitions, nodes and
//! applications touched by a move are re-evaluated.

use std::collections::BTreeSet;

use plb_state::ReplicaRole;

use crate::constraints::{self, LoadView, Violations};
use crate::score::{self, ScoreScope};
use crate::snapshot::Snapshot;

/// Penalty added to the energy for every new replica left unplaced.
pub const UNPLACED_PENALTY: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub node: Option<usize>,
    pub role: ReplicaRole,
    pub dropped: bool,
}

impl Slot {
    /// Node the replica occupies, if it is placed and not dropped.
    pub fn live_node(&self) -> Option<usize> {
        if self.dropped { None } else { self.node }
    }
}

/// An elementary change to a solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    /// Place or relocate a replica slot on `to`.
    Relocate { partition: usize, slot: usize, to: usize },
    /// Exchange the roles of primary slot `a` and secondary slot `b`.
    Swap { partition: usize, a: usize, b: usize },
    /// Drop an extra replica.
    Drop { partition: usize, slot: usize },
}

impl Move {
    pub fn partition(&self) -> usize {
        match *self {
            Move::Relocate { partition, .. } | Move::Swap { partition, .. } | Move::Drop { partition, .. } => {
                partition
            }
        }
    }
}

/// Slot writes needed to revert an `apply`.
#[derive(Debug, Default)]
pub struct Undo(Vec<(usize, usize, Slot)>);

#[derive(Default)]
struct Dirty {
    partitions: BTreeSet<usize>,
    nodes: BTreeSet<usize>,
    apps: BTreeSet<usize>,
}

pub struct Solution<'a> {
    snap: &'a Snapshot,
    mask: Vec<bool>,
    weights: Vec<f64>,
    scored_nodes: Vec<usize>,
    local_weight: f64,
    penalize_unplaced: bool,
    respect_buffer: bool,
    slots: Vec<Vec<Slot>>,
    node_loads: Vec<f64>,
    departed: Vec<f64>,
    service_loads: Vec<Vec<f64>>,
    app_node_loads: Vec<Vec<f64>>,
    app_node_counts: Vec<Vec<i32>>,
    partition_violations: Vec<Violations>,
    node_violations: Vec<Violations>,
    app_violations: Vec<Violations>,
    violations: Violations,
    partition_cost: Vec<f64>,
    partition_actions: Vec<u32>,
    partition_unplaced: Vec<usize>,
    total_cost: f64,
    total_actions: u32,
    unplaced: usize,
}

impl<'a> Solution<'a> {
    pub fn new(snap: &'a Snapshot, scope: ScoreScope) -> Self {
        let m_count = snap.metrics.len();
        let n_count = snap.nodes.len();
        let local_weight = if snap.services.len() > 1 {
            snap.config.local_domain_weight
        } else {
            0.0
        };
        let slots = snap
            .partitions
            .iter()
            .map(|p| {
                p.replicas
                    .iter()
                    .map(|r| Slot {
                        node: r.node,
                        role: r.role,
                        dropped: false,
                    })
                    .collect()
            })
            .collect();

        let mut solution = Self {
            snap,
            mask: score::metric_mask(snap, scope),
            weights: snap.metrics.iter().map(|m| m.weight).collect(),
            scored_nodes: score::scored_nodes(snap),
            local_weight,
            penalize_unplaced: false,
            respect_buffer: false,
            slots,
            node_loads: vec![0.0; n_count * m_count],
            departed: vec![0.0; n_count * m_count],
            service_loads: if local_weight > 0.0 {
                vec![vec![0.0; n_count * m_count]; snap.services.len()]
            } else {
                Vec::new()
            },
            app_node_loads: vec![vec![0.0; n_count * m_count]; snap.applications.len()],
            app_node_counts: vec![vec![0; n_count]; snap.applications.len()],
            partition_violations: vec![Violations::default(); snap.partitions.len()],
            node_violations: vec![Violations::default(); n_count],
            app_violations: vec![Violations::default(); snap.applications.len()],
            violations: Violations::default(),
            partition_cost: vec![0.0; snap.partitions.len()],
            partition_actions: vec![0; snap.partitions.len()],
            partition_unplaced: vec![0; snap.partitions.len()],
            total_cost: 0.0,
            total_actions: 0,
            unplaced: 0,
        };
        solution.rebuild();
        solution
    }

    /// Count unplaced new replicas in the energy.
    pub fn penalize_unplaced(mut self, on: bool) -> Self {
        self.penalize_unplaced = on;
        self
    }

    /// Reject targets whose load would exceed the buffered capacity.
    pub fn respect_node_buffer(mut self, on: bool) -> Self {
        self.respect_buffer = on;
        self
    }

    pub fn snapshot(&self) -> &'a Snapshot {
        self.snap
    }

    pub fn slots(&self) -> &[Vec<Slot>] {
        &self.slots
    }

    pub fn violations(&self) -> Violations {
        self.violations
    }

    pub fn partition_violations(&self, partition: usize) -> Violations {
        self.partition_violations[partition]
    }

    pub fn node_violations(&self, node: usize) -> Violations {
        self.node_violations[node]
    }

    pub fn app_violations(&self, app: usize) -> Violations {
        self.app_violations[app]
    }

    pub fn node_load(&self, node: usize, metric: usize) -> f64 {
        self.node_loads[node * self.snap.metrics.len() + metric]
    }

    pub fn node_loads(&self) -> &[f64] {
        &self.node_loads
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    /// Actions (moves, swaps, adds and drops) relative to the snapshot.
    pub fn action_count(&self) -> u32 {
        self.total_actions
    }

    pub fn partition_actions(&self, partition: usize) -> u32 {
        self.partition_actions[partition]
    }

    pub fn unplaced_count(&self) -> usize {
        self.unplaced
    }

    pub fn is_metric_scored(&self, metric: usize) -> bool {
        self.mask[metric] && self.weights[metric] > 0.0
    }

    // ── Scoring ────────────────────────────────────────────────────

    pub fn score(&self) -> f64 {
        let global = score::weighted_score(self.snap, &self.node_loads, &self.mask, &self.weights, &self.scored_nodes);
        if self.local_weight <= 0.0 {
            return global;
        }
        let mut local = 0.0;
        let mut counted = 0usize;
        for (s, service) in self.snap.services.iter().enumerate() {
            let mut service_mask = vec![false; self.mask.len()];
            let mut service_weights = vec![0.0; self.mask.len()];
            for (m, w) in &service.metric_weights {
                service_mask[*m] = self.mask[*m];
                service_weights[*m] = *w;
            }
            if !service_mask.iter().any(|b| *b) {
                continue;
            }
            local += score::weighted_score(
                self.snap,
                &self.service_loads[s],
                &service_mask,
                &service_weights,
                &self.scored_nodes,
            );
            counted += 1;
        }
        if counted == 0 {
            return global;
        }
        (1.0 - self.local_weight) * global + self.local_weight * local / counted as f64
    }

    /// Share of capacity exceeded while moves are in flight.
    pub fn transient_overflow(&self) -> f64 {
        let m_count = self.snap.metrics.len();
        let view = self.view();
        let mut over = 0.0;
        let mut capacity = 0.0;
        for (n, node) in self.snap.nodes.iter().enumerate() {
            for m in 0..m_count {
                if let Some(cap) = node.capacity[m] {
                    over += (view.transient_load(n, m) - cap).max(0.0);
                    capacity += cap;
                }
            }
        }
        if capacity <= 0.0 { 0.0 } else { over / capacity }
    }

    /// Score inflated by move cost, transient overcommit and unplaced replicas.
    pub fn energy(&self) -> f64 {
        let mut energy = self.snap.cost.energy(self.score(), self.total_cost);
        if !self.snap.config.prevent_transient_overcommit && self.departed.iter().any(|d| *d > 0.0) {
            energy *= 1.0 + self.transient_overflow();
        }
        if self.penalize_unplaced {
            energy += UNPLACED_PENALTY * self.unplaced as f64;
        }
        energy
    }

    // ── Move validity ──────────────────────────────────────────────

    fn hosts_partition(&self, partition: usize, node: usize) -> bool {
        self.slots[partition].iter().any(|s| s.live_node() == Some(node))
    }

    pub fn can_relocate(&self, partition: usize, slot: usize, to: usize) -> bool {
        let part = &self.snap.partitions[partition];
        let entry = &part.replicas[slot];
        let current = self.slots[partition][slot];
        if current.dropped || !(entry.movable || entry.is_new) {
            return false;
        }
        if part.frozen && !entry.is_new {
            return false;
        }
        if current.node == Some(to) || !self.snap.nodes[to].accepts_replicas() {
            return false;
        }
        if self.hosts_partition(partition, to) {
            return false;
        }
        if self.respect_buffer {
            let m_count = self.snap.metrics.len();
            let load = part.load(current.role, to);
            for (m, metric) in self.snap.metrics.iter().enumerate() {
                if let Some(cap) = self.snap.nodes[to].capacity[m] {
                    let buffered = metric.settings.buffered_capacity(cap as u64) as f64;
                    if self.node_loads[to * m_count + m] + load[m] > buffered + 1e-9 {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn can_swap(&self, partition: usize, a: usize, b: usize) -> bool {
        let part = &self.snap.partitions[partition];
        if part.frozen || !self.snap.services[part.service].stateful {
            return false;
        }
        let (sa, sb) = (self.slots[partition][a], self.slots[partition][b]);
        if sa.role != ReplicaRole::Primary || sb.role != ReplicaRole::Secondary {
            return false;
        }
        let (ea, eb) = (&part.replicas[a], &part.replicas[b]);
        if !ea.movable || !eb.movable {
            return false;
        }
        let (Some(_), Some(target)) = (sa.live_node(), sb.live_node()) else {
            return false;
        };
        let node = &self.snap.nodes[target];
        node.is_up && !node.must_evacuate(ReplicaRole::Primary)
    }

    pub fn can_drop(&self, partition: usize, slot: usize) -> bool {
        let entry = &self.snap.partitions[partition].replicas[slot];
        entry.droppable && !self.slots[partition][slot].dropped
    }

    pub fn is_valid(&self, mv: &Move) -> bool {
        match *mv {
            Move::Relocate { partition, slot, to } => self.can_relocate(partition, slot, to),
            Move::Swap { partition, a, b } => self.can_swap(partition, a, b),
            Move::Drop { partition, slot } => self.can_drop(partition, slot),
        }
    }

    /// `mv` followed by the moves that keep affinitized child replicas with it.
    pub fn with_followers(&self, mv: Move) -> Vec<Move> {
        let mut moves = vec![mv];
        let partition = mv.partition();
        let service = &self.snap.services[self.snap.partitions[partition].service];
        if service.children.is_empty() || service.partitions.first() != Some(&partition) {
            return moves;
        }
        for &child in &service.children {
            for &cp in &self.snap.services[child].partitions {
                match mv {
                    Move::Relocate { slot, to, .. } => {
                        let Some(from) = self.slots[partition][slot].live_node() else {
                            continue;
                        };
                        for (ci, cs) in self.slots[cp].iter().enumerate() {
                            if cs.live_node() == Some(from) && self.can_relocate(cp, ci, to) {
                                moves.push(Move::Relocate {
                                    partition: cp,
                                    slot: ci,
                                    to,
                                });
                            }
                        }
                    }
                    Move::Swap { a, b, .. } => {
                        let (Some(pa), Some(pb)) = (
                            self.slots[partition][a].live_node(),
                            self.slots[partition][b].live_node(),
                        ) else {
                            continue;
                        };
                        let child_slots = &self.slots[cp];
                        let ca = child_slots
                            .iter()
                            .position(|s| s.role == ReplicaRole::Primary && s.live_node() == Some(pa));
                        let cb = child_slots
                            .iter()
                            .position(|s| s.role == ReplicaRole::Secondary && s.live_node() == Some(pb));
                        if let (Some(ca), Some(cb)) = (ca, cb) {
                            if self.can_swap(cp, ca, cb) {
                                moves.push(Move::Swap {
                                    partition: cp,
                                    a: ca,
                                    b: cb,
                                });
                            }
                        }
                    }
                    Move::Drop { .. } => {}
                }
            }
        }
        moves
    }

    // ── Apply / undo ───────────────────────────────────────────────

    /// Apply moves in order; the returned record reverts them.
    pub fn apply(&mut self, moves: &[Move]) -> Undo {
        let mut undo = Undo::default();
        let mut dirty = Dirty::default();
        for mv in moves {
            match *mv {
                Move::Relocate { partition, slot, to } => {
                    let mut next = self.slots[partition][slot];
                    next.node = Some(to);
                    self.write(partition, slot, next, &mut undo, &mut dirty);
                }
                Move::Swap { partition, a, b } => {
                    let mut sa = self.slots[partition][a];
                    let mut sb = self.slots[partition][b];
                    std::mem::swap(&mut sa.role, &mut sb.role);
                    self.write(partition, a, sa, &mut undo, &mut dirty);
                    self.write(partition, b, sb, &mut undo, &mut dirty);
                }
                Move::Drop { partition, slot } => {
                    let mut next = self.slots[partition][slot];
                    next.dropped = true;
                    self.write(partition, slot, next, &mut undo, &mut dirty);
                }
            }
        }
        self.refresh(&dirty);
        undo
    }

    pub fn undo(&mut self, undo: Undo) {
        let mut dirty = Dirty::default();
        let mut scratch = Undo::default();
        for (p, i, slot) in undo.0.into_iter().rev() {
            self.write(p, i, slot, &mut scratch, &mut dirty);
        }
        self.refresh(&dirty);
    }

    /// Violations and energy after `moves`, leaving the solution unchanged.
    pub fn evaluate(&mut self, moves: &[Move]) -> (Violations, f64) {
        let undo = self.apply(moves);
        let result = (self.violations, self.energy());
        self.undo(undo);
        result
    }

    /// Put a partition back where the snapshot had it.
    pub fn revert_partition(&mut self, partition: usize) -> Undo {
        let original: Vec<Slot> = self.snap.partitions[partition]
            .replicas
            .iter()
            .map(|r| Slot {
                node: r.node,
                role: r.role,
                dropped: false,
            })
            .collect();
        self.set_partition(partition, &original)
    }

    /// Overwrite every slot of a partition.
    pub fn set_partition(&mut self, partition: usize, slots: &[Slot]) -> Undo {
        let mut undo = Undo::default();
        let mut dirty = Dirty::default();
        for (i, slot) in slots.iter().enumerate() {
            self.write(partition, i, *slot, &mut undo, &mut dirty);
        }
        self.refresh(&dirty);
        undo
    }

    /// Replace all slots and recompute from scratch.
    pub fn restore(&mut self, slots: &[Vec<Slot>]) {
        self.slots = slots.to_vec();
        self.rebuild();
    }

    fn write(&mut self, p: usize, i: usize, next: Slot, undo: &mut Undo, dirty: &mut Dirty) {
        let prev = self.slots[p][i];
        if prev == next {
            return;
        }
        self.contribute(p, i, prev, false, dirty);
        self.slots[p][i] = next;
        self.contribute(p, i, next, true, dirty);
        undo.0.push((p, i, prev));
        self.mark_partition(p, dirty);
    }

    fn mark_partition(&self, p: usize, dirty: &mut Dirty) {
        dirty.partitions.insert(p);
        let service = &self.snap.services[self.snap.partitions[p].service];
        if let Some(a) = service.application {
            dirty.apps.insert(a);
        }
        if service.partitions.first() == Some(&p) {
            for &child in &service.children {
                dirty
                    .partitions
                    .extend(self.snap.services[child].partitions.iter().copied());
            }
        }
    }

    fn contribute(&mut self, p: usize, i: usize, slot: Slot, add: bool, dirty: &mut Dirty) {
        let snap = self.snap;
        let m_count = snap.metrics.len();
        let part = &snap.partitions[p];
        let entry = &part.replicas[i];
        let sign = if add { 1.0 } else { -1.0 };
        let app = snap.services[part.service].application;

        if let Some(n) = slot.live_node() {
            dirty.nodes.insert(n);
            if entry.counts_load {
                for (m, l) in part.load(slot.role, n).iter().enumerate() {
                    let k = n * m_count + m;
                    self.node_loads[k] += sign * l;
                    if !self.service_loads.is_empty() {
                        self.service_loads[part.service][k] += sign * l;
                    }
                    if let Some(a) = app {
                        self.app_node_loads[a][k] += sign * l;
                    }
                }
            }
            if entry.counts_domain {
                if let Some(a) = app {
                    self.app_node_counts[a][n] += if add { 1 } else { -1 };
                }
            }
        }
        if let Some(origin) = entry.node {
            if entry.counts_load && !entry.is_new && slot.live_node() != Some(origin) {
                dirty.nodes.insert(origin);
                for (m, l) in part.load(entry.role, origin).iter().enumerate() {
                    self.departed[origin * m_count + m] += sign * l;
                }
            }
        }
    }

    fn view(&self) -> LoadView<'_> {
        LoadView {
            metric_count: self.snap.metrics.len(),
            node_loads: &self.node_loads,
            departed: &self.departed,
            app_node_loads: &self.app_node_loads,
            app_node_counts: &self.app_node_counts,
        }
    }

    fn parent_slots(&self, p: usize) -> Option<&[Slot]> {
        let service = &self.snap.services[self.snap.partitions[p].service];
        let affinity = service.affinity?;
        let parent = *self.snap.services[affinity.parent].partitions.first()?;
        Some(&self.slots[parent])
    }

    fn refresh(&mut self, dirty: &Dirty) {
        for &p in &dirty.partitions {
            let v = constraints::partition_violations(self.snap, p, &self.slots[p], self.parent_slots(p));
            self.violations -= self.partition_violations[p];
            self.violations += v;
            self.partition_violations[p] = v;

            let (cost, actions, unplaced) = self.partition_accounting(p);
            self.total_cost += cost - self.partition_cost[p];
            self.total_actions = self.total_actions + actions - self.partition_actions[p];
            self.unplaced = self.unplaced + unplaced - self.partition_unplaced[p];
            self.partition_cost[p] = cost;
            self.partition_actions[p] = actions;
            self.partition_unplaced[p] = unplaced;
        }
        // Reservation shortfall makes every node of a touched application dirty.
        let mut nodes = dirty.nodes.clone();
        for &a in &dirty.apps {
            if self.snap.applications[a].capacities.iter().any(|(_, c)| c.reservation > 0) {
                nodes.extend(0..self.snap.nodes.len());
                break;
            }
        }
        for &n in &nodes {
            let v = constraints::node_violations(self.snap, n, &self.view());
            self.violations -= self.node_violations[n];
            self.violations += v;
            self.node_violations[n] = v;
        }
        for &a in &dirty.apps {
            let v = constraints::app_violations(self.snap, a, &self.view());
            self.violations -= self.app_violations[a];
            self.violations += v;
            self.app_violations[a] = v;
        }
    }

    fn rebuild(&mut self) {
        self.node_loads.iter_mut().for_each(|v| *v = 0.0);
        self.departed.iter_mut().for_each(|v| *v = 0.0);
        self.service_loads.iter_mut().flatten().for_each(|v| *v = 0.0);
        self.app_node_loads.iter_mut().flatten().for_each(|v| *v = 0.0);
        self.app_node_counts.iter_mut().flatten().for_each(|v| *v = 0);
        self.partition_violations.iter_mut().for_each(|v| *v = Violations::default());
        self.node_violations.iter_mut().for_each(|v| *v = Violations::default());
        self.app_violations.iter_mut().for_each(|v| *v = Violations::default());
        self.partition_cost.iter_mut().for_each(|v| *v = 0.0);
        self.partition_actions.iter_mut().for_each(|v| *v = 0);
        self.partition_unplaced.iter_mut().for_each(|v| *v = 0);
        self.violations = Violations::default();
        self.total_cost = 0.0;
        self.total_actions = 0;
        self.unplaced = 0;

        let mut dirty = Dirty::default();
        for p in 0..self.slots.len() {
            for i in 0..self.slots[p].len() {
                let slot = self.slots[p][i];
                self.contribute(p, i, slot, true, &mut dirty);
            }
            dirty.partitions.insert(p);
        }
        dirty.nodes.extend(0..self.snap.nodes.len());
        dirty.apps.extend(0..self.snap.applications.len());
        self.refresh(&dirty);
    }

    /// Cost, action count and unplaced count of one partition versus the snapshot.
    fn partition_accounting(&self, p: usize) -> (f64, u32, usize) {
        let part = &self.snap.partitions[p];
        let slots = &self.slots[p];
        let mut cost = 0.0;
        let mut actions = 0;
        let mut unplaced = 0;
        let mut swapped = false;
        for (slot, entry) in slots.iter().zip(&part.replicas) {
            if entry.is_new {
                match slot.live_node() {
                    Some(_) => actions += 1,
                    None if !slot.dropped => unplaced += 1,
                    None => {}
                }
                continue;
            }
            if slot.dropped {
                actions += 1;
                continue;
            }
            if slot.role != entry.role && slot.role == ReplicaRole::Primary {
                swapped = true;
            }
            if slot.node != entry.node {
                actions += 1;
                cost += part.move_cost(slot.role);
            }
        }
        if swapped {
            actions += 1;
            cost += self.snap.cost.swap;
        }
        (cost, actions, unplaced)
    }
}
