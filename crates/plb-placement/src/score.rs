//! Balance scoring.
//!
//! Lower is better. Each metric gets a score from the node loads of the
//! nodes that accept replicas:
//!
//! - balance metrics use the coefficient of variation (std / mean) of
//!   node loads, or of load per capacity when balancing by percentage
//! - empty-node metrics blend the share of load sitting on the nodes that
//!   should be empty (or the reservation shortfall on them) with a
//!   balance or packing term, plus an optional fault/upgrade domain
//!   spread term for the empty nodes
//!
//! The global score is the weighted average over the metrics in scope.

use crate::snapshot::Snapshot;

/// Which metrics a solution is scored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreScope {
    /// Metrics that needed balancing when the snapshot was taken.
    Active,
    /// Every metric of the domain.
    All,
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let avg = mean(values);
    let var = values.iter().map(|v| (v - avg) * (v - avg)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let avg = mean(values);
    if avg <= 0.0 {
        return 0.0;
    }
    std_dev(values) / avg
}

/// Indices of nodes that take part in scoring.
pub fn scored_nodes(snap: &Snapshot) -> Vec<usize> {
    snap.eligible_nodes().collect()
}

/// Node loads of the snapshot as placed, `node * metrics + metric`.
pub fn initial_node_loads(snap: &Snapshot) -> Vec<f64> {
    let m_count = snap.metrics.len();
    let mut loads = vec![0.0; snap.nodes.len() * m_count];
    for part in &snap.partitions {
        for r in &part.replicas {
            let Some(n) = r.node else {
                continue;
            };
            if !r.counts_load {
                continue;
            }
            for (m, l) in part.load(r.role, n).iter().enumerate() {
                loads[n * m_count + m] += l;
            }
        }
    }
    loads
}

fn raw_loads(snap: &Snapshot, loads: &[f64], metric: usize, nodes: &[usize]) -> Vec<f64> {
    let m_count = snap.metrics.len();
    nodes.iter().map(|n| loads[n * m_count + metric]).collect()
}

fn balance_values(snap: &Snapshot, loads: &[f64], metric: usize, nodes: &[usize]) -> Vec<f64> {
    let m_count = snap.metrics.len();
    let by_percentage = snap.metrics[metric].settings.balance_by_percentage;
    nodes
        .iter()
        .map(|&n| {
            let load = loads[n * m_count + metric];
            match snap.nodes[n].capacity[metric] {
                Some(cap) if by_percentage && cap > 0.0 => load / cap,
                _ => load,
            }
        })
        .collect()
}

/// Nodes that count as empty for an empty-node metric.
fn empty_flags(snap: &Snapshot, loads: &[f64], metric: usize, nodes: &[usize]) -> Vec<bool> {
    let settings = &snap.metrics[metric].settings;
    let m_count = snap.metrics.len();
    nodes
        .iter()
        .map(|&n| {
            let load = loads[n * m_count + metric];
            match settings.objective {
                plb_core::Objective::Empty {
                    by_reservation: true,
                    ..
                } => reservation_shortage(settings.reserved_load as f64, snap.nodes[n].capacity[metric], load) <= 0.0,
                _ => load <= settings.empty_node_threshold as f64,
            }
        })
        .collect()
}

fn reservation_shortage(reserved: f64, capacity: Option<f64>, load: f64) -> f64 {
    match capacity {
        Some(cap) => (reserved - (cap - load)).max(0.0),
        None => 0.0,
    }
}

fn per_domain_std(snap: &Snapshot, nodes: &[usize], flags: &[bool], fault: bool) -> f64 {
    let count = if fault {
        snap.fault_domain_count
    } else {
        snap.upgrade_domain_count
    };
    let mut per_domain = vec![0.0; count];
    let mut present = vec![false; count];
    for (&n, empty) in nodes.iter().zip(flags) {
        let d = if fault {
            snap.nodes[n].fault_domain
        } else {
            snap.nodes[n].upgrade_domain
        };
        present[d] = true;
        if *empty {
            per_domain[d] += 1.0;
        }
    }
    let values: Vec<f64> = per_domain
        .into_iter()
        .zip(present)
        .filter(|(_, p)| *p)
        .map(|(v, _)| v)
        .collect();
    std_dev(&values)
}

/// Score of one metric over `nodes`.
pub fn metric_score(snap: &Snapshot, loads: &[f64], metric: usize, nodes: &[usize]) -> f64 {
    let settings = &snap.metrics[metric].settings;
    let values = balance_values(snap, loads, metric, nodes);
    let plb_core::Objective::Empty {
        by_reservation,
        pack,
    } = settings.objective
    else {
        return match settings.objective {
            plb_core::Objective::None => 0.0,
            _ => coefficient_of_variation(&values),
        };
    };

    let wanted = settings.empty_nodes_wanted(nodes.len());
    let raw = raw_loads(snap, loads, metric, nodes);
    let empty_part = if wanted == 0 {
        0.0
    } else if by_reservation {
        let reserved = settings.reserved_load as f64;
        if reserved <= 0.0 {
            0.0
        } else {
            let mut shortages: Vec<f64> = nodes
                .iter()
                .zip(&raw)
                .map(|(&n, &l)| reservation_shortage(reserved, snap.nodes[n].capacity[metric], l))
                .collect();
            shortages.sort_by(f64::total_cmp);
            shortages.iter().take(wanted).sum::<f64>() / (wanted as f64 * reserved)
        }
    } else {
        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            0.0
        } else {
            let mut sorted = raw.clone();
            sorted.sort_by(f64::total_cmp);
            sorted.iter().take(wanted).sum::<f64>() / total
        }
    };

    let rest = if pack {
        if nodes.len() > 1 {
            (1.0 - coefficient_of_variation(&values) / ((nodes.len() - 1) as f64).sqrt()).max(0.0)
        } else {
            0.0
        }
    } else {
        coefficient_of_variation(&values)
    };

    let w = settings.empty_node_weight;
    let mut score = w * empty_part + (1.0 - w) * rest;
    if settings.distribution == plb_core::DefragDistribution::Spread {
        let config = &snap.config;
        let flags = empty_flags(snap, loads, metric, nodes);
        if config.defragmentation_fds_std_dev_factor > 0.0 {
            score += config.defragmentation_fds_std_dev_factor * per_domain_std(snap, nodes, &flags, true);
        }
        if config.defragmentation_uds_std_dev_factor > 0.0 {
            score += config.defragmentation_uds_std_dev_factor * per_domain_std(snap, nodes, &flags, false);
        }
    }
    score
}

/// Weighted average of metric scores over the metrics selected by `mask`.
pub fn weighted_score(snap: &Snapshot, loads: &[f64], mask: &[bool], weights: &[f64], nodes: &[usize]) -> f64 {
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for (m, selected) in mask.iter().enumerate() {
        let w = weights[m];
        if !*selected || w <= 0.0 {
            continue;
        }
        total += w * metric_score(snap, loads, m, nodes);
        weight_sum += w;
    }
    if weight_sum <= 0.0 { 0.0 } else { total / weight_sum }
}

pub fn metric_mask(snap: &Snapshot, scope: ScoreScope) -> Vec<bool> {
    snap.metrics
        .iter()
        .map(|m| match scope {
            ScoreScope::Active => m.active,
            ScoreScope::All => true,
        })
        .collect()
}

/// Global score of a set of node loads.
pub fn global_score(snap: &Snapshot, loads: &[f64], scope: ScoreScope) -> f64 {
    let nodes = scored_nodes(snap);
    let weights: Vec<f64> = snap.metrics.iter().map(|m| m.weight).collect();
    weighted_score(snap, loads, &metric_mask(snap, scope), &weights, &nodes)
}

/// Whether each metric needs work given the snapshot as placed.
pub fn active_metrics(snap: &Snapshot) -> Vec<bool> {
    let loads = initial_node_loads(snap);
    let nodes = scored_nodes(snap);
    snap.metrics
        .iter()
        .enumerate()
        .map(|(m, entry)| {
            if nodes.is_empty() || entry.weight <= 0.0 {
                return false;
            }
            let raw = raw_loads(snap, &loads, m, &nodes);
            let min = raw.iter().copied().fold(f64::INFINITY, f64::min);
            let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let settings = &entry.settings;
            match settings.objective {
                plb_core::Objective::Balance => settings.is_imbalanced(min, max),
                plb_core::Objective::Empty { pack, .. } => {
                    let empty = empty_flags(snap, &loads, m, &nodes)
                        .into_iter()
                        .filter(|e| *e)
                        .count();
                    empty < settings.empty_nodes_wanted(nodes.len())
                        || (settings.empty_node_weight < 1.0 && !pack && settings.is_imbalanced(min, max))
                }
                plb_core::Objective::None => false,
            }
        })
        .collect()
}
