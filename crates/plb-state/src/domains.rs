//! Service domain partitioning.
//!
//! Services that share a linking metric must be optimized together, so
//! the service set is split into connected components: two services are
//! linked when they share a linking metric, when one is affinitized to
//! the other, or when both belong to an application with scale-out or
//! capacity limits. Declared metrics always link. The implicit default
//! metrics link only when some node declares a capacity for them or
//! the configuration gives them a global weight; otherwise every service
//! relying on defaults would collapse into one domain.
//!
//! Domains are always recomputed from scratch; callers reconcile the old
//! and new sets (see `plb-scheduler`).

use std::collections::{BTreeMap, BTreeSet};

use plb_core::PlbConfig;
use plb_core::metrics::is_default_metric;

use crate::store::ClusterState;

/// Stable identifier of a service domain.
pub type DomainId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDomainLayout {
    pub id: DomainId,
    pub services: BTreeSet<String>,
    /// Every metric used by the domain's services, linking or not.
    pub metrics: BTreeSet<String>,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the smaller index as root so ids are stable.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Metrics of a service that tie it to other services.
pub fn linking_metrics(state: &ClusterState, config: &PlbConfig, service: &str) -> BTreeSet<String> {
    let Some(svc) = state.service(service) else {
        return BTreeSet::new();
    };
    svc.effective_metrics()
        .into_iter()
        .map(|m| m.name)
        .filter(|name| {
            !svc.uses_default_metrics()
                || !is_default_metric(name)
                || config.global_metric_weights.contains_key(name)
                || state.nodes().any(|n| n.capacities.contains_key(name))
        })
        .collect()
}

pub fn compute_domains(state: &ClusterState, config: &PlbConfig) -> Vec<ServiceDomainLayout> {
    let names: Vec<&String> = state.services_by_name().keys().collect();
    let index: BTreeMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let mut uf = UnionFind::new(names.len());

    let mut by_metric: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_app: BTreeMap<&str, usize> = BTreeMap::new();
    let mut linking: Vec<BTreeSet<String>> = Vec::with_capacity(names.len());

    for (i, name) in names.iter().enumerate() {
        let metrics = linking_metrics(state, config, name);
        for metric in &metrics {
            match by_metric.get(metric) {
                Some(&first) => uf.union(first, i),
                None => {
                    by_metric.insert(metric.clone(), i);
                }
            }
        }
        linking.push(metrics);

        let Some(svc) = state.service(name) else {
            continue;
        };
        if let Some(affinity) = &svc.affinity {
            if let Some(&parent) = index.get(affinity.parent.as_str()) {
                uf.union(parent, i);
            }
        }
        if let Some(app) = svc.application.as_deref() {
            if state.application(app).is_some_and(|a| a.has_constraints()) {
                match by_app.get(app) {
                    Some(&first) => uf.union(first, i),
                    None => {
                        by_app.insert(app, i);
                    }
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..names.len() {
        let root = uf.find(i);
        groups.entry(root).or_default().push(i);
    }

    groups
        .into_values()
        .map(|members| {
            let services: BTreeSet<String> =
                members.iter().map(|&i| names[i].clone()).collect();
            let metrics: BTreeSet<String> = members
                .iter()
                .filter_map(|&i| state.service(names[i]))
                .flat_map(|s| s.effective_metrics().into_iter().map(|m| m.name))
                .collect();
            let id = members
                .iter()
                .flat_map(|&i| linking[i].iter())
                .min()
                .cloned()
                .unwrap_or_else(|| {
                    let first = services.iter().next().cloned().unwrap_or_default();
                    format!("service:{first}")
                });
            ServiceDomainLayout {
                id,
                services,
                metrics,
            }
        })
        .collect()
}
