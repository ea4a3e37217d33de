//! Refresh loop over a loaded scenario.
//!
//! Each round refreshes the engine at the current logical time and,
//! when asked to, completes the emitted actions through the simulated
//! fail-over layer before time moves on by one step.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use plb_placement::MoveKind;
use plb_scheduler::{DomainInfo, Plb, RefreshResult, apply_movements};
use plb_state::NodeId;

#[derive(Debug, Clone, Copy)]
pub struct SimOptions {
    pub refreshes: u32,
    pub step: Duration,
    pub apply: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            refreshes: 1,
            step: Duration::from_secs(10),
            apply: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Round {
    pub round: u32,
    pub at_secs: f64,
    pub result: RefreshResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub is_up: bool,
    pub loads: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub rounds: Vec<Round>,
    pub domains: Vec<DomainInfo>,
    pub nodes: Vec<NodeSummary>,
}

impl Report {
    pub fn action_count(&self) -> usize {
        self.rounds.iter().map(|r| r.result.action_count()).sum()
    }
}

pub struct Simulation {
    plb: Plb,
    now: Duration,
}

impl Simulation {
    pub fn new(plb: Plb) -> Self {
        Self {
            plb,
            now: Duration::ZERO,
        }
    }

    pub fn plb(&self) -> &Plb {
        &self.plb
    }

    pub fn run(&mut self, options: &SimOptions) -> Report {
        let mut rounds = Vec::with_capacity(options.refreshes as usize);
        for round in 1..=options.refreshes {
            let result = self.plb.refresh(self.now);
            debug!(round, actions = result.action_count(), "round finished");
            if options.apply {
                self.apply(&result);
            }
            rounds.push(Round {
                round,
                at_secs: self.now.as_secs_f64(),
                result,
            });
            self.now += options.step;
        }
        Report {
            rounds,
            domains: self.plb.service_domains(),
            nodes: self.nodes(),
        }
    }

    fn apply(&mut self, result: &RefreshResult) {
        for (id, movement) in &result.movements {
            let Some(fu) = self.plb.partition(*id) else {
                warn!(partition = %id, "moved partition no longer exists");
                continue;
            };
            let next = apply_movements(fu, movement);
            self.plb.update_failover_unit(next);
        }
        self.plb.process_pending_updates(self.now);
    }

    fn nodes(&self) -> Vec<NodeSummary> {
        self.plb
            .state()
            .nodes()
            .map(|n| NodeSummary {
                id: n.id,
                is_up: n.is_up,
                loads: self.plb.node_loads(n.id),
            })
            .collect()
    }
}

fn node_label(node: Option<NodeId>) -> String {
    node.map_or_else(|| "-".to_string(), |n| n.to_string())
}

/// Human-readable rendering of a report.
pub fn format_report(report: &Report) -> String {
    let mut out = String::new();
    for round in &report.rounds {
        let result = &round.result;
        let _ = writeln!(
            out,
            "round {} at {:.1}s: {} action(s) in {} partition(s)",
            round.round,
            round.at_secs,
            result.action_count(),
            result.movements.len()
        );
        for domain in &result.domains {
            let _ = writeln!(
                out,
                "  domain {}: {} ({} actions, score {:.4} -> {:.4}{})",
                domain.domain,
                domain.action,
                domain.actions,
                domain.score_before,
                domain.score_after,
                if domain.interrupted { ", interrupted" } else { "" }
            );
        }
        for movement in result.movements.values() {
            for action in &movement.actions {
                let kind = match action.kind {
                    MoveKind::RequestedPlacementNotPossible => "placement not possible".to_string(),
                    kind => format!("{kind:?}"),
                };
                let _ = writeln!(
                    out,
                    "    {} [{}] {}: {} -> {}",
                    movement.partition,
                    movement.service,
                    kind,
                    node_label(action.source),
                    node_label(action.target)
                );
            }
        }
    }

    let _ = writeln!(out, "\nnodes:");
    for node in &report.nodes {
        let loads: Vec<String> = node.loads.iter().map(|(m, v)| format!("{m}={v}")).collect();
        let status = if node.is_up { "" } else { " (down)" };
        let _ = writeln!(out, "  {}{}: {}", node.id, status, loads.join(" "));
    }
    let _ = writeln!(out, "\ndomains:");
    for domain in &report.domains {
        let services: Vec<&str> = domain.services.iter().map(String::as_str).collect();
        let _ = writeln!(out, "  {} [{}]: {}", domain.id, services.join(", "), domain.action);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Scenario;

    const PILED_UP: &str = r#"
[[nodes]]
id = 0
[[nodes]]
id = 1

[[services]]
name = "svc"
service_type = "T"
is_stateful = false
metrics = [{ name = "Cpu", weight = 1.0, primary_default_load = 10, secondary_default_load = 10 }]

[[partitions]]
id = "00000000-0000-0000-0000-000000000001"
service = "svc"
version = 1
replicas = [{ node = 0, role = "instance" }]

[[partitions]]
id = "00000000-0000-0000-0000-000000000002"
service = "svc"
version = 1
replicas = [{ node = 0, role = "instance" }]
"#;

    fn simulation() -> Simulation {
        Simulation::new(Scenario::from_toml_str(PILED_UP).unwrap().into_engine().unwrap())
    }

    #[test]
    fn applied_rounds_settle_the_cluster() {
        let mut sim = simulation();
        let report = sim.run(&SimOptions {
            refreshes: 3,
            step: Duration::from_secs(10),
            apply: true,
        });
        assert_eq!(report.rounds.len(), 3);
        assert_eq!(report.action_count(), 1);
        assert!(report.rounds[1].result.is_empty());
        assert_eq!(sim.plb().node_load(0, "Cpu"), 10);
        assert_eq!(sim.plb().node_load(1, "Cpu"), 10);
        assert_eq!(report.nodes.len(), 2);
        assert_eq!(report.rounds[2].at_secs, 20.0);
    }

    #[test]
    fn dry_run_leaves_state_alone() {
        let mut sim = simulation();
        let report = sim.run(&SimOptions::default());
        assert_eq!(report.action_count(), 1);
        assert_eq!(sim.plb().node_load(0, "Cpu"), 20);
    }

    #[test]
    fn report_renders_rounds_and_nodes() {
        let mut sim = simulation();
        let report = sim.run(&SimOptions::default());
        let text = format_report(&report);
        assert!(text.contains("round 1 at 0.0s: 1 action(s) in 1 partition(s)"));
        assert!(text.contains("MoveInstance: 0 -> 1"));
        assert!(text.contains("Cpu=20"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rounds"][0]["result"]["domains"][0]["action"], "quick_load_balancing");
    }
}
