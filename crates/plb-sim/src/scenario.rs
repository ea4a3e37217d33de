//! TOML cluster scenarios.
//!
//! A scenario describes a whole cluster: an optional `[config]` table with
//! engine settings, then arrays of nodes, service types, applications,
//! services, partitions and load reports. Every table uses the field
//! names of the corresponding description type.
//!
//! ```toml
//! [config]
//! min_load_balancing_interval = 10.0
//!
//! [[nodes]]
//! id = 0
//! fault_domain = ["dc0", "rack0"]
//! upgrade_domain = "ud0"
//! capacities = { Cpu = 100 }
//!
//! [[services]]
//! name = "web"
//! service_type = "WebType"
//! is_stateful = false
//! metrics = [{ name = "Cpu", weight = 1.0, primary_default_load = 10, secondary_default_load = 10 }]
//!
//! [[partitions]]
//! id = "00000000-0000-0000-0000-000000000001"
//! service = "web"
//! version = 1
//! replicas = [{ node = 0, role = "instance" }]
//! ```

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use plb_core::PlbConfig;
use plb_scheduler::Plb;
use plb_state::{
    ApplicationDescription, FailoverUnitDescription, LoadOrMoveCostDescription, NodeDescription, PendingUpdate,
    ServiceDescription, ServiceTypeDescription,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scenario {
    pub config: PlbConfig,
    pub nodes: Vec<NodeDescription>,
    pub service_types: Vec<ServiceTypeDescription>,
    pub applications: Vec<ApplicationDescription>,
    pub services: Vec<ServiceDescription>,
    pub partitions: Vec<FailoverUnitDescription>,
    pub loads: Vec<LoadOrMoveCostDescription>,
}

impl Scenario {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading scenario {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing scenario {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let scenario: Scenario = toml::from_str(content)?;
        scenario.config.validate().context("invalid [config] table")?;
        Ok(scenario)
    }

    /// Mutations that recreate the scenario, in dependency order.
    pub fn updates(&self) -> Vec<PendingUpdate> {
        let mut updates = Vec::new();
        updates.extend(self.nodes.iter().cloned().map(PendingUpdate::Node));
        updates.extend(self.service_types.iter().cloned().map(PendingUpdate::ServiceType));
        updates.extend(self.applications.iter().cloned().map(PendingUpdate::Application));
        updates.extend(self.services.iter().cloned().map(PendingUpdate::Service));
        updates.extend(self.partitions.iter().cloned().map(PendingUpdate::FailoverUnit));
        updates.extend(self.loads.iter().cloned().map(PendingUpdate::Load));
        updates
    }

    /// An engine with the whole scenario queued and committed.
    pub fn into_engine(self) -> anyhow::Result<Plb> {
        let updates = self.updates();
        let mut plb = Plb::new(self.config)?;
        let queued = updates.len();
        for update in updates {
            plb.submit(update);
        }
        let applied = plb.process_pending_updates(std::time::Duration::ZERO);
        info!(
            nodes = self.nodes.len(),
            services = self.services.len(),
            partitions = self.partitions.len(),
            queued,
            applied,
            "scenario loaded"
        );
        Ok(plb)
    }
}
