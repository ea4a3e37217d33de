//! Engine configuration.
//!
//! `PlbConfig` is loaded once (usually from TOML) and handed to the engine
//! as an immutable value. Every refresh reads it through an `Arc`, so a
//! configuration change is a swap of the whole value, never an in-place
//! mutation of individual knobs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// How a metric participates in placement and balancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Spread load evenly across nodes.
    #[default]
    Balancing,
    /// Keep reserved space free on some nodes, balance the rest.
    ReservationAndBalance,
    /// Keep reserved space free on some nodes, otherwise indifferent.
    Reservation,
    /// Keep reserved space free on some nodes, pack the rest densely.
    ReservationAndPack,
    /// Empty out nodes by concentrating load.
    Defragmentation,
}

/// How emptied nodes should be distributed across fault and upgrade domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefragDistribution {
    /// Empty nodes evenly across fault and upgrade domains.
    #[default]
    Spread,
    /// Any node may be emptied.
    NoDistribution,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlbConfig {
    // ── Intervals (seconds) ──────────────────────────────────────────
    pub min_placement_interval: f64,
    pub min_constraint_check_interval: f64,
    pub min_load_balancing_interval: f64,
    pub process_pending_updates_interval: f64,
    pub balancing_delay_after_node_down: f64,
    pub balancing_delay_after_new_node: f64,
    pub global_movement_throttle_counting_interval: f64,
    pub movement_per_partition_throttle_counting_interval: f64,

    // ── Throttling ───────────────────────────────────────────────────
    pub global_movement_throttle_threshold: u64,
    pub global_movement_throttle_threshold_percentage: f64,
    pub global_movement_throttle_threshold_for_placement: u64,
    pub global_movement_throttle_threshold_percentage_for_placement: f64,
    pub global_movement_throttle_threshold_for_balancing: u64,
    pub global_movement_throttle_threshold_percentage_for_balancing: f64,
    pub movement_per_partition_throttle_threshold: u64,
    pub max_percentage_to_move: f64,
    pub max_percentage_to_move_for_placement: f64,
    pub throttle_placement_phase: bool,
    pub throttle_constraint_check_phase: bool,
    pub throttle_balancing_phase: bool,

    // ── Search ───────────────────────────────────────────────────────
    pub simulated_annealing_iterations_per_round: u32,
    /// Negative means no cap beyond the round termination rules.
    pub max_simulated_annealing_iterations: i64,
    pub placement_search_iterations_per_round: u32,
    pub constraint_check_iterations_per_round: u32,
    pub quick_load_balancing_iterations: u32,
    pub fast_balancing_temperature_decay_rate: f64,
    pub slow_balancing_temperature_decay_rate: f64,
    pub use_slow_balancing: bool,
    pub enable_cluster_specific_initial_temperature: bool,
    pub cluster_specific_temperature_coefficient: f64,
    pub initial_temperature_probe_count: u32,
    pub swap_primary_probability: f64,
    pub initial_random_seed: u64,

    // ── Scoring and move cost ────────────────────────────────────────
    pub local_domain_weight: f64,
    pub score_improvement_threshold: f64,
    /// Negative disables the throttle.
    pub avg_std_dev_delta_throttle_threshold: f64,
    pub ignore_cost_in_scoring: bool,
    pub use_move_cost_reports: bool,
    pub move_cost_offset: f64,
    pub move_cost_zero: f64,
    pub move_cost_low: f64,
    pub move_cost_medium: f64,
    pub move_cost_high: f64,
    pub swap_cost: f64,

    // ── Per-metric settings ──────────────────────────────────────────
    pub metric_activity_thresholds: BTreeMap<String, u64>,
    pub metric_balancing_thresholds: BTreeMap<String, f64>,
    pub metric_empty_node_thresholds: BTreeMap<String, u64>,
    pub reserved_load_per_node: BTreeMap<String, u64>,
    pub global_metric_weights: BTreeMap<String, f64>,
    pub balancing_by_percentage: BTreeMap<String, bool>,
    pub defragmentation_metrics: BTreeMap<String, bool>,
    /// Values below 1 are a fraction of eligible nodes, otherwise a node count.
    pub defragmentation_empty_nodes_threshold: BTreeMap<String, f64>,
    pub defragmentation_empty_node_distribution: BTreeMap<String, DefragDistribution>,
    pub defragmentation_empty_node_weight: BTreeMap<String, f64>,
    pub placement_strategy: BTreeMap<String, PlacementStrategy>,
    pub node_buffer_percentage: BTreeMap<String, f64>,

    // ── Phase toggles and domain policy ──────────────────────────────
    pub load_balancing_enabled: bool,
    pub constraint_check_enabled: bool,
    pub prevent_transient_overcommit: bool,
    pub allow_balancing_during_application_upgrade: bool,
    pub restricted_defragmentation_heuristic_enabled: bool,
    pub defragmentation_fds_std_dev_factor: f64,
    pub defragmentation_uds_std_dev_factor: f64,
    pub quorum_based_replica_distribution_per_fault_domains: bool,
    pub quorum_based_replica_distribution_per_upgrade_domains: bool,
    pub quorum_based_logic_auto_switch: bool,
}

impl Default for PlbConfig {
    fn default() -> Self {
        Self {
            min_placement_interval: 1.0,
            min_constraint_check_interval: 1.0,
            min_load_balancing_interval: 5.0,
            process_pending_updates_interval: 0.3,
            balancing_delay_after_node_down: 120.0,
            balancing_delay_after_new_node: 120.0,
            global_movement_throttle_counting_interval: 600.0,
            movement_per_partition_throttle_counting_interval: 600.0,

            global_movement_throttle_threshold: 1000,
            global_movement_throttle_threshold_percentage: 0.0,
            global_movement_throttle_threshold_for_placement: 0,
            global_movement_throttle_threshold_percentage_for_placement: 0.0,
            global_movement_throttle_threshold_for_balancing: 0,
            global_movement_throttle_threshold_percentage_for_balancing: 0.0,
            movement_per_partition_throttle_threshold: 50,
            max_percentage_to_move: 0.3,
            max_percentage_to_move_for_placement: 0.1,
            throttle_placement_phase: false,
            throttle_constraint_check_phase: false,
            throttle_balancing_phase: true,

            simulated_annealing_iterations_per_round: 1000,
            max_simulated_annealing_iterations: -1,
            placement_search_iterations_per_round: 100,
            constraint_check_iterations_per_round: 100,
            quick_load_balancing_iterations: 1000,
            fast_balancing_temperature_decay_rate: 0.8,
            slow_balancing_temperature_decay_rate: 0.98,
            use_slow_balancing: false,
            enable_cluster_specific_initial_temperature: false,
            cluster_specific_temperature_coefficient: 100.0,
            initial_temperature_probe_count: 50,
            swap_primary_probability: 0.3,
            initial_random_seed: 0,

            local_domain_weight: 0.25,
            score_improvement_threshold: 0.0,
            avg_std_dev_delta_throttle_threshold: -1.0,
            ignore_cost_in_scoring: false,
            use_move_cost_reports: false,
            move_cost_offset: 1000.0,
            move_cost_zero: 0.0,
            move_cost_low: 1.0,
            move_cost_medium: 15.0,
            move_cost_high: 40.0,
            swap_cost: 0.1,

            metric_activity_thresholds: BTreeMap::new(),
            metric_balancing_thresholds: BTreeMap::new(),
            metric_empty_node_thresholds: BTreeMap::new(),
            reserved_load_per_node: BTreeMap::new(),
            global_metric_weights: BTreeMap::new(),
            balancing_by_percentage: BTreeMap::new(),
            defragmentation_metrics: BTreeMap::new(),
            defragmentation_empty_nodes_threshold: BTreeMap::new(),
            defragmentation_empty_node_distribution: BTreeMap::new(),
            defragmentation_empty_node_weight: BTreeMap::new(),
            placement_strategy: BTreeMap::new(),
            node_buffer_percentage: BTreeMap::new(),

            load_balancing_enabled: true,
            constraint_check_enabled: true,
            prevent_transient_overcommit: false,
            allow_balancing_during_application_upgrade: true,
            restricted_defragmentation_heuristic_enabled: false,
            defragmentation_fds_std_dev_factor: 0.01,
            defragmentation_uds_std_dev_factor: 0.01,
            quorum_based_replica_distribution_per_fault_domains: false,
            quorum_based_replica_distribution_per_upgrade_domains: false,
            quorum_based_logic_auto_switch: true,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl PlbConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(
            path = %path.display(),
            slow_balancing = config.use_slow_balancing,
            defrag_metrics = config.defragmentation_metrics.len(),
            "engine config loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: PlbConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the search cannot work with.
    pub fn validate(&self) -> CoreResult<()> {
        let fractions = [
            ("max_percentage_to_move", self.max_percentage_to_move),
            (
                "max_percentage_to_move_for_placement",
                self.max_percentage_to_move_for_placement,
            ),
            ("swap_primary_probability", self.swap_primary_probability),
            ("local_domain_weight", self.local_domain_weight),
            (
                "global_movement_throttle_threshold_percentage",
                self.global_movement_throttle_threshold_percentage,
            ),
        ];
        for (name, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        for (name, value) in [
            ("fast_balancing_temperature_decay_rate", self.fast_balancing_temperature_decay_rate),
            ("slow_balancing_temperature_decay_rate", self.slow_balancing_temperature_decay_rate),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} must be within (0, 1), got {value}"
                )));
            }
        }

        for (metric, weight) in &self.defragmentation_empty_node_weight {
            if !(0.0..=1.0).contains(weight) {
                return Err(CoreError::InvalidConfig(format!(
                    "defragmentation_empty_node_weight[{metric}] must be within [0, 1], got {weight}"
                )));
            }
        }
        for (metric, buffer) in &self.node_buffer_percentage {
            if !(0.0..1.0).contains(buffer) {
                return Err(CoreError::InvalidConfig(format!(
                    "node_buffer_percentage[{metric}] must be within [0, 1), got {buffer}"
                )));
            }
        }
        if self.move_cost_offset <= 0.0 {
            return Err(CoreError::InvalidConfig(
                "move_cost_offset must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_placement_interval(&self) -> Duration {
        secs(self.min_placement_interval)
    }

    pub fn min_constraint_check_interval(&self) -> Duration {
        secs(self.min_constraint_check_interval)
    }

    pub fn min_load_balancing_interval(&self) -> Duration {
        secs(self.min_load_balancing_interval)
    }

    pub fn process_pending_updates_interval(&self) -> Duration {
        secs(self.process_pending_updates_interval)
    }

    pub fn balancing_delay_after_node_down(&self) -> Duration {
        secs(self.balancing_delay_after_node_down)
    }

    pub fn balancing_delay_after_new_node(&self) -> Duration {
        secs(self.balancing_delay_after_new_node)
    }

    pub fn global_movement_throttle_counting_interval(&self) -> Duration {
        secs(self.global_movement_throttle_counting_interval)
    }

    pub fn movement_per_partition_throttle_counting_interval(&self) -> Duration {
        secs(self.movement_per_partition_throttle_counting_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PlbConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_load_balancing_interval(), Duration::from_secs(5));
        assert_eq!(config.global_movement_throttle_threshold, 1000);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml_str = r#"
min_load_balancing_interval = 10.0
swap_primary_probability = 0.0

[metric_balancing_thresholds]
Memory = 2.0

[placement_strategy]
Disk = "defragmentation"

[defragmentation_empty_node_distribution]
Disk = "no_distribution"
"#;
        let config = PlbConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.min_load_balancing_interval, 10.0);
        assert_eq!(config.swap_primary_probability, 0.0);
        assert_eq!(config.metric_balancing_thresholds["Memory"], 2.0);
        assert_eq!(config.placement_strategy["Disk"], PlacementStrategy::Defragmentation);
        assert_eq!(
            config.defragmentation_empty_node_distribution["Disk"],
            DefragDistribution::NoDistribution
        );
        assert_eq!(config.max_percentage_to_move, 0.3);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = PlbConfig::from_toml_str("max_percentage_to_move = 1.5").unwrap_err();
        assert!(err.to_string().contains("max_percentage_to_move"));

        let config = PlbConfig {
            fast_balancing_temperature_decay_rate: 1.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plb.toml");

        let mut config = PlbConfig::default();
        config.global_metric_weights.insert("Cpu".to_string(), 2.0);
        config.prevent_transient_overcommit = true;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = PlbConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn negative_intervals_clamp_to_zero() {
        let config = PlbConfig {
            min_placement_interval: -3.0,
            ..Default::default()
        };
        assert_eq!(config.min_placement_interval(), Duration::ZERO);
    }
}
