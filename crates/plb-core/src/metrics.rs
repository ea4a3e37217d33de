//! Metric and capacity model.
//!
//! A metric is a named resource dimension. Services report load against
//! metrics, nodes declare capacity for them, and the configuration tunes
//! how each metric is balanced. `MetricSettings` is the per-metric view of
//! `PlbConfig` the search consumes, resolved once per snapshot.

use serde::{Deserialize, Serialize};

use crate::config::{DefragDistribution, PlacementStrategy, PlbConfig};

/// Number of primaries (or stateless instances) on a node.
pub const PRIMARY_COUNT: &str = "PrimaryCount";
/// Number of stateful replicas on a node.
pub const REPLICA_COUNT: &str = "ReplicaCount";
/// Number of replicas and instances on a node.
pub const COUNT: &str = "Count";
/// Pseudo-metric carrying reported move cost.
pub const MOVE_COST: &str = "_MoveCost_";

/// A metric a service receives when it declares none of its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefaultMetric {
    pub name: &'static str,
    pub weight: f64,
    pub primary_load: u64,
    pub secondary_load: u64,
}

pub fn default_metrics() -> [DefaultMetric; 3] {
    [
        DefaultMetric {
            name: PRIMARY_COUNT,
            weight: 1.0,
            primary_load: 1,
            secondary_load: 0,
        },
        DefaultMetric {
            name: REPLICA_COUNT,
            weight: 0.3,
            primary_load: 1,
            secondary_load: 1,
        },
        DefaultMetric {
            name: COUNT,
            weight: 0.1,
            primary_load: 1,
            secondary_load: 1,
        },
    ]
}

pub fn is_default_metric(name: &str) -> bool {
    matches!(name, PRIMARY_COUNT | REPLICA_COUNT | COUNT)
}

/// How a metric's node loads enter the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    /// Coefficient of variation of node loads.
    Balance,
    /// Load (or load per capacity) spread, with emptied or reserved nodes rewarded.
    Empty {
        /// Nodes count as empty when their free capacity covers the reservation.
        by_reservation: bool,
        /// The non-empty share of the score rewards packing instead of balance.
        pack: bool,
    },
    /// Metric is only capacity-checked.
    None,
}

/// Per-metric settings resolved from `PlbConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSettings {
    pub name: String,
    pub activity_threshold: u64,
    /// Max/min node load ratio above which the metric is imbalanced; `<= 0` means never.
    pub balancing_threshold: f64,
    pub global_weight: Option<f64>,
    pub balance_by_percentage: bool,
    pub strategy: PlacementStrategy,
    pub objective: Objective,
    /// Load at or below which a node counts as empty.
    pub empty_node_threshold: u64,
    pub reserved_load: u64,
    /// Fraction (below 1) or count of nodes that should be empty.
    pub empty_nodes_target: f64,
    pub distribution: DefragDistribution,
    pub empty_node_weight: f64,
    pub node_buffer: f64,
}

impl MetricSettings {
    pub fn resolve(config: &PlbConfig, name: &str) -> Self {
        let defrag_flag = config
            .defragmentation_metrics
            .get(name)
            .copied()
            .unwrap_or(false);
        let strategy = match config.placement_strategy.get(name) {
            Some(strategy) => *strategy,
            None if defrag_flag => PlacementStrategy::Defragmentation,
            None => PlacementStrategy::Balancing,
        };
        let objective = match strategy {
            PlacementStrategy::Balancing => Objective::Balance,
            PlacementStrategy::Defragmentation => Objective::Empty {
                by_reservation: false,
                pack: false,
            },
            PlacementStrategy::ReservationAndBalance => Objective::Empty {
                by_reservation: true,
                pack: false,
            },
            PlacementStrategy::ReservationAndPack => Objective::Empty {
                by_reservation: true,
                pack: true,
            },
            PlacementStrategy::Reservation => Objective::Empty {
                by_reservation: true,
                pack: false,
            },
        };
        let activity_threshold = config
            .metric_activity_thresholds
            .get(name)
            .copied()
            .unwrap_or(0);
        let empty_node_weight = match strategy {
            PlacementStrategy::Reservation => 1.0,
            _ => config
                .defragmentation_empty_node_weight
                .get(name)
                .copied()
                .unwrap_or(0.5),
        };

        Self {
            name: name.to_string(),
            activity_threshold,
            balancing_threshold: config
                .metric_balancing_thresholds
                .get(name)
                .copied()
                .unwrap_or(1.0),
            global_weight: config.global_metric_weights.get(name).copied(),
            balance_by_percentage: config
                .balancing_by_percentage
                .get(name)
                .copied()
                .unwrap_or(false),
            strategy,
            objective,
            empty_node_threshold: config
                .metric_empty_node_thresholds
                .get(name)
                .copied()
                .unwrap_or(activity_threshold),
            reserved_load: config.reserved_load_per_node.get(name).copied().unwrap_or(0),
            empty_nodes_target: config
                .defragmentation_empty_nodes_threshold
                .get(name)
                .copied()
                .unwrap_or(1.0),
            distribution: config
                .defragmentation_empty_node_distribution
                .get(name)
                .copied()
                .unwrap_or_default(),
            empty_node_weight,
            node_buffer: config.node_buffer_percentage.get(name).copied().unwrap_or(0.0),
        }
    }

    pub fn is_defrag(&self) -> bool {
        matches!(self.objective, Objective::Empty { .. })
    }

    /// Number of nodes (out of `eligible`) that should be empty.
    pub fn empty_nodes_wanted(&self, eligible: usize) -> usize {
        let wanted = if self.empty_nodes_target <= 0.0 {
            0
        } else if self.empty_nodes_target < 1.0 {
            (self.empty_nodes_target * eligible as f64).ceil() as usize
        } else {
            self.empty_nodes_target.floor() as usize
        };
        wanted.min(eligible.saturating_sub(1))
    }

    /// Capacity usable by balancing and placement after the node buffer.
    pub fn buffered_capacity(&self, capacity: u64) -> u64 {
        (capacity as f64 * (1.0 - self.node_buffer)).floor() as u64
    }

    /// Whether a spread of node loads between `min` and `max` needs balancing.
    pub fn is_imbalanced(&self, min: f64, max: f64) -> bool {
        if self.balancing_threshold <= 0.0 {
            return false;
        }
        if max <= self.activity_threshold as f64 || max <= 0.0 {
            return false;
        }
        if min <= 0.0 {
            return true;
        }
        max / min > self.balancing_threshold
    }
}
