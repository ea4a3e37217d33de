//! plb-core — shared building blocks for the placement and load balancing engine.
//!
//! # Components
//!
//! - **`config`** — `PlbConfig`, the immutable tuning value threaded into every refresh
//! - **`metrics`** — per-metric resolved settings and the default metric set
//! - **`expression`** — placement-constraint expressions evaluated against node properties
//! - **`error`** — error types shared by the core modules

pub mod config;
pub mod error;
pub mod expression;
pub mod metrics;

pub use config::{DefragDistribution, PlacementStrategy, PlbConfig};
pub use error::{CoreError, CoreResult};
pub use expression::{CompareOp, Expression, NodeView};
pub use metrics::{
    COUNT, DefaultMetric, MOVE_COST, MetricSettings, Objective, PRIMARY_COUNT, REPLICA_COUNT,
    default_metrics, is_default_metric,
};
