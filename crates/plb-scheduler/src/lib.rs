//! plb-scheduler — decides when each service domain is searched and what
//! the caller gets back.
//!
//! The `Plb` engine owns the cluster state store and the pending update
//! queue. Each refresh commits queued mutations, reconciles service
//! domains, and walks every dirty domain through its phase state machine.
//! Results are throttled before they are returned as per-partition
//! movements.
//!
//! # Architecture
//!
//! ```text
//! Plb
//!   ├── ClusterState + PendingQueue (from plb-state)
//!   ├── MovementThrottle (rolling windows, per-partition budgets)
//!   └── Per-domain DomainScheduler
//!       └── SearchTask (owns its snapshots, runs plb-placement searches)
//! PlbService
//!   └── Mutex<Plb> + Clock, searches on the blocking pool
//! ```
//!
//! # Components
//!
//! - **`engine`** — `Plb`: mutation, refresh and query surface
//! - **`scheduler`** — per-domain phase ordering, timers and dirty flags
//! - **`throttle`** — global, phase and per-partition movement caps
//! - **`service`** — async wrapper with an injected clock and a run loop
//! - **`failover`** — applies movements back onto partition descriptions

pub mod engine;
pub mod error;
pub mod failover;
pub mod scheduler;
pub mod service;
pub mod throttle;

pub use engine::{DomainInfo, DomainRefresh, PhaseResult, Plb, RefreshResult, SearchTask, TaskResult, check_config};
pub use error::{SchedulerError, SchedulerResult};
pub use failover::apply_movements;
pub use scheduler::{DomainNeeds, DomainScheduler, SchedulerAction};
pub use service::{Clock, ManualClock, MonotonicClock, PendingRefresh, PlbService};
pub use throttle::{MovementThrottle, percentage_cap, truncate};
