//! PLB placement engine — turns a frozen view of one service domain into
//! a bounded list of replica movements.
//!
//! This crate does NOT own cluster state or decide when to run (that's
//! `plb-scheduler`). It projects the state store into a `Snapshot`,
//! evaluates hard constraints and the balance score on candidate
//! solutions, and searches for a cheap set of moves.
//!
//! # Components
//!
//! - **`snapshot`** — Immutable per-run projection of a domain
//! - **`solution`** — Mutable candidate placement with incremental loads and violations
//! - **`constraints`** — Hard constraint kinds and target validity
//! - **`score`** — Balance, defragmentation and reservation scoring
//! - **`cost`** — Move cost model
//! - **`movement`** — Result surface (per-partition actions)
//! - **`search`** — Placement, greedy repair, simulated annealing, restricted defragmentation

pub mod constraints;
pub mod cost;
pub mod error;
pub mod movement;
pub mod score;
pub mod search;
pub mod snapshot;
pub mod solution;

pub use constraints::{ConstraintKind, Violations};
pub use cost::MoveCostModel;
pub use error::{SearchError, SearchResult};
pub use movement::{MoveKind, Movement, PartitionMovement};
pub use search::{CancelToken, SearchKind, SearchLimits, SearchOutcome, run_search};
pub use snapshot::{Snapshot, SnapshotBuilder};
pub use solution::Solution;
