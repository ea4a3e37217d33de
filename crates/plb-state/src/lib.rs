//! plb-state — the cluster state store for the placement and load balancing engine.
//!
//! Holds the committed, versioned view of nodes, service types,
//! applications, services, partitions (failover units) and their loads.
//! Mutations arrive through the `PendingQueue` and are committed in
//! batches, so a search in flight never observes a half-applied update.
//!
//! # Architecture
//!
//! Entities live in ordered maps keyed by their ids; every relationship
//! (replica → node, partition → service, service → application) is an id
//! lookup, never an owning reference. The `domains` module derives the
//! independent optimization domains from the service set.

pub mod domains;
pub mod error;
pub mod pending;
pub mod store;
pub mod types;

pub use domains::{DomainId, ServiceDomainLayout, compute_domains};
pub use error::{StateError, StateResult};
pub use pending::{PendingQueue, PendingUpdate, is_critical};
pub use store::{Change, ClusterState};
pub use types::*;
