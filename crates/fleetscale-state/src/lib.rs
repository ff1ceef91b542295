//! fleetscale-state — embedded state store and local backend for fleetscale.
//!
//! Backed by [redb](https://docs.rs/redb). The store persists the nodes,
//! target-group members, utilization samples, alerts, dashboards and tick
//! leases of a locally simulated fleet; [`LocalBackend`] serves every
//! collaborator contract from it so the control loop can run end to end
//! without a cloud account.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{group}|{node}`, `{node}|{metric}|{millis}`) enable
//! prefix scans for related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod backend;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use backend::{LocalBackend, LocalBehavior};
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
