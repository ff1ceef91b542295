//! fleetscale-inventory — fleet snapshot for one tick.
//!
//! Queries the fleet provider once per tick, splits the result into running
//! and stopped nodes, and marks nodes carrying the primary tag as protected
//! from scale-down. Snapshots are never cached across ticks.

pub mod inventory;

pub use inventory::{FleetInventory, InventoryError, InventoryResult};
