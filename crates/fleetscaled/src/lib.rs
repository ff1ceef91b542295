//! fleetscaled — the fleetscale control loop.
//!
//! A tick is run to completion once per invocation; an external scheduler
//! decides how often. The caller must hold the tick [`Lease`] so that two
//! ticks never mutate the fleet at the same time.
//!
//! [`Lease`]: fleet_core::Lease

pub mod tick;

pub use tick::{ActionOutcome, ControlLoop, TickError, TickReport, TickStage, lease_ttl};
