//! fleetscale-metrics — utilization measurement for the control loop.
//!
//! Wraps the metrics source with the trailing-window query used to decide
//! scaling, the fleet-wide unweighted average, and custom metric
//! publication.

pub mod collector;

pub use collector::{MetricsCollector, MetricsError, MetricsResult, fleet_average};
