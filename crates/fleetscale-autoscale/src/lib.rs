//! fleetscale-autoscale — threshold-driven scaling decisions.
//!
//! # Decision rule
//!
//! ```text
//! average = unweighted mean of per-node utilization
//!
//! if average > high: ScaleUp    (one node)
//! if average < low:  ScaleDown  (one non-primary node)
//! otherwise:         NoAction
//! ```
//!
//! Comparisons are strict. There is no cooldown between ticks, so an
//! average hovering at a threshold can alternate decisions tick to tick.

pub mod scaler;

pub use scaler::{ScalingDecision, decide, select_scale_down_candidate};
