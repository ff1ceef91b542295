//! fleetscale-health — load balancer reconciliation and bounded waits.
//!
//! # Architecture
//!
//! ```text
//! LoadBalancerReconciler (one target group)
//!   ├── register / deregister   idempotent membership changes
//!   ├── healthy_members()       targets the load balancer reports healthy
//!   └── wait_healthy()          poll_until(healthy_members contains id)
//!
//! poll_until(clock, budget, probe)
//!   probe at t=0, then every interval; the last sleep is clamped to the
//!   deadline. Sleeps go through the injected Clock.
//! ```

pub mod poll;
pub mod reconciler;

pub use poll::{PollError, Polled, Probe, poll_until};
pub use reconciler::LoadBalancerReconciler;
