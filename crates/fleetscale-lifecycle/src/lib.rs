//! fleetscale-lifecycle — bring one node into service per scale-up.
//!
//! A stopped node is reused when one exists; otherwise a new node is
//! launched with the configured bootstrap payload. The node is started,
//! boot-verified against the provider's status checks, registered with the
//! load balancer, and health-verified. Both waits are bounded by the same
//! poll budget (default 15s interval, 300s timeout).
//!
//! A boot failure ends the run as `Failed` before registration. A health
//! timeout also ends it as `Failed`, but the node stays started and
//! registered: nothing is rolled back.

pub mod orchestrator;

pub use orchestrator::{
    LifecycleFailure, LifecycleOrchestrator, LifecycleState, NodeOrigin, Provisioning, WaitPhase,
};
