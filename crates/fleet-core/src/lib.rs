//! fleet-core — shared vocabulary of the fleetscale control loop.
//!
//! Holds the settings parser, domain types, error types, the collaborator
//! traits every component is built against, the injectable [`Clock`], and
//! the tick [`Lease`].

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod lease;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    Collaborators, DashboardRenderer, FleetProvider, LoadBalancer, MetricsSource, Notifier,
};
pub use config::{
    BehaviorFlags, BehaviorProfile, FleetConfig, PollBudget, PrimaryTag, ScaleDownPolicy,
    ScalerSettings, Thresholds, UtilizationMetric,
};
pub use error::{CallError, CallResult, ConfigError, ProviderError};
pub use lease::{Lease, LeaseProvider};
pub use types::*;
