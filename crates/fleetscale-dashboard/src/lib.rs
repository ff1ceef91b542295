//! fleetscale-dashboard — reporting side of the control loop.
//!
//! # Architecture
//!
//! ```text
//! AlertPublisher      notifier.publish(topic, subject, body)
//! EventPublisher      log ScalingEvent, publish ScalingEvents / RunningNodes
//! DashboardPublisher  render_layout(healthy) ─▶ renderer.put_dashboard(name, body)
//! ```
//!
//! The dashboard is regenerated from the load balancer's confirmed healthy
//! set every tick and overwrites the previous definition. None of these
//! calls is allowed to abort a tick.

pub mod layout;
pub mod publisher;

pub use layout::{
    CUSTOM_NAMESPACE, DashboardSpec, LayoutParams, RUNNING_NODES_METRIC, SCALING_EVENTS_METRIC,
    Widget, WidgetProperties, render_layout,
};
pub use publisher::{
    AlertPublisher, DashboardPublisher, EventPublisher, ReportingFailure, SCALE_DOWN_SKIPPED,
    SCALE_DOWN_TRIGGERED, SCALE_UP_FAILED, SCALE_UP_TRIGGERED,
};
