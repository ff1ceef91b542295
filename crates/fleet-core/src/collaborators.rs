//! Contracts the control loop requires from external systems.
//!
//! Each collaborator is a trait object injected at process start; nothing
//! in the core holds a global client handle. Implementations must make
//! registration and deregistration idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::CallResult;
use crate::types::*;

/// Lists, boots and stops compute nodes.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    async fn list_nodes(&self, filter: &NodeFilter) -> CallResult<Vec<NodeDescription>>;

    async fn start(&self, id: &str) -> CallResult<()>;

    async fn stop(&self, id: &str) -> CallResult<()>;

    /// Create a new node and return its id.
    async fn launch(&self, spec: &LaunchSpec) -> CallResult<NodeId>;

    async fn describe_status(&self, id: &str) -> CallResult<StatusReport>;
}

/// Time-series utilization and custom metric publication.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Per-`period` averages of `metric` for `node` inside `window`.
    async fn query_average(
        &self,
        node: &str,
        metric: &MetricRef,
        window: &TimeWindow,
        period: Duration,
    ) -> CallResult<Vec<Datapoint>>;

    async fn publish(&self, datum: &MetricDatum) -> CallResult<()>;
}

/// Target-group membership and per-target health.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    async fn register_target(&self, group: &str, id: &str, port: u16) -> CallResult<()>;

    async fn deregister_target(&self, group: &str, id: &str, port: u16) -> CallResult<()>;

    async fn describe_health(&self, group: &str) -> CallResult<Vec<TargetHealth>>;
}

/// Fire-and-forget alert delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, subject: &str, body: &str) -> CallResult<()>;
}

/// Persists a declarative dashboard definition, replacing any previous one.
#[async_trait]
pub trait DashboardRenderer: Send + Sync {
    async fn put_dashboard(&self, name: &str, body: &serde_json::Value) -> CallResult<()>;
}

/// All collaborator handles, built once and shared by every component.
#[derive(Clone)]
pub struct Collaborators {
    pub fleet: Arc<dyn FleetProvider>,
    pub metrics: Arc<dyn MetricsSource>,
    pub load_balancer: Arc<dyn LoadBalancer>,
    pub notifier: Arc<dyn Notifier>,
    pub dashboards: Arc<dyn DashboardRenderer>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Use one backend for every collaborator role.
    pub fn from_backend<B>(backend: Arc<B>, clock: Arc<dyn Clock>) -> Self
    where
        B: FleetProvider + MetricsSource + LoadBalancer + Notifier + DashboardRenderer + 'static,
    {
        Self {
            fleet: backend.clone(),
            metrics: backend.clone(),
            load_balancer: backend.clone(),
            notifier: backend.clone(),
            dashboards: backend,
            clock,
        }
    }
}
