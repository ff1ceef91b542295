//! Best-effort reporters: alerts, scaling-event metrics, dashboard.
//!
//! Every call here is fire-and-forget from the control loop's point of
//! view. Failures come back as [`ReportingFailure`] so the caller can log
//! them, but nothing is retried.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use fleet_core::{
    CallError, Clock, DashboardRenderer, MetricDatum, MetricsSource, NodeId, Notifier,
    ScalingEvent,
};

use crate::layout::{
    CUSTOM_NAMESPACE, DashboardSpec, LayoutParams, RUNNING_NODES_METRIC, SCALING_EVENTS_METRIC,
    render_layout,
};

pub const SCALE_UP_TRIGGERED: &str = "SCALE UP Triggered";
pub const SCALE_UP_FAILED: &str = "SCALE UP Failed";
pub const SCALE_DOWN_TRIGGERED: &str = "SCALE DOWN Triggered";
pub const SCALE_DOWN_SKIPPED: &str = "SCALE DOWN Skipped";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportingFailure {
    #[error("alert {subject:?} not delivered: {source}")]
    Alert {
        subject: String,
        #[source]
        source: CallError,
    },

    #[error("metric {name} not published: {source}")]
    Metric {
        name: String,
        #[source]
        source: CallError,
    },

    #[error("dashboard {name} not updated: {source}")]
    Dashboard {
        name: String,
        #[source]
        source: CallError,
    },

    #[error("dashboard {name} could not be encoded: {reason}")]
    Encode { name: String, reason: String },
}

// ── Alerts ──────────────────────────────────────────────────────

pub struct AlertPublisher {
    notifier: Arc<dyn Notifier>,
    topic: String,
}

impl AlertPublisher {
    pub fn new(notifier: Arc<dyn Notifier>, topic: impl Into<String>) -> Self {
        Self {
            notifier,
            topic: topic.into(),
        }
    }

    pub async fn alert(&self, subject: &str, message: &str) -> Result<(), ReportingFailure> {
        match self.notifier.publish(&self.topic, subject, message).await {
            Ok(()) => {
                info!(topic = %self.topic, %subject, "alert sent");
                Ok(())
            }
            Err(source) => {
                warn!(topic = %self.topic, %subject, error = %source, "alert delivery failed");
                Err(ReportingFailure::Alert {
                    subject: subject.to_string(),
                    source,
                })
            }
        }
    }
}

// ── Scaling events ──────────────────────────────────────────────

/// Logs scaling events and, when enabled, publishes them as custom
/// metrics for the dashboard's events and running-count panels.
pub struct EventPublisher {
    metrics: Arc<dyn MetricsSource>,
    clock: Arc<dyn Clock>,
    publish: bool,
}

impl EventPublisher {
    pub fn new(metrics: Arc<dyn MetricsSource>, clock: Arc<dyn Clock>, publish: bool) -> Self {
        Self {
            metrics,
            clock,
            publish,
        }
    }

    pub async fn record(&self, event: &ScalingEvent) -> Result<(), ReportingFailure> {
        info!(
            action = %event.action,
            node = %event.node_id,
            at = %event.timestamp,
            "scaling event"
        );
        if !self.publish {
            return Ok(());
        }
        self.put(MetricDatum {
            namespace: CUSTOM_NAMESPACE.to_string(),
            name: SCALING_EVENTS_METRIC.to_string(),
            dimensions: vec![("Action".to_string(), event.action.as_str().to_string())],
            value: 1.0,
            timestamp: event.timestamp,
        })
        .await
    }

    pub async fn running_count(&self, count: usize) -> Result<(), ReportingFailure> {
        if !self.publish {
            return Ok(());
        }
        self.put(MetricDatum {
            namespace: CUSTOM_NAMESPACE.to_string(),
            name: RUNNING_NODES_METRIC.to_string(),
            dimensions: vec![],
            value: count as f64,
            timestamp: self.clock.now(),
        })
        .await
    }

    async fn put(&self, datum: MetricDatum) -> Result<(), ReportingFailure> {
        self.metrics.publish(&datum).await.map_err(|source| {
            warn!(metric = %datum.name, error = %source, "custom metric not published");
            ReportingFailure::Metric {
                name: datum.name.clone(),
                source,
            }
        })?;
        debug!(metric = %datum.name, value = datum.value, "custom metric published");
        Ok(())
    }
}

// ── Dashboard ───────────────────────────────────────────────────

pub struct DashboardPublisher {
    renderer: Arc<dyn DashboardRenderer>,
    name: String,
    params: LayoutParams,
}

impl DashboardPublisher {
    pub fn new(
        renderer: Arc<dyn DashboardRenderer>,
        name: impl Into<String>,
        params: LayoutParams,
    ) -> Self {
        Self {
            renderer,
            name: name.into(),
            params,
        }
    }

    /// Rebuild the layout for `healthy` and replace the stored definition.
    pub async fn render(&self, healthy: &[NodeId]) -> Result<DashboardSpec, ReportingFailure> {
        let spec = render_layout(healthy, &self.params);
        let body = serde_json::to_value(&spec).map_err(|e| ReportingFailure::Encode {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;

        if let Err(source) = self.renderer.put_dashboard(&self.name, &body).await {
            warn!(dashboard = %self.name, error = %source, "dashboard update failed");
            return Err(ReportingFailure::Dashboard {
                name: self.name.clone(),
                source,
            });
        }
        info!(
            dashboard = %self.name,
            nodes = healthy.len(),
            widgets = spec.widgets.len(),
            "dashboard updated"
        );
        Ok(spec)
    }
}
