//! Control loop tick — one full measure/decide/act/report cycle.
//!
//! ```text
//! Start ─▶ InventoryLoaded ─▶ MetricsComputed ─▶ DecisionMade ─▶ ActionApplied ─▶ DashboardUpdated ─▶ Done
//!               │
//!               └─ no running nodes ─▶ NoInstances
//! ```
//!
//! Inventory and metrics failures end the tick with an error. Everything
//! after the decision degrades to a warning in the [`TickReport`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use fleet_core::{
    Clock, Collaborators, FleetProvider, FleetSnapshot, Lease, NodeId, NodeUtilization,
    ProviderError, ScaleAction, ScalerSettings, ScalingEvent,
};
use fleetscale_autoscale::{ScalingDecision, decide, select_scale_down_candidate};
use fleetscale_dashboard::{
    AlertPublisher, DashboardPublisher, EventPublisher, LayoutParams, ReportingFailure,
    SCALE_DOWN_SKIPPED, SCALE_DOWN_TRIGGERED, SCALE_UP_FAILED, SCALE_UP_TRIGGERED,
};
use fleetscale_health::LoadBalancerReconciler;
use fleetscale_inventory::{FleetInventory, InventoryError};
use fleetscale_lifecycle::{LifecycleOrchestrator, LifecycleState, NodeOrigin};
use fleetscale_metrics::{MetricsCollector, MetricsError, fleet_average};

/// Stage of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStage {
    Start,
    InventoryLoaded,
    MetricsComputed,
    DecisionMade,
    ActionApplied,
    DashboardUpdated,
    Done,
    NoInstances,
}

/// Errors that end a tick before a decision can be trusted.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("tick lease held by {holder} expired at {expired_at}")]
    LeaseExpired {
        holder: String,
        expired_at: DateTime<Utc>,
    },

    #[error("inventory unavailable: {0}")]
    Inventory(#[from] InventoryError),

    #[error("metrics unavailable: {0}")]
    Metrics(#[from] MetricsError),
}

/// What the action stage did.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Decision was `NoAction`.
    None,
    ScaledUp {
        node_id: NodeId,
        origin: NodeOrigin,
    },
    /// Scale-up stopped short of service. After a health timeout the node
    /// is still registered.
    ScaleUpIncomplete {
        node_id: Option<NodeId>,
        state: LifecycleState,
        reason: String,
    },
    ScaledDown {
        node_id: NodeId,
    },
    /// Every running node is primary.
    ScaleDownSkipped,
    ScaleDownFailed {
        node_id: NodeId,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub stages: Vec<TickStage>,
    pub utilization: Vec<NodeUtilization>,
    pub fleet_average: Option<f64>,
    pub decision: Option<ScalingDecision>,
    pub action: ActionOutcome,
    /// Load-balancer-confirmed healthy set after the action.
    pub healthy: Vec<NodeId>,
    /// Running node count after the action.
    pub running_after: usize,
    pub warnings: Vec<String>,
}

impl TickReport {
    fn new() -> Self {
        Self {
            stages: vec![TickStage::Start],
            utilization: Vec::new(),
            fleet_average: None,
            decision: None,
            action: ActionOutcome::None,
            healthy: Vec::new(),
            running_after: 0,
            warnings: Vec::new(),
        }
    }

    pub fn final_stage(&self) -> TickStage {
        self.stages.last().copied().unwrap_or(TickStage::Start)
    }

    fn enter(&mut self, stage: TickStage) {
        debug!(?stage, "tick stage");
        self.stages.push(stage);
    }

    fn note(&mut self, result: Result<(), ReportingFailure>) {
        if let Err(e) = result {
            self.warnings.push(e.to_string());
        }
    }
}

/// How long the tick lease must last to cover a worst-case tick: two
/// bounded waits plus a minute of slack.
pub fn lease_ttl(settings: &ScalerSettings) -> Duration {
    settings
        .lifecycle
        .timeout
        .saturating_mul(2)
        .saturating_add(Duration::from_secs(60))
}

pub struct ControlLoop {
    settings: ScalerSettings,
    clock: Arc<dyn Clock>,
    fleet: Arc<dyn FleetProvider>,
    inventory: FleetInventory,
    metrics: MetricsCollector,
    reconciler: Arc<LoadBalancerReconciler>,
    lifecycle: LifecycleOrchestrator,
    alerts: AlertPublisher,
    events: EventPublisher,
    dashboard: DashboardPublisher,
}

impl ControlLoop {
    pub fn new(settings: ScalerSettings, c: &Collaborators) -> Self {
        let behavior = settings.behavior;
        let reconciler = Arc::new(LoadBalancerReconciler::new(
            c.load_balancer.clone(),
            c.clock.clone(),
            settings.target_group.clone(),
        ));
        Self {
            clock: c.clock.clone(),
            fleet: c.fleet.clone(),
            inventory: FleetInventory::new(
                c.fleet.clone(),
                c.clock.clone(),
                settings.primary_tag.clone(),
            ),
            metrics: MetricsCollector::new(
                c.metrics.clone(),
                c.clock.clone(),
                settings.metric.clone(),
                settings.window,
                settings.period,
            )
            .concurrent(behavior.concurrent_metrics),
            lifecycle: LifecycleOrchestrator::new(
                c.fleet.clone(),
                reconciler.clone(),
                c.clock.clone(),
                settings.launch.clone(),
                settings.service_port,
                settings.lifecycle,
            )
            .reuse_stopped(behavior.reuse_stopped),
            reconciler,
            alerts: AlertPublisher::new(c.notifier.clone(), settings.alert_topic.clone()),
            events: EventPublisher::new(c.metrics.clone(), c.clock.clone(), behavior.publish_metrics),
            dashboard: DashboardPublisher::new(
                c.dashboards.clone(),
                settings.dashboard_name.clone(),
                LayoutParams::from_settings(&settings),
            ),
            settings,
        }
    }

    pub fn settings(&self) -> &ScalerSettings {
        &self.settings
    }

    /// Run one tick. The caller must hold `lease` for its whole duration.
    pub async fn tick(&self, lease: &Lease) -> Result<TickReport, TickError> {
        let now = self.clock.now();
        if !lease.is_valid_at(now) {
            return Err(TickError::LeaseExpired {
                holder: lease.holder().to_string(),
                expired_at: lease.expires_at(),
            });
        }

        let mut report = TickReport::new();
        info!(holder = %lease.holder(), "tick started");

        let mut snapshot = self.inventory.snapshot().await.inspect_err(|e| {
            error!(error = %e, "inventory failed, aborting tick");
        })?;
        report.enter(TickStage::InventoryLoaded);

        if snapshot.is_empty() {
            warn!("no running instances, nothing to scale");
            report.enter(TickStage::NoInstances);
            return Ok(report);
        }

        let utilization = self
            .metrics
            .collect(&snapshot.running_ids())
            .await
            .inspect_err(|e| error!(error = %e, "metrics failed, aborting tick"))?;
        snapshot.apply_utilization(&utilization);
        let Some(average) = fleet_average(&utilization) else {
            report.enter(TickStage::NoInstances);
            return Ok(report);
        };
        info!(
            average,
            nodes = utilization.len(),
            metric = %self.settings.metric.name,
            "fleet utilization"
        );
        report.utilization = utilization;
        report.fleet_average = Some(average);
        report.enter(TickStage::MetricsComputed);

        let decision = decide(average, &self.settings.thresholds);
        info!(average, %decision, "decision made");
        report.decision = Some(decision);
        report.enter(TickStage::DecisionMade);

        let mut running_after = snapshot.running.len();
        report.action = match decision {
            ScalingDecision::ScaleUp => {
                let outcome = self.scale_up(&snapshot, average, &mut report).await;
                if matches!(outcome, ActionOutcome::ScaledUp { .. }) {
                    running_after += 1;
                }
                outcome
            }
            ScalingDecision::ScaleDown => {
                let outcome = self.scale_down(&snapshot, average, &mut report).await;
                if matches!(outcome, ActionOutcome::ScaledDown { .. }) {
                    running_after -= 1;
                }
                outcome
            }
            ScalingDecision::NoAction => {
                info!(
                    average,
                    low = self.settings.thresholds.low(),
                    high = self.settings.thresholds.high(),
                    "utilization within range, no scaling"
                );
                ActionOutcome::None
            }
        };
        report.running_after = running_after;
        report.enter(TickStage::ActionApplied);

        self.report_fleet(&mut report).await;
        report.enter(TickStage::DashboardUpdated);

        report.enter(TickStage::Done);
        info!(
            decision = %decision,
            action = ?report.action,
            warnings = report.warnings.len(),
            "tick complete"
        );
        Ok(report)
    }

    async fn scale_up(
        &self,
        snapshot: &FleetSnapshot,
        average: f64,
        report: &mut TickReport,
    ) -> ActionOutcome {
        let label = self.settings.metric_kind.label();
        let message = format!(
            "Average {label} utilization {average:.2}% exceeds {}%; bringing one node into service.",
            self.settings.thresholds.high()
        );
        report.note(self.alerts.alert(SCALE_UP_TRIGGERED, &message).await);

        let run = self.lifecycle.bring_into_service(snapshot).await;
        if let (Some(event), Some(id)) = (run.event(), run.node_id()) {
            report.note(self.events.record(event).await);
            return ActionOutcome::ScaledUp {
                node_id: id.to_string(),
                origin: run.origin(),
            };
        }

        let reason = run
            .failure()
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("lifecycle ended in {}", run.state()));
        let node = run.node_id().unwrap_or("<not launched>");
        let message = format!("Scale-up of {node} stopped in state {}: {reason}", run.state());
        report.note(self.alerts.alert(SCALE_UP_FAILED, &message).await);

        ActionOutcome::ScaleUpIncomplete {
            node_id: run.node_id().map(str::to_string),
            state: run.state(),
            reason,
        }
    }

    async fn scale_down(
        &self,
        snapshot: &FleetSnapshot,
        average: f64,
        report: &mut TickReport,
    ) -> ActionOutcome {
        let label = self.settings.metric_kind.label();
        let Some(node) = select_scale_down_candidate(snapshot, self.settings.scale_down_policy)
        else {
            warn!(average, "every running node is primary, skipping scale-down");
            let message = format!(
                "Average {label} utilization {average:.2}% is below {}%, \
                 but all running instances are primary.",
                self.settings.thresholds.low()
            );
            report.note(self.alerts.alert(SCALE_DOWN_SKIPPED, &message).await);
            return ActionOutcome::ScaleDownSkipped;
        };
        let id = node.id.clone();

        if let Err(e) = self.reconciler.deregister(&id, self.settings.service_port).await {
            error!(node = %id, error = %e, "deregistration failed, node left running");
            return ActionOutcome::ScaleDownFailed {
                node_id: id,
                reason: format!("deregister: {e}"),
            };
        }
        if let Err(e) = self.fleet.stop(&id).await {
            let e = ProviderError::new("stop", e);
            error!(node = %id, error = %e, "stop failed after deregistration");
            return ActionOutcome::ScaleDownFailed {
                node_id: id,
                reason: e.to_string(),
            };
        }
        info!(node = %id, utilization = node.utilization, average, "node stopped");

        let event = ScalingEvent {
            action: ScaleAction::ScaleDown,
            node_id: id.clone(),
            timestamp: self.clock.now(),
        };
        report.note(self.events.record(&event).await);

        let message = format!(
            "Stopped {id}; average {label} utilization {average:.2}% is below {}%.",
            self.settings.thresholds.low()
        );
        report.note(self.alerts.alert(SCALE_DOWN_TRIGGERED, &message).await);

        ActionOutcome::ScaledDown { node_id: id }
    }

    /// Capture the confirmed healthy set and regenerate the dashboard.
    async fn report_fleet(&self, report: &mut TickReport) {
        match self.reconciler.healthy_members().await {
            Ok(healthy) => report.healthy = healthy,
            Err(e) => {
                warn!(error = %e, "healthy set unavailable, dashboard not updated");
                report.warnings.push(format!("healthy set unavailable: {e}"));
                return;
            }
        }

        if self.settings.behavior.render_dashboard {
            let result = self.dashboard.render(&report.healthy).await.map(|_| ());
            report.note(result);
        }
        let result = self.events.running_count(report.running_after).await;
        report.note(result);
    }
}
