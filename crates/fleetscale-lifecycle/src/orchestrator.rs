//! Lifecycle orchestrator — drives one node into service.
//!
//! ```text
//! Stopped ─start/launch─▶ Starting ─status OK─▶ BootVerified ─register─▶ Registered
//!                                                                          │
//!            InService ◀─ HealthVerified ◀────────── healthy ──────────────┘
//!
//! start/launch error, boot timeout, registration error  ─▶ Failed
//! health timeout                    ─▶ Failed (target stays registered)
//! ```
//!
//! Each [`LifecycleOrchestrator::step`] performs exactly one transition.
//! Waits go through the injected clock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use fleet_core::{
    CallError, Clock, FleetProvider, FleetSnapshot, LaunchSpec, NodeId, PollBudget,
    ProviderError, ScaleAction, ScalingEvent,
};
use fleetscale_health::{LoadBalancerReconciler, PollError, Probe, poll_until};

/// Where a node undergoing scale-up is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Stopped,
    Starting,
    BootVerified,
    Registered,
    HealthVerified,
    InService,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Whether the node came from the stopped pool or was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeOrigin {
    Reused,
    Launched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitPhase {
    Boot,
    Health,
}

impl fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WaitPhase::Boot => "boot",
            WaitPhase::Health => "health",
        })
    }
}

/// Why a lifecycle stopped short of `InService`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("load balancer registration failed: {0}")]
    Registration(CallError),

    #[error("{phase} wait timed out after {waited:?}")]
    Timeout { phase: WaitPhase, waited: Duration },
}

/// One node's run through the lifecycle.
#[derive(Debug, Clone)]
pub struct Provisioning {
    node_id: Option<NodeId>,
    origin: NodeOrigin,
    state: LifecycleState,
    history: Vec<LifecycleState>,
    failure: Option<LifecycleFailure>,
    event: Option<ScalingEvent>,
}

impl Provisioning {
    fn new(origin: NodeOrigin, node_id: Option<NodeId>) -> Self {
        Self {
            node_id,
            origin,
            state: LifecycleState::Stopped,
            history: vec![LifecycleState::Stopped],
            failure: None,
            event: None,
        }
    }

    /// `None` only for a launch that never returned an id.
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn origin(&self) -> NodeOrigin {
        self.origin
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Every state entered, starting with `Stopped`.
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn failure(&self) -> Option<&LifecycleFailure> {
        self.failure.as_ref()
    }

    /// The `ScaleUp` event, present once the node is in service.
    pub fn event(&self) -> Option<&ScalingEvent> {
        self.event.as_ref()
    }

    pub fn is_in_service(&self) -> bool {
        self.state == LifecycleState::InService
    }

    /// No further transitions: in service or failed.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, LifecycleState::InService | LifecycleState::Failed)
    }

    fn enter(&mut self, state: LifecycleState) {
        self.state = state;
        self.history.push(state);
    }

    fn fail(&mut self, failure: LifecycleFailure) {
        error!(node = ?self.node_id, from = %self.state, error = %failure, "lifecycle failed");
        self.failure = Some(failure);
        self.enter(LifecycleState::Failed);
    }

    /// Fail without the error-level log; the caller has already warned.
    fn fail_quietly(&mut self, failure: LifecycleFailure) {
        self.failure = Some(failure);
        self.enter(LifecycleState::Failed);
    }
}

pub struct LifecycleOrchestrator {
    fleet: Arc<dyn FleetProvider>,
    reconciler: Arc<LoadBalancerReconciler>,
    clock: Arc<dyn Clock>,
    launch: LaunchSpec,
    service_port: u16,
    budget: PollBudget,
    reuse_stopped: bool,
}

impl LifecycleOrchestrator {
    pub fn new(
        fleet: Arc<dyn FleetProvider>,
        reconciler: Arc<LoadBalancerReconciler>,
        clock: Arc<dyn Clock>,
        launch: LaunchSpec,
        service_port: u16,
        budget: PollBudget,
    ) -> Self {
        Self {
            fleet,
            reconciler,
            clock,
            launch,
            service_port,
            budget,
            reuse_stopped: true,
        }
    }

    /// When off, every scale-up launches a new node.
    pub fn reuse_stopped(mut self, reuse: bool) -> Self {
        self.reuse_stopped = reuse;
        self
    }

    /// Choose the node to bring up: the first stopped node in snapshot
    /// order, or a launch when none exists (or reuse is off).
    pub fn plan(&self, snapshot: &FleetSnapshot) -> Provisioning {
        match snapshot.stopped.first().filter(|_| self.reuse_stopped) {
            Some(node) => {
                info!(node = %node.id, "reusing stopped node");
                Provisioning::new(NodeOrigin::Reused, Some(node.id.clone()))
            }
            None => {
                info!(
                    image = %self.launch.image,
                    instance_type = %self.launch.instance_type,
                    "no stopped node to reuse, launching"
                );
                Provisioning::new(NodeOrigin::Launched, None)
            }
        }
    }

    /// Plan and step until the run is finished.
    pub async fn bring_into_service(&self, snapshot: &FleetSnapshot) -> Provisioning {
        let mut run = self.plan(snapshot);
        while !run.is_finished() {
            self.step(&mut run).await;
        }
        run
    }

    /// Perform one transition. No-op on a finished run.
    pub async fn step(&self, run: &mut Provisioning) {
        if run.is_finished() {
            return;
        }
        match run.state {
            LifecycleState::Stopped => self.issue_start(run).await,
            LifecycleState::Starting => self.verify_boot(run).await,
            LifecycleState::BootVerified => self.register(run).await,
            LifecycleState::Registered => self.verify_health(run).await,
            LifecycleState::HealthVerified => {
                let id = run.node_id.clone().unwrap_or_default();
                run.event = Some(ScalingEvent {
                    action: ScaleAction::ScaleUp,
                    node_id: id.clone(),
                    timestamp: self.clock.now(),
                });
                run.enter(LifecycleState::InService);
                info!(node = %id, "node in service");
            }
            LifecycleState::InService | LifecycleState::Failed => {}
        }
    }

    async fn issue_start(&self, run: &mut Provisioning) {
        let result = match (run.origin, run.node_id.clone()) {
            (NodeOrigin::Reused, Some(id)) => self
                .fleet
                .start(&id)
                .await
                .map(|()| id)
                .map_err(|e| ProviderError::new("start", e)),
            _ => self
                .fleet
                .launch(&self.launch)
                .await
                .map_err(|e| ProviderError::new("launch", e)),
        };

        match result {
            Ok(id) => {
                info!(node = %id, origin = ?run.origin, "node starting");
                run.node_id = Some(id);
                run.enter(LifecycleState::Starting);
            }
            Err(e) => run.fail(e.into()),
        }
    }

    async fn verify_boot(&self, run: &mut Provisioning) {
        let id = run.node_id.clone().unwrap_or_default();
        let fleet = &self.fleet;
        let result = poll_until(self.clock.as_ref(), self.budget, || {
            let id = id.clone();
            async move {
                let status = fleet.describe_status(&id).await?;
                Ok::<_, CallError>(if status.is_ready() {
                    Probe::Ready(())
                } else {
                    Probe::Pending
                })
            }
        })
        .await;

        match result {
            Ok(polled) => {
                info!(node = %id, attempts = polled.attempts, waited = ?polled.waited, "boot verified");
                run.enter(LifecycleState::BootVerified);
            }
            Err(PollError::TimedOut { waited, .. }) => run.fail(LifecycleFailure::Timeout {
                phase: WaitPhase::Boot,
                waited,
            }),
            Err(PollError::Probe(e)) => run.fail(ProviderError::new("describe_status", e).into()),
        }
    }

    async fn register(&self, run: &mut Provisioning) {
        let id = run.node_id.clone().unwrap_or_default();
        match self.reconciler.register(&id, self.service_port).await {
            Ok(()) => run.enter(LifecycleState::Registered),
            Err(e) => run.fail(LifecycleFailure::Registration(e)),
        }
    }

    async fn verify_health(&self, run: &mut Provisioning) {
        let id = run.node_id.clone().unwrap_or_default();
        let started = self.clock.now();
        if self.reconciler.wait_healthy(&id, self.budget).await {
            run.enter(LifecycleState::HealthVerified);
        } else {
            let waited = (self.clock.now() - started).to_std().unwrap_or_default();
            // Target membership is left in place; only the lifecycle ends.
            warn!(
                node = %id,
                ?waited,
                "node registered but not healthy; leaving it registered"
            );
            run.fail_quietly(LifecycleFailure::Timeout {
                phase: WaitPhase::Health,
                waited,
            });
        }
    }
}
