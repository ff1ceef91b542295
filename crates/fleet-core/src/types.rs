//! Domain types shared by every fleetscale crate.
//!
//! These types describe what the collaborators report (nodes, statuses,
//! datapoints, target health) and what the control loop produces
//! (snapshots, scaling events). All of them serialize to JSON so the
//! local backend can persist them unchanged.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider-assigned identifier of a compute node.
pub type NodeId = String;

// ── Nodes ─────────────────────────────────────────────────────────

/// Provider-reported state of a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
            NodeState::ShuttingDown => "shutting-down",
            NodeState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A node as listed by the fleet provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub id: NodeId,
    pub state: NodeState,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Filter for `FleetProvider::list_nodes`. An empty filter matches all nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    pub states: Vec<NodeState>,
}

impl NodeFilter {
    pub fn states(states: &[NodeState]) -> Self {
        Self {
            states: states.to_vec(),
        }
    }

    pub fn matches(&self, state: NodeState) -> bool {
        self.states.is_empty() || self.states.contains(&state)
    }
}

/// A node inside a fleet snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub state: NodeState,
    /// Protected from scale-down.
    pub primary: bool,
    /// Last measured utilization in percent; 0 until measured.
    pub utilization: f64,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, state: NodeState, primary: bool) -> Self {
        Self {
            id: id.into(),
            state,
            primary,
            utilization: 0.0,
        }
    }
}

/// Inventory captured at the start of a tick. Never reused across ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    /// Running nodes in provider order.
    pub running: Vec<Node>,
    /// Stopped nodes in provider order; the reuse pool for scale-up.
    pub stopped: Vec<Node>,
    pub captured_at: DateTime<Utc>,
}

impl FleetSnapshot {
    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn running_ids(&self) -> Vec<NodeId> {
        self.running.iter().map(|n| n.id.clone()).collect()
    }

    pub fn primary_ids(&self) -> Vec<NodeId> {
        self.running
            .iter()
            .filter(|n| n.primary)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Running nodes that may be stopped, in provider order.
    pub fn scale_down_candidates(&self) -> Vec<&Node> {
        self.running.iter().filter(|n| !n.primary).collect()
    }

    /// Overwrite per-node utilization from measured values.
    pub fn apply_utilization(&mut self, samples: &[NodeUtilization]) {
        for node in &mut self.running {
            if let Some(sample) = samples.iter().find(|s| s.node_id == node.id) {
                node.utilization = sample.average;
            }
        }
    }
}

/// Boot and status-check report for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub system_ok: bool,
    pub instance_ok: bool,
}

impl StatusReport {
    /// Running with both status checks passing.
    pub fn is_ready(&self) -> bool {
        self.running && self.system_ok && self.instance_ok
    }
}

/// Parameters for creating a brand-new node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub image: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
    pub subnet: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// Opaque startup payload handed to the provider at creation time.
    pub bootstrap: Vec<u8>,
}

// ── Metrics ───────────────────────────────────────────────────────

/// Reference to a utilization metric in the metrics source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRef {
    pub namespace: String,
    pub name: String,
    /// Dimension that selects a node, e.g. `InstanceId`.
    pub dimension: String,
}

/// Closed time range `[start, end]` of a metrics query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// The window of length `span` ending at `end`. A span reaching past
    /// the representable range starts at the earliest representable time.
    pub fn trailing(end: DateTime<Utc>, span: std::time::Duration) -> Self {
        let start = chrono::Duration::from_std(span)
            .ok()
            .and_then(|span| end.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// One averaged sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A custom metric value published by the control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDatum {
    pub namespace: String,
    pub name: String,
    pub dimensions: Vec<(String, String)>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Average utilization of one node over the look-back window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUtilization {
    pub node_id: NodeId,
    pub average: f64,
    pub samples: usize,
    /// False when the source had no datapoints; `average` is then 0.
    pub measured: bool,
    pub latest_at: Option<DateTime<Utc>>,
}

// ── Load balancer ─────────────────────────────────────────────────

/// Load balancer verdict for one registered target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Initial,
    Healthy,
    Unhealthy,
    Unused,
    Draining,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHealth {
    pub id: NodeId,
    pub state: TargetState,
}

// ── Scaling events ────────────────────────────────────────────────

/// Direction of a scale action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
}

impl ScaleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleAction::ScaleUp => "ScaleUp",
            ScaleAction::ScaleDown => "ScaleDown",
        }
    }
}

impl fmt::Display for ScaleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Observability record of a completed scale action. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub action: ScaleAction,
    pub node_id: NodeId,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> FleetSnapshot {
        FleetSnapshot {
            running: vec![
                Node::new("i-a", NodeState::Running, true),
                Node::new("i-b", NodeState::Running, false),
                Node::new("i-c", NodeState::Running, false),
            ],
            stopped: vec![Node::new("i-d", NodeState::Stopped, false)],
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn candidates_exclude_primary() {
        let snap = snapshot();
        let ids: Vec<&str> = snap
            .scale_down_candidates()
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(ids, vec!["i-b", "i-c"]);
        assert_eq!(snap.primary_ids(), vec!["i-a".to_string()]);
    }

    #[test]
    fn apply_utilization_matches_by_id() {
        let mut snap = snapshot();
        snap.apply_utilization(&[NodeUtilization {
            node_id: "i-c".to_string(),
            average: 42.5,
            samples: 5,
            measured: true,
            latest_at: None,
        }]);
        assert_eq!(snap.running[2].utilization, 42.5);
        assert_eq!(snap.running[0].utilization, 0.0);
    }

    #[test]
    fn status_ready_requires_all_checks() {
        let mut status = StatusReport {
            running: true,
            system_ok: true,
            instance_ok: false,
        };
        assert!(!status.is_ready());
        status.instance_ok = true;
        assert!(status.is_ready());
    }

    #[test]
    fn node_state_serializes_kebab_case() {
        let json = serde_json::to_string(&NodeState::ShuttingDown).unwrap();
        assert_eq!(json, "\"shutting-down\"");
    }

    #[test]
    fn trailing_window_contains_endpoints() {
        let end = Utc::now();
        let window = TimeWindow::trailing(end, std::time::Duration::from_secs(300));
        assert!(window.contains(end));
        assert!(window.contains(end - chrono::Duration::seconds(300)));
        assert!(!window.contains(end - chrono::Duration::seconds(301)));
    }

    #[test]
    fn oversized_trailing_window_clamps_to_earliest_time() {
        let end = Utc::now();
        let window = TimeWindow::trailing(end, std::time::Duration::from_secs(9_000_000_000_000));
        assert_eq!(window.start, DateTime::<Utc>::MIN_UTC);
        assert!(window.contains(end));

        let window = TimeWindow::trailing(end, std::time::Duration::MAX);
        assert_eq!(window.start, DateTime::<Utc>::MIN_UTC);
    }
}
