//! Records persisted by the local backend.
//!
//! All records are JSON-serialized into redb `&[u8]` value columns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_core::{MetricRef, NodeId, NodeState, StatusReport, TargetState};

// ── Nodes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub state: NodeState,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub status: StatusReport,
    /// Status checks left before a pending node reports running and OK.
    pub boot_checks_remaining: u32,
    pub launch: Option<LaunchRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a launched node was created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub image: String,
    pub instance_type: String,
    pub bootstrap_bytes: usize,
}

impl NodeRecord {
    /// A node that already exists in the given state, with matching status.
    pub fn existing(id: &str, state: NodeState, at: DateTime<Utc>) -> Self {
        let running = state == NodeState::Running;
        Self {
            id: id.to_string(),
            state,
            tags: BTreeMap::new(),
            status: StatusReport {
                running,
                system_ok: running,
                instance_ok: running,
            },
            boot_checks_remaining: 0,
            launch: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    /// Enter the boot sequence; with no checks left the node is ready at once.
    pub fn begin_boot(&mut self, checks: u32, at: DateTime<Utc>) {
        self.boot_checks_remaining = checks;
        self.updated_at = at;
        if checks == 0 {
            self.mark_ready();
        } else {
            self.state = NodeState::Pending;
            self.status = StatusReport::default();
        }
    }

    pub fn mark_ready(&mut self) {
        self.state = NodeState::Running;
        self.status = StatusReport {
            running: true,
            system_ok: true,
            instance_ok: true,
        };
        self.boot_checks_remaining = 0;
    }

    pub fn mark_stopped(&mut self, at: DateTime<Utc>) {
        self.state = NodeState::Stopped;
        self.status = StatusReport::default();
        self.boot_checks_remaining = 0;
        self.updated_at = at;
    }

    /// Consume one status check and report the resulting status.
    pub fn check_status(&mut self) -> StatusReport {
        if self.state == NodeState::Pending {
            if self.boot_checks_remaining > 0 {
                self.boot_checks_remaining -= 1;
            } else {
                self.mark_ready();
            }
        }
        self.status
    }
}

// ── Targets ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub group: String,
    pub id: NodeId,
    pub port: u16,
    pub state: TargetState,
    /// Health checks left before the target reports healthy.
    pub health_checks_remaining: u32,
    pub registered_at: DateTime<Utc>,
}

impl TargetRecord {
    pub fn table_key(&self) -> String {
        target_key(&self.group, &self.id)
    }
}

pub fn target_key(group: &str, id: &str) -> String {
    format!("{group}|{id}")
}

// ── Metrics ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatapointRecord {
    pub node_id: NodeId,
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl DatapointRecord {
    pub fn new(node_id: &str, metric: &MetricRef, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            node_id: node_id.to_string(),
            metric: metric_key(metric),
            timestamp,
            value,
        }
    }

    pub fn table_key(&self) -> String {
        format!(
            "{}|{}|{:020}",
            self.node_id,
            self.metric,
            self.timestamp.timestamp_millis().max(0)
        )
    }
}

pub fn metric_key(metric: &MetricRef) -> String {
    format!("{}/{}", metric.namespace, metric.name)
}

// ── Alerts, dashboards, leases ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub topic: String,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardRecord {
    pub name: String,
    pub body: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_node_becomes_ready_after_checks() {
        let now = Utc::now();
        let mut node = NodeRecord::existing("i-1", NodeState::Stopped, now);
        node.begin_boot(2, now);
        assert_eq!(node.state, NodeState::Pending);

        assert!(!node.check_status().is_ready());
        assert!(!node.check_status().is_ready());
        assert!(node.check_status().is_ready());
        assert_eq!(node.state, NodeState::Running);
    }

    #[test]
    fn zero_boot_checks_is_ready_immediately() {
        let now = Utc::now();
        let mut node = NodeRecord::existing("i-1", NodeState::Stopped, now);
        node.begin_boot(0, now);
        assert_eq!(node.state, NodeState::Running);
        assert!(node.status.is_ready());
    }

    #[test]
    fn datapoint_keys_sort_by_time() {
        let metric = MetricRef {
            namespace: "AWS/EC2".to_string(),
            name: "CPUUtilization".to_string(),
            dimension: "InstanceId".to_string(),
        };
        let t = Utc::now();
        let a = DatapointRecord::new("i-1", &metric, t, 1.0);
        let b = DatapointRecord::new("i-1", &metric, t + chrono::Duration::seconds(60), 2.0);
        assert!(a.table_key() < b.table_key());
        assert!(a.table_key().starts_with("i-1|AWS/EC2/CPUUtilization|"));
    }
}
