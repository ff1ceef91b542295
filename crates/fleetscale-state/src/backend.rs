//! Local backend serving every collaborator contract from the state store.
//!
//! Used by `fleetscaled` for local runs and by tests as a fixture fleet.
//! Boot and health-check latency are simulated by a number of status
//! checks ([`LocalBehavior`]) rather than by wall-clock delays, so a
//! polling caller sees the same pending → ready progression a real
//! provider would report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use fleet_core::{
    CallError, CallResult, Clock, DashboardRenderer, Datapoint, FleetProvider, LaunchSpec, Lease,
    LeaseProvider, LoadBalancer, MetricDatum, MetricRef, MetricsSource, NodeDescription,
    NodeFilter, NodeId, NodeState, Notifier, StatusReport, TargetHealth, TargetState, TimeWindow,
};

use crate::store::StateStore;
use crate::types::*;

const TICK_LEASE: &str = "tick";

/// Simulated provisioning latency, in status checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalBehavior {
    /// Not-ready status reports before a started or launched node is ready.
    pub boot_checks: u32,
    /// `initial` health reports before a registered target turns healthy.
    pub health_checks: u32,
}

#[derive(Clone)]
pub struct LocalBackend {
    store: StateStore,
    behavior: LocalBehavior,
    clock: Arc<dyn Clock>,
}

impl LocalBackend {
    pub fn new(store: StateStore, behavior: LocalBehavior, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            behavior,
            clock,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Add (or replace) a node in the given state.
    pub fn add_node(&self, id: &str, state: NodeState, tags: &[(&str, &str)]) -> CallResult<()> {
        let mut node = NodeRecord::existing(id, state, self.clock.now());
        for (k, v) in tags {
            node = node.with_tag(k, v);
        }
        self.store.put_node(&node)?;
        Ok(())
    }

    /// Record one utilization sample.
    pub fn record_sample(
        &self,
        node: &str,
        metric: &MetricRef,
        at: DateTime<Utc>,
        value: f64,
    ) -> CallResult<()> {
        self.store
            .put_datapoint(&DatapointRecord::new(node, metric, at, value))?;
        Ok(())
    }

    fn new_node_id() -> NodeId {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("i-{}", &hex[..17])
    }
}

#[async_trait]
impl FleetProvider for LocalBackend {
    async fn list_nodes(&self, filter: &NodeFilter) -> CallResult<Vec<NodeDescription>> {
        let nodes = self.store.list_nodes()?;
        Ok(nodes
            .into_iter()
            .filter(|n| filter.matches(n.state))
            .map(|n| NodeDescription {
                id: n.id,
                state: n.state,
                tags: n.tags,
            })
            .collect())
    }

    async fn start(&self, id: &str) -> CallResult<()> {
        let now = self.clock.now();
        let checks = self.behavior.boot_checks;
        let current = self
            .store
            .get_node(id)?
            .ok_or_else(|| CallError::NotFound(format!("node {id}")))?;
        match current.state {
            NodeState::Running | NodeState::Pending => return Ok(()),
            NodeState::Stopped => {}
            other => {
                return Err(CallError::Rejected(format!("node {id} cannot start from {other}")));
            }
        }
        self.store.update_node(id, |n| n.begin_boot(checks, now))?;
        info!(node = %id, boot_checks = checks, "node starting");
        Ok(())
    }

    async fn stop(&self, id: &str) -> CallResult<()> {
        let now = self.clock.now();
        self.store.update_node(id, |n| {
            if n.state != NodeState::Stopped {
                n.mark_stopped(now);
            }
        })?;
        info!(node = %id, "node stopped");
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> CallResult<NodeId> {
        if spec.image.is_empty() {
            return Err(CallError::Rejected("launch spec has no image".to_string()));
        }
        let now = self.clock.now();
        let id = Self::new_node_id();
        let mut node = NodeRecord::existing(&id, NodeState::Stopped, now);
        node.tags = spec.tags.clone();
        node.launch = Some(LaunchRecord {
            image: spec.image.clone(),
            instance_type: spec.instance_type.clone(),
            bootstrap_bytes: spec.bootstrap.len(),
        });
        node.begin_boot(self.behavior.boot_checks, now);
        self.store.put_node(&node)?;
        info!(node = %id, image = %spec.image, bootstrap_bytes = spec.bootstrap.len(), "node launched");
        Ok(id)
    }

    async fn describe_status(&self, id: &str) -> CallResult<StatusReport> {
        let mut status = StatusReport::default();
        self.store.update_node(id, |n| status = n.check_status())?;
        debug!(node = %id, ?status, "status checked");
        Ok(status)
    }
}

#[async_trait]
impl MetricsSource for LocalBackend {
    async fn query_average(
        &self,
        node: &str,
        metric: &MetricRef,
        window: &TimeWindow,
        period: Duration,
    ) -> CallResult<Vec<Datapoint>> {
        let period_ms = period.as_millis().max(1) as i64;
        let points = self.store.list_datapoints(node, &metric_key(metric))?;

        // Average raw samples per period bucket, like a provider's "Average" statistic.
        let mut buckets: BTreeMap<i64, (f64, u32)> = BTreeMap::new();
        for p in points.iter().filter(|p| window.contains(p.timestamp)) {
            let offset = (p.timestamp - window.start).num_milliseconds();
            let entry = buckets.entry(offset / period_ms).or_insert((0.0, 0));
            entry.0 += p.value;
            entry.1 += 1;
        }

        Ok(buckets
            .into_iter()
            .map(|(bucket, (sum, count))| Datapoint {
                timestamp: window.start + chrono::Duration::milliseconds(bucket * period_ms),
                value: sum / count as f64,
            })
            .collect())
    }

    async fn publish(&self, datum: &MetricDatum) -> CallResult<()> {
        self.store.put_published(datum)?;
        Ok(())
    }
}

#[async_trait]
impl LoadBalancer for LocalBackend {
    async fn register_target(&self, group: &str, id: &str, port: u16) -> CallResult<()> {
        let stored = self.store.register_target(TargetRecord {
            group: group.to_string(),
            id: id.to_string(),
            port,
            state: TargetState::Initial,
            health_checks_remaining: self.behavior.health_checks,
            registered_at: self.clock.now(),
        })?;
        debug!(%group, node = %id, port, state = ?stored.state, "target registered");
        Ok(())
    }

    async fn deregister_target(&self, group: &str, id: &str, port: u16) -> CallResult<()> {
        let existed = self.store.deregister_target(group, id)?;
        debug!(%group, node = %id, port, existed, "target deregistered");
        Ok(())
    }

    async fn describe_health(&self, group: &str) -> CallResult<Vec<TargetHealth>> {
        let mut report = Vec::new();
        for target in self.store.list_targets(group)? {
            let node_running = self
                .store
                .get_node(&target.id)?
                .is_some_and(|n| n.state == NodeState::Running);

            let updated = self.store.update_target(group, &target.id, |t| {
                if !node_running {
                    t.state = TargetState::Unhealthy;
                } else if t.health_checks_remaining > 0 {
                    t.health_checks_remaining -= 1;
                    t.state = TargetState::Initial;
                } else {
                    t.state = TargetState::Healthy;
                }
            })?;

            if let Some(t) = updated {
                report.push(TargetHealth {
                    id: t.id,
                    state: t.state,
                });
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl Notifier for LocalBackend {
    async fn publish(&self, topic: &str, subject: &str, body: &str) -> CallResult<()> {
        self.store.put_alert(&AlertRecord {
            topic: topic.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            sent_at: self.clock.now(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl DashboardRenderer for LocalBackend {
    async fn put_dashboard(&self, name: &str, body: &serde_json::Value) -> CallResult<()> {
        self.store.put_dashboard(&DashboardRecord {
            name: name.to_string(),
            body: body.clone(),
            updated_at: self.clock.now(),
        })?;
        Ok(())
    }
}

#[async_trait]
impl LeaseProvider for LocalBackend {
    async fn acquire(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> CallResult<Option<Lease>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CallError::Rejected(format!("lease ttl: {e}")))?;
        let stored = self.store.try_acquire_lease(
            TICK_LEASE,
            LeaseRecord {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
            now,
        )?;
        if stored.holder == holder {
            Ok(Some(Lease::granted(stored.holder, stored.expires_at)))
        } else {
            debug!(held_by = %stored.holder, until = %stored.expires_at, "tick lease busy");
            Ok(None)
        }
    }

    async fn release(&self, lease: &Lease) -> CallResult<()> {
        self.store.release_lease(TICK_LEASE, lease.holder())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::ManualClock;

    fn backend(behavior: LocalBehavior) -> (LocalBackend, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = StateStore::open_in_memory().unwrap();
        (LocalBackend::new(store, behavior, clock.clone()), clock)
    }

    fn cpu() -> MetricRef {
        MetricRef {
            namespace: "AWS/EC2".to_string(),
            name: "CPUUtilization".to_string(),
            dimension: "InstanceId".to_string(),
        }
    }

    fn launch_spec() -> LaunchSpec {
        LaunchSpec {
            image: "ami-1".to_string(),
            instance_type: "t3.micro".to_string(),
            key_name: None,
            security_groups: vec![],
            subnet: None,
            tags: BTreeMap::from([("Purpose".to_string(), "ScaledInstance".to_string())]),
            bootstrap: b"#!/bin/sh".to_vec(),
        }
    }

    #[tokio::test]
    async fn list_nodes_applies_filter() {
        let (b, _) = backend(LocalBehavior::default());
        b.add_node("i-1", NodeState::Running, &[("Role", "Primary")]).unwrap();
        b.add_node("i-2", NodeState::Stopped, &[]).unwrap();
        b.add_node("i-3", NodeState::Terminated, &[]).unwrap();

        let running = b.list_nodes(&NodeFilter::states(&[NodeState::Running])).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].tags.get("Role").map(String::as_str), Some("Primary"));

        let all = b.list_nodes(&NodeFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn started_node_boots_after_configured_checks() {
        let (b, _) = backend(LocalBehavior {
            boot_checks: 2,
            health_checks: 0,
        });
        b.add_node("i-1", NodeState::Stopped, &[]).unwrap();
        b.start("i-1").await.unwrap();

        assert!(!b.describe_status("i-1").await.unwrap().is_ready());
        assert!(!b.describe_status("i-1").await.unwrap().is_ready());
        assert!(b.describe_status("i-1").await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn start_rejects_terminated_node() {
        let (b, _) = backend(LocalBehavior::default());
        b.add_node("i-1", NodeState::Terminated, &[]).unwrap();
        assert!(matches!(b.start("i-1").await, Err(CallError::Rejected(_))));
        assert!(matches!(b.start("i-404").await, Err(CallError::NotFound(_))));
    }

    #[tokio::test]
    async fn launch_records_bootstrap_and_tags() {
        let (b, _) = backend(LocalBehavior::default());
        let id = b.launch(&launch_spec()).await.unwrap();

        assert!(id.starts_with("i-"));
        let node = b.store().get_node(&id).unwrap().unwrap();
        assert_eq!(node.state, NodeState::Running);
        assert_eq!(node.launch.unwrap().bootstrap_bytes, 9);
        assert_eq!(node.tags.get("Purpose").map(String::as_str), Some("ScaledInstance"));
    }

    #[tokio::test]
    async fn registered_target_turns_healthy_after_checks() {
        let (b, _) = backend(LocalBehavior {
            boot_checks: 0,
            health_checks: 1,
        });
        b.add_node("i-1", NodeState::Running, &[]).unwrap();
        b.register_target("tg", "i-1", 80).await.unwrap();

        let first = b.describe_health("tg").await.unwrap();
        assert_eq!(first[0].state, TargetState::Initial);
        let second = b.describe_health("tg").await.unwrap();
        assert_eq!(second[0].state, TargetState::Healthy);
    }

    #[tokio::test]
    async fn stopped_node_target_reports_unhealthy() {
        let (b, _) = backend(LocalBehavior::default());
        b.add_node("i-1", NodeState::Running, &[]).unwrap();
        b.register_target("tg", "i-1", 80).await.unwrap();
        b.stop("i-1").await.unwrap();

        let health = b.describe_health("tg").await.unwrap();
        assert_eq!(health[0].state, TargetState::Unhealthy);
    }

    #[tokio::test]
    async fn query_average_buckets_by_period_inside_window() {
        let (b, clock) = backend(LocalBehavior::default());
        let end = clock.now();
        let window = TimeWindow::trailing(end, Duration::from_secs(300));

        b.record_sample("i-1", &cpu(), window.start + chrono::Duration::seconds(10), 40.0).unwrap();
        b.record_sample("i-1", &cpu(), window.start + chrono::Duration::seconds(20), 60.0).unwrap();
        b.record_sample("i-1", &cpu(), window.start + chrono::Duration::seconds(70), 80.0).unwrap();
        // Outside the window.
        b.record_sample("i-1", &cpu(), window.start - chrono::Duration::seconds(1), 100.0).unwrap();

        let points = b
            .query_average("i-1", &cpu(), &window, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, 50.0);
        assert_eq!(points[1].value, 80.0);
    }

    #[tokio::test]
    async fn lease_round_trip() {
        let (b, clock) = backend(LocalBehavior::default());
        let now = clock.now();

        let lease = b.acquire("a", Duration::from_secs(60), now).await.unwrap().unwrap();
        assert!(b.acquire("b", Duration::from_secs(60), now).await.unwrap().is_none());

        b.release(&lease).await.unwrap();
        assert!(b.acquire("b", Duration::from_secs(60), now).await.unwrap().is_some());
    }
}
