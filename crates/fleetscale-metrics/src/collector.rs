//! Metrics collector — per-node utilization over a trailing window.
//!
//! Each node is queried for averaged datapoints covering `[now - window, now]`
//! at `period` granularity. A node with no datapoints is unmeasured and
//! counts as idle (0%) rather than failing the tick.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use thiserror::Error;
use tracing::{debug, warn};

use fleet_core::{
    CallError, CallResult, Clock, MetricDatum, MetricRef, MetricsSource, NodeId, NodeUtilization,
    TimeWindow,
};

/// The metrics source failed for one node. Tick-fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("utilization query for {node_id} failed: {source}")]
pub struct MetricsError {
    pub node_id: NodeId,
    #[source]
    pub source: CallError,
}

pub type MetricsResult<T> = Result<T, MetricsError>;

pub struct MetricsCollector {
    source: Arc<dyn MetricsSource>,
    clock: Arc<dyn Clock>,
    metric: MetricRef,
    window: Duration,
    period: Duration,
    concurrent: bool,
}

impl MetricsCollector {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        clock: Arc<dyn Clock>,
        metric: MetricRef,
        window: Duration,
        period: Duration,
    ) -> Self {
        Self {
            source,
            clock,
            metric,
            window,
            period,
            concurrent: false,
        }
    }

    /// Issue per-node queries concurrently instead of one after another.
    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn metric(&self) -> &MetricRef {
        &self.metric
    }

    /// Average utilization of one node over the trailing window.
    pub async fn average_utilization(&self, node_id: &str) -> MetricsResult<NodeUtilization> {
        let window = TimeWindow::trailing(self.clock.now(), self.window);
        let mut points = self
            .source
            .query_average(node_id, &self.metric, &window, self.period)
            .await
            .map_err(|source| MetricsError {
                node_id: node_id.to_string(),
                source,
            })?;
        points.retain(|p| p.value.is_finite());
        points.sort_by_key(|p| p.timestamp);

        if points.is_empty() {
            warn!(
                node = %node_id,
                metric = %self.metric.name,
                "no datapoints in window, treating node as idle"
            );
            return Ok(NodeUtilization {
                node_id: node_id.to_string(),
                average: 0.0,
                samples: 0,
                measured: false,
                latest_at: None,
            });
        }

        let average = points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64;
        let latest_at = points.last().map(|p| p.timestamp);
        debug!(
            node = %node_id,
            average,
            samples = points.len(),
            latest = ?latest_at,
            "node utilization"
        );

        Ok(NodeUtilization {
            node_id: node_id.to_string(),
            average,
            samples: points.len(),
            measured: true,
            latest_at,
        })
    }

    /// Utilization for every node, in the order given.
    ///
    /// The first query failure aborts the whole collection.
    pub async fn collect(&self, nodes: &[NodeId]) -> MetricsResult<Vec<NodeUtilization>> {
        if self.concurrent {
            return try_join_all(nodes.iter().map(|id| self.average_utilization(id))).await;
        }

        let mut samples = Vec::with_capacity(nodes.len());
        for id in nodes {
            samples.push(self.average_utilization(id).await?);
        }
        Ok(samples)
    }

    /// Forward a custom metric to the source.
    pub async fn publish(&self, datum: &MetricDatum) -> CallResult<()> {
        self.source.publish(datum).await
    }
}

/// Unweighted mean of per-node averages. `None` for an empty fleet.
pub fn fleet_average(samples: &[NodeUtilization]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().map(|s| s.average).sum::<f64>() / samples.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use fleet_core::{Datapoint, ManualClock, NodeState};
    use fleetscale_state::{LocalBackend, LocalBehavior, StateStore};

    fn cpu() -> MetricRef {
        MetricRef {
            namespace: "AWS/EC2".to_string(),
            name: "CPUUtilization".to_string(),
            dimension: "InstanceId".to_string(),
        }
    }

    fn local() -> (Arc<LocalBackend>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = StateStore::open_in_memory().unwrap();
        let backend = LocalBackend::new(store, LocalBehavior::default(), clock.clone());
        (Arc::new(backend), clock)
    }

    fn collector(backend: Arc<LocalBackend>, clock: Arc<ManualClock>) -> MetricsCollector {
        MetricsCollector::new(
            backend,
            clock,
            cpu(),
            Duration::from_secs(300),
            Duration::from_secs(60),
        )
    }

    fn sample(node: &str, average: f64) -> NodeUtilization {
        NodeUtilization {
            node_id: node.to_string(),
            average,
            samples: 1,
            measured: true,
            latest_at: None,
        }
    }

    #[tokio::test]
    async fn averages_datapoints_in_window() {
        let (backend, clock) = local();
        backend.add_node("i-1", NodeState::Running, &[]).unwrap();
        let now = clock.now();
        backend.record_sample("i-1", &cpu(), now - chrono::Duration::seconds(240), 50.0).unwrap();
        backend.record_sample("i-1", &cpu(), now - chrono::Duration::seconds(120), 70.0).unwrap();
        // Older than the window.
        backend.record_sample("i-1", &cpu(), now - chrono::Duration::seconds(900), 0.0).unwrap();

        let u = collector(backend, clock).average_utilization("i-1").await.unwrap();
        assert!(u.measured);
        assert_eq!(u.samples, 2);
        assert_eq!(u.average, 60.0);
        assert!(u.latest_at.is_some());
    }

    #[tokio::test]
    async fn no_datapoints_is_unmeasured_zero() {
        let (backend, clock) = local();
        let u = collector(backend, clock).average_utilization("i-quiet").await.unwrap();
        assert!(!u.measured);
        assert_eq!(u.average, 0.0);
        assert_eq!(u.samples, 0);
    }

    #[tokio::test]
    async fn collect_preserves_order_sequential_and_concurrent() {
        let (backend, clock) = local();
        let now = clock.now();
        for (id, v) in [("i-1", 60.0), ("i-2", 80.0), ("i-3", 85.0)] {
            backend.record_sample(id, &cpu(), now - chrono::Duration::seconds(30), v).unwrap();
        }
        let nodes: Vec<NodeId> = vec!["i-1".into(), "i-2".into(), "i-3".into()];

        let sequential = collector(backend.clone(), clock.clone()).collect(&nodes).await.unwrap();
        let concurrent = collector(backend, clock)
            .concurrent(true)
            .collect(&nodes)
            .await
            .unwrap();

        assert_eq!(sequential, concurrent);
        assert_eq!(fleet_average(&sequential), Some(75.0));
    }

    #[test]
    fn fleet_average_is_unweighted_mean() {
        let samples = [sample("a", 5.0), sample("b", 15.0)];
        assert_eq!(fleet_average(&samples), Some(10.0));
    }

    #[test]
    fn fleet_average_of_nothing_is_none() {
        assert_eq!(fleet_average(&[]), None);
    }

    struct Flaky;

    #[async_trait]
    impl MetricsSource for Flaky {
        async fn query_average(
            &self,
            node: &str,
            _: &MetricRef,
            window: &TimeWindow,
            _: Duration,
        ) -> CallResult<Vec<Datapoint>> {
            if node == "i-bad" {
                return Err(CallError::Unavailable("throttled".to_string()));
            }
            Ok(vec![
                Datapoint {
                    timestamp: window.end,
                    value: f64::NAN,
                },
                Datapoint {
                    timestamp: window.start,
                    value: 40.0,
                },
            ])
        }

        async fn publish(&self, _: &MetricDatum) -> CallResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn query_failure_names_the_node() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let c = MetricsCollector::new(
            Arc::new(Flaky),
            clock,
            cpu(),
            Duration::from_secs(300),
            Duration::from_secs(60),
        );

        let nodes: Vec<NodeId> = vec!["i-ok".into(), "i-bad".into()];
        let err = c.collect(&nodes).await.unwrap_err();
        assert_eq!(err.node_id, "i-bad");

        // Non-finite datapoints are discarded.
        let ok = c.average_utilization("i-ok").await.unwrap();
        assert_eq!(ok.samples, 1);
        assert_eq!(ok.average, 40.0);
    }
}
