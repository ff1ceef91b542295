//! Load balancer reconciler — target-group membership for one group.

use std::sync::Arc;

use tracing::{debug, info, warn};

use fleet_core::{CallError, CallResult, Clock, LoadBalancer, NodeId, PollBudget, TargetState};

use crate::poll::{PollError, Probe, poll_until};

pub struct LoadBalancerReconciler {
    lb: Arc<dyn LoadBalancer>,
    clock: Arc<dyn Clock>,
    group: String,
}

impl LoadBalancerReconciler {
    pub fn new(lb: Arc<dyn LoadBalancer>, clock: Arc<dyn Clock>, group: impl Into<String>) -> Self {
        Self {
            lb,
            clock,
            group: group.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Add a node to the serving pool. Registering a member again is safe.
    pub async fn register(&self, id: &str, port: u16) -> CallResult<()> {
        self.lb.register_target(&self.group, id, port).await?;
        info!(group = %self.group, node = %id, port, "registered with load balancer");
        Ok(())
    }

    /// Remove a node from the serving pool. Removing a non-member is safe.
    pub async fn deregister(&self, id: &str, port: u16) -> CallResult<()> {
        match self.lb.deregister_target(&self.group, id, port).await {
            Ok(()) | Err(CallError::NotFound(_)) => {
                info!(group = %self.group, node = %id, port, "deregistered from load balancer");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Members the load balancer currently reports healthy, in its order.
    pub async fn healthy_members(&self) -> CallResult<Vec<NodeId>> {
        let targets = self.lb.describe_health(&self.group).await?;
        let healthy: Vec<NodeId> = targets
            .into_iter()
            .filter(|t| t.state == TargetState::Healthy)
            .map(|t| t.id)
            .collect();
        debug!(group = %self.group, ?healthy, "healthy members");
        Ok(healthy)
    }

    pub async fn is_healthy(&self, id: &str) -> CallResult<bool> {
        Ok(self.healthy_members().await?.iter().any(|m| m == id))
    }

    /// Poll membership until `id` is healthy or the budget runs out.
    ///
    /// Errors from the load balancer count as "not yet healthy".
    pub async fn wait_healthy(&self, id: &str, budget: PollBudget) -> bool {
        let result = poll_until(self.clock.as_ref(), budget, || async move {
            match self.is_healthy(id).await {
                Ok(true) => Ok::<_, CallError>(Probe::Ready(())),
                Ok(false) => Ok(Probe::Pending),
                Err(e) => {
                    warn!(node = %id, error = %e, "health query failed, retrying");
                    Ok(Probe::Pending)
                }
            }
        })
        .await;

        match result {
            Ok(polled) => {
                info!(node = %id, attempts = polled.attempts, waited = ?polled.waited, "target healthy");
                true
            }
            Err(PollError::TimedOut { attempts, waited }) => {
                warn!(node = %id, attempts, ?waited, "target did not become healthy in time");
                false
            }
            Err(PollError::Probe(e)) => {
                warn!(node = %id, error = %e, "health wait aborted");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use fleet_core::{ManualClock, NodeState, TargetHealth};
    use fleetscale_state::{LocalBackend, LocalBehavior, StateStore};

    fn local(health_checks: u32) -> (Arc<LocalBackend>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = StateStore::open_in_memory().unwrap();
        let behavior = LocalBehavior {
            boot_checks: 0,
            health_checks,
        };
        (Arc::new(LocalBackend::new(store, behavior, clock.clone())), clock)
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let (backend, clock) = local(0);
        backend.add_node("i-1", NodeState::Running, &[]).unwrap();
        let lb = LoadBalancerReconciler::new(backend.clone(), clock, "web");

        lb.register("i-1", 80).await.unwrap();
        lb.register("i-1", 80).await.unwrap();

        assert_eq!(backend.store().list_targets("web").unwrap().len(), 1);
        assert_eq!(lb.healthy_members().await.unwrap(), vec!["i-1"]);
    }

    #[tokio::test]
    async fn deregister_unknown_member_is_ok() {
        let (backend, clock) = local(0);
        let lb = LoadBalancerReconciler::new(backend, clock, "web");
        lb.deregister("i-ghost", 80).await.unwrap();
    }

    #[tokio::test]
    async fn wait_healthy_succeeds_after_checks() {
        let (backend, clock) = local(3);
        backend.add_node("i-1", NodeState::Running, &[]).unwrap();
        let lb = LoadBalancerReconciler::new(backend, clock.clone(), "web");
        lb.register("i-1", 80).await.unwrap();

        assert!(lb.wait_healthy("i-1", PollBudget::default()).await);
        assert_eq!(clock.total_slept(), std::time::Duration::from_secs(45));
    }

    #[tokio::test]
    async fn wait_healthy_times_out_and_leaves_registration() {
        let (backend, clock) = local(1000);
        backend.add_node("i-1", NodeState::Running, &[]).unwrap();
        let lb = LoadBalancerReconciler::new(backend.clone(), clock.clone(), "web");
        lb.register("i-1", 80).await.unwrap();

        assert!(!lb.wait_healthy("i-1", PollBudget::default()).await);
        assert_eq!(clock.total_slept(), std::time::Duration::from_secs(300));
        assert!(backend.store().get_target("web", "i-1").unwrap().is_some());
    }

    /// Fails the first `failures` health queries, then reports healthy.
    struct Recovering {
        failures: AtomicU32,
        registered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LoadBalancer for Recovering {
        async fn register_target(&self, _: &str, id: &str, _: u16) -> CallResult<()> {
            self.registered.lock().unwrap().push(id.to_string());
            Ok(())
        }
        async fn deregister_target(&self, _: &str, id: &str, _: u16) -> CallResult<()> {
            Err(CallError::NotFound(id.to_string()))
        }
        async fn describe_health(&self, _: &str) -> CallResult<Vec<TargetHealth>> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(CallError::Unavailable("throttled".to_string()));
            }
            let registered = self.registered.lock().unwrap();
            Ok(registered
                .iter()
                .map(|id| TargetHealth {
                    id: id.clone(),
                    state: TargetState::Healthy,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn health_query_errors_are_retried() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let backend = Arc::new(Recovering {
            failures: AtomicU32::new(2),
            registered: Mutex::new(vec![]),
        });
        let lb = LoadBalancerReconciler::new(backend, clock.clone(), "web");

        lb.register("i-1", 80).await.unwrap();
        assert!(lb.wait_healthy("i-1", PollBudget::default()).await);
        assert_eq!(clock.sleeps().len(), 2);

        // NotFound on deregister is treated as already removed.
        lb.deregister("i-1", 80).await.unwrap();
    }
}
