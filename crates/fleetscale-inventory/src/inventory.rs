//! FleetInventory — running/stopped partition of the fleet at tick start.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use fleet_core::{
    Clock, FleetProvider, FleetSnapshot, Node, NodeFilter, NodeId, NodeState, PrimaryTag,
    ProviderError,
};

/// Inventory could not be captured. Tick-fatal: no decision is trusted
/// without a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub type InventoryResult<T> = Result<T, InventoryError>;

pub struct FleetInventory {
    provider: Arc<dyn FleetProvider>,
    clock: Arc<dyn Clock>,
    primary_tag: PrimaryTag,
}

impl FleetInventory {
    pub fn new(
        provider: Arc<dyn FleetProvider>,
        clock: Arc<dyn Clock>,
        primary_tag: PrimaryTag,
    ) -> Self {
        Self {
            provider,
            clock,
            primary_tag,
        }
    }

    /// Capture running and stopped nodes with a single provider query.
    ///
    /// Provider order is preserved inside each partition. Nodes in any
    /// other state (pending, stopping, terminated) are left out.
    pub async fn snapshot(&self) -> InventoryResult<FleetSnapshot> {
        let filter = NodeFilter::states(&[NodeState::Running, NodeState::Stopped]);
        let described = self
            .provider
            .list_nodes(&filter)
            .await
            .map_err(|e| ProviderError::new("list_nodes", e))?;

        let mut running = Vec::new();
        let mut stopped = Vec::new();
        for desc in described {
            let primary = self.primary_tag.matches(&desc.tags);
            let node = Node::new(desc.id, desc.state, primary);
            match desc.state {
                NodeState::Running => running.push(node),
                NodeState::Stopped => stopped.push(node),
                other => debug!(node = %node.id, state = %other, "ignoring node outside filter"),
            }
        }

        let snapshot = FleetSnapshot {
            running,
            stopped,
            captured_at: self.clock.now(),
        };
        info!(
            running = ?snapshot.running_ids(),
            primary = ?snapshot.primary_ids(),
            stopped = snapshot.stopped.len(),
            "fleet inventory captured"
        );
        Ok(snapshot)
    }

    /// Running node ids and the primary subset, in provider order.
    pub async fn list(&self) -> InventoryResult<(Vec<NodeId>, Vec<NodeId>)> {
        let snapshot = self.snapshot().await?;
        Ok((snapshot.running_ids(), snapshot.primary_ids()))
    }
}
