//! Static provider for pools of pre-existing nodes.

use async_trait::async_trait;
use ondemand_scaler_core::{Node, ScaleContext};

use super::NodeProvider;
use crate::error::{PoolError, Result};

/// Registry name.
pub const NAME: &str = "anynode";

/// Claims every node it is asked about and can neither grow nor shrink.
///
/// Useful for a pool of manually managed machines, and for testing pool
/// membership without a cloud backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyNodeProvider;

impl AnyNodeProvider {
    /// Create the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeProvider for AnyNodeProvider {
    fn kind(&self) -> &'static str {
        NAME
    }

    async fn is_node_exists(&self, node: &Node) -> bool {
        tracing::debug!(
            node_id = %node.id,
            registered_at = ?node.last_registered_at(),
            "anynode provider claims node"
        );
        true
    }

    async fn remove_nodes(&self, _nodes: &[Node]) -> Result<()> {
        Err(PoolError::Unsupported {
            provider: NAME,
            operation: "remove_nodes",
        })
    }

    async fn update_nodes(
        &self,
        _ctx: &ScaleContext,
        _current: &[Node],
        _desired_total: usize,
    ) -> Result<()> {
        Err(PoolError::Unsupported {
            provider: NAME,
            operation: "update_nodes",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ondemand_scaler_core::NodeId;

    #[tokio::test]
    async fn claims_everything_changes_nothing() {
        let provider = AnyNodeProvider::new();
        let node = Node::new(NodeId::new("n1"));

        assert!(provider.is_node_exists(&node).await);
        assert!(matches!(
            provider.remove_nodes(&[node.clone()]).await,
            Err(PoolError::Unsupported { .. })
        ));
        assert!(provider
            .update_nodes(&ScaleContext::new(), &[node], 3)
            .await
            .is_err());
    }
}
