//! Node providers.
//!
//! A provider creates and destroys nodes in one external substrate. Pools
//! only talk to providers through [`NodeProvider`]; which implementation a
//! pool gets is decided once, at startup, from the pool's `provider`
//! descriptor via the closed [`ProviderKind`] registry.

pub mod anynode;
pub mod inventory;
pub mod karpenter;

use std::sync::Arc;

use async_trait::async_trait;
use ondemand_scaler_core::{Node, ScaleContext, Variant};

use crate::error::{PoolError, Result};
use crate::spec::PoolNodeSpec;

pub use anynode::AnyNodeProvider;
pub use inventory::{ElasticProvider, InstanceBackend};
pub use karpenter::{KarpenterBackend, KarpenterParams, Requirement};

/// Creates, removes and recognizes nodes for one pool.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Short provider name for logs.
    fn kind(&self) -> &'static str;

    /// Whether `node` belongs to this provider's inventory.
    async fn is_node_exists(&self, node: &Node) -> bool;

    /// Destroy the given nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot remove nodes or the backend
    /// rejects the request.
    async fn remove_nodes(&self, nodes: &[Node]) -> Result<()>;

    /// Grow the inventory to `desired_total` nodes.
    ///
    /// `current` lists the nodes the pool has confirmed. Calling this again
    /// before an earlier increase completes must not double count it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be issued.
    async fn update_nodes(
        &self,
        ctx: &ScaleContext,
        current: &[Node],
        desired_total: usize,
    ) -> Result<()>;
}

/// Provider implementations a pool may name, with typed parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    /// Static pool: claims every node, cannot grow or shrink.
    AnyNode,
    /// Kubernetes elastic provisioner driven through node claims.
    Karpenter(Box<KarpenterParams>),
}

type ParseFn = fn(&PoolNodeSpec, Option<&Variant>) -> Result<ProviderKind>;

/// Provider names and their parameter parsers.
const REGISTRY: &[(&str, ParseFn)] = &[
    (anynode::NAME, parse_anynode),
    (karpenter::NAME, parse_karpenter),
];

fn parse_anynode(_spec: &PoolNodeSpec, _params: Option<&Variant>) -> Result<ProviderKind> {
    Ok(ProviderKind::AnyNode)
}

fn parse_karpenter(spec: &PoolNodeSpec, params: Option<&Variant>) -> Result<ProviderKind> {
    KarpenterParams::from_variant(spec, params).map(|p| ProviderKind::Karpenter(Box::new(p)))
}

impl ProviderKind {
    /// Resolve the provider descriptor of `spec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is missing, names an unknown
    /// provider, or carries invalid parameters.
    pub fn from_spec(spec: &PoolNodeSpec) -> Result<Self> {
        let descriptor = spec
            .provider()
            .ok_or_else(|| PoolError::Spec(format!("pool {} has no provider", spec.full_name())))?
            .expect_map("provider")?;
        let name = descriptor
            .get("name")
            .ok_or_else(|| PoolError::Spec("provider has no name".to_string()))?
            .expect_str("provider.name")?;

        let (_, parse) = REGISTRY
            .iter()
            .find(|(registered, _)| *registered == name)
            .ok_or_else(|| PoolError::UnknownProvider(name.to_string()))?;
        parse(spec, descriptor.get("params"))
    }

    /// Registered provider name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AnyNode => anynode::NAME,
            Self::Karpenter(_) => karpenter::NAME,
        }
    }

    /// Instantiate the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider's backend cannot be reached.
    pub async fn build(self) -> Result<Arc<dyn NodeProvider>> {
        match self {
            Self::AnyNode => Ok(Arc::new(AnyNodeProvider::new())),
            Self::Karpenter(params) => {
                let client = kube::Client::try_default().await?;
                let pool_name = params.name.clone();
                let backend = KarpenterBackend::new(client, *params);
                let provider = ElasticProvider::connect(pool_name, backend).await?;
                Ok(Arc::new(provider))
            }
        }
    }
}

/// Names of every registered provider.
#[must_use]
pub fn registered_providers() -> Vec<&'static str> {
    REGISTRY.iter().map(|(name, _)| *name).collect()
}

/// An in-memory provider for testing pools without infrastructure.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use ondemand_scaler_core::NodeId;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// A provider that records every call.
    ///
    /// By default it claims every node; [`MockProvider::claiming`] restricts
    /// membership to an explicit id set.
    #[derive(Default)]
    pub struct MockProvider {
        claimed: Mutex<Option<HashSet<NodeId>>>,
        updates: Mutex<Vec<usize>>,
        removed: Mutex<Vec<NodeId>>,
        fail_updates: Mutex<bool>,
    }

    impl MockProvider {
        /// Create a provider that claims every node.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a provider that claims only `ids`.
        #[must_use]
        pub fn claiming<I, T>(ids: I) -> Self
        where
            I: IntoIterator<Item = T>,
            T: Into<NodeId>,
        {
            let provider = Self::default();
            *provider.claimed.lock() = Some(ids.into_iter().map(Into::into).collect());
            provider
        }

        /// Add a node to the claimed set.
        pub fn claim(&self, id: impl Into<NodeId>) {
            if let Some(claimed) = self.claimed.lock().as_mut() {
                claimed.insert(id.into());
            }
        }

        /// Make subsequent `update_nodes` calls fail.
        pub fn set_fail_updates(&self, fail: bool) {
            *self.fail_updates.lock() = fail;
        }

        /// Desired totals passed to `update_nodes`, in call order.
        #[must_use]
        pub fn update_calls(&self) -> Vec<usize> {
            self.updates.lock().clone()
        }

        /// Nodes passed to `remove_nodes`, in call order.
        #[must_use]
        pub fn removed(&self) -> Vec<NodeId> {
            self.removed.lock().clone()
        }
    }

    #[async_trait]
    impl NodeProvider for MockProvider {
        fn kind(&self) -> &'static str {
            "mock"
        }

        async fn is_node_exists(&self, node: &Node) -> bool {
            self.claimed
                .lock()
                .as_ref()
                .map_or(true, |claimed| claimed.contains(&node.id))
        }

        async fn remove_nodes(&self, nodes: &[Node]) -> Result<()> {
            self.removed
                .lock()
                .extend(nodes.iter().map(|n| n.id.clone()));
            Ok(())
        }

        async fn update_nodes(
            &self,
            _ctx: &ScaleContext,
            _current: &[Node],
            desired_total: usize,
        ) -> Result<()> {
            self.updates.lock().push(desired_total);
            if *self.fail_updates.lock() {
                return Err(PoolError::Backend("update rejected".to_string()));
            }
            Ok(())
        }
    }
}
