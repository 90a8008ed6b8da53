//! Capacity pool lifecycle.
//!
//! A [`Pool`] owns the nodes and allocations of one capacity class. It keeps
//! two views of them:
//!
//! - **confirmed** entries, learned from the cluster event stream through
//!   [`Pool::try_node`] and [`Pool::try_alloc`]
//! - **tentative** entries, synthesized by a scaling worker and handed to
//!   [`Pool::update`] while the capacity they describe does not exist yet
//!
//! `update` asks the provider for `confirmed + tentative` nodes and then
//! waits until the stream shows the requested allocations landing. Every
//! tentative entry an `update` added is retracted when it returns, whatever
//! the outcome, so tentative state never outlives the call that created it.
//!
//! ```text
//!   worker ──update()──► Pool ──update_nodes()──► NodeProvider
//!                          ▲
//!   event stream ──try_node()/try_alloc()── confirms, notifies waiters
//! ```
//!
//! Grow operations (`update`, `warm_up`) share a read lock; `remove_nodes`
//! takes it exclusively so a provider is never asked to grow and shrink the
//! same pool at once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ondemand_scaler_core::{AllocId, Allocation, Node, NodeId, ScaleContext};
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::provider::{NodeProvider, ProviderKind};
use crate::spec::PoolNodeSpec;

/// Default quiet period after which an `update` stops waiting.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Single-use notification subscriptions.
struct Watchers<T> {
    next_id: u64,
    senders: Vec<(u64, mpsc::UnboundedSender<T>)>,
}

impl<T> Default for Watchers<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            senders: Vec::new(),
        }
    }
}

impl<T: Clone> Watchers<T> {
    fn subscribe(&mut self) -> (u64, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;
        self.senders.push((id, tx));
        (id, rx)
    }

    fn unsubscribe(&mut self, id: u64) {
        self.senders.retain(|(sub, _)| *sub != id);
    }

    fn publish(&mut self, value: &T) {
        self.senders.retain(|(_, tx)| tx.send(value.clone()).is_ok());
    }

    fn len(&self) -> usize {
        self.senders.len()
    }
}

#[derive(Default)]
struct PoolState {
    nodes: HashMap<NodeId, Node>,
    allocs: HashMap<AllocId, Allocation>,
    tentative_nodes: Vec<Node>,
    tentative_allocs: Vec<Allocation>,
    node_count: Watchers<usize>,
    placed: Watchers<AllocId>,
}

impl PoolState {
    /// Retire the tentative allocation `real` fulfils, and its node once no
    /// other tentative allocation is planned on it.
    fn retire_matching(&mut self, real: &Allocation) -> Option<AllocId> {
        let pos = self
            .tentative_allocs
            .iter()
            .position(|t| t.same_slot(real))?;
        let retired = self.tentative_allocs.remove(pos);
        if !self
            .tentative_allocs
            .iter()
            .any(|t| t.node_id == retired.node_id)
        {
            self.tentative_nodes.retain(|n| n.id != retired.node_id);
        }
        Some(retired.id)
    }
}

/// Tentative entries and subscriptions owned by one in-flight call.
///
/// Dropping it runs [`Pool::retract`], so every exit path of `update` and
/// `warm_up` (including the future being dropped) reconciles the same way.
struct Pending<'a> {
    pool: &'a Pool,
    nodes: Vec<NodeId>,
    allocs: Vec<AllocId>,
    node_sub: u64,
    placed_sub: Option<u64>,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.pool
            .retract(&self.nodes, &self.allocs, self.node_sub, self.placed_sub);
    }
}

/// Clears the warm-up flag when the warm-up ends or is dropped.
struct WarmingFlag<'a>(&'a AtomicBool);

impl Drop for WarmingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// How a [`Pool::update`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Total node count requested from the provider.
    pub wait_count: usize,
    /// Tentative allocations passed in.
    pub requested: usize,
    /// Tentative allocations observed placed before the call returned.
    pub placed: usize,
}

impl UpdateOutcome {
    /// Whether every requested allocation landed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.placed == self.requested
    }
}

/// Point-in-time copy of a pool's state.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    /// Confirmed nodes.
    pub nodes: Vec<Node>,
    /// Confirmed allocations.
    pub allocations: Vec<Allocation>,
    /// Tentative nodes of in-flight updates.
    pub tentative_nodes: Vec<Node>,
    /// Tentative allocations of in-flight updates.
    pub tentative_allocations: Vec<Allocation>,
}

/// One capacity pool.
pub struct Pool {
    spec: PoolNodeSpec,
    provider: Arc<dyn NodeProvider>,
    state: Mutex<PoolState>,
    resize: RwLock<()>,
    warming: AtomicBool,
    idle_timeout: Duration,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name())
            .field("provider", &self.provider.kind())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create an empty pool backed by `provider`.
    #[must_use]
    pub fn new(spec: PoolNodeSpec, provider: Arc<dyn NodeProvider>) -> Self {
        Self {
            spec,
            provider,
            state: Mutex::new(PoolState::default()),
            resize: RwLock::new(()),
            warming: AtomicBool::new(false),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Create a pool and the provider its spec names.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider descriptor is invalid or the provider
    /// cannot reach its backend.
    pub async fn from_spec(spec: PoolNodeSpec) -> Result<Self> {
        let provider = ProviderKind::from_spec(&spec)?.build().await?;
        Ok(Self::new(spec, provider))
    }

    /// Override how long `update` waits without progress.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Unique pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.spec.full_name()
    }

    /// The node specification.
    #[must_use]
    pub const fn spec(&self) -> &PoolNodeSpec {
        &self.spec
    }

    /// Name of the backing provider.
    #[must_use]
    pub fn provider_kind(&self) -> &'static str {
        self.provider.kind()
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Offer a node seen on the event stream to this pool.
    ///
    /// Returns `true` if the node belongs here. A node that is down is
    /// dropped together with its allocations.
    pub async fn try_node(&self, node: Node) -> bool {
        let known = self.state.lock().nodes.contains_key(&node.id);
        if !known && !self.provider.is_node_exists(&node).await {
            return false;
        }

        let mut state = self.state.lock();
        if node.is_down() {
            state.nodes.remove(&node.id);
            state.allocs.retain(|_, a| a.node_id != node.id);
            info!(
                pool = %self.name(),
                node_id = %node.id,
                status = %node.status,
                nodes = state.nodes.len(),
                allocs = state.allocs.len(),
                "node removed"
            );
            return true;
        }

        let node_id = node.id.clone();
        let status = node.status;
        if state.nodes.insert(node_id.clone(), node).is_none() {
            let count = state.nodes.len();
            info!(
                pool = %self.name(),
                node_id = %node_id,
                %status,
                nodes = count,
                allocs = state.allocs.len(),
                "node added"
            );
            state.node_count.publish(&count);
        } else {
            debug!(pool = %self.name(), node_id = %node_id, %status, "node updated");
        }
        true
    }

    /// Offer an allocation seen on the event stream to this pool.
    ///
    /// Returns `true` if the allocation runs on one of this pool's nodes.
    /// A newly placed allocation retires the tentative allocation of the same
    /// task group and wakes any `update` waiting for it.
    pub fn try_alloc(&self, alloc: Allocation) -> bool {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&alloc.node_id) {
            return false;
        }

        if !alloc.is_live() {
            if state.allocs.remove(&alloc.id).is_some() {
                debug!(
                    pool = %self.name(),
                    alloc_id = %alloc.id,
                    client_status = alloc.client_status.as_str(),
                    allocs = state.allocs.len(),
                    "allocation removed"
                );
            }
            return true;
        }

        let alloc_id = alloc.id.clone();
        if state.allocs.contains_key(&alloc_id) {
            state.allocs.insert(alloc_id.clone(), alloc);
            debug!(pool = %self.name(), alloc_id = %alloc_id, "allocation updated");
            return true;
        }

        let retired = state.retire_matching(&alloc);
        state.allocs.insert(alloc_id.clone(), alloc);

        debug!(
            pool = %self.name(),
            alloc_id = %alloc_id,
            nodes = state.nodes.len(),
            allocs = state.allocs.len(),
            "allocation added"
        );
        if let Some(tentative) = retired {
            state.placed.publish(&tentative);
        }
        true
    }

    // ========================================================================
    // Resizing
    // ========================================================================

    /// Request capacity for tentative nodes and allocations and wait for it.
    ///
    /// The wait ends when every tentative allocation has been placed, when
    /// no progress was seen for the idle timeout after the node count was
    /// reached, or when `ctx` finishes. Tentative entries that were not
    /// confirmed are retracted on every path.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if the resize request fails, or a
    /// context error if `ctx` is cancelled or times out during the wait.
    pub async fn update(
        &self,
        ctx: &ScaleContext,
        nodes: Vec<Node>,
        allocs: Vec<Allocation>,
    ) -> Result<UpdateOutcome> {
        let _resize = self.resize.read().await;

        let requested: HashSet<AllocId> = allocs.iter().map(|a| a.id.clone()).collect();
        let node_ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();

        let (pending, current, wait_count, mut node_rx, mut placed_rx) = {
            let mut state = self.state.lock();
            state.tentative_nodes.extend(nodes);
            state.tentative_allocs.extend(allocs);
            let wait_count = state.nodes.len() + state.tentative_nodes.len();
            let current: Vec<Node> = state.nodes.values().cloned().collect();
            let (node_sub, node_rx) = state.node_count.subscribe();
            let (placed_sub, placed_rx) = state.placed.subscribe();
            let pending = Pending {
                pool: self,
                nodes: node_ids,
                allocs: requested.iter().cloned().collect(),
                node_sub,
                placed_sub: Some(placed_sub),
            };
            (pending, current, wait_count, node_rx, placed_rx)
        };

        info!(pool = %self.name(), wait_count, allocs = requested.len(), "setting pool size");
        if let Err(e) = self.provider.update_nodes(ctx, &current, wait_count).await {
            warn!(pool = %self.name(), wait_count, error = %e, "can't set node count");
            return Err(e);
        }

        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);
        let mut armed = current.len() >= wait_count;
        let mut placed = HashSet::new();

        let result = loop {
            tokio::select! {
                reason = ctx.done() => break Err(reason.into()),
                () = &mut idle, if armed => {
                    info!(
                        pool = %self.name(),
                        placed = placed.len(),
                        requested = requested.len(),
                        "pool update went idle"
                    );
                    break Ok(());
                }
                Some(count) = node_rx.recv() => {
                    if count >= wait_count {
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        armed = true;
                    }
                }
                Some(alloc_id) = placed_rx.recv() => {
                    if requested.contains(&alloc_id) && placed.insert(alloc_id) {
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        armed = true;
                        if placed.len() == requested.len() {
                            info!(pool = %self.name(), placed = placed.len(), "all tentative allocations placed");
                            break Ok(());
                        }
                    }
                }
            }
        };

        drop(pending);
        {
            let state = self.state.lock();
            info!(
                pool = %self.name(),
                nodes = state.nodes.len(),
                allocs = state.allocs.len(),
                "pool update finished"
            );
        }

        result.map(|()| UpdateOutcome {
            wait_count,
            requested: requested.len(),
            placed: placed.len(),
        })
    }

    /// Grow the pool by `count` nodes and wait until they register.
    ///
    /// Does nothing if another warm-up of this pool is still running.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or a deadline error if the nodes do not
    /// register within `timeout`.
    pub async fn warm_up(&self, count: usize, timeout: Duration) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if self
            .warming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(pool = %self.name(), "warm-up already in progress");
            return Ok(());
        }
        let _warming = WarmingFlag(&self.warming);
        self.warm_up_inner(count, timeout).await
    }

    async fn warm_up_inner(&self, count: usize, timeout: Duration) -> Result<()> {
        let _resize = self.resize.read().await;
        let ctx = ScaleContext::with_timeout(timeout);

        let (pending, current, mut node_rx) = {
            let mut state = self.state.lock();
            let current: Vec<Node> = state.nodes.values().cloned().collect();
            let (node_sub, node_rx) = state.node_count.subscribe();
            let pending = Pending {
                pool: self,
                nodes: Vec::new(),
                allocs: Vec::new(),
                node_sub,
                placed_sub: None,
            };
            (pending, current, node_rx)
        };

        let wait_count = current.len() + count;
        info!(pool = %self.name(), count, wait_count, "warming up pool");
        self.provider.update_nodes(&ctx, &current, wait_count).await?;

        let result = loop {
            tokio::select! {
                reason = ctx.done() => break Err(reason.into()),
                Some(nodes) = node_rx.recv() => {
                    if nodes >= wait_count {
                        info!(pool = %self.name(), nodes, "warm-up done");
                        break Ok(());
                    }
                }
            }
        };
        drop(pending);
        result
    }

    /// Whether a warm-up is running.
    #[must_use]
    pub fn is_warming(&self) -> bool {
        self.warming.load(Ordering::Acquire)
    }

    /// Ask the provider to destroy the given nodes.
    ///
    /// Ids not in the pool are ignored. Provider errors are logged, not
    /// returned.
    pub async fn remove_nodes(&self, node_ids: &[NodeId]) {
        let _resize = self.resize.write().await;

        let nodes: Vec<Node> = {
            let state = self.state.lock();
            node_ids
                .iter()
                .filter_map(|id| state.nodes.get(id).cloned())
                .collect()
        };
        if nodes.is_empty() {
            return;
        }

        if let Err(e) = self.provider.remove_nodes(&nodes).await {
            error!(pool = %self.name(), count = nodes.len(), error = %e, "can't remove nodes");
        }
        info!(
            pool = %self.name(),
            nodes = ?nodes.iter().map(|n| n.id.short()).collect::<Vec<_>>(),
            "removed nodes"
        );
    }

    /// Drop tentative entries and subscriptions of a finished call.
    fn retract(&self, nodes: &[NodeId], allocs: &[AllocId], node_sub: u64, placed_sub: Option<u64>) {
        let mut state = self.state.lock();
        state.node_count.unsubscribe(node_sub);
        if let Some(sub) = placed_sub {
            state.placed.unsubscribe(sub);
        }

        let before = (state.tentative_nodes.len(), state.tentative_allocs.len());
        state.tentative_allocs.retain(|a| !allocs.contains(&a.id));
        state.tentative_nodes.retain(|n| !nodes.contains(&n.id));
        let retracted_nodes = before.0 - state.tentative_nodes.len();
        let retracted_allocs = before.1 - state.tentative_allocs.len();
        if retracted_nodes > 0 || retracted_allocs > 0 {
            debug!(
                pool = %self.name(),
                retracted_nodes,
                retracted_allocs,
                "retracted unconfirmed tentative entries"
            );
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Confirmed node count.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Confirmed allocation count.
    #[must_use]
    pub fn alloc_count(&self) -> usize {
        self.state.lock().allocs.len()
    }

    /// Tentative node and allocation counts.
    #[must_use]
    pub fn tentative_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.tentative_nodes.len(), state.tentative_allocs.len())
    }

    /// Tentative nodes and allocations of every in-flight update.
    #[must_use]
    pub fn tentative(&self) -> (Vec<Node>, Vec<Allocation>) {
        let state = self.state.lock();
        (state.tentative_nodes.clone(), state.tentative_allocs.clone())
    }

    /// Whether the pool has confirmed `node_id`.
    #[must_use]
    pub fn contains_node(&self, node_id: &NodeId) -> bool {
        self.state.lock().nodes.contains_key(node_id)
    }

    /// Allocations per confirmed node; idle nodes map to zero.
    #[must_use]
    pub fn allocs_per_node(&self) -> BTreeMap<NodeId, usize> {
        let state = self.state.lock();
        let mut counts: BTreeMap<NodeId, usize> =
            state.nodes.keys().map(|id| (id.clone(), 0)).collect();
        for alloc in state.allocs.values() {
            if let Some(count) = counts.get_mut(&alloc.node_id) {
                *count += 1;
            }
        }
        counts
    }

    /// Copy of the pool's state.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        PoolSnapshot {
            nodes: state.nodes.values().cloned().collect(),
            allocations: state.allocs.values().cloned().collect(),
            tentative_nodes: state.tentative_nodes.clone(),
            tentative_allocations: state.tentative_allocs.clone(),
        }
    }

    /// Number of live wait subscriptions.
    #[must_use]
    pub fn waiters(&self) -> usize {
        let state = self.state.lock();
        state.node_count.len() + state.placed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use crate::spec_file::parse_pool_specs;
    use ondemand_scaler_core::{ClientStatus, DesiredStatus, NodeStatus, Resources};

    fn pool_with(provider: Arc<MockProvider>) -> Arc<Pool> {
        let spec = parse_pool_specs("- {cpu: 1000, mem: 1024, provider: {name: anynode}}")
            .unwrap()
            .remove(0);
        Arc::new(Pool::new(spec, provider))
    }

    fn alloc(id: &str, node: &str, group: &str) -> Allocation {
        Allocation {
            id: AllocId::new(id),
            name: format!("web.{group}[0]"),
            namespace: "default".into(),
            job_id: "web".into(),
            task_group: group.into(),
            node_id: NodeId::new(node),
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            resources: Resources::new(100, 128, 0),
            devices: Vec::new(),
        }
    }

    #[tokio::test]
    async fn foreign_node_is_rejected() {
        let provider = Arc::new(MockProvider::claiming(["n1"]));
        let pool = pool_with(provider);

        assert!(!pool.try_node(Node::new(NodeId::new("n2"))).await);
        assert!(pool.try_node(Node::new(NodeId::new("n1"))).await);
        assert_eq!(pool.node_count(), 1);
    }

    #[tokio::test]
    async fn down_node_cascades_to_allocations() {
        let pool = pool_with(Arc::new(MockProvider::new()));
        pool.try_node(Node::new(NodeId::new("n1"))).await;
        assert!(pool.try_alloc(alloc("a1", "n1", "web")));
        assert!(pool.try_alloc(alloc("a2", "n1", "web")));
        assert_eq!(pool.alloc_count(), 2);

        let mut down = Node::new(NodeId::new("n1"));
        down.status = NodeStatus::Down;
        assert!(pool.try_node(down).await);
        assert_eq!(pool.node_count(), 0);
        assert_eq!(pool.alloc_count(), 0);
    }

    #[tokio::test]
    async fn allocation_on_foreign_node_is_ignored() {
        let pool = pool_with(Arc::new(MockProvider::new()));
        assert!(!pool.try_alloc(alloc("a1", "elsewhere", "web")));
        assert_eq!(pool.alloc_count(), 0);
    }

    #[tokio::test]
    async fn finished_allocation_is_dropped() {
        let pool = pool_with(Arc::new(MockProvider::new()));
        pool.try_node(Node::new(NodeId::new("n1"))).await;
        pool.try_alloc(alloc("a1", "n1", "web"));

        let mut done = alloc("a1", "n1", "web");
        done.client_status = ClientStatus::Complete;
        assert!(pool.try_alloc(done));
        assert_eq!(pool.alloc_count(), 0);

        let mut stopped = alloc("a2", "n1", "web");
        stopped.desired_status = DesiredStatus::Stop;
        pool.try_alloc(stopped);
        assert_eq!(pool.alloc_count(), 0);
    }

    #[tokio::test]
    async fn allocs_per_node_reports_idle_nodes() {
        let pool = pool_with(Arc::new(MockProvider::new()));
        pool.try_node(Node::new(NodeId::new("n1"))).await;
        pool.try_node(Node::new(NodeId::new("n2"))).await;
        pool.try_alloc(alloc("a1", "n1", "web"));

        let counts = pool.allocs_per_node();
        assert_eq!(counts[&NodeId::new("n1")], 1);
        assert_eq!(counts[&NodeId::new("n2")], 0);
    }

    #[tokio::test]
    async fn provider_failure_rolls_back() {
        let provider = Arc::new(MockProvider::new());
        provider.set_fail_updates(true);
        let pool = pool_with(Arc::clone(&provider));

        let result = pool
            .update(
                &ScaleContext::new(),
                vec![Node::new(NodeId::new("t1"))],
                vec![alloc("ta1", "t1", "web")],
            )
            .await;

        assert!(result.is_err());
        assert_eq!(provider.update_calls(), vec![1]);
        assert_eq!(pool.tentative_counts(), (0, 0));
        assert_eq!(pool.waiters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_ends_partial_update() {
        let pool = pool_with(Arc::new(MockProvider::new()));

        let worker = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.update(
                    &ScaleContext::new(),
                    vec![Node::new(NodeId::new("t1")), Node::new(NodeId::new("t2"))],
                    vec![alloc("ta1", "t1", "web"), alloc("ta2", "t2", "web")],
                )
                .await
            })
        };
        tokio::task::yield_now().await;

        pool.try_node(Node::new(NodeId::new("n1"))).await;
        pool.try_node(Node::new(NodeId::new("n2"))).await;
        pool.try_alloc(alloc("a1", "n1", "web"));

        tokio::time::advance(DEFAULT_IDLE_TIMEOUT + Duration::from_millis(1)).await;
        let outcome = worker.await.unwrap().unwrap();

        assert_eq!(outcome.wait_count, 2);
        assert_eq!(outcome.placed, 1);
        assert!(!outcome.is_complete());
        assert_eq!(pool.tentative_counts(), (0, 0));
    }

    #[tokio::test]
    async fn remove_nodes_resolves_known_ids() {
        let provider = Arc::new(MockProvider::new());
        let pool = pool_with(Arc::clone(&provider));
        pool.try_node(Node::new(NodeId::new("n1"))).await;

        pool.remove_nodes(&[NodeId::new("n1"), NodeId::new("ghost")]).await;
        assert_eq!(provider.removed(), vec![NodeId::new("n1")]);

        pool.remove_nodes(&[NodeId::new("ghost")]).await;
        assert_eq!(provider.removed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn warm_up_waits_for_nodes() {
        let provider = Arc::new(MockProvider::new());
        let pool = pool_with(Arc::clone(&provider));
        pool.try_node(Node::new(NodeId::new("n1"))).await;

        let warm = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.warm_up(2, Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        assert!(pool.is_warming());

        // A second warm-up while the first is running is a no-op.
        pool.warm_up(5, Duration::from_secs(60)).await.unwrap();
        assert_eq!(provider.update_calls(), vec![3]);

        pool.try_node(Node::new(NodeId::new("n2"))).await;
        pool.try_node(Node::new(NodeId::new("n3"))).await;
        warm.await.unwrap().unwrap();

        assert!(!pool.is_warming());
        assert_eq!(pool.waiters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn warm_up_times_out() {
        let pool = pool_with(Arc::new(MockProvider::new()));
        let err = pool.warm_up(1, Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!pool.is_warming());
    }
}
