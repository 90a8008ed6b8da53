//! Shared application state.
//!
//! One [`AppContext`] is built at startup and handed, behind an `Arc`, to
//! every long-lived task.

use std::sync::Arc;

use ondemand_scaler_cluster::{ClusterApi, StalePolicy};
use ondemand_scaler_core::ChainKey;
use ondemand_scaler_oracle::SchedulingOracle;
use ondemand_scaler_pool::Pool;
use tokio_util::sync::CancellationToken;

use crate::config::ScalerConfig;
use crate::event::ScalingEvent;
use crate::queue::ScalingQueue;
use crate::stats::ScalerStats;

/// Demand queue keyed by eval chain.
pub type DemandQueue = ScalingQueue<ChainKey, ScalingEvent>;

/// Everything the control loops share.
pub struct AppContext {
    /// Loaded configuration.
    pub config: ScalerConfig,
    /// Pools in definition order.
    pub pools: Vec<Arc<Pool>>,
    /// Cluster manager.
    pub cluster: Arc<dyn ClusterApi>,
    /// Feasibility and placement decisions.
    pub oracle: Arc<dyn SchedulingOracle>,
    /// Counters.
    pub stats: ScalerStats,
    /// Fired scaling events awaiting a worker.
    pub queue: DemandQueue,
    /// Cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppContext {
    /// Assemble the context for `scale_threads` workers.
    ///
    /// The GC loop only runs when there is at least one worker.
    #[must_use]
    pub fn new(
        config: ScalerConfig,
        pools: Vec<Arc<Pool>>,
        cluster: Arc<dyn ClusterApi>,
        oracle: Arc<dyn SchedulingOracle>,
        scale_threads: usize,
    ) -> Self {
        Self {
            config,
            pools,
            cluster,
            oracle,
            stats: ScalerStats::new(scale_threads, usize::from(scale_threads > 0)),
            queue: ScalingQueue::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Look up a pool by full name.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&Arc<Pool>> {
        self.pools.iter().find(|p| p.name() == name)
    }

    /// Read policy for cluster queries.
    #[must_use]
    pub const fn stale_policy(&self) -> StalePolicy {
        self.config.stale_api.policy()
    }
}
