//! Scaling events: the unit of work passed from the debouncer to workers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ondemand_scaler_core::{ChainKey, Job, ScaleContext};
use ondemand_scaler_pool::Pool;
use tokio::time::Instant;

/// Unmet demand of one task group and the pool chosen to serve it.
#[derive(Clone)]
pub struct TaskGroupDemand {
    /// Allocations queued for lack of capacity.
    pub unallocated: u32,
    /// Target pool.
    pub pool: Arc<Pool>,
}

impl fmt::Debug for TaskGroupDemand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroupDemand")
            .field("unallocated", &self.unallocated)
            .field("pool", &self.pool.name())
            .finish()
    }
}

/// Stable demand for one job, fired once its eval chain settled.
#[derive(Debug, Clone)]
pub struct ScalingEvent {
    /// Chain the event was fired for.
    pub key: ChainKey,
    /// Job definition at fire time.
    pub job: Job,
    /// When the event was fired.
    pub fired_at: Instant,
    /// Demand per task group name.
    pub demand: BTreeMap<String, TaskGroupDemand>,
    /// Cancelled when the demand disappears or the hung-prevention deadline
    /// passes.
    pub ctx: ScaleContext,
}

impl ScalingEvent {
    /// Total unallocated instances across task groups.
    #[must_use]
    pub fn unallocated(&self) -> u32 {
        self.demand.values().map(|d| d.unallocated).sum()
    }
}
