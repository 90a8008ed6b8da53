//! Idle-node collection.
//!
//! Every cycle the loop counts allocations per node in each pool. A node
//! seen idle for `cycles_to_gc` consecutive cycles is drained and removed,
//! unless the pool's allowed-free budget still wants it kept. When a pool has
//! fewer idle nodes than the budget, it is warmed up by the shortfall.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use ondemand_scaler_core::NodeId;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::context::AppContext;

/// Allocation counts of one pool's nodes.
#[derive(Debug, Clone, Default)]
pub struct PoolUsage {
    /// Pool name.
    pub name: String,
    /// Allocations per confirmed node; idle nodes map to zero.
    pub allocs_per_node: BTreeMap<NodeId, usize>,
}

/// Collection state of one idle node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcInfo {
    /// Owning pool.
    pub pool: String,
    /// Consecutive cycles the node was seen idle.
    pub idle_cycles: u32,
    /// Whether removal was already requested.
    pub collecting: bool,
}

/// What one cycle decided.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcPlan {
    /// Pools to warm up, with the number of nodes to add.
    pub warm_ups: Vec<(String, usize)>,
    /// Nodes to drain and remove, per pool.
    pub collect: BTreeMap<String, Vec<NodeId>>,
}

/// Idle counters across cycles.
#[derive(Debug)]
pub struct GcState {
    nodes: HashMap<NodeId, GcInfo>,
    cycles_to_gc: u32,
}

impl GcState {
    /// Collect nodes after `cycles_to_gc` idle cycles.
    #[must_use]
    pub fn new(cycles_to_gc: u32) -> Self {
        Self {
            nodes: HashMap::new(),
            cycles_to_gc,
        }
    }

    /// Counters of a tracked node.
    #[must_use]
    pub fn info(&self, node_id: &NodeId) -> Option<&GcInfo> {
        self.nodes.get(node_id)
    }

    /// Number of tracked idle nodes.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.nodes.len()
    }

    /// Run one cycle. `allowed_free(total, busy)` gives the idle nodes a pool
    /// should keep.
    pub fn cycle(
        &mut self,
        usage: &[PoolUsage],
        allowed_free: impl Fn(usize, usize) -> usize,
    ) -> GcPlan {
        check_single_owner(usage);

        let mut plan = GcPlan::default();
        let mut seen_idle = HashSet::new();

        for pool in usage {
            let total = pool.allocs_per_node.len();
            let busy = pool.allocs_per_node.values().filter(|&&n| n > 0).count();
            let mut allowed = allowed_free(total, busy);

            let to_launch = allowed.saturating_sub(total - busy);
            if to_launch > 0 {
                info!(
                    pool = %pool.name,
                    allowed_free = allowed,
                    total_nodes = total,
                    busy_nodes = busy,
                    nodes = to_launch,
                    "pool below its free-node floor"
                );
                plan.warm_ups.push((pool.name.clone(), to_launch));
            }

            for (node_id, &allocs) in &pool.allocs_per_node {
                if allocs > 0 {
                    continue;
                }
                seen_idle.insert(node_id.clone());

                let info = self.nodes.entry(node_id.clone()).or_insert_with(|| GcInfo {
                    pool: pool.name.clone(),
                    idle_cycles: 0,
                    collecting: false,
                });
                info.pool.clone_from(&pool.name);
                info.idle_cycles += 1;

                if info.idle_cycles < self.cycles_to_gc || info.collecting {
                    continue;
                }
                if allowed > 0 {
                    allowed -= 1;
                    debug!(pool = %pool.name, node_id = %node_id, "idle node kept as free capacity");
                    continue;
                }

                info!(
                    pool = %pool.name,
                    node_id = %node_id,
                    idle_cycles = info.idle_cycles,
                    "collecting idle node"
                );
                info.collecting = true;
                plan.collect
                    .entry(pool.name.clone())
                    .or_default()
                    .push(node_id.clone());
            }
        }

        self.nodes.retain(|id, _| seen_idle.contains(id));
        plan
    }
}

/// Log every node claimed by more than one pool.
fn check_single_owner(usage: &[PoolUsage]) {
    let mut owners: HashMap<&NodeId, &str> = HashMap::new();
    for pool in usage {
        for node_id in pool.allocs_per_node.keys() {
            if let Some(first) = owners.insert(node_id, &pool.name) {
                error!(
                    node_id = %node_id,
                    first_pool = %first,
                    second_pool = %pool.name,
                    "node belongs to two pools"
                );
            }
        }
    }
}

/// Run the GC loop until shutdown.
pub async fn run_gc(app: Arc<AppContext>) {
    let config = &app.config.gc;
    let mut state = GcState::new(config.cycles_to_gc);
    let mut ticker = interval_at(Instant::now() + config.cycle_period, config.cycle_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period = ?config.cycle_period, cycles_to_gc = config.cycles_to_gc, "gc loop started");

    loop {
        tokio::select! {
            () = app.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let _busy = app.stats.gc_busy();
        run_cycle(&app, &mut state).await;
    }
    info!("gc loop stopped");
}

/// Run one cycle against the pools in `app`.
pub async fn run_cycle(app: &Arc<AppContext>, state: &mut GcState) {
    let usage: Vec<PoolUsage> = app
        .pools
        .iter()
        .map(|pool| PoolUsage {
            name: pool.name().to_string(),
            allocs_per_node: pool.allocs_per_node(),
        })
        .collect();

    let expr = &app.config.gc.allowed_free_expr;
    let plan = state.cycle(&usage, |total, busy| expr.allowed_free(total, busy));

    for (name, count) in plan.warm_ups {
        let Some(pool) = app.pool(&name).cloned() else {
            continue;
        };
        if pool.is_warming() {
            debug!(pool = %name, "warm-up already running");
            continue;
        }
        let timeout = app.config.gc.warmup_timeout;
        tokio::spawn(async move {
            if let Err(e) = pool.warm_up(count, timeout).await {
                warn!(pool = %pool.name(), count, error = %e, "warm-up failed");
            }
        });
    }

    for (name, node_ids) in plan.collect {
        let Some(pool) = app.pool(&name) else {
            continue;
        };
        for node_id in &node_ids {
            if let Err(e) = app.cluster.drain_node(node_id).await {
                error!(pool = %name, node_id = %node_id, error = %e, "can't drain node");
            }
        }
        pool.remove_nodes(&node_ids).await;
    }
}
