//! Scaling workers.
//!
//! Each worker takes one [`ScalingEvent`] at a time, estimates the nodes
//! its demand needs per pool and runs one [`Pool::update`] per pool. The
//! chain key is reported back to the debouncer whatever the outcome.

use std::collections::BTreeMap;
use std::sync::Arc;

use ondemand_scaler_core::ChainKey;
use ondemand_scaler_pool::Pool;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::estimate::{estimate, Plan};
use crate::event::ScalingEvent;

/// Run one worker until shutdown.
pub async fn run_worker(app: Arc<AppContext>, id: usize, done: mpsc::UnboundedSender<ChainKey>) {
    debug!(worker = id, "scaling worker started");
    loop {
        let (key, event) = tokio::select! {
            () = app.shutdown.cancelled() => break,
            entry = app.queue.dequeue() => entry,
        };

        {
            let _busy = app.stats.scaling_busy();
            handle_event(&app, &event).await;
        }

        if done.send(key).is_err() {
            break;
        }
    }
    debug!(worker = id, "scaling worker stopped");
}

/// Estimate and apply one scaling event.
pub async fn handle_event(app: &AppContext, event: &ScalingEvent) {
    let key = &event.key;
    debug!(
        chain = %key,
        unallocated = event.unallocated(),
        waited = ?event.fired_at.elapsed(),
        "handling scaling event"
    );
    let mut plans: BTreeMap<String, (Arc<Pool>, Plan)> = BTreeMap::new();

    for (tg_name, demand) in &event.demand {
        let Some(tg) = event.job.task_group(tg_name) else {
            warn!(chain = %key, task_group = %tg_name, "task group missing from job");
            continue;
        };
        let (_, plan) = plans
            .entry(demand.pool.name().to_string())
            .or_insert_with(|| (Arc::clone(&demand.pool), Plan::default()));

        match estimate(
            app.oracle.as_ref(),
            &demand.pool,
            &event.job,
            tg,
            demand.unallocated,
            plan,
        ) {
            Ok(added) => info!(
                chain = %key,
                task_group = %tg_name,
                pool = %demand.pool.name(),
                unallocated = demand.unallocated,
                nodes = added,
                "estimated required nodes"
            ),
            Err(e) => error!(chain = %key, task_group = %tg_name, error = %e, "estimate failed"),
        }
    }

    let mut estimated = 0;
    for (pool_name, (pool, plan)) in plans {
        if plan.is_empty() {
            continue;
        }
        estimated += plan.nodes.len();
        match pool.update(&event.ctx, plan.nodes, plan.allocs).await {
            Ok(outcome) => info!(
                chain = %key,
                pool = %pool_name,
                wait_count = outcome.wait_count,
                placed = outcome.placed,
                requested = outcome.requested,
                "pool update finished"
            ),
            Err(e) if e.is_timeout() => {
                error!(chain = %key, pool = %pool_name, "pool update hit the hung-prevention deadline");
                app.stats.inc_scaling_timeouts();
            }
            Err(e) if e.is_cancelled() => {
                info!(chain = %key, pool = %pool_name, "pool update cancelled, demand satisfied or gone");
            }
            Err(e) => info!(chain = %key, pool = %pool_name, error = %e, "can't update pool"),
        }
    }

    info!(
        chain = %key,
        estimated_nodes = estimated,
        elapsed = ?event.fired_at.elapsed(),
        "scaling event handled"
    );
}
