//! Startup and ingestion.
//!
//! [`populate`] loads the current nodes and allocations into the pools.
//! [`run`] then starts every long-lived task and waits for them to stop:
//!
//! ```text
//!   event stream ──► pump_events ──┬─ evals ──► Debouncer ──► queue ──► workers
//!                                  ├─ nodes ──► distribute_nodes ──► Pool::try_node
//!                                  └─ allocs ─► distribute_allocs ─► Pool::try_alloc
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use ondemand_scaler_cluster::stale::{with_retry, with_retry_or_missing};
use ondemand_scaler_cluster::ClusterEvent;
use ondemand_scaler_core::{Allocation, Evaluation, Node};
use ondemand_scaler_pool::Pool;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::context::AppContext;
use crate::debouncer::Debouncer;
use crate::dump;
use crate::gc;
use crate::workers::run_worker;

/// Buffer of the node and allocation channels.
pub const CHANNEL_CAPACITY: usize = 256;

/// Delay before reopening the event stream after a failure.
///
/// Starts at 5s and grows by 5s per consecutive failure, wrapping back to 5s
/// once it passes 60s.
#[derive(Debug, Clone)]
pub struct StreamBackoff {
    next: Duration,
}

impl StreamBackoff {
    const INITIAL: Duration = Duration::from_secs(5);
    const STEP: Duration = Duration::from_secs(5);
    const MAX: Duration = Duration::from_secs(60);

    /// Backoff at its initial delay.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: Self::INITIAL,
        }
    }

    /// Delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next += Self::STEP;
        if self.next > Self::MAX {
            self.next = Self::INITIAL;
        }
        delay
    }
}

impl Default for StreamBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the event pump delivers what it reads.
#[derive(Debug, Clone)]
pub struct EventSinks {
    /// Evaluations for the debouncer.
    pub evals: mpsc::UnboundedSender<Evaluation>,
    /// Nodes for the node distributor.
    pub nodes: mpsc::Sender<Node>,
    /// Allocations for the allocation distributor.
    pub allocs: mpsc::Sender<Allocation>,
}

/// Offer `node` to each pool in order; returns the pool that took it.
pub async fn route_node<'a>(pools: &'a [Arc<Pool>], node: Node) -> Option<&'a Arc<Pool>> {
    for pool in pools {
        if pool.try_node(node.clone()).await {
            return Some(pool);
        }
    }
    None
}

/// Offer `alloc` to each pool in order; returns the pool that took it.
pub fn route_alloc<'a>(pools: &'a [Arc<Pool>], alloc: &Allocation) -> Option<&'a Arc<Pool>> {
    pools.iter().find(|pool| pool.try_alloc(alloc.clone()))
}

/// Load every current node and its allocations into the pools.
///
/// Returns the highest raft index seen, where the event stream resumes.
pub async fn populate(app: &AppContext) -> u64 {
    let policy = app.stale_policy();
    let cluster = app.cluster.as_ref();

    let (stubs, meta) = with_retry(&policy, "node list", |opts| cluster.list_nodes(opts)).await;
    let mut index = meta.last_index;
    let mut claimed = 0;

    for stub in stubs {
        let id = &stub.id;
        let what = format!("node {id}");
        let Some((node, meta)) =
            with_retry_or_missing(&policy, &what, move |opts| cluster.node(id, opts)).await
        else {
            debug!(node_id = %id, "node disappeared during startup");
            continue;
        };
        index = index.max(meta.last_index);

        let Some(pool) = route_node(&app.pools, node).await else {
            trace!(node_id = %id, "node belongs to no pool");
            continue;
        };
        claimed += 1;

        let (allocs, meta) =
            with_retry(&policy, &what, move |opts| cluster.node_allocations(id, opts)).await;
        index = index.max(meta.last_index);
        for alloc in allocs {
            pool.try_alloc(alloc);
        }
    }

    for pool in &app.pools {
        info!(
            pool = %pool.name(),
            nodes = pool.node_count(),
            allocs = pool.alloc_count(),
            "pool populated"
        );
    }
    info!(claimed_nodes = claimed, index, "startup state loaded");
    index
}

/// Route nodes from the event stream until the channel closes.
pub async fn distribute_nodes(app: Arc<AppContext>, mut nodes: mpsc::Receiver<Node>) {
    while let Some(node) = nodes.recv().await {
        let id = node.id.clone();
        if route_node(&app.pools, node).await.is_none() {
            trace!(node_id = %id, "node belongs to no pool");
        }
    }
}

/// Route allocations from the event stream until the channel closes.
pub async fn distribute_allocs(app: Arc<AppContext>, mut allocs: mpsc::Receiver<Allocation>) {
    while let Some(alloc) = allocs.recv().await {
        if route_alloc(&app.pools, &alloc).is_none() {
            trace!(alloc_id = %alloc.id, node_id = %alloc.node_id, "allocation on no pool node");
        }
    }
}

/// Send every existing evaluation, then follow the event stream from
/// `index` until shutdown.
pub async fn pump_events(app: Arc<AppContext>, mut index: u64, sinks: EventSinks) {
    let policy = app.stale_policy();
    let cluster = app.cluster.as_ref();

    let (namespaces, _) =
        with_retry(&policy, "namespace list", |opts| cluster.list_namespaces(opts)).await;
    for namespace in &namespaces {
        let what = format!("evaluations of {namespace}");
        let ns = namespace.as_str();
        let (evals, _) =
            with_retry(&policy, &what, move |opts| cluster.list_evaluations(ns, opts)).await;
        for eval in evals {
            trace!(eval_id = %eval.id, status = ?eval.status, "listed evaluation");
            if sinks.evals.send(eval).is_err() {
                return;
            }
        }
    }

    let mut backoff = StreamBackoff::new();
    info!(index, "following cluster events");

    while !app.shutdown.is_cancelled() {
        let opened = tokio::select! {
            () = app.shutdown.cancelled() => break,
            opened = cluster.event_stream(index) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "can't open the event stream");
                tokio::select! {
                    () = app.shutdown.cancelled() => {}
                    () = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        loop {
            let item = tokio::select! {
                () = app.shutdown.cancelled() => return,
                item = stream.next() => item,
            };
            let batch = match item {
                Some(Ok(batch)) => batch,
                Some(Err(e)) => {
                    error!(error = %e, index, "event stream failed");
                    break;
                }
                None => break,
            };
            index = batch.index;
            if !deliver(&app, &sinks, batch.events).await {
                return;
            }
        }
        warn!(index, "event stream closed, reopening");
    }
}

/// Forward one batch. Returns `false` once a receiver is gone.
async fn deliver(app: &AppContext, sinks: &EventSinks, events: Vec<ClusterEvent>) -> bool {
    for event in events {
        let sent = match event {
            ClusterEvent::Evaluation(eval) => {
                trace!(eval_id = %eval.id, status = ?eval.status, "evaluation event");
                app.stats.inc_accepted_evals();
                sinks.evals.send(eval).is_ok()
            }
            ClusterEvent::Node(node) => {
                trace!(node_id = %node.id, status = %node.status, "node event");
                sinks.nodes.send(node).await.is_ok()
            }
            ClusterEvent::Allocation(alloc) => {
                app.stats.inc_accepted_allocs();
                sinks.allocs.send(alloc).await.is_ok()
            }
        };
        if !sent {
            return false;
        }
    }
    true
}

/// Cancel `app.shutdown` on ctrl-c.
async fn shutdown_on_ctrl_c(app: Arc<AppContext>) {
    tokio::select! {
        () = app.shutdown.cancelled() => {}
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("interrupt received, shutting down"),
                Err(e) => error!(error = %e, "can't listen for ctrl-c, shutting down"),
            }
            app.shutdown.cancel();
        }
    }
}

/// Populate the pools, start every task and wait until they all stop.
pub async fn run(app: Arc<AppContext>, scale_threads: usize) {
    let index = populate(&app).await;

    let (eval_tx, eval_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let (node_tx, node_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (alloc_tx, alloc_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let mut tasks = JoinSet::new();
    tasks.spawn(shutdown_on_ctrl_c(Arc::clone(&app)));
    tasks.spawn(Debouncer::new(Arc::clone(&app), eval_rx, done_rx).run());

    for id in 0..scale_threads {
        info!(worker = id + 1, "starting scaling worker");
        tasks.spawn(run_worker(Arc::clone(&app), id + 1, done_tx.clone()));
    }
    drop(done_tx);

    if scale_threads > 0 {
        tasks.spawn(gc::run_gc(Arc::clone(&app)));
    } else {
        warn!("no scaling workers, running in observe-only mode");
    }

    tasks.spawn(distribute_nodes(Arc::clone(&app), node_rx));
    tasks.spawn(distribute_allocs(Arc::clone(&app), alloc_rx));
    tasks.spawn(dump::dump_on_signal(Arc::clone(&app)));
    tasks.spawn(pump_events(
        Arc::clone(&app),
        index,
        EventSinks {
            evals: eval_tx,
            nodes: node_tx,
            allocs: alloc_tx,
        },
    ));

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "task failed");
            app.shutdown.cancel();
        }
    }
    info!("all tasks stopped");
}
