//! Inventory tracking shared by elastic providers.
//!
//! An elastic substrate (auto-scaling group, node-claim controller, ...) is
//! reduced to three calls on an [`InstanceBackend`]: list, add and remove
//! instances. [`ElasticProvider`] layers the bookkeeping every such provider
//! needs on top:
//!
//! - a cached instance inventory, refreshed only when a node reports a
//!   registration newer than the last refresh
//! - a seen-by-pool flag per instance, so instances the pool once confirmed
//!   but no longer lists can be detected as desynced and removed
//! - in-flight increments, so a repeated `update_nodes` never double counts
//!   capacity that is still being created
//! - batched removal with bounded retries

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ondemand_scaler_core::{Node, ScaleContext};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::NodeProvider;
use crate::error::{PoolError, Result};

/// Instances removed per backend call.
pub const REMOVE_BATCH: usize = 20;

/// Delay between retries of a failed backend call.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Attempts per removal batch before giving up until the next cycle.
pub const REMOVE_ATTEMPTS: usize = 5;

/// Raw instance operations of an elastic substrate.
#[async_trait]
pub trait InstanceBackend: Send + Sync + 'static {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Ids of every instance currently in the group.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn list_instances(&self) -> Result<Vec<String>>;

    /// Request `count` new instances and return the ids actually created.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing could be requested.
    async fn add_instances(&self, count: usize) -> Result<Vec<String>>;

    /// Destroy the given instances.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the removal.
    async fn remove_instances(&self, instance_ids: &[String]) -> Result<()>;
}

#[derive(Debug)]
struct Inventory {
    /// Instance id to whether the pool has confirmed the node.
    instances: HashMap<String, bool>,
    /// Outstanding increments keyed by request.
    in_flight: HashMap<u64, usize>,
    next_request: u64,
    refreshed_at: DateTime<Utc>,
}

impl Inventory {
    fn in_flight_total(&self) -> usize {
        self.in_flight.values().sum()
    }

    /// Replace the instance list, keeping seen flags of surviving instances.
    fn replace(&mut self, listed: Vec<String>, refreshed_at: DateTime<Utc>) {
        let previous = std::mem::take(&mut self.instances);
        self.instances = listed
            .into_iter()
            .map(|id| {
                let seen = previous.get(&id).copied().unwrap_or(false);
                (id, seen)
            })
            .collect();
        self.refreshed_at = refreshed_at;
    }
}

/// [`NodeProvider`] over any [`InstanceBackend`].
pub struct ElasticProvider<B> {
    pool: String,
    backend: Arc<B>,
    inventory: Arc<Mutex<Inventory>>,
    retry_delay: Duration,
}

impl<B: InstanceBackend> ElasticProvider<B> {
    /// Create the provider and load the initial inventory.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial listing fails.
    pub async fn connect(pool: impl Into<String>, backend: B) -> Result<Self> {
        let refreshed_at = Utc::now();
        let listed = backend.list_instances().await?;
        let mut inventory = Inventory {
            instances: HashMap::new(),
            in_flight: HashMap::new(),
            next_request: 0,
            refreshed_at,
        };
        inventory.replace(listed, refreshed_at);

        Ok(Self {
            pool: pool.into(),
            backend: Arc::new(backend),
            inventory: Arc::new(Mutex::new(inventory)),
            retry_delay: RETRY_DELAY,
        })
    }

    /// Override the delay between backend retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Number of instances currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.inventory.lock().instances.len()
    }

    /// Instances requested but not yet created.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inventory.lock().in_flight_total()
    }

    /// Reload the inventory, retrying until the backend answers.
    async fn refresh(&self) {
        loop {
            let started = Utc::now();
            match self.backend.list_instances().await {
                Ok(listed) => {
                    self.inventory.lock().replace(listed, started);
                    return;
                }
                Err(e) => {
                    error!(pool = %self.pool, error = %e, "can't refresh provider inventory");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Remove instances in batches. Ids of batches that finally fail stay
    /// tracked so a later cycle can retry them.
    async fn remove_instances(&self, instance_ids: &[String]) -> Result<()> {
        let mut last_error = None;

        for batch in instance_ids.chunks(REMOVE_BATCH) {
            let mut removed = false;
            for attempt in 1..=REMOVE_ATTEMPTS {
                match self.backend.remove_instances(batch).await {
                    Ok(()) => {
                        removed = true;
                        break;
                    }
                    Err(e) => {
                        error!(
                            pool = %self.pool,
                            attempt,
                            batch = batch.len(),
                            error = %e,
                            "failed to remove instances"
                        );
                        last_error = Some(e);
                        if attempt < REMOVE_ATTEMPTS {
                            tokio::time::sleep(self.retry_delay).await;
                        }
                    }
                }
            }

            if removed {
                let mut inventory = self.inventory.lock();
                for id in batch {
                    inventory.instances.remove(id);
                }
            }
        }

        last_error.map_or(Ok(()), Err)
    }

    fn spawn_growth(&self, ctx: &ScaleContext, request: u64, count: usize) {
        let backend = Arc::clone(&self.backend);
        let inventory = Arc::clone(&self.inventory);
        let ctx = ctx.clone();
        let pool = self.pool.clone();
        let retry_delay = self.retry_delay;

        tokio::spawn(async move {
            let mut remaining = count;
            while remaining > 0 && ctx.error().is_none() {
                match backend.add_instances(remaining).await {
                    Ok(created) => {
                        let added = created.len().min(remaining);
                        remaining -= added;
                        let mut inv = inventory.lock();
                        for id in created {
                            inv.instances.entry(id).or_insert(false);
                        }
                        inv.in_flight.insert(request, remaining);
                        if remaining > 0 {
                            warn!(pool = %pool, added, remaining, "provider added fewer instances than requested");
                        }
                    }
                    Err(e) => {
                        error!(pool = %pool, remaining, error = %e, "can't add instances");
                    }
                }

                if remaining > 0 {
                    tokio::select! {
                        () = tokio::time::sleep(retry_delay) => {}
                        reason = ctx.done() => {
                            info!(pool = %pool, remaining, %reason, "instance growth stopped");
                        }
                    }
                }
            }
            inventory.lock().in_flight.remove(&request);
        });
    }
}

#[async_trait]
impl<B: InstanceBackend> NodeProvider for ElasticProvider<B> {
    fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    async fn is_node_exists(&self, node: &Node) -> bool {
        let Some(instance_id) = node.instance_id() else {
            return false;
        };

        let stale = {
            let inventory = self.inventory.lock();
            node.last_registered_at()
                .is_some_and(|registered| registered > inventory.refreshed_at)
        };
        if stale {
            self.refresh().await;
            debug!(pool = %self.pool, instance_id, node_id = %node.id, "refreshed inventory for node");
        }

        let mut inventory = self.inventory.lock();
        match inventory.instances.get_mut(instance_id) {
            Some(seen) => {
                *seen = true;
                true
            }
            None => false,
        }
    }

    async fn remove_nodes(&self, nodes: &[Node]) -> Result<()> {
        let instance_ids: Vec<String> = nodes
            .iter()
            .filter_map(|n| n.instance_id().map(str::to_string))
            .collect();
        self.remove_instances(&instance_ids).await
    }

    async fn update_nodes(
        &self,
        ctx: &ScaleContext,
        current: &[Node],
        desired_total: usize,
    ) -> Result<()> {
        let in_pool: HashSet<&str> = current.iter().filter_map(Node::instance_id).collect();

        let desynced: Vec<String> = {
            let inventory = self.inventory.lock();
            inventory
                .instances
                .iter()
                .filter(|(id, seen)| **seen && !in_pool.contains(id.as_str()))
                .map(|(id, _)| id.clone())
                .collect()
        };
        if !desynced.is_empty() {
            warn!(
                pool = %self.pool,
                tracked = self.tracked(),
                confirmed = current.len(),
                "pool lost track of instances, removing them"
            );
            if let Err(e) = self.remove_instances(&desynced).await {
                warn!(pool = %self.pool, error = %e, "desynced instance removal incomplete");
            }
        }

        let (request, increment) = {
            let mut inventory = self.inventory.lock();
            let tracked = inventory.instances.len() + inventory.in_flight_total();
            if desired_total < tracked {
                return Err(PoolError::Overprovisioned {
                    desired: desired_total,
                    tracked,
                });
            }
            let increment = desired_total - tracked;
            if increment == 0 {
                return Ok(());
            }
            let request = inventory.next_request;
            inventory.next_request += 1;
            inventory.in_flight.insert(request, increment);
            (request, increment)
        };

        info!(pool = %self.pool, desired_total, increment, "requesting instances");
        self.spawn_growth(ctx, request, increment);
        Ok(())
    }
}
