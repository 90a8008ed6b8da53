//! Eval-chain debouncer.
//!
//! Turns the stream of scheduling evaluations into at most one in-flight
//! [`ScalingEvent`] per job.
//!
//! Blocked evaluations of a job form a chain ordered by create index. Every
//! structural change to a chain restarts the settle timer; only when the
//! timer fires are chains advanced past resolved evaluations and demand
//! computed. A burst of evaluations therefore produces one decision once it
//! quiesces.
//!
//! ```text
//!   evals ──► observe() ──► chains ──(settle timer)──► settle()
//!                                                        │
//!                  resolved chain: queue.remove / ctx.cancel
//!                  active chain:   job + summary ──► ScalingQueue
//!   done(key) ◄──────────────────── workers
//! ```
//!
//! The timer has no upper bound: a steady stream of new blocked evaluations
//! keeps postponing the settle indefinitely.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ondemand_scaler_cluster::stale::with_retry_or_missing;
use ondemand_scaler_core::{ChainKey, EvalId, Evaluation, Job, ScaleContext, TaskGroupSummary};
use ondemand_scaler_pool::Pool;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::event::{ScalingEvent, TaskGroupDemand};
use crate::placement;

/// What a settle pass found.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Chains with no blocked evaluation left; already dropped.
    pub resolved: Vec<ChainKey>,
    /// Chains still blocked, with their head evaluation.
    pub active: Vec<(ChainKey, Evaluation)>,
}

/// Blocked-evaluation chains per job.
///
/// The head of a chain is the oldest evaluation not yet seen resolved;
/// members are strictly increasing in create index.
#[derive(Debug, Default)]
pub struct EvalChains {
    evals: HashMap<EvalId, Evaluation>,
    chains: BTreeMap<ChainKey, Vec<EvalId>>,
}

impl EvalChains {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an evaluation. Returns `true` if a chain changed and the
    /// settle timer must restart.
    pub fn observe(&mut self, eval: Evaluation) -> bool {
        let key = eval.chain_key();

        if let Some(chain) = self.chains.get_mut(&key) {
            if !chain.contains(&eval.id) {
                let tail_index = chain
                    .last()
                    .and_then(|id| self.evals.get(id))
                    .map_or(0, |tail| tail.create_index);
                if eval.create_index <= tail_index {
                    return true;
                }
                debug!(chain = %key, eval_id = %eval.id, len = chain.len() + 1, "eval appended to chain");
                chain.push(eval.id.clone());
            }
            self.evals.insert(eval.id.clone(), eval);
            return true;
        }

        if eval.is_blocked() {
            debug!(chain = %key, eval_id = %eval.id, "chain started");
            self.chains.insert(key, vec![eval.id.clone()]);
            self.evals.insert(eval.id.clone(), eval);
            return true;
        }
        false
    }

    /// Advance every chain past resolved evaluations and drop the empty
    /// ones.
    pub fn settle(&mut self) -> Settlement {
        let mut settlement = Settlement::default();

        for (key, chain) in &mut self.chains {
            let first_blocked = chain
                .iter()
                .position(|id| self.evals.get(id).is_some_and(Evaluation::is_blocked))
                .unwrap_or(chain.len());
            if first_blocked > 0 {
                chain.drain(..first_blocked);
                debug!(chain = %key, len = chain.len(), "chain advanced");
            }

            match chain.first().and_then(|id| self.evals.get(id)) {
                Some(head) => settlement.active.push((key.clone(), head.clone())),
                None => settlement.resolved.push(key.clone()),
            }
        }

        self.chains.retain(|_, chain| !chain.is_empty());
        let members: HashSet<&EvalId> = self.chains.values().flatten().collect();
        self.evals.retain(|id, _| members.contains(id));
        settlement
    }

    /// Forget a chain and its evaluations.
    pub fn drop_chain(&mut self, key: &ChainKey) {
        if let Some(chain) = self.chains.remove(key) {
            for id in chain {
                self.evals.remove(&id);
            }
            debug!(chain = %key, "chain dropped");
        }
    }

    /// Members of a chain, head first.
    #[must_use]
    pub fn chain(&self, key: &ChainKey) -> Option<&[EvalId]> {
        self.chains.get(key).map(Vec::as_slice)
    }

    /// Create index of a tracked evaluation.
    #[must_use]
    pub fn create_index(&self, id: &EvalId) -> Option<u64> {
        self.evals.get(id).map(|e| e.create_index)
    }

    /// Number of chains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Whether no chain is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// The debouncer task.
pub struct Debouncer {
    app: Arc<AppContext>,
    evals: mpsc::UnboundedReceiver<Evaluation>,
    done: mpsc::UnboundedReceiver<ChainKey>,
    chains: EvalChains,
    fired: HashMap<ChainKey, ScaleContext>,
    settle_delay: Duration,
}

impl Debouncer {
    /// Create the debouncer. `evals` carries every evaluation from the
    /// cluster; `done` carries the chain key of every finished scaling event.
    #[must_use]
    pub fn new(
        app: Arc<AppContext>,
        evals: mpsc::UnboundedReceiver<Evaluation>,
        done: mpsc::UnboundedReceiver<ChainKey>,
    ) -> Self {
        let settle_delay = app.config.scaling.settle_delay;
        Self {
            app,
            evals,
            done,
            chains: EvalChains::new(),
            fired: HashMap::new(),
            settle_delay,
        }
    }

    /// Run until shutdown or until the evaluation channel closes.
    pub async fn run(mut self) {
        let settle = tokio::time::sleep(self.settle_delay);
        tokio::pin!(settle);
        let mut armed = false;

        loop {
            tokio::select! {
                () = self.app.shutdown.cancelled() => break,
                eval = self.evals.recv() => {
                    let Some(eval) = eval else { break };
                    if self.chains.observe(eval) {
                        settle.as_mut().reset(Instant::now() + self.settle_delay);
                        armed = true;
                    }
                }
                Some(key) = self.done.recv() => {
                    debug!(chain = %key, "scaling event finished");
                    self.fired.remove(&key);
                }
                () = &mut settle, if armed => {
                    armed = false;
                    self.settle().await;
                }
            }
        }
        info!("eval debouncer stopped");
    }

    async fn settle(&mut self) {
        let Settlement { resolved, active } = self.chains.settle();

        for key in resolved {
            if self.app.queue.remove(&key) {
                self.fired.remove(&key);
                info!(chain = %key, "demand resolved, queued scaling event cancelled");
            } else if let Some(ctx) = self.fired.get(&key) {
                ctx.cancel();
                info!(chain = %key, "demand resolved, in-flight scaling event cancelled");
            }
        }

        for (key, head) in active {
            if self.fired.contains_key(&key) {
                continue;
            }
            // Cluster reads retry without limit, so shutdown must cut them short.
            let fired = tokio::select! {
                () = self.app.shutdown.cancelled() => return,
                fired = self.fire(&key, &head) => fired,
            };
            match fired {
                Some(event) => {
                    self.fired.insert(key.clone(), event.ctx.clone());
                    self.app.queue.enqueue(key, event);
                }
                None => self.chains.drop_chain(&key),
            }
        }
    }

    /// Build the scaling event for an active chain, or `None` if the chain
    /// should be dropped.
    async fn fire(&self, key: &ChainKey, head: &Evaluation) -> Option<ScalingEvent> {
        let app = Arc::clone(&self.app);
        let cluster = app.cluster.as_ref();
        let policy = app.stale_policy();
        let (namespace, job_id) = (key.namespace(), key.job_id());
        let what = format!("job {key}");

        let Some((job, _)) =
            with_retry_or_missing(&policy, &what, move |opts| cluster.job(namespace, job_id, opts))
                .await
        else {
            info!(chain = %key, "job no longer exists");
            return None;
        };

        if !placement::job_feasible(app.oracle.as_ref(), &job, &app.pools) {
            debug!(chain = %key, "job constraints match no pool, chain skipped");
            return None;
        }
        let pools = placement::optimal_pools(app.oracle.as_ref(), &job, &app.pools);

        let (evals, _) = with_retry_or_missing(&policy, &what, move |opts| {
            cluster.job_evaluations(namespace, job_id, opts)
        })
        .await?;
        let latest = evals
            .into_iter()
            .max_by_key(|e| e.create_index)
            .unwrap_or_else(|| head.clone());

        let (summary, _) = with_retry_or_missing(&policy, &what, move |opts| {
            cluster.job_summary(namespace, job_id, opts)
        })
        .await?;

        let demand = self.demand(key, &job, &latest, &summary.task_groups, &pools);
        if demand.is_empty() {
            warn!(chain = %key, "blocked chain has no queued task group with failed placement");
            return None;
        }

        let ctx = ScaleContext::child_of(&app.shutdown, app.config.hung_prevention.deadline());
        info!(
            chain = %key,
            evals = ?self.chains.chain(key).unwrap_or_default(),
            demand = ?demand.iter().map(|(tg, d)| (tg.as_str(), d.unallocated)).collect::<Vec<_>>(),
            "firing scaling event"
        );

        Some(ScalingEvent {
            key: key.clone(),
            job,
            fired_at: Instant::now(),
            demand,
            ctx,
        })
    }

    fn demand(
        &self,
        key: &ChainKey,
        job: &Job,
        latest: &Evaluation,
        summary: &BTreeMap<String, TaskGroupSummary>,
        pools: &BTreeMap<String, Arc<Pool>>,
    ) -> BTreeMap<String, TaskGroupDemand> {
        let mut demand = BTreeMap::new();
        for (tg, counts) in summary {
            if !latest.failed_tg_allocs.contains(tg) || job.task_group(tg).is_none() {
                continue;
            }
            let Some(pool) = pools.get(tg) else {
                warn!(chain = %key, task_group = %tg, "no pool suits the task group, demand skipped");
                self.app.stats.inc_no_suited();
                continue;
            };
            if counts.queued > 0 {
                demand.insert(
                    tg.clone(),
                    TaskGroupDemand {
                        unallocated: counts.queued,
                        pool: Arc::clone(pool),
                    },
                );
            }
        }
        demand
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ondemand_scaler_core::EvalStatus;
    use proptest::prelude::*;

    fn eval(job: &str, index: u64, status: EvalStatus) -> Evaluation {
        Evaluation {
            id: EvalId::new(format!("{job}-{index}")),
            namespace: "default".into(),
            job_id: job.into(),
            status,
            create_index: index,
            failed_tg_allocs: std::iter::once("web".to_string()).collect(),
        }
    }

    fn key(job: &str) -> ChainKey {
        ChainKey::new("default", job)
    }

    fn ids(chains: &EvalChains, job: &str) -> Vec<String> {
        chains
            .chain(&key(job))
            .unwrap_or_default()
            .iter()
            .map(|id| id.as_str().to_string())
            .collect()
    }

    #[test]
    fn unrelated_complete_eval_does_not_arm_timer() {
        let mut chains = EvalChains::new();
        assert!(!chains.observe(eval("shop", 1, EvalStatus::Complete)));
        assert!(chains.is_empty());
    }

    #[test]
    fn chain_grows_only_forward() {
        let mut chains = EvalChains::new();
        assert!(chains.observe(eval("shop", 5, EvalStatus::Blocked)));
        assert!(chains.observe(eval("shop", 7, EvalStatus::Blocked)));
        // Older than the tail: not appended, but still a chain change.
        assert!(chains.observe(eval("shop", 6, EvalStatus::Blocked)));
        // Already a member.
        assert!(chains.observe(eval("shop", 5, EvalStatus::Blocked)));

        assert_eq!(ids(&chains, "shop"), vec!["shop-5", "shop-7"]);
    }

    #[test]
    fn settle_advances_head_past_resolved_evals() {
        let mut chains = EvalChains::new();
        chains.observe(eval("shop", 1, EvalStatus::Blocked));
        chains.observe(eval("shop", 2, EvalStatus::Blocked));
        chains.observe(eval("shop", 1, EvalStatus::Complete));

        let settlement = chains.settle();
        assert!(settlement.resolved.is_empty());
        assert_eq!(settlement.active.len(), 1);
        assert_eq!(settlement.active[0].1.create_index, 2);
        assert_eq!(ids(&chains, "shop"), vec!["shop-2"]);
        assert_eq!(chains.create_index(&EvalId::new("shop-1")), None);
    }

    #[test]
    fn chain_without_blocked_members_resolves() {
        let mut chains = EvalChains::new();
        chains.observe(eval("shop", 1, EvalStatus::Blocked));
        chains.observe(eval("shop", 2, EvalStatus::Complete));
        chains.observe(eval("shop", 1, EvalStatus::Canceled));
        chains.observe(eval("cart", 3, EvalStatus::Blocked));

        let settlement = chains.settle();
        assert_eq!(settlement.resolved, vec![key("shop")]);
        assert_eq!(settlement.active[0].0, key("cart"));
        assert_eq!(chains.len(), 1);
        assert!(chains.chain(&key("shop")).is_none());
    }

    #[test]
    fn dropped_chain_restarts_on_next_blocked_eval() {
        let mut chains = EvalChains::new();
        chains.observe(eval("shop", 1, EvalStatus::Blocked));
        chains.drop_chain(&key("shop"));
        assert!(chains.is_empty());

        assert!(chains.observe(eval("shop", 2, EvalStatus::Blocked)));
        assert_eq!(ids(&chains, "shop"), vec!["shop-2"]);
    }

    fn status() -> impl Strategy<Value = EvalStatus> {
        prop_oneof![
            3 => Just(EvalStatus::Blocked),
            1 => Just(EvalStatus::Complete),
            1 => Just(EvalStatus::Canceled),
            1 => Just(EvalStatus::Pending),
        ]
    }

    proptest! {
        #[test]
        fn chains_stay_unique_and_ordered(
            deliveries in prop::collection::vec(
                (prop::sample::select(vec!["shop", "cart"]), 1u64..40, status(), any::<bool>()),
                1..80,
            )
        ) {
            let mut chains = EvalChains::new();
            for (job, index, status, settle) in deliveries {
                chains.observe(eval(job, index, status));
                if settle {
                    chains.settle();
                }

                for job in ["shop", "cart"] {
                    let members = chains.chain(&key(job)).unwrap_or_default();
                    let unique: HashSet<_> = members.iter().collect();
                    prop_assert_eq!(unique.len(), members.len());

                    let indices: Vec<u64> = members
                        .iter()
                        .map(|id| chains.create_index(id).unwrap())
                        .collect();
                    prop_assert!(indices.windows(2).all(|w| w[0] < w[1]));
                }
            }
        }
    }
}
