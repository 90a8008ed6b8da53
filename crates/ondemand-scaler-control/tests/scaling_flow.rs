//! Blocked evaluation to pool update, end to end against in-memory doubles.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use ondemand_scaler_cluster::mock::MockClusterApi;
use ondemand_scaler_control::workers::run_worker;
use ondemand_scaler_control::{AppContext, Debouncer, ScalerConfig};
use ondemand_scaler_core::{
    AllocId, Allocation, ChainKey, ClientStatus, DesiredStatus, EvalId, EvalStatus, Evaluation,
    Job, JobSummary, NodeId, Resources, Task, TaskGroup, TaskGroupSummary,
};
use ondemand_scaler_oracle::BinPackOracle;
use ondemand_scaler_pool::{parse_pool_specs, MockProvider, Pool};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const POOLS: &str =
    "- {cpu: 4000, mem: 8GiB, datacenter: dc1, drivers: [docker], provider: {name: anynode}}";

struct Harness {
    app: Arc<AppContext>,
    cluster: Arc<MockClusterApi>,
    provider: Arc<MockProvider>,
    evals: mpsc::UnboundedSender<Evaluation>,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    fn start(workers: usize) -> Self {
        let cluster = Arc::new(MockClusterApi::new());
        let provider = Arc::new(MockProvider::new());
        let spec = parse_pool_specs(POOLS).unwrap().remove(0);
        let pool = Arc::new(
            Pool::new(spec, Arc::clone(&provider) as _).with_idle_timeout(Duration::from_secs(10)),
        );
        let app = Arc::new(AppContext::new(
            ScalerConfig::default(),
            vec![pool],
            Arc::clone(&cluster) as _,
            Arc::new(BinPackOracle::new()),
            workers,
        ));

        cluster.put_job(job());
        cluster.put_summary(JobSummary {
            job_id: "shop".into(),
            namespace: "default".into(),
            task_groups: BTreeMap::from([(
                "web".to_string(),
                TaskGroupSummary {
                    queued: 3,
                    ..TaskGroupSummary::default()
                },
            )]),
        });

        let (eval_tx, eval_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let mut tasks = vec![tokio::spawn(
            Debouncer::new(Arc::clone(&app), eval_rx, done_rx).run(),
        )];
        for id in 0..workers {
            tasks.push(tokio::spawn(run_worker(Arc::clone(&app), id, done_tx.clone())));
        }

        Self {
            app,
            cluster,
            provider,
            evals: eval_tx,
            tasks,
        }
    }

    fn pool(&self) -> &Arc<Pool> {
        &self.app.pools[0]
    }

    fn send(&self, eval: Evaluation) {
        self.cluster.add_evaluation(eval.clone());
        self.evals.send(eval).unwrap();
    }

    async fn stop(self) {
        self.app.shutdown.cancel();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

fn job() -> Job {
    Job {
        id: "shop".into(),
        namespace: "default".into(),
        name: "shop".into(),
        datacenters: vec!["dc1".into()],
        constraints: Vec::new(),
        task_groups: vec![TaskGroup {
            name: "web".into(),
            count: 3,
            constraints: Vec::new(),
            tasks: vec![Task {
                name: "server".into(),
                driver: "docker".into(),
                constraints: Vec::new(),
                resources: Resources::new(3000, 1024, 0),
                devices: Vec::new(),
            }],
            ephemeral_disk_mb: 300,
        }],
    }
}

fn eval(id: &str, status: EvalStatus, create_index: u64) -> Evaluation {
    Evaluation {
        id: EvalId::new(id),
        namespace: "default".into(),
        job_id: "shop".into(),
        status,
        create_index,
        failed_tg_allocs: BTreeSet::from(["web".to_string()]),
    }
}

fn placed(id: &str, node: &NodeId) -> Allocation {
    Allocation {
        id: AllocId::new(id),
        name: format!("shop.web[{id}]"),
        namespace: "default".into(),
        job_id: "shop".into(),
        task_group: "web".into(),
        node_id: node.clone(),
        desired_status: DesiredStatus::Run,
        client_status: ClientStatus::Running,
        resources: Resources::new(3000, 1024, 0),
        devices: Vec::new(),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(11)).await;
}

#[tokio::test(start_paused = true)]
async fn blocked_eval_grows_the_pool_until_allocations_land() {
    let h = Harness::start(1);
    h.send(eval("e1", EvalStatus::Blocked, 10));
    settle().await;

    // One instance per 4000 MHz node.
    assert_eq!(h.provider.update_calls(), vec![3]);
    assert_eq!(h.pool().tentative_counts(), (3, 3));

    for i in 0..3 {
        let node = h.pool().spec().synthesize_node(NodeId::new(format!("real-{i}")));
        let id = node.id.clone();
        assert!(h.pool().try_node(node).await);
        assert!(h.pool().try_alloc(placed(&format!("a{i}"), &id)));
    }
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(h.pool().tentative_counts(), (0, 0));
    assert_eq!(h.pool().waiters(), 0);
    assert_eq!(h.app.stats.snapshot().free_scaling_threads, 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn burst_of_evals_fires_once() {
    let h = Harness::start(1);
    for i in 0..5 {
        h.send(eval(&format!("e{i}"), EvalStatus::Blocked, 10 + i));
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
    assert!(h.provider.update_calls().is_empty());

    settle().await;
    assert_eq!(h.provider.update_calls(), vec![3]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn resolved_chain_cancels_the_queued_event() {
    let h = Harness::start(0);
    let key = ChainKey::new("default", "shop");

    h.send(eval("e1", EvalStatus::Blocked, 10));
    settle().await;
    assert!(h.app.queue.contains(&key));

    h.send(eval("e1", EvalStatus::Complete, 10));
    settle().await;
    assert!(h.app.queue.is_empty());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn resolved_chain_cancels_the_inflight_update() {
    let h = Harness::start(1);
    h.send(eval("e1", EvalStatus::Blocked, 10));
    settle().await;
    assert_eq!(h.pool().tentative_counts(), (3, 3));

    h.send(eval("e1", EvalStatus::Complete, 10));
    settle().await;

    assert_eq!(h.pool().tentative_counts(), (0, 0));
    assert_eq!(h.pool().waiters(), 0);
    assert_eq!(h.app.stats.snapshot().scaling_timeouts, 0);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn deleted_job_drops_the_chain() {
    let h = Harness::start(1);
    let other = Evaluation {
        job_id: "gone".into(),
        ..eval("e9", EvalStatus::Blocked, 5)
    };
    h.send(other);
    settle().await;

    assert!(h.app.queue.is_empty());
    assert!(h.provider.update_calls().is_empty());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn oversized_group_is_skipped_and_the_rest_scales() {
    let h = Harness::start(1);
    let mut two_groups = job();
    let mut huge = two_groups.task_groups[0].clone();
    huge.name = "huge".into();
    huge.tasks[0].resources = Resources::new(12_000, 1024, 0);
    two_groups.task_groups.push(huge);
    h.cluster.put_job(two_groups);
    h.cluster.put_summary(JobSummary {
        job_id: "shop".into(),
        namespace: "default".into(),
        task_groups: BTreeMap::from([
            (
                "web".to_string(),
                TaskGroupSummary {
                    queued: 3,
                    ..TaskGroupSummary::default()
                },
            ),
            (
                "huge".to_string(),
                TaskGroupSummary {
                    queued: 2,
                    ..TaskGroupSummary::default()
                },
            ),
        ]),
    });

    h.send(Evaluation {
        failed_tg_allocs: BTreeSet::from(["web".to_string(), "huge".to_string()]),
        ..eval("e1", EvalStatus::Blocked, 10)
    });
    settle().await;

    assert_eq!(h.provider.update_calls(), vec![3]);
    assert_eq!(h.app.stats.snapshot().no_suited_events, 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_job_lookup_retries() {
    let h = Harness::start(1);
    h.cluster.fail_reads(usize::MAX);
    h.send(eval("e1", EvalStatus::Blocked, 10));
    settle().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let provider = Arc::clone(&h.provider);
    tokio::time::timeout(Duration::from_secs(60), h.stop())
        .await
        .expect("debouncer stops while the cluster is unreachable");
    assert!(provider.update_calls().is_empty());
}
