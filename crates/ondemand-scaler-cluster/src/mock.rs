//! In-memory [`ClusterApi`] for tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use ondemand_scaler_core::{Allocation, Evaluation, Job, JobSummary, Node, NodeId};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::api::{ClusterApi, EventBatch, EventStream, NodeStub, QueryMeta, QueryOptions};
use crate::error::{ClusterError, Result};

type EventItem = Result<EventBatch>;

struct EventChannel {
    tx: mpsc::UnboundedSender<EventItem>,
    rx: Option<mpsc::UnboundedReceiver<EventItem>>,
}

impl EventChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct MockState {
    namespaces: Vec<String>,
    evaluations: Vec<Evaluation>,
    nodes: BTreeMap<NodeId, Node>,
    allocations: Vec<Allocation>,
    jobs: BTreeMap<(String, String), Job>,
    summaries: BTreeMap<(String, String), JobSummary>,
    drained: Vec<NodeId>,
    stream_requests: Vec<u64>,
    failing_reads: usize,
    consistent_reads: usize,
    last_contact: Duration,
    index: u64,
}

/// Cluster manager double backed by in-memory collections.
///
/// Events pushed with [`MockClusterApi::push_events`] are delivered to the
/// current subscription. [`MockClusterApi::close_events`] ends it; the next
/// [`ClusterApi::event_stream`] call receives a fresh one.
pub struct MockClusterApi {
    state: Mutex<MockState>,
    events: Mutex<EventChannel>,
}

impl Default for MockClusterApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClusterApi {
    /// Create an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            events: Mutex::new(EventChannel::new()),
        }
    }

    /// Register a namespace.
    pub fn add_namespace(&self, name: impl Into<String>) {
        self.state.lock().namespaces.push(name.into());
    }

    /// Register or replace a node.
    pub fn add_node(&self, node: Node) {
        self.state.lock().nodes.insert(node.id.clone(), node);
    }

    /// Register an allocation.
    pub fn add_allocation(&self, alloc: Allocation) {
        self.state.lock().allocations.push(alloc);
    }

    /// Register an evaluation.
    pub fn add_evaluation(&self, eval: Evaluation) {
        self.state.lock().evaluations.push(eval);
    }

    /// Register or replace a job.
    pub fn put_job(&self, job: Job) {
        let key = (job.namespace.clone(), job.id.clone());
        self.state.lock().jobs.insert(key, job);
    }

    /// Register or replace a job summary.
    pub fn put_summary(&self, summary: JobSummary) {
        let key = (summary.namespace.clone(), summary.job_id.clone());
        self.state.lock().summaries.insert(key, summary);
    }

    /// Raft index reported with every read.
    pub fn set_index(&self, index: u64) {
        self.state.lock().index = index;
    }

    /// Leader contact age reported with stale reads.
    pub fn set_last_contact(&self, last_contact: Duration) {
        self.state.lock().last_contact = last_contact;
    }

    /// Fail the next `count` reads with a 503.
    pub fn fail_reads(&self, count: usize) {
        self.state.lock().failing_reads = count;
    }

    /// Deliver a batch to the current subscription.
    pub fn push_events(&self, batch: EventBatch) {
        let _ = self.events.lock().tx.send(Ok(batch));
    }

    /// Deliver an error to the current subscription.
    pub fn push_stream_error(&self, message: impl Into<String>) {
        let _ = self
            .events
            .lock()
            .tx
            .send(Err(ClusterError::Stream(message.into())));
    }

    /// End the current subscription.
    pub fn close_events(&self) {
        *self.events.lock() = EventChannel::new();
    }

    /// Nodes drained so far, in order.
    #[must_use]
    pub fn drained(&self) -> Vec<NodeId> {
        self.state.lock().drained.clone()
    }

    /// Start indices of every event subscription.
    #[must_use]
    pub fn stream_requests(&self) -> Vec<u64> {
        self.state.lock().stream_requests.clone()
    }

    /// Number of reads that went to the leader.
    #[must_use]
    pub fn consistent_reads(&self) -> usize {
        self.state.lock().consistent_reads
    }

    fn answer<T>(
        &self,
        opts: QueryOptions,
        read: impl FnOnce(&MockState) -> Result<T>,
    ) -> Result<(T, QueryMeta)> {
        let mut state = self.state.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(ClusterError::Status {
                status: 503,
                path: "mock".into(),
                message: "no cluster leader".into(),
            });
        }
        if !opts.allow_stale {
            state.consistent_reads += 1;
        }
        let meta = QueryMeta {
            last_index: state.index,
            last_contact: if opts.allow_stale {
                state.last_contact
            } else {
                Duration::ZERO
            },
        };
        Ok((read(&state)?, meta))
    }
}

fn job_key(namespace: &str, id: &str) -> (String, String) {
    (namespace.to_string(), id.to_string())
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn list_namespaces(&self, opts: QueryOptions) -> Result<(Vec<String>, QueryMeta)> {
        self.answer(opts, |s| {
            Ok(if s.namespaces.is_empty() {
                vec!["default".to_string()]
            } else {
                s.namespaces.clone()
            })
        })
    }

    async fn list_evaluations(
        &self,
        namespace: &str,
        opts: QueryOptions,
    ) -> Result<(Vec<Evaluation>, QueryMeta)> {
        self.answer(opts, |s| {
            Ok(s.evaluations
                .iter()
                .filter(|e| e.namespace == namespace)
                .cloned()
                .collect())
        })
    }

    async fn list_nodes(&self, opts: QueryOptions) -> Result<(Vec<NodeStub>, QueryMeta)> {
        self.answer(opts, |s| {
            Ok(s.nodes
                .values()
                .map(|n| NodeStub {
                    id: n.id.clone(),
                    name: n.name.clone(),
                    status: n.status,
                })
                .collect())
        })
    }

    async fn node(&self, id: &NodeId, opts: QueryOptions) -> Result<(Node, QueryMeta)> {
        self.answer(opts, |s| {
            s.nodes
                .get(id)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound(format!("node {id}")))
        })
    }

    async fn node_allocations(
        &self,
        id: &NodeId,
        opts: QueryOptions,
    ) -> Result<(Vec<Allocation>, QueryMeta)> {
        self.answer(opts, |s| {
            Ok(s.allocations
                .iter()
                .filter(|a| &a.node_id == id)
                .cloned()
                .collect())
        })
    }

    async fn job(&self, namespace: &str, id: &str, opts: QueryOptions) -> Result<(Job, QueryMeta)> {
        self.answer(opts, |s| {
            s.jobs
                .get(&job_key(namespace, id))
                .cloned()
                .ok_or_else(|| ClusterError::NotFound(format!("job {namespace}/{id}")))
        })
    }

    async fn job_evaluations(
        &self,
        namespace: &str,
        id: &str,
        opts: QueryOptions,
    ) -> Result<(Vec<Evaluation>, QueryMeta)> {
        self.answer(opts, |s| {
            Ok(s.evaluations
                .iter()
                .filter(|e| e.namespace == namespace && e.job_id == id)
                .cloned()
                .collect())
        })
    }

    async fn job_summary(
        &self,
        namespace: &str,
        id: &str,
        opts: QueryOptions,
    ) -> Result<(JobSummary, QueryMeta)> {
        self.answer(opts, |s| {
            s.summaries
                .get(&job_key(namespace, id))
                .cloned()
                .ok_or_else(|| ClusterError::NotFound(format!("job summary {namespace}/{id}")))
        })
    }

    async fn drain_node(&self, id: &NodeId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(id) {
            return Err(ClusterError::NotFound(format!("node {id}")));
        }
        state.drained.push(id.clone());
        Ok(())
    }

    async fn event_stream(&self, index: u64) -> Result<EventStream> {
        self.state.lock().stream_requests.push(index);
        let rx = self
            .events
            .lock()
            .rx
            .take()
            .ok_or_else(|| ClusterError::Stream("subscription already open".into()))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}
