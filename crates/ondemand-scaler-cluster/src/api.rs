//! The cluster manager API boundary.
//!
//! [`ClusterApi`] is everything the scaler reads from or asks of the cluster
//! manager. Reads return a [`QueryMeta`] alongside the value so callers can
//! tell how stale a follower's answer was.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use ondemand_scaler_core::{Allocation, Evaluation, Job, JobSummary, Node, NodeId, NodeStatus};

use crate::error::Result;

/// Options for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryOptions {
    /// Let any server answer, not only the leader.
    pub allow_stale: bool,
}

impl QueryOptions {
    /// Options for a read any server may answer.
    #[must_use]
    pub const fn stale() -> Self {
        Self { allow_stale: true }
    }

    /// Options for a read only the leader may answer.
    #[must_use]
    pub const fn consistent() -> Self {
        Self { allow_stale: false }
    }
}

/// Metadata returned with every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryMeta {
    /// Raft index the answer reflects.
    pub last_index: u64,
    /// Time since the answering server last heard from the leader.
    pub last_contact: Duration,
}

/// A node as listed, before its full record is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStub {
    /// Node id.
    pub id: NodeId,
    /// Node name.
    pub name: String,
    /// Node status.
    pub status: NodeStatus,
}

/// One change delivered by the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// An evaluation was created or updated.
    Evaluation(Evaluation),
    /// A node was registered or updated.
    Node(Node),
    /// An allocation was created or updated.
    Allocation(Allocation),
}

/// Events sharing one raft index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventBatch {
    /// Raft index of the batch.
    pub index: u64,
    /// Events in arrival order.
    pub events: Vec<ClusterEvent>,
}

/// Stream of event batches; ends when the server closes the connection.
pub type EventStream = BoxStream<'static, Result<EventBatch>>;

/// Read and control operations against the cluster manager.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List namespace names.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn list_namespaces(&self, opts: QueryOptions) -> Result<(Vec<String>, QueryMeta)>;

    /// List evaluations in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn list_evaluations(
        &self,
        namespace: &str,
        opts: QueryOptions,
    ) -> Result<(Vec<Evaluation>, QueryMeta)>;

    /// List every node.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn list_nodes(&self, opts: QueryOptions) -> Result<(Vec<NodeStub>, QueryMeta)>;

    /// Fetch the full record of a node.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ClusterError::NotFound`] if the node does not exist.
    async fn node(&self, id: &NodeId, opts: QueryOptions) -> Result<(Node, QueryMeta)>;

    /// List allocations bound to a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn node_allocations(
        &self,
        id: &NodeId,
        opts: QueryOptions,
    ) -> Result<(Vec<Allocation>, QueryMeta)>;

    /// Fetch a job.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ClusterError::NotFound`] if the job does not exist.
    async fn job(&self, namespace: &str, id: &str, opts: QueryOptions) -> Result<(Job, QueryMeta)>;

    /// List a job's evaluations.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn job_evaluations(
        &self,
        namespace: &str,
        id: &str,
        opts: QueryOptions,
    ) -> Result<(Vec<Evaluation>, QueryMeta)>;

    /// Fetch a job's per-task-group summary.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ClusterError::NotFound`] if the job does not exist.
    async fn job_summary(
        &self,
        namespace: &str,
        id: &str,
        opts: QueryOptions,
    ) -> Result<(JobSummary, QueryMeta)>;

    /// Start draining a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn drain_node(&self, id: &NodeId) -> Result<()>;

    /// Subscribe to evaluation, node and allocation events after `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be opened.
    async fn event_stream(&self, index: u64) -> Result<EventStream>;
}
