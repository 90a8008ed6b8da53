//! Cluster manager client for the ondemand scaler.
//!
//! This crate provides the [`ClusterApi`] trait and its HTTP implementation.
//! It handles:
//!
//! - Reads of namespaces, evaluations, nodes, allocations, jobs and job
//!   summaries, each returned with its [`QueryMeta`]
//! - Stale-read policy: follower answers that are too old are redone against
//!   the leader ([`stale`])
//! - Node drains
//! - The newline-delimited event stream of evaluation, node and allocation
//!   changes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Debouncer / ingestion / GC (control plane)            │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   stale::fresh / with_retry                      │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      dyn ClusterApi                              │
//! │   HttpClusterClient (reqwest)          MockClusterApi (tests)    │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                   cluster manager HTTP API
//! ```
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use ondemand_scaler_cluster::{ClusterApi, ClusterEvent, HttpClusterClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClusterClient::new("http://127.0.0.1:4646", None)?;
//! let mut events = client.event_stream(0).await?;
//! while let Some(batch) = events.next().await {
//!     for event in batch?.events {
//!         if let ClusterEvent::Evaluation(eval) = event {
//!             println!("{} {:?}", eval.chain_key(), eval.status);
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for [`MockClusterApi`], an in-memory
//! cluster with a controllable event stream.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod error;
pub mod http;
pub mod stale;
pub mod wire;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use api::{
    ClusterApi, ClusterEvent, EventBatch, EventStream, NodeStub, QueryMeta, QueryOptions,
};
pub use error::{ClusterError, Result};
pub use http::HttpClusterClient;
pub use stale::StalePolicy;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockClusterApi;
