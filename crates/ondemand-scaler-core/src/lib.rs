//! Core types for the ondemand scaler.
//!
//! This crate provides the foundational types shared by every other crate in
//! the workspace:
//!
//! - **Identifiers**: Strongly-typed ids for nodes, allocations, evaluations
//!   and eval chains
//! - **Domain model**: Nodes, allocations, evaluations, jobs and job summaries
//!   as seen by the cluster manager
//! - **Variant**: The tagged-union value type used for pool specifications,
//!   with structural hashing for compute-class fingerprints
//! - **Scale context**: Cooperative cancellation with an optional deadline
//! - **Error types**: Common error definitions
//!
//! # Example
//!
//! ```
//! use ondemand_scaler_core::{ChainKey, NodeId};
//!
//! let key = ChainKey::new("default", "web");
//! assert_eq!(key.to_string(), "default/web");
//!
//! let node_id = NodeId::generate();
//! assert_eq!(node_id.as_str().len(), 36);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod context;
pub mod error;
pub mod ids;
pub mod model;
pub mod variant;

pub use context::{ContextError, ScaleContext};
pub use error::{CoreError, Result};
pub use ids::{AllocId, ChainKey, EvalId, NodeId};
pub use model::{
    Allocation, ClientStatus, Constraint, DesiredStatus, DeviceGroup, DeviceInstance,
    DeviceRequest, DriverInfo, EvalStatus, Evaluation, Job, JobSummary, Node, NodeEvent,
    NodeStatus, Resources, SchedulingEligibility, Task, TaskGroup, TaskGroupSummary,
};
pub use variant::Variant;
