//! Scheduling oracle for the ondemand scaler.
//!
//! The scaler never decides *where* a workload runs; it only asks "would this
//! task group fit on these nodes" and "which node would the next instance land
//! on". This crate defines that narrow interface and a compact implementation
//! of it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  feasible_nodes / select_node  ┌──────────────────┐
//! │ Scaling workers │ ─────────────────────────────► │ SchedulingOracle │
//! │ Debouncer       │                                │  (BinPackOracle) │
//! └─────────────────┘                                └────────┬─────────┘
//!                                                             │
//!                                   ┌─────────────────────────┼───────────────┐
//!                                   ▼                         ▼               ▼
//!                            constraint checks         driver checks   device + resource fit
//! ```
//!
//! [`BinPackOracle`] filters candidates by datacenter, constraints, drivers
//! and devices, then picks the feasible node that would be most utilized after
//! placement (best fit), mirroring the cluster manager's own bin-packing
//! preference closely enough to estimate how many nodes a burst needs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod binpack;
pub mod constraint;

pub use binpack::BinPackOracle;

use ondemand_scaler_core::{Allocation, Job, Node, NodeId, TaskGroup};

/// Feasibility and placement decisions.
///
/// Implementations must be deterministic for a given input so that
/// estimates are reproducible.
pub trait SchedulingOracle: Send + Sync {
    /// Whether `node` passes the job-level filters (datacenter, job constraints).
    fn admits_job(&self, job: &Job, node: &Node) -> bool;

    /// Whether `node` passes the task group's constraint, driver and device
    /// filters. Resources are not considered.
    fn satisfies_task_group(&self, job: &Job, tg: &TaskGroup, node: &Node) -> bool;

    /// Whether one instance of `tg` could run on an otherwise empty `node`.
    fn fits_task_group(&self, job: &Job, tg: &TaskGroup, node: &Node) -> bool;

    /// Choose the node for one more instance of `tg`.
    ///
    /// `planned` holds allocations already placed or planned on the
    /// candidates; their resources count as used. Returns `None` when no
    /// candidate has room.
    fn select_node(
        &self,
        job: &Job,
        tg: &TaskGroup,
        candidates: &[Node],
        planned: &[Allocation],
    ) -> Option<NodeId>;

    /// Candidates on which one instance of `tg` could run if they were empty.
    fn feasible_nodes<'a>(&self, job: &Job, tg: &TaskGroup, candidates: &'a [Node]) -> Vec<&'a Node> {
        candidates
            .iter()
            .filter(|node| self.admits_job(job, node) && self.fits_task_group(job, tg, node))
            .collect()
    }
}
