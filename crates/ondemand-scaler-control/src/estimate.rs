//! Estimating the nodes a burst of demand needs.
//!
//! The oracle bin-packs the requested instances onto the pool's tentative
//! nodes plus those already estimated for the same event. Whenever it finds
//! no room, one more node is synthesized from the pool spec and packing
//! continues, until every instance has a place.

use ondemand_scaler_core::{
    AllocId, Allocation, ClientStatus, DesiredStatus, Job, Node, NodeId, TaskGroup,
};
use ondemand_scaler_oracle::SchedulingOracle;
use ondemand_scaler_pool::Pool;

use crate::error::{Result, ScalerError};

/// Nodes and allocations planned for one pool.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Nodes to provision.
    pub nodes: Vec<Node>,
    /// Allocations expected to land on them.
    pub allocs: Vec<Allocation>,
}

impl Plan {
    /// Whether nothing is planned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.allocs.is_empty()
    }
}

/// Extend `plan` with the nodes and allocations `count` more instances of
/// `tg` need on `pool`. Returns the number of nodes added.
///
/// # Errors
///
/// Returns [`ScalerError::Unplaceable`] if an instance does not fit even on
/// a freshly synthesized node.
pub fn estimate(
    oracle: &dyn SchedulingOracle,
    pool: &Pool,
    job: &Job,
    tg: &TaskGroup,
    count: u32,
    plan: &mut Plan,
) -> Result<usize> {
    let (mut candidates, mut planned) = pool.tentative();
    candidates.extend(plan.nodes.iter().cloned());
    planned.extend(plan.allocs.iter().cloned());

    let resources = tg.requested();
    let devices = tg.device_requests();
    let added_before = plan.nodes.len();
    let mut placed = 0;
    let mut fresh_node = false;

    while placed < count {
        let Some(node_id) = oracle.select_node(job, tg, &candidates, &planned) else {
            if fresh_node {
                return Err(ScalerError::Unplaceable {
                    job: job.chain_key().to_string(),
                    task_group: tg.name.clone(),
                    pool: pool.name().to_string(),
                });
            }
            let node = pool.spec().synthesize_node(NodeId::generate());
            candidates.push(node.clone());
            plan.nodes.push(node);
            fresh_node = true;
            continue;
        };

        placed += 1;
        fresh_node = false;
        let alloc = Allocation {
            id: AllocId::generate(),
            name: format!("{}.{}[{placed}]", job.id, tg.name),
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            task_group: tg.name.clone(),
            node_id,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Pending,
            resources,
            devices: devices.clone(),
        };
        planned.push(alloc.clone());
        plan.allocs.push(alloc);
    }

    Ok(plan.nodes.len() - added_before)
}
