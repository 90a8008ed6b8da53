//! Best-fit bin-packing oracle.

use std::collections::HashMap;

use ondemand_scaler_core::{Allocation, Job, Node, NodeId, Resources, TaskGroup};

use crate::constraint::satisfies;
use crate::SchedulingOracle;

/// Constraint/driver/device feasibility plus best-fit placement.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinPackOracle;

impl BinPackOracle {
    /// Create the oracle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Resources and device instances already claimed on one node.
#[derive(Debug, Default)]
struct Usage {
    resources: Resources,
    devices: HashMap<String, u32>,
}

fn usage_by_node(planned: &[Allocation]) -> HashMap<&NodeId, Usage> {
    let mut usage: HashMap<&NodeId, Usage> = HashMap::new();
    for alloc in planned.iter().filter(|a| a.is_live()) {
        let entry = usage.entry(&alloc.node_id).or_default();
        entry.resources = entry.resources.add(&alloc.resources);
        for device in &alloc.devices {
            *entry.devices.entry(device.name.clone()).or_default() += device.count;
        }
    }
    usage
}

/// Whether the node's devices can serve every request of `tg` given `used`.
fn devices_fit(tg: &TaskGroup, node: &Node, used: Option<&Usage>) -> bool {
    tg.device_requests().iter().all(|request| {
        let available: usize = node
            .devices
            .iter()
            .filter(|group| group.matches(&request.name))
            .map(ondemand_scaler_core::DeviceGroup::healthy_count)
            .sum();
        let claimed = used
            .and_then(|u| u.devices.get(&request.name))
            .copied()
            .unwrap_or(0);
        available >= (claimed + request.count) as usize
    })
}

/// Average of cpu and memory utilization after adding `extra`.
#[allow(clippy::cast_precision_loss)]
fn fit_score(node: &Node, used: &Resources, extra: &Resources) -> f64 {
    let capacity = node.allocatable();
    let total = used.add(extra);
    let ratio = |used: u64, cap: u64| {
        if cap == 0 {
            1.0
        } else {
            used as f64 / cap as f64
        }
    };
    (ratio(total.cpu_mhz, capacity.cpu_mhz) + ratio(total.memory_mb, capacity.memory_mb)) / 2.0
}

impl SchedulingOracle for BinPackOracle {
    fn admits_job(&self, job: &Job, node: &Node) -> bool {
        let dc_ok = job.datacenters.is_empty()
            || job
                .datacenters
                .iter()
                .any(|dc| dc == "*" || *dc == node.datacenter);
        dc_ok && job.constraints.iter().all(|c| satisfies(c, node))
    }

    fn satisfies_task_group(&self, _job: &Job, tg: &TaskGroup, node: &Node) -> bool {
        if node.is_down() {
            return false;
        }
        let constraints_ok = tg
            .constraints
            .iter()
            .chain(tg.tasks.iter().flat_map(|t| &t.constraints))
            .all(|c| satisfies(c, node));
        let drivers_ok = tg.tasks.iter().all(|t| node.has_driver(&t.driver));

        constraints_ok && drivers_ok && devices_fit(tg, node, None)
    }

    fn fits_task_group(&self, job: &Job, tg: &TaskGroup, node: &Node) -> bool {
        self.satisfies_task_group(job, tg, node) && tg.requested().fits_in(&node.allocatable())
    }

    fn select_node(
        &self,
        job: &Job,
        tg: &TaskGroup,
        candidates: &[Node],
        planned: &[Allocation],
    ) -> Option<NodeId> {
        let usage = usage_by_node(planned);
        let request = tg.requested();
        let wants_devices = tg.wants_devices();

        let mut best: Option<(bool, f64, &Node)> = None;
        for node in self.feasible_nodes(job, tg, candidates) {
            let used = usage.get(&node.id);
            let used_resources = used.map(|u| u.resources).unwrap_or_default();
            if !used_resources.add(&request).fits_in(&node.allocatable()) {
                continue;
            }
            if !devices_fit(tg, node, used) {
                continue;
            }

            // Keep device nodes free for workloads that need them.
            let wastes_devices = !wants_devices && !node.devices.is_empty();
            let score = fit_score(node, &used_resources, &request);
            let better = match best {
                None => true,
                Some((best_wastes, best_score, _)) => {
                    (wastes_devices, -score) < (best_wastes, -best_score)
                }
            };
            if better {
                best = Some((wastes_devices, score, node));
            }
        }

        best.map(|(_, _, node)| node.id.clone())
    }
}
