//! Pool selection for a job.
//!
//! Each pool is represented by one node synthesized from its spec and named
//! after the pool, so oracle answers map straight back to pools.

use std::collections::BTreeMap;
use std::sync::Arc;

use ondemand_scaler_core::{Job, Node, NodeId};
use ondemand_scaler_oracle::SchedulingOracle;
use ondemand_scaler_pool::Pool;

/// Synthesized nodes of the pools whose datacenter and job constraints admit
/// `job`.
fn admitted_nodes(oracle: &dyn SchedulingOracle, job: &Job, pools: &[Arc<Pool>]) -> Vec<Node> {
    pools
        .iter()
        .map(|pool| pool.spec().synthesize_node(NodeId::new(pool.name())))
        .filter(|node| oracle.admits_job(job, node))
        .collect()
}

/// Whether every task group of `job` passes the constraint, driver and
/// device filters of at least one pool.
///
/// Size is not checked here. A task group too large for every pool is left
/// to [`optimal_pools`], which omits it.
#[must_use]
pub fn job_feasible(oracle: &dyn SchedulingOracle, job: &Job, pools: &[Arc<Pool>]) -> bool {
    let nodes = admitted_nodes(oracle, job, pools);
    !nodes.is_empty()
        && job.task_groups.iter().all(|tg| {
            nodes
                .iter()
                .any(|node| oracle.satisfies_task_group(job, tg, node))
        })
}

/// The pool each task group should grow, keyed by task group name.
///
/// The oracle picks the best pool across all of them; within that pool's
/// compute class the smallest feasible pool by cpu then memory wins. Task
/// groups no pool can host are absent.
#[must_use]
pub fn optimal_pools(
    oracle: &dyn SchedulingOracle,
    job: &Job,
    pools: &[Arc<Pool>],
) -> BTreeMap<String, Arc<Pool>> {
    let nodes = admitted_nodes(oracle, job, pools);
    let by_name: BTreeMap<&str, &Arc<Pool>> = pools.iter().map(|p| (p.name(), p)).collect();
    let mut chosen = BTreeMap::new();

    for tg in &job.task_groups {
        let Some(best) = oracle.select_node(job, tg, &nodes, &[]) else {
            continue;
        };
        let Some(best_pool) = by_name.get(best.as_str()) else {
            continue;
        };
        let class = best_pool.spec().compute_class();

        let smallest = nodes
            .iter()
            .filter(|node| oracle.fits_task_group(job, tg, node))
            .filter_map(|node| by_name.get(node.id.as_str()))
            .filter(|pool| pool.spec().compute_class() == class)
            .min_by_key(|pool| {
                let resources = pool.spec().resources();
                (resources.cpu_mhz, resources.memory_mb)
            })
            .unwrap_or(best_pool);
        chosen.insert(tg.name.clone(), Arc::clone(*smallest));
    }

    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use ondemand_scaler_core::{Constraint, Resources, Task, TaskGroup};
    use ondemand_scaler_oracle::BinPackOracle;
    use ondemand_scaler_pool::{parse_pool_specs, MockProvider};

    fn pools(yaml: &str) -> Vec<Arc<Pool>> {
        parse_pool_specs(yaml)
            .unwrap()
            .into_iter()
            .map(|spec| Arc::new(Pool::new(spec, Arc::new(MockProvider::new()))))
            .collect()
    }

    fn group(name: &str, cpu: u64, mem: u64) -> TaskGroup {
        TaskGroup {
            name: name.into(),
            count: 1,
            constraints: Vec::new(),
            tasks: vec![Task {
                name: name.into(),
                driver: "docker".into(),
                constraints: Vec::new(),
                resources: Resources::new(cpu, mem, 0),
                devices: Vec::new(),
            }],
            ephemeral_disk_mb: 300,
        }
    }

    fn job(groups: Vec<TaskGroup>) -> Job {
        Job {
            id: "shop".into(),
            namespace: "default".into(),
            name: "shop".into(),
            datacenters: vec!["dc1".into()],
            constraints: Vec::new(),
            task_groups: groups,
        }
    }

    const POOLS: &str = "
- {cpu: 8000, mem: 16GiB, datacenter: dc1, drivers: [docker], provider: {name: anynode}}
- {cpu: 2000, mem: 4GiB, datacenter: dc1, drivers: [docker], provider: {name: anynode}}
- {cpu: 4000, mem: 8GiB, datacenter: dc1, drivers: [docker], meta.tier: batch, provider: {name: anynode}}
- {cpu: 16000, mem: 32GiB, datacenter: dc2, drivers: [docker], provider: {name: anynode}}
";

    #[test]
    fn feasibility_checks_filters_not_size() {
        let pools = pools(POOLS);
        let oracle = BinPackOracle::new();

        assert!(job_feasible(&oracle, &job(vec![group("web", 1000, 512)]), &pools));
        // "huge" fits no dc1 pool but still passes their filters.
        let oversized = job(vec![group("web", 1000, 512), group("huge", 12000, 1024)]);
        assert!(job_feasible(&oracle, &oversized, &pools));
        let chosen = optimal_pools(&oracle, &oversized, &pools);
        assert_eq!(chosen.keys().collect::<Vec<_>>(), vec!["web"]);

        let mut wrong_driver = job(vec![group("web", 1000, 512), group("batch", 500, 256)]);
        wrong_driver.task_groups[1].tasks[0].driver = "exec".into();
        assert!(!job_feasible(&oracle, &wrong_driver, &pools));

        let mut constrained = job(vec![group("web", 1000, 512)]);
        constrained
            .constraints
            .push(Constraint::new("${meta.tier}", "=", "realtime"));
        assert!(!job_feasible(&oracle, &constrained, &pools));
    }

    #[test]
    fn smallest_pool_of_the_chosen_class_wins() {
        let pools = pools(POOLS);
        let oracle = BinPackOracle::new();
        let chosen = optimal_pools(
            &oracle,
            &job(vec![group("web", 1000, 512), group("db", 6000, 2048)]),
            &pools,
        );

        assert_eq!(chosen["web"].spec().resources().cpu_mhz, 2000);
        assert_eq!(chosen["db"].spec().resources().cpu_mhz, 8000);
    }

    #[test]
    fn groups_without_a_pool_are_absent() {
        let pools = pools(POOLS);
        let oracle = BinPackOracle::new();
        let chosen = optimal_pools(
            &oracle,
            &job(vec![group("web", 1000, 512), group("huge", 12000, 1024)]),
            &pools,
        );
        assert!(chosen.contains_key("web"));
        assert!(!chosen.contains_key("huge"));
    }
}
