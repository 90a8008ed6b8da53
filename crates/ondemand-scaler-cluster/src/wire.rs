//! JSON shapes of the cluster manager HTTP API and their mapping into the
//! domain model.
//!
//! The API spells fields in `PascalCase` with upper-cased acronyms (`ID`,
//! `JobID`, `MemoryMB`) and sends `null` for empty collections, so every
//! collection field goes through [`nullable`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ondemand_scaler_core::{
    AllocId, Allocation, ClientStatus, Constraint, DesiredStatus, DeviceGroup, DeviceInstance,
    DeviceRequest, DriverInfo, EvalId, EvalStatus, Evaluation, Job, JobSummary, Node, NodeEvent,
    NodeId, NodeStatus, Resources, SchedulingEligibility, Task, TaskGroup, TaskGroupSummary,
};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::api::{ClusterEvent, EventBatch, NodeStub};
use crate::error::{ClusterError, Result};

const DEFAULT_NAMESPACE: &str = "default";

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn namespace_or_default(namespace: String) -> String {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        namespace
    }
}

// ============================================================================
// Namespaces
// ============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct WireNamespace {
    #[serde(rename = "Name")]
    pub name: String,
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct WireNodeStub {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Drain", default)]
    drain: bool,
}

impl From<WireNodeStub> for NodeStub {
    fn from(stub: WireNodeStub) -> Self {
        Self {
            status: node_status(&stub.status, stub.drain),
            id: NodeId::new(stub.id),
            name: stub.name,
        }
    }
}

fn node_status(status: &str, drain: bool) -> NodeStatus {
    if drain {
        return NodeStatus::Draining;
    }
    match status {
        "ready" => NodeStatus::Ready,
        "down" => NodeStatus::Down,
        "disconnected" => NodeStatus::Disconnected,
        _ => NodeStatus::Initializing,
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireCpu {
    #[serde(rename = "CpuShares", default)]
    cpu_shares: u64,
}

#[derive(Debug, Default, Deserialize)]
struct WireMemory {
    #[serde(rename = "MemoryMB", default)]
    memory_mb: u64,
}

#[derive(Debug, Default, Deserialize)]
struct WireDisk {
    #[serde(rename = "DiskMB", default)]
    disk_mb: u64,
}

#[derive(Debug, Default, Deserialize)]
struct WireAttribute {
    #[serde(rename = "String")]
    string: Option<String>,
    #[serde(rename = "Int")]
    int: Option<i64>,
    #[serde(rename = "Float")]
    float: Option<f64>,
    #[serde(rename = "Bool")]
    boolean: Option<bool>,
    #[serde(rename = "Unit", default)]
    unit: String,
}

impl WireAttribute {
    fn render(&self) -> String {
        let value = if let Some(s) = &self.string {
            s.clone()
        } else if let Some(i) = self.int {
            i.to_string()
        } else if let Some(f) = self.float {
            f.to_string()
        } else if let Some(b) = self.boolean {
            b.to_string()
        } else {
            String::new()
        };
        if self.unit.is_empty() {
            value
        } else {
            format!("{value} {}", self.unit)
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireDeviceInstance {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Healthy", default)]
    healthy: bool,
}

#[derive(Debug, Deserialize)]
struct WireDeviceGroup {
    #[serde(rename = "Vendor", default)]
    vendor: String,
    #[serde(rename = "Type", default)]
    device_type: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Instances", default, deserialize_with = "nullable")]
    instances: Vec<WireDeviceInstance>,
    #[serde(rename = "Attributes", default, deserialize_with = "nullable")]
    attributes: BTreeMap<String, WireAttribute>,
}

impl From<WireDeviceGroup> for DeviceGroup {
    fn from(group: WireDeviceGroup) -> Self {
        Self {
            vendor: group.vendor,
            device_type: group.device_type,
            name: group.name,
            instances: group
                .instances
                .into_iter()
                .map(|i| DeviceInstance {
                    id: i.id,
                    healthy: i.healthy,
                })
                .collect(),
            attributes: group
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.render()))
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireNodeResources {
    #[serde(rename = "Cpu", default, deserialize_with = "nullable")]
    cpu: WireCpu,
    #[serde(rename = "Memory", default, deserialize_with = "nullable")]
    memory: WireMemory,
    #[serde(rename = "Disk", default, deserialize_with = "nullable")]
    disk: WireDisk,
    #[serde(rename = "Devices", default, deserialize_with = "nullable")]
    devices: Vec<WireDeviceGroup>,
}

impl WireNodeResources {
    const fn resources(&self) -> Resources {
        Resources::new(self.cpu.cpu_shares, self.memory.memory_mb, self.disk.disk_mb)
    }
}

#[derive(Debug, Deserialize)]
struct WireDriver {
    #[serde(rename = "Detected", default)]
    detected: bool,
    #[serde(rename = "Healthy", default)]
    healthy: bool,
}

#[derive(Debug, Deserialize)]
struct WireNodeEvent {
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "Timestamp")]
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireNode {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Datacenter", default)]
    datacenter: String,
    #[serde(rename = "NodeClass", default)]
    node_class: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "SchedulingEligibility", default)]
    eligibility: String,
    #[serde(rename = "Drain", default)]
    drain: bool,
    #[serde(rename = "Attributes", default, deserialize_with = "nullable")]
    attributes: BTreeMap<String, String>,
    #[serde(rename = "Meta", default, deserialize_with = "nullable")]
    meta: BTreeMap<String, String>,
    #[serde(rename = "Links", default, deserialize_with = "nullable")]
    links: BTreeMap<String, String>,
    #[serde(rename = "Drivers", default, deserialize_with = "nullable")]
    drivers: BTreeMap<String, WireDriver>,
    #[serde(rename = "NodeResources", default, deserialize_with = "nullable")]
    node_resources: WireNodeResources,
    #[serde(rename = "ReservedResources", default, deserialize_with = "nullable")]
    reserved_resources: WireNodeResources,
    #[serde(rename = "Events", default, deserialize_with = "nullable")]
    events: Vec<WireNodeEvent>,
}

impl From<WireNode> for Node {
    fn from(node: WireNode) -> Self {
        let capacity = node.node_resources.resources();
        let reserved = node.reserved_resources.resources();
        Self {
            status: node_status(&node.status, node.drain),
            eligibility: if node.eligibility == "ineligible" {
                SchedulingEligibility::Ineligible
            } else {
                SchedulingEligibility::Eligible
            },
            id: NodeId::new(node.id),
            name: node.name,
            datacenter: node.datacenter,
            node_class: node.node_class,
            attributes: node.attributes,
            meta: node.meta,
            links: node.links,
            drivers: node
                .drivers
                .into_iter()
                .map(|(name, d)| {
                    (
                        name,
                        DriverInfo {
                            detected: d.detected,
                            healthy: d.healthy,
                        },
                    )
                })
                .collect(),
            capacity,
            reserved,
            devices: node
                .node_resources
                .devices
                .into_iter()
                .map(DeviceGroup::from)
                .collect(),
            events: node
                .events
                .into_iter()
                .map(|e| NodeEvent {
                    message: e.message,
                    timestamp: e.timestamp,
                })
                .collect(),
        }
    }
}

// ============================================================================
// Allocations
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireAllocatedDevice {
    #[serde(rename = "Vendor", default)]
    vendor: String,
    #[serde(rename = "Type", default)]
    device_type: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "DeviceIDs", default, deserialize_with = "nullable")]
    device_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireAllocatedTask {
    #[serde(rename = "Cpu", default, deserialize_with = "nullable")]
    cpu: WireCpu,
    #[serde(rename = "Memory", default, deserialize_with = "nullable")]
    memory: WireMemory,
    #[serde(rename = "Devices", default, deserialize_with = "nullable")]
    devices: Vec<WireAllocatedDevice>,
}

#[derive(Debug, Default, Deserialize)]
struct WireSharedResources {
    #[serde(rename = "DiskMB", default)]
    disk_mb: u64,
}

#[derive(Debug, Default, Deserialize)]
struct WireAllocatedResources {
    #[serde(rename = "Tasks", default, deserialize_with = "nullable")]
    tasks: BTreeMap<String, WireAllocatedTask>,
    #[serde(rename = "Shared", default, deserialize_with = "nullable")]
    shared: WireSharedResources,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAllocation {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Namespace", default)]
    namespace: String,
    #[serde(rename = "JobID", default)]
    job_id: String,
    #[serde(rename = "TaskGroup", default)]
    task_group: String,
    #[serde(rename = "NodeID", default)]
    node_id: String,
    #[serde(rename = "DesiredStatus")]
    desired_status: DesiredStatus,
    #[serde(rename = "ClientStatus")]
    client_status: ClientStatus,
    #[serde(rename = "AllocatedResources", default, deserialize_with = "nullable")]
    allocated_resources: WireAllocatedResources,
}

impl From<WireAllocation> for Allocation {
    fn from(alloc: WireAllocation) -> Self {
        let allocated = alloc.allocated_resources;
        let mut resources = Resources::new(0, 0, allocated.shared.disk_mb);
        let mut devices = Vec::new();
        for task in allocated.tasks.into_values() {
            resources = resources.add(&Resources::new(
                task.cpu.cpu_shares,
                task.memory.memory_mb,
                0,
            ));
            devices.extend(task.devices.into_iter().map(|d| DeviceRequest {
                name: format!("{}/{}/{}", d.vendor, d.device_type, d.name),
                count: u32::try_from(d.device_ids.len()).unwrap_or(u32::MAX),
            }));
        }

        Self {
            id: AllocId::new(alloc.id),
            name: alloc.name,
            namespace: namespace_or_default(alloc.namespace),
            job_id: alloc.job_id,
            task_group: alloc.task_group,
            node_id: NodeId::new(alloc.node_id),
            desired_status: alloc.desired_status,
            client_status: alloc.client_status,
            resources,
            devices,
        }
    }
}

// ============================================================================
// Evaluations
// ============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct WireEvaluation {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Namespace", default)]
    namespace: String,
    #[serde(rename = "JobID", default)]
    job_id: String,
    #[serde(rename = "Status")]
    status: EvalStatus,
    #[serde(rename = "CreateIndex", default)]
    create_index: u64,
    #[serde(rename = "FailedTGAllocs", default, deserialize_with = "nullable")]
    failed_tg_allocs: BTreeMap<String, serde_json::Value>,
}

impl From<WireEvaluation> for Evaluation {
    fn from(eval: WireEvaluation) -> Self {
        Self {
            id: EvalId::new(eval.id),
            namespace: namespace_or_default(eval.namespace),
            job_id: eval.job_id,
            status: eval.status,
            create_index: eval.create_index,
            failed_tg_allocs: eval.failed_tg_allocs.into_keys().collect(),
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireConstraint {
    #[serde(rename = "LTarget", default)]
    l_target: String,
    #[serde(rename = "RTarget", default)]
    r_target: String,
    #[serde(rename = "Operand", default)]
    operand: String,
}

impl From<WireConstraint> for Constraint {
    fn from(c: WireConstraint) -> Self {
        Self::new(c.l_target, c.operand, c.r_target)
    }
}

fn constraints(wire: Vec<WireConstraint>) -> Vec<Constraint> {
    wire.into_iter().map(Constraint::from).collect()
}

#[derive(Debug, Deserialize)]
struct WireDeviceRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Count", default)]
    count: u32,
}

#[derive(Debug, Default, Deserialize)]
struct WireTaskResources {
    #[serde(rename = "CPU", default, deserialize_with = "nullable")]
    cpu: u64,
    #[serde(rename = "MemoryMB", default, deserialize_with = "nullable")]
    memory_mb: u64,
    #[serde(rename = "Devices", default, deserialize_with = "nullable")]
    devices: Vec<WireDeviceRequest>,
}

#[derive(Debug, Deserialize)]
struct WireTask {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Driver", default)]
    driver: String,
    #[serde(rename = "Constraints", default, deserialize_with = "nullable")]
    constraints: Vec<WireConstraint>,
    #[serde(rename = "Resources", default, deserialize_with = "nullable")]
    resources: WireTaskResources,
}

#[derive(Debug, Default, Deserialize)]
struct WireEphemeralDisk {
    #[serde(rename = "SizeMB", default, deserialize_with = "nullable")]
    size_mb: u64,
}

#[derive(Debug, Deserialize)]
struct WireTaskGroup {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Count", default, deserialize_with = "nullable")]
    count: u32,
    #[serde(rename = "Constraints", default, deserialize_with = "nullable")]
    constraints: Vec<WireConstraint>,
    #[serde(rename = "EphemeralDisk", default, deserialize_with = "nullable")]
    ephemeral_disk: WireEphemeralDisk,
    #[serde(rename = "Tasks", default, deserialize_with = "nullable")]
    tasks: Vec<WireTask>,
}

impl From<WireTaskGroup> for TaskGroup {
    fn from(group: WireTaskGroup) -> Self {
        Self {
            name: group.name,
            count: group.count,
            constraints: constraints(group.constraints),
            ephemeral_disk_mb: group.ephemeral_disk.size_mb,
            tasks: group
                .tasks
                .into_iter()
                .map(|t| Task {
                    name: t.name,
                    driver: t.driver,
                    constraints: constraints(t.constraints),
                    resources: Resources::new(t.resources.cpu, t.resources.memory_mb, 0),
                    devices: t
                        .resources
                        .devices
                        .into_iter()
                        .map(|d| DeviceRequest {
                            name: d.name,
                            count: d.count,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireJob {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Namespace", default, deserialize_with = "nullable")]
    namespace: String,
    #[serde(rename = "Datacenters", default, deserialize_with = "nullable")]
    datacenters: Vec<String>,
    #[serde(rename = "Constraints", default, deserialize_with = "nullable")]
    constraints: Vec<WireConstraint>,
    #[serde(rename = "TaskGroups", default, deserialize_with = "nullable")]
    task_groups: Vec<WireTaskGroup>,
}

impl From<WireJob> for Job {
    fn from(job: WireJob) -> Self {
        Self {
            name: if job.name.is_empty() {
                job.id.clone()
            } else {
                job.name
            },
            id: job.id,
            namespace: namespace_or_default(job.namespace),
            datacenters: job.datacenters,
            constraints: constraints(job.constraints),
            task_groups: job.task_groups.into_iter().map(TaskGroup::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireTaskGroupSummary {
    #[serde(rename = "Queued", default)]
    queued: u32,
    #[serde(rename = "Starting", default)]
    starting: u32,
    #[serde(rename = "Running", default)]
    running: u32,
    #[serde(rename = "Complete", default)]
    complete: u32,
    #[serde(rename = "Failed", default)]
    failed: u32,
    #[serde(rename = "Lost", default)]
    lost: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireJobSummary {
    #[serde(rename = "JobID")]
    job_id: String,
    #[serde(rename = "Namespace", default)]
    namespace: String,
    #[serde(rename = "Summary", default, deserialize_with = "nullable")]
    summary: BTreeMap<String, WireTaskGroupSummary>,
}

impl From<WireJobSummary> for JobSummary {
    fn from(summary: WireJobSummary) -> Self {
        Self {
            job_id: summary.job_id,
            namespace: namespace_or_default(summary.namespace),
            task_groups: summary
                .summary
                .into_iter()
                .map(|(name, s)| {
                    (
                        name,
                        TaskGroupSummary {
                            queued: s.queued,
                            starting: s.starting,
                            running: s.running,
                            complete: s.complete,
                            failed: s.failed,
                            lost: s.lost,
                        },
                    )
                })
                .collect(),
        }
    }
}

// ============================================================================
// Drain
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct DrainSpec {
    #[serde(rename = "Deadline")]
    pub deadline: i64,
    #[serde(rename = "IgnoreSystemJobs")]
    pub ignore_system_jobs: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct DrainRequest {
    #[serde(rename = "DrainSpec")]
    pub drain_spec: DrainSpec,
    #[serde(rename = "MarkEligible")]
    pub mark_eligible: bool,
}

impl Default for DrainRequest {
    fn default() -> Self {
        Self {
            drain_spec: DrainSpec {
                deadline: 0,
                ignore_system_jobs: false,
            },
            mark_eligible: false,
        }
    }
}

// ============================================================================
// Event stream
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "Topic", default)]
    topic: String,
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Payload", default)]
    payload: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct WireFrame {
    #[serde(rename = "Index")]
    index: Option<u64>,
    #[serde(rename = "Events", default, deserialize_with = "nullable")]
    events: Vec<WireEvent>,
    #[serde(rename = "Error")]
    error: Option<String>,
}

/// Decode one line of the event stream.
///
/// Returns `Ok(None)` for heartbeats (`{}`) and blank lines. Events on
/// unknown topics, or whose payload does not decode, are skipped with a
/// warning.
///
/// # Errors
///
/// Returns [`ClusterError::Decode`] if the line is not a frame, or
/// [`ClusterError::Stream`] if the server reported an error.
pub fn decode_event_frame(line: &[u8]) -> Result<Option<EventBatch>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let frame: WireFrame =
        serde_json::from_slice(line).map_err(|e| ClusterError::decode("event frame", e))?;
    if let Some(error) = frame.error.filter(|e| !e.is_empty()) {
        return Err(ClusterError::Stream(error));
    }
    let Some(index) = frame.index else {
        return Ok(None);
    };

    let events = frame
        .events
        .into_iter()
        .filter_map(|event| match decode_event(&event) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(topic = %event.topic, kind = %event.kind, error = %e, "skipping undecodable event");
                None
            }
        })
        .collect();

    Ok(Some(EventBatch { index, events }))
}

fn decode_event(event: &WireEvent) -> Result<Option<ClusterEvent>> {
    let payload = |key: &str| {
        event
            .payload
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::Stream(format!("{} event without {key} payload", event.topic)))
    };
    let decoded = match event.topic.as_str() {
        "Evaluation" => {
            let eval: WireEvaluation = serde_json::from_value(payload("Evaluation")?)
                .map_err(|e| ClusterError::decode("evaluation event", e))?;
            ClusterEvent::Evaluation(eval.into())
        }
        "Node" => {
            let node: WireNode = serde_json::from_value(payload("Node")?)
                .map_err(|e| ClusterError::decode("node event", e))?;
            ClusterEvent::Node(node.into())
        }
        "Allocation" => {
            let alloc: WireAllocation = serde_json::from_value(payload("Allocation")?)
                .map_err(|e| ClusterError::decode("allocation event", e))?;
            ClusterEvent::Allocation(alloc.into())
        }
        _ => return Ok(None),
    };
    Ok(Some(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node_json() -> serde_json::Value {
        json!({
            "ID": "5c1f2a8e-0000-4000-8000-000000000001",
            "Name": "gpu-1",
            "Datacenter": "dc1",
            "NodeClass": "",
            "Status": "ready",
            "SchedulingEligibility": "eligible",
            "Drain": false,
            "Attributes": {"kernel.name": "linux", "unique.platform.aws.instance-id": "i-0abc"},
            "Meta": null,
            "Links": {"aws.ec2": "us-east-1a.i-0abc"},
            "Drivers": {"docker": {"Detected": true, "Healthy": true}},
            "NodeResources": {
                "Cpu": {"CpuShares": 8000},
                "Memory": {"MemoryMB": 16384},
                "Disk": {"DiskMB": 50000},
                "Devices": [{
                    "Vendor": "nvidia",
                    "Type": "gpu",
                    "Name": "Tesla T4",
                    "Instances": [{"ID": "GPU-1", "Healthy": true}],
                    "Attributes": {
                        "memory": {"Int": 16, "Unit": "GiB"},
                        "cuda": {"String": "12.2"}
                    }
                }]
            },
            "ReservedResources": {"Cpu": {"CpuShares": 500}, "Memory": {"MemoryMB": 512}, "Disk": null},
            "Events": [{"Message": "Node registered", "Timestamp": "2024-05-01T10:00:00Z"}]
        })
    }

    #[test]
    fn node_maps_resources_and_devices() {
        let node: Node = serde_json::from_value::<WireNode>(node_json()).unwrap().into();
        assert_eq!(node.status, NodeStatus::Ready);
        assert_eq!(node.capacity, Resources::new(8000, 16384, 50000));
        assert_eq!(node.reserved, Resources::new(500, 512, 0));
        assert_eq!(node.instance_id(), Some("i-0abc"));
        assert!(node.meta.is_empty());
        assert!(node.has_driver("docker"));
        assert_eq!(node.devices[0].attributes["memory"], "16 GiB");
        assert_eq!(node.devices[0].attributes["cuda"], "12.2");
        assert_eq!(node.devices[0].healthy_count(), 1);
        assert_eq!(node.events.len(), 1);
    }

    #[test]
    fn draining_node_overrides_status() {
        let mut raw = node_json();
        raw["Drain"] = json!(true);
        let node: Node = serde_json::from_value::<WireNode>(raw).unwrap().into();
        assert_eq!(node.status, NodeStatus::Draining);
    }

    #[test]
    fn allocation_sums_task_resources() {
        let alloc: Allocation = serde_json::from_value::<WireAllocation>(json!({
            "ID": "a1",
            "Name": "shop.web[0]",
            "Namespace": "",
            "JobID": "shop",
            "TaskGroup": "web",
            "NodeID": "n1",
            "DesiredStatus": "run",
            "ClientStatus": "running",
            "AllocatedResources": {
                "Tasks": {
                    "app": {"Cpu": {"CpuShares": 500}, "Memory": {"MemoryMB": 256},
                            "Devices": [{"Vendor": "nvidia", "Type": "gpu", "Name": "Tesla T4", "DeviceIDs": ["GPU-1"]}]},
                    "sidecar": {"Cpu": {"CpuShares": 100}, "Memory": {"MemoryMB": 64}, "Devices": null}
                },
                "Shared": {"DiskMB": 300}
            }
        }))
        .unwrap()
        .into();

        assert_eq!(alloc.namespace, "default");
        assert_eq!(alloc.resources, Resources::new(600, 320, 300));
        assert_eq!(alloc.devices[0].name, "nvidia/gpu/Tesla T4");
        assert_eq!(alloc.devices[0].count, 1);
        assert!(alloc.is_live());
    }

    #[test]
    fn evaluation_collects_failed_groups() {
        let eval: Evaluation = serde_json::from_value::<WireEvaluation>(json!({
            "ID": "e1", "Namespace": "default", "JobID": "shop", "Status": "blocked",
            "CreateIndex": 42, "FailedTGAllocs": {"web": {"NodesEvaluated": 3}}
        }))
        .unwrap()
        .into();
        assert!(eval.is_blocked());
        assert_eq!(eval.create_index, 42);
        assert!(eval.failed_tg_allocs.contains("web"));

        let eval: Evaluation = serde_json::from_value::<WireEvaluation>(json!({
            "ID": "e2", "Namespace": "default", "JobID": "shop", "Status": "complete",
            "CreateIndex": 43, "FailedTGAllocs": null
        }))
        .unwrap()
        .into();
        assert!(eval.failed_tg_allocs.is_empty());
    }

    #[test]
    fn job_maps_groups_and_tasks() {
        let job: Job = serde_json::from_value::<WireJob>(json!({
            "ID": "shop",
            "Name": "shop",
            "Namespace": "default",
            "Datacenters": ["dc1"],
            "Constraints": [{"LTarget": "${attr.kernel.name}", "RTarget": "linux", "Operand": "="}],
            "TaskGroups": [{
                "Name": "web",
                "Count": 3,
                "Constraints": null,
                "EphemeralDisk": {"SizeMB": 300},
                "Tasks": [{
                    "Name": "app",
                    "Driver": "docker",
                    "Constraints": null,
                    "Resources": {"CPU": 500, "MemoryMB": 256, "Devices": [{"Name": "nvidia/gpu", "Count": 1}]}
                }]
            }]
        }))
        .unwrap()
        .into();

        let group = job.task_group("web").unwrap();
        assert_eq!(group.count, 3);
        assert_eq!(group.requested(), Resources::new(500, 256, 300));
        assert!(group.wants_devices());
        assert_eq!(job.constraints[0].operand, "=");
    }

    #[test]
    fn heartbeat_frames_are_skipped() {
        assert_eq!(decode_event_frame(b"{}").unwrap(), None);
        assert_eq!(decode_event_frame(b"  \n").unwrap(), None);
    }

    #[test]
    fn frames_decode_known_topics() {
        let line = serde_json::to_vec(&json!({
            "Index": 100,
            "Events": [
                {"Topic": "Evaluation", "Type": "EvaluationUpdated", "Payload": {"Evaluation": {
                    "ID": "e1", "Namespace": "default", "JobID": "shop", "Status": "blocked", "CreateIndex": 100
                }}},
                {"Topic": "Deployment", "Type": "DeploymentStatusUpdate", "Payload": {}},
                {"Topic": "Node", "Type": "NodeRegistration", "Payload": {"Node": node_json()}},
                {"Topic": "Allocation", "Type": "AllocationUpdated", "Payload": {"Allocation": {"ID": "broken"}}}
            ]
        }))
        .unwrap();

        let batch = decode_event_frame(&line).unwrap().unwrap();
        assert_eq!(batch.index, 100);
        assert_eq!(batch.events.len(), 2);
        assert!(matches!(batch.events[0], ClusterEvent::Evaluation(_)));
        assert!(matches!(batch.events[1], ClusterEvent::Node(_)));
    }

    #[test]
    fn stream_errors_surface() {
        let err = decode_event_frame(br#"{"Error": "Permission denied"}"#).unwrap_err();
        assert!(matches!(err, ClusterError::Stream(_)));
        assert!(decode_event_frame(b"not json").is_err());
    }
}
