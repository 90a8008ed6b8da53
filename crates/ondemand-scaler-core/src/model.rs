//! Cluster domain model.
//!
//! These are the scaler's own views of cluster-manager objects. They carry
//! only the fields the scaling loop, the scheduling oracle and the providers
//! read; wire formats are mapped into them by the cluster client.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AllocId, ChainKey, EvalId, NodeId};

/// Node attribute carrying the cloud instance id.
pub const INSTANCE_ID_ATTRIBUTE: &str = "unique.platform.aws.instance-id";

// ============================================================================
// Resources
// ============================================================================

/// CPU, memory and disk amounts.
///
/// Used for node capacity, node reservations and allocation requests alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU in MHz shares.
    pub cpu_mhz: u64,
    /// Memory in MB.
    pub memory_mb: u64,
    /// Disk in MB.
    pub disk_mb: u64,
}

impl Resources {
    /// Create a resource triple.
    #[must_use]
    pub const fn new(cpu_mhz: u64, memory_mb: u64, disk_mb: u64) -> Self {
        Self {
            cpu_mhz,
            memory_mb,
            disk_mb,
        }
    }

    /// Component-wise sum.
    #[must_use]
    pub const fn add(&self, other: &Self) -> Self {
        Self {
            cpu_mhz: self.cpu_mhz + other.cpu_mhz,
            memory_mb: self.memory_mb + other.memory_mb,
            disk_mb: self.disk_mb + other.disk_mb,
        }
    }

    /// Component-wise difference, clamped at zero.
    #[must_use]
    pub const fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            cpu_mhz: self.cpu_mhz.saturating_sub(other.cpu_mhz),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
        }
    }

    /// Whether every component of `self` fits within `capacity`.
    #[must_use]
    pub const fn fits_in(&self, capacity: &Self) -> bool {
        self.cpu_mhz <= capacity.cpu_mhz
            && self.memory_mb <= capacity.memory_mb
            && self.disk_mb <= capacity.disk_mb
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Node registered but not yet ready.
    Initializing,
    /// Node is ready for work.
    Ready,
    /// Node is being drained of its allocations.
    Draining,
    /// Node has missed its heartbeats.
    Disconnected,
    /// Node is gone.
    Down,
}

impl NodeStatus {
    /// Whether the node is gone for good.
    #[must_use]
    pub const fn is_down(&self) -> bool {
        matches!(self, Self::Down)
    }

    /// Status as the cluster manager spells it.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Disconnected => "disconnected",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the scheduler may place new work on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingEligibility {
    /// New allocations may be placed.
    #[default]
    Eligible,
    /// No new allocations.
    Ineligible,
}

/// A timestamped entry in a node's event history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    /// Human-readable event message (e.g. "Node registered").
    pub message: String,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
}

/// Task driver fingerprint on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    /// Driver was detected.
    pub detected: bool,
    /// Driver reports healthy.
    pub healthy: bool,
}

/// One instance of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInstance {
    /// Instance id.
    pub id: String,
    /// Whether the instance is usable.
    pub healthy: bool,
}

/// A group of identical devices on a node (e.g. four GPUs of one model).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroup {
    /// Vendor (e.g. "nvidia").
    pub vendor: String,
    /// Device type (e.g. "gpu").
    pub device_type: String,
    /// Model name (e.g. "Tesla T4").
    pub name: String,
    /// Individual instances.
    pub instances: Vec<DeviceInstance>,
    /// Free-form device attributes.
    pub attributes: BTreeMap<String, String>,
}

impl DeviceGroup {
    /// Number of healthy instances.
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        self.instances.iter().filter(|i| i.healthy).count()
    }

    /// Whether this group satisfies a device request name.
    ///
    /// Request names take the forms `type`, `vendor/type` or
    /// `vendor/type/name`.
    #[must_use]
    pub fn matches(&self, request: &str) -> bool {
        let parts: Vec<&str> = request.split('/').collect();
        match parts.as_slice() {
            [ty] => *ty == self.device_type,
            [vendor, ty] => *vendor == self.vendor && *ty == self.device_type,
            [vendor, ty, name] => {
                *vendor == self.vendor && *ty == self.device_type && *name == self.name
            }
            _ => false,
        }
    }
}

/// A cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Cluster-assigned id.
    pub id: NodeId,
    /// Node name.
    pub name: String,
    /// Datacenter the node lives in.
    pub datacenter: String,
    /// Operator-assigned node class.
    pub node_class: String,
    /// Lifecycle status.
    pub status: NodeStatus,
    /// Scheduling eligibility.
    pub eligibility: SchedulingEligibility,
    /// Fingerprinted attributes (`kernel.name`, `unique.platform.aws.instance-id`, ...).
    pub attributes: BTreeMap<String, String>,
    /// Operator metadata.
    pub meta: BTreeMap<String, String>,
    /// Links to external systems.
    pub links: BTreeMap<String, String>,
    /// Task drivers keyed by name.
    pub drivers: BTreeMap<String, DriverInfo>,
    /// Total capacity.
    pub capacity: Resources,
    /// Capacity reserved for the host.
    pub reserved: Resources,
    /// Device groups.
    pub devices: Vec<DeviceGroup>,
    /// Event history, oldest first.
    pub events: Vec<NodeEvent>,
}

impl Node {
    /// Create a ready, eligible node with no attributes.
    #[must_use]
    pub fn new(id: NodeId) -> Self {
        Self {
            name: id.to_string(),
            id,
            datacenter: String::new(),
            node_class: String::new(),
            status: NodeStatus::Ready,
            eligibility: SchedulingEligibility::Eligible,
            attributes: BTreeMap::new(),
            meta: BTreeMap::new(),
            links: BTreeMap::new(),
            drivers: BTreeMap::new(),
            capacity: Resources::default(),
            reserved: Resources::default(),
            devices: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Whether the node is gone.
    #[must_use]
    pub const fn is_down(&self) -> bool {
        self.status.is_down()
    }

    /// Capacity available to allocations.
    #[must_use]
    pub const fn allocatable(&self) -> Resources {
        self.capacity.saturating_sub(&self.reserved)
    }

    /// Cloud instance id from the node's fingerprint.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.attributes.get(INSTANCE_ID_ATTRIBUTE).map(String::as_str)
    }

    /// Timestamp of the oldest recorded event.
    #[must_use]
    pub fn first_event_at(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|e| e.timestamp)
    }

    /// Timestamp of the latest registration event.
    ///
    /// A registration event is one whose message contains `Node` followed
    /// later by `registered`. Falls back to the first event when no such
    /// event exists.
    #[must_use]
    pub fn last_registered_at(&self) -> Option<DateTime<Utc>> {
        self.events
            .iter()
            .rev()
            .find(|e| is_registration_message(&e.message))
            .or_else(|| self.events.first())
            .map(|e| e.timestamp)
    }

    /// Whether a driver is both detected and healthy.
    #[must_use]
    pub fn has_driver(&self, driver: &str) -> bool {
        self.drivers
            .get(driver)
            .is_some_and(|d| d.detected && d.healthy)
    }
}

fn is_registration_message(message: &str) -> bool {
    message
        .find("Node")
        .is_some_and(|pos| message[pos + 4..].contains("registered"))
}

// ============================================================================
// Allocations
// ============================================================================

/// What the scheduler wants an allocation to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    /// Keep running.
    Run,
    /// Stop.
    Stop,
    /// Evict from the node.
    Evict,
}

/// What the client reports an allocation is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    /// Placed, not yet running.
    Pending,
    /// Running.
    Running,
    /// Finished successfully.
    Complete,
    /// Failed.
    Failed,
    /// Node lost.
    Lost,
    /// Client disconnected.
    Unknown,
}

impl ClientStatus {
    /// Status as the cluster manager spells it.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Lost => "lost",
            Self::Unknown => "unknown",
        }
    }
}

/// One placed instance of a task group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Allocation id.
    pub id: AllocId,
    /// Allocation name (`job.group[index]`).
    pub name: String,
    /// Namespace of the owning job.
    pub namespace: String,
    /// Owning job id.
    pub job_id: String,
    /// Task group name.
    pub task_group: String,
    /// Node the allocation is bound to.
    pub node_id: NodeId,
    /// Desired status.
    pub desired_status: DesiredStatus,
    /// Client status.
    pub client_status: ClientStatus,
    /// Resources the allocation consumes.
    pub resources: Resources,
    /// Devices the allocation consumes, as (request name, count).
    pub devices: Vec<DeviceRequest>,
}

impl Allocation {
    /// Whether the allocation is live: desired to run and pending or running.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.desired_status, DesiredStatus::Run)
            && matches!(
                self.client_status,
                ClientStatus::Pending | ClientStatus::Running
            )
    }

    /// Whether both allocations fill a slot of the same task group.
    #[must_use]
    pub fn same_slot(&self, other: &Self) -> bool {
        self.namespace == other.namespace
            && self.job_id == other.job_id
            && self.task_group == other.task_group
    }
}

// ============================================================================
// Evaluations
// ============================================================================

/// Status of a scheduling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    /// Waiting to be processed.
    Pending,
    /// Could not place everything; waiting for capacity.
    Blocked,
    /// Processed.
    Complete,
    /// Processing failed.
    Failed,
    /// Superseded.
    Canceled,
}

/// A scheduling evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Evaluation id.
    pub id: EvalId,
    /// Namespace of the evaluated job.
    pub namespace: String,
    /// Evaluated job id.
    pub job_id: String,
    /// Status.
    pub status: EvalStatus,
    /// Monotonic creation index.
    pub create_index: u64,
    /// Task groups that failed placement in this evaluation.
    pub failed_tg_allocs: BTreeSet<String>,
}

impl Evaluation {
    /// Whether the evaluation is waiting for capacity.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self.status, EvalStatus::Blocked)
    }

    /// Key of the chain this evaluation belongs to.
    #[must_use]
    pub fn chain_key(&self) -> ChainKey {
        ChainKey::new(&self.namespace, &self.job_id)
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// A placement constraint (`${attr.kernel.name} = linux`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Left-hand target, usually an interpolated node property.
    pub l_target: String,
    /// Right-hand value.
    pub r_target: String,
    /// Operator (`=`, `!=`, `<`, `regexp`, `set_contains`, `is_set`, ...).
    pub operand: String,
}

impl Constraint {
    /// Create a constraint.
    #[must_use]
    pub fn new(
        l_target: impl Into<String>,
        operand: impl Into<String>,
        r_target: impl Into<String>,
    ) -> Self {
        Self {
            l_target: l_target.into(),
            r_target: r_target.into(),
            operand: operand.into(),
        }
    }
}

/// A device request: `count` instances matching `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    /// `type`, `vendor/type` or `vendor/type/name`.
    pub name: String,
    /// Instances needed.
    pub count: u32,
}

/// A task within a task group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task name.
    pub name: String,
    /// Driver the task runs under.
    pub driver: String,
    /// Task-level constraints.
    pub constraints: Vec<Constraint>,
    /// CPU and memory the task needs (disk is set at group level).
    pub resources: Resources,
    /// Devices the task needs.
    pub devices: Vec<DeviceRequest>,
}

/// A group of tasks placed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    /// Group name.
    pub name: String,
    /// Desired instance count.
    pub count: u32,
    /// Group-level constraints.
    pub constraints: Vec<Constraint>,
    /// Tasks.
    pub tasks: Vec<Task>,
    /// Ephemeral disk size in MB.
    pub ephemeral_disk_mb: u64,
}

impl TaskGroup {
    /// Total resources one instance of the group needs.
    #[must_use]
    pub fn requested(&self) -> Resources {
        self.tasks.iter().fold(
            Resources::new(0, 0, self.ephemeral_disk_mb),
            |acc, task| acc.add(&task.resources),
        )
    }

    /// Device requests of every task, merged by name.
    #[must_use]
    pub fn device_requests(&self) -> Vec<DeviceRequest> {
        let mut merged: BTreeMap<&str, u32> = BTreeMap::new();
        for device in self.tasks.iter().flat_map(|t| &t.devices) {
            *merged.entry(device.name.as_str()).or_default() += device.count;
        }
        merged
            .into_iter()
            .map(|(name, count)| DeviceRequest {
                name: name.to_string(),
                count,
            })
            .collect()
    }

    /// Whether any task requests a device.
    #[must_use]
    pub fn wants_devices(&self) -> bool {
        self.tasks.iter().any(|t| !t.devices.is_empty())
    }
}

/// A job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job id.
    pub id: String,
    /// Namespace.
    pub namespace: String,
    /// Job name.
    pub name: String,
    /// Datacenters the job may run in (`*` matches any).
    pub datacenters: Vec<String>,
    /// Job-level constraints.
    pub constraints: Vec<Constraint>,
    /// Task groups.
    pub task_groups: Vec<TaskGroup>,
}

impl Job {
    /// Look up a task group by name.
    #[must_use]
    pub fn task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }

    /// Key of the eval chain for this job.
    #[must_use]
    pub fn chain_key(&self) -> ChainKey {
        ChainKey::new(&self.namespace, &self.id)
    }
}

/// Per-task-group allocation counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroupSummary {
    /// Allocations waiting for placement.
    pub queued: u32,
    /// Allocations starting.
    pub starting: u32,
    /// Allocations running.
    pub running: u32,
    /// Allocations completed.
    pub complete: u32,
    /// Allocations failed.
    pub failed: u32,
    /// Allocations lost.
    pub lost: u32,
}

/// Allocation counts for every task group of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job id.
    pub job_id: String,
    /// Namespace.
    pub namespace: String,
    /// Summary per task group name.
    pub task_groups: BTreeMap<String, TaskGroupSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(message: &str, secs: i64) -> NodeEvent {
        NodeEvent {
            message: message.to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn alloc(desired: DesiredStatus, client: ClientStatus) -> Allocation {
        Allocation {
            id: AllocId::new("a1"),
            name: "web.web[0]".into(),
            namespace: "default".into(),
            job_id: "web".into(),
            task_group: "web".into(),
            node_id: NodeId::new("n1"),
            desired_status: desired,
            client_status: client,
            resources: Resources::default(),
            devices: Vec::new(),
        }
    }

    #[test]
    fn resources_arithmetic() {
        let a = Resources::new(100, 200, 300);
        let b = Resources::new(50, 300, 0);
        assert_eq!(a.add(&b), Resources::new(150, 500, 300));
        assert_eq!(a.saturating_sub(&b), Resources::new(50, 0, 300));
        assert!(b.fits_in(&Resources::new(50, 300, 0)));
        assert!(!a.fits_in(&b));
    }

    #[test]
    fn allocation_liveness() {
        assert!(alloc(DesiredStatus::Run, ClientStatus::Pending).is_live());
        assert!(alloc(DesiredStatus::Run, ClientStatus::Running).is_live());
        assert!(!alloc(DesiredStatus::Stop, ClientStatus::Running).is_live());
        assert!(!alloc(DesiredStatus::Run, ClientStatus::Complete).is_live());
    }

    #[test]
    fn last_registered_picks_latest_registration() {
        let mut node = Node::new(NodeId::new("n1"));
        node.events = vec![
            event("Node registered", 10),
            event("Node heartbeat missed", 20),
            event("Node re-registered", 30),
            event("Drain complete", 40),
        ];
        assert_eq!(node.last_registered_at().unwrap().timestamp(), 30);
        assert_eq!(node.first_event_at().unwrap().timestamp(), 10);
    }

    #[test]
    fn last_registered_falls_back_to_first_event() {
        let mut node = Node::new(NodeId::new("n1"));
        node.events = vec![event("Heartbeat", 5), event("Drain", 7)];
        assert_eq!(node.last_registered_at().unwrap().timestamp(), 5);

        node.events.clear();
        assert!(node.last_registered_at().is_none());
    }

    #[test]
    fn device_group_matching() {
        let group = DeviceGroup {
            vendor: "nvidia".into(),
            device_type: "gpu".into(),
            name: "T4".into(),
            ..Default::default()
        };
        assert!(group.matches("gpu"));
        assert!(group.matches("nvidia/gpu"));
        assert!(group.matches("nvidia/gpu/T4"));
        assert!(!group.matches("amd/gpu"));
        assert!(!group.matches("nvidia/gpu/A100"));
    }

    #[test]
    fn task_group_requested_sums_tasks() {
        let task = |cpu, mem| Task {
            name: "t".into(),
            driver: "docker".into(),
            constraints: vec![],
            resources: Resources::new(cpu, mem, 0),
            devices: vec![DeviceRequest {
                name: "gpu".into(),
                count: 1,
            }],
        };
        let tg = TaskGroup {
            name: "web".into(),
            count: 1,
            constraints: vec![],
            tasks: vec![task(100, 64), task(200, 128)],
            ephemeral_disk_mb: 300,
        };
        assert_eq!(tg.requested(), Resources::new(300, 192, 300));
        assert_eq!(tg.device_requests()[0].count, 2);
        assert!(tg.wants_devices());
    }

    #[test]
    fn status_serde_lowercase() {
        let json = serde_json::to_string(&EvalStatus::Blocked).unwrap();
        assert_eq!(json, "\"blocked\"");
        let status: NodeStatus = serde_json::from_str("\"down\"").unwrap();
        assert!(status.is_down());
    }
}
