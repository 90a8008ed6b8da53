//! Pool node specifications.
//!
//! A [`PoolNodeSpec`] describes the shape of the nodes a pool can provision:
//! resources, attributes, drivers, devices and the provider that creates
//! them. Its compute class is a fingerprint of everything except the three
//! numeric resource fields, so pools that differ only in size share a class
//! while pools differing in any attribute never do.

use std::collections::BTreeMap;

use ondemand_scaler_core::{
    DeviceGroup, DeviceInstance, DriverInfo, Node, NodeId, Resources, Variant,
};

/// Disk assumed for synthesized nodes whose spec has no `disk` attribute.
pub const DEFAULT_DISK_MB: u64 = 100 * 1024;

/// Attribute keys excluded from the compute class.
const RESOURCE_KEYS: [&str; 3] = ["cpu", "mem", "disk"];

/// Node specification of one capacity pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolNodeSpec {
    full_name: String,
    compute_class: String,
    attributes: BTreeMap<String, Variant>,
}

impl PoolNodeSpec {
    /// Build a spec from its attribute map.
    #[must_use]
    pub fn new(attributes: BTreeMap<String, Variant>) -> Self {
        let compute_class = compute_class_of(&attributes);
        let full_name = format!("{}-{compute_class}", resource_name_of(&attributes));
        Self {
            full_name,
            compute_class,
            attributes,
        }
    }

    /// Unique pool name: resource summary plus compute class.
    #[must_use]
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Fingerprint of every attribute except cpu/mem/disk.
    #[must_use]
    pub fn compute_class(&self) -> &str {
        &self.compute_class
    }

    /// Resource summary, e.g. `cpu:4000;mem:8192`.
    #[must_use]
    pub fn name(&self) -> String {
        resource_name_of(&self.attributes)
    }

    /// All attributes.
    #[must_use]
    pub const fn attributes(&self) -> &BTreeMap<String, Variant> {
        &self.attributes
    }

    /// One attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Variant> {
        self.attributes.get(key)
    }

    /// The `provider` descriptor.
    #[must_use]
    pub fn provider(&self) -> Option<&Variant> {
        self.attributes.get("provider")
    }

    /// Declared cpu/mem/disk; absent or non-int fields are zero.
    #[must_use]
    pub fn resources(&self) -> Resources {
        Resources::new(
            self.int_attr("cpu"),
            self.int_attr("mem"),
            self.int_attr("disk"),
        )
    }

    fn int_attr(&self, key: &str) -> u64 {
        self.attributes
            .get(key)
            .and_then(Variant::as_int)
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(0)
    }

    /// Build a node exactly as the spec describes it.
    ///
    /// Used to ask the scheduling oracle what a freshly provisioned node
    /// could host.
    #[must_use]
    pub fn synthesize_node(&self, id: NodeId) -> Node {
        let mut node = Node::new(id);

        for (key, value) in &self.attributes {
            if let Some(attr) = key.strip_prefix("attr.") {
                if let Some(s) = value.to_scalar_string() {
                    node.attributes.insert(attr.to_string(), s);
                }
            } else if let Some(meta) = key.strip_prefix("meta.") {
                if let Some(s) = value.as_str() {
                    node.meta.insert(meta.to_string(), s.to_string());
                }
            } else if let Some(link) = key.strip_prefix("links.") {
                if let Some(s) = value.as_str() {
                    node.links.insert(link.to_string(), s.to_string());
                }
            }
        }

        if let Some(drivers) = self.attributes.get("drivers").and_then(Variant::as_list) {
            for driver in drivers.iter().filter_map(Variant::as_str) {
                node.drivers.insert(
                    driver.to_string(),
                    DriverInfo {
                        detected: true,
                        healthy: true,
                    },
                );
            }
        }

        if let Some(devices) = self.attributes.get("devices").and_then(Variant::as_list) {
            for (index, device) in devices.iter().filter_map(Variant::as_map).enumerate() {
                node.devices.push(synthesize_device(&node.id, index, device));
            }
        }

        let declared = self.resources();
        node.capacity = Resources {
            disk_mb: if self.attributes.get("disk").and_then(Variant::as_int).is_some() {
                declared.disk_mb
            } else {
                DEFAULT_DISK_MB
            },
            ..declared
        };

        if let Some(reserved) = self.attributes.get("reserved").and_then(Variant::as_map) {
            let get = |k: &str| {
                reserved
                    .get(k)
                    .and_then(Variant::as_int)
                    .and_then(|v| u64::try_from(v).ok())
                    .unwrap_or(0)
            };
            node.reserved = Resources::new(get("cpu"), get("mem"), get("disk"));
        }

        if let Some(dc) = self.attributes.get("datacenter").and_then(Variant::as_str) {
            node.datacenter = dc.to_string();
        }
        if let Some(class) = self.attributes.get("nodeclass").and_then(Variant::as_str) {
            node.node_class = class.to_string();
        }

        node
    }

    /// Describe `node` using the same keys this spec declares.
    ///
    /// Lets an operator compare what a pool asked for with what a real member
    /// node reports. Keys the node cannot answer are omitted.
    #[must_use]
    pub fn spec_from_node(&self, node: &Node) -> BTreeMap<String, Variant> {
        let mut observed = BTreeMap::new();

        for (key, declared) in &self.attributes {
            let value = match key.as_str() {
                "cpu" => Some(Variant::Int(to_i64(node.capacity.cpu_mhz))),
                "mem" => Some(Variant::Int(to_i64(node.capacity.memory_mb))),
                "disk" => Some(Variant::Int(to_i64(node.capacity.disk_mb))),
                "datacenter" => Some(Variant::from(node.datacenter.clone())),
                "nodeclass" => Some(Variant::from(node.node_class.clone())),
                "drivers" => Some(Variant::List(
                    node.drivers
                        .iter()
                        .filter(|(_, info)| info.detected)
                        .map(|(name, _)| Variant::from(name.clone()))
                        .collect(),
                )),
                "reserved" => declared.as_map().map(|declared| {
                    observed_reserved(declared, &node.reserved)
                }),
                "devices" => declared
                    .as_list()
                    .filter(|_| !node.devices.is_empty())
                    .map(|declared| observed_devices(declared, &node.devices)),
                _ => {
                    if let Some(attr) = key.strip_prefix("attr.") {
                        node.attributes.get(attr).cloned().map(Variant::from)
                    } else if let Some(meta) = key.strip_prefix("meta.") {
                        node.meta.get(meta).cloned().map(Variant::from)
                    } else if let Some(link) = key.strip_prefix("links.") {
                        node.links.get(link).cloned().map(Variant::from)
                    } else {
                        None
                    }
                }
            };

            if let Some(value) = value {
                observed.insert(key.clone(), value);
            }
        }

        observed
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn resource_name_of(attributes: &BTreeMap<String, Variant>) -> String {
    RESOURCE_KEYS
        .iter()
        .filter_map(|key| {
            attributes
                .get(*key)
                .and_then(Variant::as_int)
                .map(|v| format!("{key}:{v}"))
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn compute_class_of(attributes: &BTreeMap<String, Variant>) -> String {
    let shape: BTreeMap<String, Variant> = attributes
        .iter()
        .filter(|(key, _)| !RESOURCE_KEYS.contains(&key.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let fingerprint = Variant::Map(shape).fingerprint();
    format!("v1:{}", hex::encode(&fingerprint[..8]))
}

fn synthesize_device(node_id: &NodeId, index: usize, device: &BTreeMap<String, Variant>) -> DeviceGroup {
    let text = |k: &str| {
        device
            .get(k)
            .and_then(Variant::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let count = device
        .get("count")
        .and_then(Variant::as_int)
        .and_then(|c| usize::try_from(c).ok())
        .unwrap_or(0);

    DeviceGroup {
        vendor: text("vendor"),
        device_type: text("type"),
        name: text("name"),
        instances: (0..count)
            .map(|i| DeviceInstance {
                id: format!("{}-{index}-{i}", node_id.short()),
                healthy: true,
            })
            .collect(),
        attributes: device
            .get("attr")
            .and_then(Variant::as_map)
            .map(|attrs| {
                attrs
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn observed_reserved(declared: &BTreeMap<String, Variant>, reserved: &Resources) -> Variant {
    let mut out = BTreeMap::new();
    for key in declared.keys() {
        let value = match key.as_str() {
            "cpu" => reserved.cpu_mhz,
            "mem" => reserved.memory_mb,
            "disk" => reserved.disk_mb,
            _ => continue,
        };
        out.insert(key.clone(), Variant::Int(to_i64(value)));
    }
    Variant::Map(out)
}

fn observed_devices(declared: &[Variant], devices: &[DeviceGroup]) -> Variant {
    let items = declared
        .iter()
        .zip(devices)
        .filter_map(|(declared, group)| {
            let declared = declared.as_map()?;
            let mut out = BTreeMap::new();
            for key in declared.keys() {
                let value = match key.as_str() {
                    "name" => Variant::from(group.name.clone()),
                    "type" => Variant::from(group.device_type.clone()),
                    "vendor" => Variant::from(group.vendor.clone()),
                    "count" => Variant::Int(i64::try_from(group.instances.len()).unwrap_or(i64::MAX)),
                    "attr" if !group.attributes.is_empty() => Variant::Map(
                        group
                            .attributes
                            .iter()
                            .map(|(k, v)| (k.clone(), Variant::from(v.clone())))
                            .collect(),
                    ),
                    _ => continue,
                };
                out.insert(key.clone(), value);
            }
            Some(Variant::Map(out))
        })
        .collect();
    Variant::List(items)
}
