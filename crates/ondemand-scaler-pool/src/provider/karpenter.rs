//! Kubernetes elastic provisioner backend.
//!
//! Capacity is requested by creating `karpenter.sh/v1` `NodeClaim` objects
//! labelled with the pool name; the provisioner launches one instance per
//! claim. A launched claim reports its cloud instance in `status.providerID`
//! (`aws:///us-east-1a/i-0abc...`), whose last path segment matches the
//! `unique.platform.aws.instance-id` attribute of the cluster node that later
//! registers. Claims still waiting for an instance are tracked under a
//! `claim:<name>` placeholder so they count towards the inventory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams};
use ondemand_scaler_core::Variant;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::inventory::InstanceBackend;
use crate::error::{PoolError, Result};
use crate::spec::PoolNodeSpec;

/// Registry name.
pub const NAME: &str = "karpenter";

/// Label carrying the pool name on every claim this backend creates.
pub const POOL_LABEL: &str = "ondemand-scaler.io/pool";

const PLACEHOLDER_PREFIX: &str = "claim:";

/// A node requirement passed through to the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Requirement {
    /// Well-known label key (e.g. `node.kubernetes.io/instance-type`).
    #[serde(alias = "Key")]
    pub key: String,
    /// Accepted values.
    #[serde(alias = "Values")]
    pub values: Vec<String>,
    /// Operator; defaults to `In`.
    #[serde(alias = "Op", default = "default_operator")]
    pub op: String,
}

fn default_operator() -> String {
    "In".to_string()
}

fn default_node_class_group() -> String {
    "karpenter.k8s.aws".to_string()
}

fn default_node_class_kind() -> String {
    "EC2NodeClass".to_string()
}

/// Typed parameters of a `karpenter` provider descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KarpenterParams {
    /// Pool label value; claims carrying it belong to this pool.
    pub name: String,
    /// Name of the node class object the claims reference.
    pub node_class: String,
    /// API group of the node class.
    #[serde(default = "default_node_class_group")]
    pub node_class_group: String,
    /// Kind of the node class.
    #[serde(default = "default_node_class_kind")]
    pub node_class_kind: String,
    /// MHz per CPU core, used to convert the pool's cpu into millicores.
    #[serde(default, alias = "freqPerCpuCore")]
    pub freq_per_cpu_core: Option<u64>,
    /// Node requirements.
    pub reqs: Vec<Requirement>,
    /// Extra labels put on every claim.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Resource requests derived from the pool spec.
    #[serde(skip)]
    pub requests: BTreeMap<String, String>,
}

impl KarpenterParams {
    /// Parse and validate parameters for the pool described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ProviderConfig`] if parameters are missing,
    /// malformed, or `freq_per_cpu_core` is absent while the pool declares cpu.
    pub fn from_variant(spec: &PoolNodeSpec, params: Option<&Variant>) -> Result<Self> {
        let config_error = |message: String| PoolError::ProviderConfig {
            provider: NAME,
            message,
        };

        let params = params.ok_or_else(|| config_error("params are required".to_string()))?;
        let value = serde_json::to_value(params).map_err(|e| config_error(e.to_string()))?;
        let mut parsed: Self =
            serde_json::from_value(value).map_err(|e| config_error(e.to_string()))?;

        let resources = spec.resources();
        if resources.cpu_mhz > 0 {
            let freq = parsed
                .freq_per_cpu_core
                .filter(|f| *f > 0)
                .ok_or_else(|| config_error("freq_per_cpu_core is required when cpu is set".to_string()))?;
            parsed
                .requests
                .insert("cpu".to_string(), format!("{}m", resources.cpu_mhz * 1000 / freq));
        }
        if resources.memory_mb > 0 {
            parsed
                .requests
                .insert("memory".to_string(), format!("{}Mi", resources.memory_mb));
        }
        if resources.disk_mb > 0 {
            parsed
                .requests
                .insert("ephemeral-storage".to_string(), format!("{}Mi", resources.disk_mb));
        }

        Ok(parsed)
    }
}

/// Instance id from a claim's `providerID`.
fn instance_from_provider_id(provider_id: &str) -> Option<&str> {
    provider_id.rsplit('/').next().filter(|s| !s.is_empty())
}

/// Inventory key of a claim: its instance id once launched, a placeholder before.
fn claim_key(claim: &DynamicObject) -> Option<String> {
    let launched = claim
        .data
        .get("status")
        .and_then(|s| s.get("providerID"))
        .and_then(serde_json::Value::as_str)
        .and_then(instance_from_provider_id)
        .map(str::to_string);
    launched.or_else(|| {
        claim
            .metadata
            .name
            .as_ref()
            .map(|name| format!("{PLACEHOLDER_PREFIX}{name}"))
    })
}

/// Node-claim backend for [`super::ElasticProvider`].
pub struct KarpenterBackend {
    claims: Api<DynamicObject>,
    resource: ApiResource,
    params: KarpenterParams,
}

impl KarpenterBackend {
    /// Create a backend for the pool described by `params`.
    #[must_use]
    pub fn new(client: kube::Client, params: KarpenterParams) -> Self {
        let gvk = GroupVersionKind::gvk("karpenter.sh", "v1", "NodeClaim");
        let resource = ApiResource::from_gvk(&gvk);
        let claims = Api::all_with(client, &resource);
        Self {
            claims,
            resource,
            params,
        }
    }

    fn selector(&self) -> ListParams {
        ListParams::default().labels(&format!("{POOL_LABEL}={}", self.params.name))
    }

    fn build_claim(&self) -> DynamicObject {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", self.params.name, &suffix[..10]);

        let mut labels = self.params.labels.clone();
        labels.insert(POOL_LABEL.to_string(), self.params.name.clone());

        let requirements: Vec<_> = self
            .params
            .reqs
            .iter()
            .map(|r| json!({"key": r.key, "operator": r.op, "values": r.values}))
            .collect();

        let mut claim = DynamicObject::new(&name, &self.resource).data(json!({
            "spec": {
                "nodeClassRef": {
                    "group": self.params.node_class_group,
                    "kind": self.params.node_class_kind,
                    "name": self.params.node_class,
                },
                "requirements": requirements,
                "resources": {"requests": self.params.requests},
            }
        }));
        claim.metadata = ObjectMeta {
            name: Some(name),
            labels: Some(labels),
            ..ObjectMeta::default()
        };
        claim
    }

    async fn list_claims(&self) -> Result<Vec<DynamicObject>> {
        Ok(self.claims.list(&self.selector()).await?.items)
    }
}

#[async_trait]
impl InstanceBackend for KarpenterBackend {
    fn kind(&self) -> &'static str {
        NAME
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        Ok(self.list_claims().await?.iter().filter_map(claim_key).collect())
    }

    async fn add_instances(&self, count: usize) -> Result<Vec<String>> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let claim = self.build_claim();
            match self.claims.create(&PostParams::default(), &claim).await {
                Ok(claim) => {
                    if let Some(key) = claim_key(&claim) {
                        created.push(key);
                    }
                }
                Err(e) if created.is_empty() => return Err(e.into()),
                Err(e) => {
                    warn!(pool = %self.params.name, created = created.len(), error = %e, "node claim creation stopped early");
                    break;
                }
            }
        }
        info!(pool = %self.params.name, count = created.len(), "created node claims");
        Ok(created)
    }

    async fn remove_instances(&self, instance_ids: &[String]) -> Result<()> {
        let claims = self.list_claims().await?;
        for claim in claims {
            let (Some(key), Some(name)) = (claim_key(&claim), claim.metadata.name.as_deref()) else {
                continue;
            };
            if !instance_ids.contains(&key) {
                continue;
            }
            match self.claims.delete(name, &DeleteParams::default()).await {
                Ok(_) => info!(pool = %self.params.name, claim = name, instance_id = %key, "deleted node claim"),
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    warn!(claim = name, "node claim already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
