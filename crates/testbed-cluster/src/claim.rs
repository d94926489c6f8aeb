//! Typed builder and reader for the `GKECluster` Crossplane claim
//!
//! Only the fields this operator writes (sizing) or reads (readiness,
//! endpoint, bound composite name) are modelled.

use std::collections::BTreeMap;

use kube::api::{DynamicObject, ObjectMeta};
use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

use testbed_common::crd::ClusterSpec;
use testbed_common::kube_utils::build_api_resource;
use testbed_common::{Error, CLUSTER_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// apiVersion of the claim
pub const GKE_CLAIM_API_VERSION: &str = "illm.io/v1alpha1";
/// Kind of the claim
pub const GKE_CLAIM_KIND: &str = "GKECluster";

/// Default GCP zone
pub const DEFAULT_ZONE: &str = "us-central1-a";
/// Default node count
pub const DEFAULT_NODE_COUNT: u32 = 1;
/// Default GCE machine type
pub const DEFAULT_MACHINE_TYPE: &str = "e2-medium";
/// Default boot disk size
pub const DEFAULT_DISK_SIZE_GB: u32 = 50;

/// ApiResource for the claim kind
pub fn claim_api_resource() -> ApiResource {
    build_api_resource(GKE_CLAIM_API_VERSION, GKE_CLAIM_KIND)
}

/// Cluster sizing with documented defaults applied
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSizing {
    /// GCP zone
    pub zone: String,
    /// Node count
    pub node_count: u32,
    /// GCE machine type
    pub machine_type: String,
    /// Boot disk size
    pub disk_size_gb: u32,
    /// Spot/preemptible nodes
    pub preemptible: bool,
}

impl ClusterSizing {
    /// Apply defaults to a target's cluster spec
    pub fn from_spec(spec: &ClusterSpec) -> Self {
        Self {
            zone: spec
                .zone
                .clone()
                .filter(|z| !z.is_empty())
                .unwrap_or_else(|| DEFAULT_ZONE.to_string()),
            node_count: spec
                .node_count
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_NODE_COUNT),
            machine_type: spec
                .machine_type
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MACHINE_TYPE.to_string()),
            disk_size_gb: spec
                .disk_size_gb
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_DISK_SIZE_GB),
            preemptible: spec.preemptible,
        }
    }
}

/// Build the claim object for a cluster
pub fn build_claim(name: &str, namespace: &str, spec: &ClusterSpec) -> DynamicObject {
    let ar = claim_api_resource();
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (CLUSTER_LABEL.to_string(), name.to_string()),
    ]);
    let mut obj = DynamicObject::new(name, &ar).within(namespace);
    obj.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    };
    obj.data = serde_json::json!({ "spec": ClusterSizing::from_spec(spec) });
    obj
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimBody {
    #[serde(default)]
    spec: ClaimSpecView,
    #[serde(default)]
    status: ClaimStatusView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimSpecView {
    #[serde(default)]
    resource_ref: Option<ResourceRef>,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceRef {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ClaimStatusView {
    #[serde(default)]
    conditions: Vec<ClaimCondition>,
    #[serde(default)]
    endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ClaimCondition {
    #[serde(rename = "type", default)]
    type_: String,
    #[serde(default)]
    status: String,
}

/// The fields of an observed claim this operator reads
#[derive(Debug, Default)]
pub struct ClaimView {
    body: ClaimBody,
}

impl ClaimView {
    /// Read a claim object
    pub fn from_object(obj: &DynamicObject) -> Result<Self, Error> {
        let body: ClaimBody = serde_json::from_value(obj.data.clone())?;
        Ok(Self { body })
    }

    /// True when a `Ready=True` condition is present
    pub fn is_ready(&self) -> bool {
        self.body
            .status
            .conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
    }

    /// API endpoint, once reported
    pub fn endpoint(&self) -> Option<String> {
        self.body
            .status
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
    }

    /// Name of the bound composite resource, once bound
    pub fn composite_name(&self) -> Option<&str> {
        self.body
            .spec
            .resource_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .filter(|n| !n.is_empty())
    }
}
