//! Component CRD: a reusable, cluster-scoped deployable unit
//!
//! Experiments reference components by name. When a Component object
//! exists its sources are used; otherwise a path is derived by convention.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Component definition
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "experiments.illm.io",
    version = "v1alpha1",
    kind = "Component",
    plural = "components",
    shortname = "comp",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// app, workflow or config
    #[serde(rename = "type")]
    pub component_type: ComponentType,

    /// Sources deployed for this component
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ComponentSource>,

    /// Documented parameters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ComponentParameter>,

    /// Scrape hints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ComponentObservability>,
}

/// Kind of component
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    /// Long-running application
    #[default]
    App,
    /// Workflow templates
    Workflow,
    /// Plain configuration manifests
    Config,
}

impl ComponentType {
    /// Directory name used by the conventional repository layout
    pub fn directory(&self) -> &'static str {
        match self {
            Self::App => "apps",
            Self::Workflow => "workflows",
            Self::Config => "configs",
        }
    }
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::App => write!(f, "app"),
            Self::Workflow => write!(f, "workflow"),
            Self::Config => write!(f, "config"),
        }
    }
}

/// A git path or helm chart
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSource {
    /// Repository URL
    #[serde(rename = "repoURL")]
    pub repo_url: String,

    /// Revision; HEAD when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_revision: Option<String>,

    /// Path within the repository
    #[serde(default)]
    pub path: String,

    /// Helm chart name for package-repository sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,

    /// Helm settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmConfig>,
}

/// Helm settings for a source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmConfig {
    /// Release name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Values files, possibly `$values/...` references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_files: Vec<String>,

    /// Default parameters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<HelmParameter>,
}

/// Default helm parameter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmParameter {
    /// Parameter path
    pub name: String,
    /// Value
    pub value: String,
    /// Force string typing
    #[serde(default)]
    pub force_string: bool,
}

/// Documented component parameter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentParameter {
    /// Name
    pub name: String,
    /// Type hint
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub param_type: Option<String>,
    /// Default value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Must be provided
    #[serde(default)]
    pub required: bool,
}

/// Scrape hints for the component's pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentObservability {
    /// Create a ServiceMonitor
    #[serde(default)]
    pub service_monitor: bool,
    /// Create a PodMonitor
    #[serde(default)]
    pub pod_monitor: bool,
    /// Pod selector labels
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub pod_labels: std::collections::BTreeMap<String, String>,
    /// Metrics path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_path: Option<String>,
    /// Metrics port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<i32>,
}
