//! ArgoCD Application types
//!
//! Typed builder for the Applications this operator writes and a reader for
//! the status fields it polls. Only the fields actually used are modelled.

use serde::{Deserialize, Serialize};

use testbed_common::crd::DeploymentLayer;
use testbed_common::kube_utils::{HasApiResource, ObjectMeta};
use testbed_common::{EXPERIMENT_LABEL, TARGET_LABEL};

use crate::resolver::ResolvedComponent;

/// Name of the source that only provides shared values files
pub const VALUES_REF: &str = "values";

const ACCEPTABLE_HEALTH: &[&str] = &["Healthy", "Degraded", "Progressing"];
const ACCEPTABLE_SYNC: &[&str] = &["Synced", "Unknown", "OutOfSync"];
const COMPARISON_ERROR: &str = "ComparisonError";

/// Deterministic Application name for a target and optional layer
pub fn application_name(experiment: &str, target: &str, layer: Option<DeploymentLayer>) -> String {
    match layer {
        Some(layer) => format!("{}-{}-{}", experiment, target, layer),
        None => format!("{}-{}", experiment, target),
    }
}

/// ArgoCD Application
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// API version
    pub api_version: String,
    /// Resource kind
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Application spec
    pub spec: ApplicationSpec,
}

impl HasApiResource for Application {
    const API_VERSION: &'static str = "argoproj.io/v1alpha1";
    const KIND: &'static str = "Application";
}

/// Application spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// ArgoCD project
    pub project: String,
    /// Sources rendered together
    pub sources: Vec<ApplicationSource>,
    /// Target cluster and namespace
    pub destination: Destination,
    /// Sync policy
    pub sync_policy: SyncPolicy,
}

/// One Application source
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    /// Repository URL
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    /// Revision
    pub target_revision: String,
    /// Path in a git repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Chart in a helm repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    /// Reference name for values-only sources
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Helm settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<ApplicationHelm>,
}

/// Helm settings of a source
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationHelm {
    /// Release name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    /// Values files
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_files: Vec<String>,
    /// Parameters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ApplicationHelmParameter>,
}

impl ApplicationHelm {
    fn is_empty(&self) -> bool {
        self.release_name.is_none() && self.value_files.is_empty() && self.parameters.is_empty()
    }
}

/// Helm parameter
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApplicationHelmParameter {
    /// Parameter path
    pub name: String,
    /// Value
    pub value: String,
}

/// Deployment destination
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Destination {
    /// API server URL as registered with ArgoCD
    pub server: String,
    /// Namespace
    pub namespace: String,
}

/// Sync policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Automated sync
    pub automated: AutomatedSync,
    /// Sync options
    pub sync_options: Vec<String>,
}

/// Automated sync settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedSync {
    /// Delete resources no longer in git
    pub prune: bool,
    /// Revert drift
    pub self_heal: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            automated: AutomatedSync {
                prune: true,
                self_heal: true,
            },
            sync_options: vec![
                "CreateNamespace=true".to_string(),
                "ServerSideApply=true".to_string(),
            ],
        }
    }
}

/// Flatten resolved components into Application sources.
///
/// A chart source is rendered from its helm repository. A git source without
/// helm settings that sits next to `$values` references only supplies values
/// files and is added as a `ref` so ArgoCD does not apply it as manifests.
pub fn build_sources(components: &[ResolvedComponent]) -> Vec<ApplicationSource> {
    let mut sources = Vec::new();
    for component in components {
        let needs_values_ref = component.uses_values_ref();
        for source in &component.sources {
            let mut out = ApplicationSource {
                repo_url: source.repo_url.clone(),
                target_revision: source.target_revision.clone(),
                ..Default::default()
            };
            if let Some(chart) = &source.chart {
                out.chart = Some(chart.clone());
            } else if needs_values_ref && source.helm.is_none() {
                out.reference = Some(VALUES_REF.to_string());
            } else {
                out.path = Some(source.path.clone());
            }

            if let Some(helm) = &source.helm {
                let rendered = ApplicationHelm {
                    release_name: helm.release_name.clone(),
                    value_files: helm.values_files.clone(),
                    parameters: helm
                        .parameters
                        .iter()
                        .map(|(name, value)| ApplicationHelmParameter {
                            name: name.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                };
                if !rendered.is_empty() {
                    out.helm = Some(rendered);
                }
            }
            sources.push(out);
        }
    }
    sources
}

/// Build the Application for a target, or `None` when nothing resolved to a source
pub fn build_application(
    experiment: &str,
    target: &str,
    layer: Option<DeploymentLayer>,
    server: &str,
    namespace: &str,
    components: &[ResolvedComponent],
) -> Option<Application> {
    let sources = build_sources(components);
    if sources.is_empty() {
        return None;
    }

    let metadata = ObjectMeta::new(application_name(experiment, target, layer), namespace)
        .with_label(EXPERIMENT_LABEL, experiment)
        .with_label(TARGET_LABEL, target);

    Some(Application {
        api_version: Application::API_VERSION.to_string(),
        kind: Application::KIND.to_string(),
        metadata,
        spec: ApplicationSpec {
            project: "default".to_string(),
            sources,
            destination: Destination {
                server: server.to_string(),
                namespace: experiment.to_string(),
            },
            sync_policy: SyncPolicy::default(),
        },
    })
}

// ===== Status reader =====

#[derive(Debug, Default, Deserialize)]
struct StatusView {
    #[serde(default)]
    health: Option<StatusField>,
    #[serde(default)]
    sync: Option<StatusField>,
    #[serde(default)]
    conditions: Vec<ConditionView>,
    #[serde(default)]
    resources: Vec<ResourceView>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusField {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConditionView {
    #[serde(rename = "type", default)]
    type_: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceView {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    name: String,
}

/// Observed Application status
#[derive(Debug, Default)]
pub struct ApplicationStatus {
    view: StatusView,
}

impl ApplicationStatus {
    /// Read the `status` of an observed Application object body
    pub fn from_object_data(data: &serde_json::Value) -> Self {
        let view = data
            .get("status")
            .cloned()
            .and_then(|s| serde_json::from_value(s).ok())
            .unwrap_or_default();
        Self { view }
    }

    /// Health status, if reported
    pub fn health(&self) -> Option<&str> {
        self.view.health.as_ref()?.status.as_deref()
    }

    /// Sync status, if reported
    pub fn sync(&self) -> Option<&str> {
        self.view.sync.as_ref()?.status.as_deref()
    }

    /// True when ArgoCD failed to generate manifests
    pub fn has_comparison_error(&self) -> bool {
        self.view
            .conditions
            .iter()
            .any(|c| c.type_ == COMPARISON_ERROR)
    }

    /// Healthy enough to proceed.
    ///
    /// Degraded and Progressing stacks are accepted since large stacks sit
    /// there under resource pressure while still serving. A comparison error
    /// always fails the check because health is reported Healthy when no
    /// manifests were generated at all.
    pub fn is_healthy(&self) -> bool {
        let (Some(health), Some(sync)) = (self.health(), self.sync()) else {
            return false;
        };
        if self.has_comparison_error() {
            return false;
        }
        ACCEPTABLE_HEALTH.contains(&health) && ACCEPTABLE_SYNC.contains(&sync)
    }

    /// Managed resources as `Kind/name`
    pub fn components(&self) -> Vec<String> {
        self.view
            .resources
            .iter()
            .filter(|r| !r.kind.is_empty() && !r.name.is_empty())
            .map(|r| format!("{}/{}", r.kind, r.name))
            .collect()
    }
}
