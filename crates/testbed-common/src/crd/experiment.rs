//! Experiment CRD: the root object driven by the experiment controller
//!
//! An Experiment names one or more targets, each backed by an ephemeral
//! cluster and a set of components, plus a validation workflow and an
//! optional hypothesis with machine-checkable success criteria.
//!
//! Example:
//! ```yaml
//! apiVersion: experiments.illm.io/v1alpha1
//! kind: Experiment
//! metadata:
//!   name: tsdb-comparison
//!   namespace: experiments
//! spec:
//!   targets:
//!     - name: app
//!       cluster: { type: gke, machineType: e2-standard-4, nodeCount: 2 }
//!       components: [{ app: victoria-metrics }]
//!       observability: { enabled: true, transport: direct }
//!   workflow:
//!     template: tsdb-benchmark
//!     completion: { mode: workflow }
//!   publish: true
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Desired state of an experiment. Immutable once created.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "experiments.illm.io",
    version = "v1alpha1",
    kind = "Experiment",
    plural = "experiments",
    shortname = "exp",
    namespaced,
    status = "ExperimentStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Targets","type":"string","jsonPath":".spec.targets[*].name"}"#,
    printcolumn = r#"{"name":"Workflow","type":"string","jsonPath":".status.workflowStatus.phase"}"#,
    printcolumn = r#"{"name":"Published","type":"boolean","jsonPath":".status.published"}"#,
    printcolumn = r#"{"name":"Cleaned","type":"boolean","jsonPath":".status.resourcesCleaned"}"#,
    printcolumn = r#"{"name":"Analysis","type":"string","jsonPath":".status.analysisPhase"}"#,
    printcolumn = r#"{"name":"Results","type":"string","jsonPath":".status.resultsURL","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    /// Free-form description carried into the results summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Deployment targets (one cluster each)
    pub targets: Vec<Target>,

    /// Validation workflow
    pub workflow: WorkflowSpec,

    /// Interactive tutorial settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tutorial: Option<TutorialSpec>,

    /// Named queries executed at completion. Defaults are used when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricsQuery>,

    /// Tags for categorizing published results
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Publish results to the results repository and run analysis
    #[serde(default)]
    pub publish: bool,

    /// The claim under test
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<HypothesisSpec>,

    /// Analysis sections to generate. An explicit empty list disables analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer_config: Option<AnalyzerConfig>,
}

// ===== Targets =====

/// One deployment unit: a cluster plus the components deployed onto it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Target name, unique within the experiment
    pub name: String,

    /// Cluster to provision for this target
    pub cluster: ClusterSpec,

    /// Components to deploy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentRef>,

    /// Observability stack injected alongside the components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilitySpec>,

    /// Targets whose applications must be created and healthy first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
}

impl Target {
    /// True for targets deployed onto the pre-existing hub cluster
    pub fn is_hub(&self) -> bool {
        self.cluster.cluster_type == ClusterType::Hub
    }

    /// True when the observability stack is enabled
    pub fn observability_enabled(&self) -> bool {
        self.observability.as_ref().is_some_and(|o| o.enabled)
    }

    /// True when metrics are relayed over the tailscale mesh
    pub fn uses_tailscale(&self) -> bool {
        self.observability
            .as_ref()
            .is_some_and(|o| o.enabled && o.transport == Transport::Tailscale)
    }
}

/// Kind of cluster backing a target
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    /// Ephemeral GKE cluster provisioned through a Crossplane claim
    #[default]
    Gke,
    /// The shared hub cluster the operator runs in
    Hub,
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gke => write!(f, "gke"),
            Self::Hub => write!(f, "hub"),
        }
    }
}

/// Cluster sizing. Unset fields take documented defaults at provisioning.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// gke or hub
    #[serde(rename = "type")]
    pub cluster_type: ClusterType,

    /// GCP zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    /// Node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,

    /// GCE machine type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,

    /// Boot disk size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,

    /// Use spot/preemptible nodes
    #[serde(default)]
    pub preemptible: bool,
}

/// Reference to a component by kind and name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRef {
    /// Application component name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,

    /// Workflow component name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,

    /// Configuration component name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    /// Helm parameter overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl ComponentRef {
    /// Reference an application component
    pub fn app(name: impl Into<String>) -> Self {
        Self {
            app: Some(name.into()),
            ..Default::default()
        }
    }

    /// Reference a workflow component
    pub fn workflow(name: impl Into<String>) -> Self {
        Self {
            workflow: Some(name.into()),
            ..Default::default()
        }
    }

    /// Reference a configuration component
    pub fn config(name: impl Into<String>) -> Self {
        Self {
            config: Some(name.into()),
            ..Default::default()
        }
    }

    /// Add a parameter override
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Metrics transport between the target and the hub
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Remote write straight to the hub
    #[default]
    Direct,
    /// Relay over the tailscale mesh
    Tailscale,
}

/// Observability stack configuration for a target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilitySpec {
    /// Inject the observability stack
    pub enabled: bool,

    /// Metrics transport
    #[serde(default)]
    pub transport: Transport,

    /// Tenant for multi-tenant backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

// ===== Workflow =====

/// When an experiment is considered finished
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// Complete as soon as the workflow succeeds
    #[default]
    Workflow,
    /// Stay Running until the experiment is deleted
    Manual,
}

/// Completion settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CompletionSpec {
    /// Completion mode
    #[serde(default)]
    pub mode: CompletionMode,
}

/// Validation workflow settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// WorkflowTemplate name
    pub template: String,

    /// Completion mode
    #[serde(default)]
    pub completion: CompletionSpec,

    /// Extra workflow parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

// ===== Hypothesis and metrics =====

/// The claim being tested
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HypothesisSpec {
    /// Expected outcome
    pub claim: String,

    /// Specific questions the experiment should answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,

    /// Areas for deep analysis
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub focus: Vec<String>,

    /// Machine-checkable thresholds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<SuccessCriterion>,
}

/// Threshold comparison against a named collected metric
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuccessCriterion {
    /// Query name in the collected metrics
    pub metric: String,

    /// One of lt, lte, gt, gte
    pub operator: String,

    /// Threshold, parsed as a float at evaluation time
    pub value: String,

    /// Human-readable explanation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named PromQL query with `$EXPERIMENT`, `$NAMESPACE`, `$DURATION` substitution
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuery {
    /// Result key
    pub name: String,

    /// PromQL expression
    pub query: String,

    /// instant (default) or range
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,

    /// Display unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Chart title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// UI grouping label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Requested analysis sections
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AnalyzerConfig {
    /// Section names
    #[serde(default)]
    pub sections: Vec<String>,
}

// ===== Tutorial =====

/// Interactive tutorial settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TutorialSpec {
    /// Tutorial file path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Copy target kubeconfigs into the experiment namespace
    #[serde(default)]
    pub expose_kubeconfig: bool,

    /// Services to resolve for the tutorial front-end
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<TutorialServiceRef>,
}

/// A service on a target cluster exposed to the tutorial
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TutorialServiceRef {
    /// Friendly name
    pub name: String,
    /// Target name
    pub target: String,
    /// Service name
    pub service: String,
    /// Service namespace
    pub namespace: String,
    /// Port; the first service port when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

// ===== Status =====

/// Experiment lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExperimentPhase {
    /// Accepted, nothing provisioned yet
    #[default]
    Pending,
    /// Cluster claims issued, waiting for readiness and deploying applications
    Provisioning,
    /// Applications created, waiting for health before submitting the workflow
    Ready,
    /// Validation workflow running
    Running,
    /// Workflow succeeded
    Complete,
    /// Workflow or analysis failed
    Failed,
}

impl ExperimentPhase {
    /// Complete and Failed are handled by the same two-stage teardown
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Lifecycle of the asynchronous analysis job
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AnalysisPhase {
    /// Job created
    Pending,
    /// Job has active pods
    Running,
    /// Job completed
    Succeeded,
    /// Job failed or vanished before completion was observed
    Failed,
    /// Analysis was not requested
    Skipped,
}

impl AnalysisPhase {
    /// Everything except Pending and Running
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for AnalysisPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Per-target phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TargetPhase {
    /// No claim yet
    #[default]
    Pending,
    /// Claim issued
    Provisioning,
    /// Cluster ready
    Ready,
    /// Claim creation failed
    Failed,
}

/// Ordered deployment groups for layered rollouts
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentLayer {
    /// Configuration and mesh plumbing
    Infra,
    /// Metrics agents and backends
    Obs,
    /// The components under test
    Workload,
}

impl DeploymentLayer {
    /// Name suffix used for the layer's Application
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Infra => "infra",
            Self::Obs => "obs",
            Self::Workload => "workload",
        }
    }
}

impl std::fmt::Display for DeploymentLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of one target
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    /// Target name, mirrors spec order
    pub name: String,

    /// Target phase
    #[serde(default)]
    pub phase: TargetPhase,

    /// Cluster handle returned by the provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Cluster API endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Effective machine type with defaults applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,

    /// Effective node count with defaults applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,

    /// Deployed resources as Kind/name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<String>,

    /// Secret holding this target's kubeconfig in the experiment namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig_secret: Option<String>,

    /// Layers whose Applications have been created
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployed_layers: Vec<DeploymentLayer>,

    /// Applications exist for this target. Never reset once true.
    #[serde(default)]
    pub apps_created: bool,
}

impl TargetStatus {
    /// Fresh status for a target
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// True when the target deploys through layered Applications
    pub fn is_layered(&self) -> bool {
        !self.deployed_layers.is_empty()
    }

    /// Whether a layer's Application has been created
    pub fn has_layer(&self, layer: DeploymentLayer) -> bool {
        self.deployed_layers.contains(&layer)
    }
}

/// Observed state of the validation workflow
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    /// Workflow object name
    pub name: String,

    /// Engine-reported phase
    #[serde(default)]
    pub phase: String,

    /// Start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Finish time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Engine-reported message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Resolved tutorial resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TutorialStatus {
    /// Resolved services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<DiscoveredService>,

    /// Target name to kubeconfig secret name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kubeconfig_secrets: BTreeMap<String, String>,
}

/// A tutorial service with its resolved endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DiscoveredService {
    /// Friendly name
    pub name: String,
    /// Resolved URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Endpoint resolved
    #[serde(default)]
    pub ready: bool,
}

/// Observed state of an experiment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: ExperimentPhase,

    /// One entry per spec target, same order, once initialized
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetStatus>,

    /// Validation workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_status: Option<WorkflowStatus>,

    /// Tutorial resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tutorial_status: Option<TutorialStatus>,

    /// When the experiment reached Complete or Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Billable resources released. Never reset once true.
    #[serde(default)]
    pub resources_cleaned: bool,

    /// Where the summary was stored, or "disabled"
    #[serde(
        default,
        rename = "resultsURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub results_url: Option<String>,

    /// In-cluster metrics collection attempts made so far
    #[serde(default)]
    pub metrics_attempts: u32,

    /// Results committed to the results repository
    #[serde(default)]
    pub published: bool,

    /// Results branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_branch: Option<String>,

    /// Results pull request number
    #[serde(
        default,
        rename = "publishPRNumber",
        skip_serializing_if = "Option::is_none"
    )]
    pub publish_pr_number: Option<u64>,

    /// Results pull request URL
    #[serde(
        default,
        rename = "publishPRURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub publish_pr_url: Option<String>,

    /// Analysis job name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_job_name: Option<String>,

    /// Analysis job lifecycle; unset until analysis is decided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_phase: Option<AnalysisPhase>,

    /// validated, invalidated or insufficient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis_result: Option<String>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ExperimentStatus {
    /// True when analysis was decided and reached a terminal phase
    pub fn analysis_terminal(&self) -> bool {
        self.analysis_phase.is_some_and(|p| p.is_terminal())
    }
}

impl Experiment {
    /// Current status, or the default status for a fresh object
    pub fn status_or_default(&self) -> ExperimentStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Current phase
    pub fn phase(&self) -> ExperimentPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Completion mode of the validation workflow
    pub fn completion_mode(&self) -> CompletionMode {
        self.spec.workflow.completion.mode
    }

    /// Look up a spec target by name
    pub fn target(&self, name: &str) -> Option<&Target> {
        self.spec.targets.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn sample_yaml() -> &'static str {
        r#"
apiVersion: experiments.illm.io/v1alpha1
kind: Experiment
metadata:
  name: tsdb-comparison
  namespace: experiments
spec:
  targets:
    - name: app
      cluster:
        type: gke
        machineType: e2-standard-4
        nodeCount: 2
      components:
        - app: victoria-metrics
          params:
            replicas: "2"
      observability:
        enabled: true
        transport: tailscale
    - name: loadgen
      cluster:
        type: hub
      depends: [app]
  workflow:
    template: tsdb-benchmark
    completion:
      mode: manual
  hypothesis:
    claim: VictoriaMetrics uses less memory
    successCriteria:
      - metric: memory_total
        operator: lt
        value: "500000000"
  publish: true
"#
    }

    #[test]
    fn parses_full_experiment() {
        let exp: Experiment = serde_yaml::from_str(sample_yaml()).unwrap();
        assert_eq!(exp.spec.targets.len(), 2);
        let app = &exp.spec.targets[0];
        assert_eq!(app.cluster.cluster_type, ClusterType::Gke);
        assert_eq!(app.cluster.node_count, Some(2));
        assert!(app.uses_tailscale());
        assert!(exp.spec.targets[1].is_hub());
        assert_eq!(exp.spec.targets[1].depends, vec!["app".to_string()]);
        assert_eq!(exp.completion_mode(), CompletionMode::Manual);
        assert_eq!(exp.phase(), ExperimentPhase::Pending);
        assert!(exp.spec.publish);
    }

    #[test]
    fn status_uses_wire_field_names() {
        let status = ExperimentStatus {
            phase: ExperimentPhase::Complete,
            results_url: Some("s3://experiment-results/x/".to_string()),
            publish_pr_number: Some(7),
            publish_pr_url: Some("https://github.com/o/r/pull/7".to_string()),
            analysis_phase: Some(AnalysisPhase::Pending),
            targets: vec![TargetStatus {
                deployed_layers: vec![DeploymentLayer::Infra, DeploymentLayer::Obs],
                ..TargetStatus::pending("app")
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Complete");
        assert_eq!(json["resultsURL"], "s3://experiment-results/x/");
        assert_eq!(json["publishPRNumber"], 7);
        assert_eq!(json["publishPRURL"], "https://github.com/o/r/pull/7");
        assert_eq!(json["analysisPhase"], "Pending");
        assert_eq!(json["targets"][0]["deployedLayers"][1], "obs");
        assert_eq!(json["targets"][0]["phase"], "Pending");
    }

    #[test]
    fn analysis_terminal_phases() {
        assert!(!AnalysisPhase::Pending.is_terminal());
        assert!(!AnalysisPhase::Running.is_terminal());
        assert!(AnalysisPhase::Succeeded.is_terminal());
        assert!(AnalysisPhase::Failed.is_terminal());
        assert!(AnalysisPhase::Skipped.is_terminal());

        let mut status = ExperimentStatus::default();
        assert!(!status.analysis_terminal());
        status.analysis_phase = Some(AnalysisPhase::Skipped);
        assert!(status.analysis_terminal());
    }

    #[test]
    fn crd_has_expected_names() {
        let crd = Experiment::crd();
        assert_eq!(crd.spec.group, "experiments.illm.io");
        assert_eq!(crd.spec.names.kind, "Experiment");
        assert_eq!(crd.spec.names.plural, "experiments");
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn component_ref_builders() {
        let r = ComponentRef::app("metrics-agent").with_param("alloy.extraEnv[0].value", "exp");
        assert_eq!(r.app.as_deref(), Some("metrics-agent"));
        assert_eq!(r.params.get("alloy.extraEnv[0].value").map(String::as_str), Some("exp"));
        assert_eq!(ComponentRef::config("metrics-egress").config.as_deref(), Some("metrics-egress"));
        assert_eq!(ComponentRef::workflow("k6").workflow.as_deref(), Some("k6"));
    }
}
