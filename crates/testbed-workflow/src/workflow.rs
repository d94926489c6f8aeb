//! Argo Workflow types
//!
//! A validation workflow either references a registered WorkflowTemplate or,
//! when none exists, carries a minimal inline definition: one logging step
//! and, under manual completion, a suspend step that waits for a resume.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use testbed_common::crd::{CompletionMode, WorkflowSpec};
use testbed_common::kube_utils::{HasApiResource, ObjectMeta};
use testbed_common::EXPERIMENT_LABEL;

/// Service account workflows run as
pub const SERVICE_ACCOUNT: &str = "argo-workflow";
/// Entrypoint of the inline workflow
pub const INLINE_ENTRYPOINT: &str = "experiment-lifecycle";
/// Image of the inline logging step
pub const LOG_IMAGE: &str = "alpine:3.19";

const TERMINAL_PHASES: &[&str] = &["Succeeded", "Failed", "Error"];
const SUCCEEDED: &str = "Succeeded";

/// Deterministic workflow name for an experiment
pub fn workflow_name(experiment: &str) -> String {
    format!("{}-validation", experiment)
}

/// Argo WorkflowTemplate, only used for existence checks
pub struct WorkflowTemplate;

impl HasApiResource for WorkflowTemplate {
    const API_VERSION: &'static str = "argoproj.io/v1alpha1";
    const KIND: &'static str = "WorkflowTemplate";
}

/// Argo Workflow
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// API version
    pub api_version: String,
    /// Resource kind
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Workflow spec
    pub spec: WorkflowBody,
}

impl HasApiResource for Workflow {
    const API_VERSION: &'static str = "argoproj.io/v1alpha1";
    const KIND: &'static str = "Workflow";
}

/// Workflow spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowBody {
    /// Service account
    pub service_account_name: String,
    /// Registered template to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_template_ref: Option<TemplateRef>,
    /// Inline entrypoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    /// Inline templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Template>,
    /// Workflow arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Arguments>,
}

/// Reference to a WorkflowTemplate
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TemplateRef {
    /// Template name
    pub name: String,
}

/// Named parameters
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Arguments {
    /// Parameters
    pub parameters: Vec<Parameter>,
}

/// One parameter; inputs declare it without a value
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    /// Name
    pub name: String,
    /// Value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Parameter {
    fn valued(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

/// Inline template
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Template {
    /// Template name
    pub name: String,
    /// Sequential step groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Vec<Step>>,
    /// Declared inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Arguments>,
    /// Container to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    /// Suspend until resumed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<Suspend>,
}

/// A step invoking a template
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Step name
    pub name: String,
    /// Template invoked
    pub template: String,
    /// Arguments passed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Arguments>,
}

/// Container template body
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Container {
    /// Image
    pub image: String,
    /// Command
    pub command: Vec<String>,
    /// Args
    pub args: Vec<String>,
}

/// Indefinite suspend; resumed with `argo resume`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Suspend {}

fn arguments(params: &BTreeMap<String, String>) -> Option<Arguments> {
    (!params.is_empty()).then(|| Arguments {
        parameters: params
            .iter()
            .map(|(k, v)| Parameter::valued(k, v))
            .collect(),
    })
}

fn metadata(experiment: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta::new(workflow_name(experiment), namespace).with_label(EXPERIMENT_LABEL, experiment)
}

/// Workflow running the registered template named in the spec.
///
/// Parameters are emitted sorted by name.
pub fn build_template_workflow(experiment: &str, namespace: &str, spec: &WorkflowSpec) -> Workflow {
    Workflow {
        api_version: Workflow::API_VERSION.to_string(),
        kind: Workflow::KIND.to_string(),
        metadata: metadata(experiment, namespace),
        spec: WorkflowBody {
            service_account_name: SERVICE_ACCOUNT.to_string(),
            workflow_template_ref: Some(TemplateRef {
                name: spec.template.clone(),
            }),
            arguments: arguments(&spec.params),
            ..Default::default()
        },
    }
}

/// Minimal inline workflow used when the named template is not registered
pub fn build_inline_workflow(experiment: &str, namespace: &str, spec: &WorkflowSpec) -> Workflow {
    let manual = spec.completion.mode == CompletionMode::Manual;

    let mut steps = vec![vec![Step {
        name: "log-ready".to_string(),
        template: "log".to_string(),
        arguments: Some(Arguments {
            parameters: vec![Parameter::valued(
                "message",
                format!("Experiment {} is running", experiment),
            )],
        }),
    }]];
    if manual {
        steps.push(vec![Step {
            name: "wait".to_string(),
            template: "suspend-step".to_string(),
            arguments: None,
        }]);
    }

    let mut templates = vec![
        Template {
            name: INLINE_ENTRYPOINT.to_string(),
            steps,
            ..Default::default()
        },
        Template {
            name: "log".to_string(),
            inputs: Some(Arguments {
                parameters: vec![Parameter {
                    name: "message".to_string(),
                    value: None,
                }],
            }),
            container: Some(Container {
                image: LOG_IMAGE.to_string(),
                command: vec!["echo".to_string()],
                args: vec!["{{inputs.parameters.message}}".to_string()],
            }),
            ..Default::default()
        },
    ];
    if manual {
        templates.push(Template {
            name: "suspend-step".to_string(),
            suspend: Some(Suspend {}),
            ..Default::default()
        });
    }

    Workflow {
        api_version: Workflow::API_VERSION.to_string(),
        kind: Workflow::KIND.to_string(),
        metadata: metadata(experiment, namespace),
        spec: WorkflowBody {
            service_account_name: SERVICE_ACCOUNT.to_string(),
            entrypoint: Some(INLINE_ENTRYPOINT.to_string()),
            templates,
            arguments: arguments(&spec.params),
            ..Default::default()
        },
    }
}

// ===== Status =====

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusView {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    finished_at: Option<String>,
}

/// Observed state of a workflow run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkflowRun {
    /// Engine phase; Pending until the engine reports one
    pub phase: String,
    /// Start time
    pub started_at: Option<DateTime<Utc>>,
    /// Finish time
    pub finished_at: Option<DateTime<Utc>>,
    /// Engine message
    pub message: Option<String>,
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.filter(|s| !s.is_empty())
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

impl WorkflowRun {
    /// Read the `status` of an observed Workflow object body
    pub fn from_object_data(data: &serde_json::Value) -> Self {
        let view: StatusView = data
            .get("status")
            .cloned()
            .and_then(|s| serde_json::from_value(s).ok())
            .unwrap_or_default();

        let Some(phase) = view.phase.filter(|p| !p.is_empty()) else {
            return Self {
                phase: "Pending".to_string(),
                ..Default::default()
            };
        };
        Self {
            phase,
            started_at: parse_time(view.started_at),
            finished_at: parse_time(view.finished_at),
            message: view.message.filter(|m| !m.is_empty()),
        }
    }

    /// Succeeded, Failed and Error are terminal
    pub fn is_terminal(&self) -> bool {
        is_terminal(&self.phase)
    }

    /// Only Succeeded is success
    pub fn is_succeeded(&self) -> bool {
        is_succeeded(&self.phase)
    }
}

/// Whether a phase is terminal
pub fn is_terminal(phase: &str) -> bool {
    TERMINAL_PHASES.contains(&phase)
}

/// Whether a phase is success
pub fn is_succeeded(phase: &str) -> bool {
    phase == SUCCEEDED
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbed_common::crd::CompletionSpec;

    fn spec(mode: CompletionMode) -> WorkflowSpec {
        WorkflowSpec {
            template: "tsdb-benchmark".to_string(),
            completion: CompletionSpec { mode },
            params: BTreeMap::from([
                ("target-endpoint".to_string(), "34.1.2.3".to_string()),
                ("experiment-name".to_string(), "tsdb".to_string()),
            ]),
        }
    }

    #[test]
    fn template_workflow_references_template_with_sorted_params() {
        let wf = build_template_workflow("tsdb", "argo-workflows", &spec(CompletionMode::Workflow));
        let json = serde_json::to_value(&wf).unwrap();
        assert_eq!(json["metadata"]["name"], "tsdb-validation");
        assert_eq!(json["metadata"]["labels"][EXPERIMENT_LABEL], "tsdb");
        assert_eq!(json["spec"]["serviceAccountName"], "argo-workflow");
        assert_eq!(json["spec"]["workflowTemplateRef"]["name"], "tsdb-benchmark");
        assert_eq!(json["spec"]["arguments"]["parameters"][0]["name"], "experiment-name");
        assert_eq!(json["spec"]["arguments"]["parameters"][1]["value"], "34.1.2.3");
        assert!(json["spec"].get("templates").is_none());
    }

    #[test]
    fn inline_workflow_logs_and_finishes_in_workflow_mode() {
        let wf = build_inline_workflow("tsdb", "argo-workflows", &spec(CompletionMode::Workflow));
        assert_eq!(wf.spec.entrypoint.as_deref(), Some("experiment-lifecycle"));
        assert_eq!(wf.spec.templates.len(), 2);
        assert_eq!(wf.spec.templates[0].steps.len(), 1);

        let json = serde_json::to_value(&wf).unwrap();
        let log = &json["spec"]["templates"][1];
        assert_eq!(log["container"]["image"], "alpine:3.19");
        assert_eq!(log["container"]["args"][0], "{{inputs.parameters.message}}");
        assert!(log["inputs"]["parameters"][0].get("value").is_none());
        assert_eq!(
            json["spec"]["templates"][0]["steps"][0][0]["arguments"]["parameters"][0]["value"],
            "Experiment tsdb is running"
        );
    }

    #[test]
    fn inline_workflow_suspends_in_manual_mode() {
        let wf = build_inline_workflow("tsdb", "argo-workflows", &spec(CompletionMode::Manual));
        assert_eq!(wf.spec.templates.len(), 3);
        assert_eq!(wf.spec.templates[0].steps[1][0].template, "suspend-step");

        let json = serde_json::to_value(&wf).unwrap();
        assert_eq!(json["spec"]["templates"][2]["suspend"], serde_json::json!({}));
    }

    #[test]
    fn status_without_phase_is_pending() {
        let run = WorkflowRun::from_object_data(&serde_json::json!({"spec": {}}));
        assert_eq!(run.phase, "Pending");
        assert!(!run.is_terminal());
    }

    #[test]
    fn status_reads_phase_times_and_message() {
        let run = WorkflowRun::from_object_data(&serde_json::json!({
            "status": {
                "phase": "Failed",
                "message": "child failed",
                "startedAt": "2026-01-02T03:04:05Z",
                "finishedAt": "not-a-time"
            }
        }));
        assert_eq!(run.phase, "Failed");
        assert_eq!(run.message.as_deref(), Some("child failed"));
        assert_eq!(run.started_at.unwrap().to_rfc3339(), "2026-01-02T03:04:05+00:00");
        assert!(run.finished_at.is_none());
        assert!(run.is_terminal());
        assert!(!run.is_succeeded());
    }

    #[test]
    fn phase_classification() {
        for phase in ["Succeeded", "Failed", "Error"] {
            assert!(is_terminal(phase), "{phase} should be terminal");
        }
        for phase in ["Pending", "Running", ""] {
            assert!(!is_terminal(phase), "{phase} should not be terminal");
        }
        assert!(is_succeeded("Succeeded"));
        assert!(!is_succeeded("Error"));
    }
}
