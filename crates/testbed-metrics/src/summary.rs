//! Experiment summary persisted as `summary.json`
//!
//! The summary is the single document handed to storage, the results
//! repository and the analyzer. Effective cluster sizing is read from status,
//! which records what was actually provisioned.

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use testbed_common::crd::Experiment;

use crate::cost::CostEstimate;
use crate::types::MetricsResult;

/// Analysis sections requested when an experiment does not list its own
pub const DEFAULT_ANALYZER_SECTIONS: &[&str] = &[
    "abstract",
    "targetAnalysis",
    "performanceAnalysis",
    "metricInsights",
    "body",
    "feedback",
    "architectureDiagram",
];

/// Analysis sections as embedded in the summary
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerSections {
    /// Requested section identifiers
    pub sections: Vec<String>,
}

/// Everything known about a finished experiment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSummary {
    /// Experiment name
    pub name: String,
    /// Experiment namespace
    pub namespace: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Completion time, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between creation and completion
    #[serde(default)]
    pub duration_seconds: f64,
    /// Phase at collection time
    pub phase: String,
    /// Classification tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Hypothesis and criterion outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<HypothesisContext>,
    /// Sections the analyzer should produce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer_config: Option<AnalyzerSections>,
    /// Per-target summaries in spec order
    #[serde(default)]
    pub targets: Vec<TargetSummary>,
    /// Validation workflow outcome
    pub workflow: WorkflowSummary,
    /// Collected metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsResult>,
    /// Rough infrastructure cost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<CostEstimate>,
    /// Analyzer output, written back by the analysis job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
}

/// Hypothesis as carried into the summary
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HypothesisContext {
    /// The claim under test
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub claim: String,
    /// Questions for the analyzer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    /// Areas to focus on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub focus: Vec<String>,
    /// Criteria with their evaluated outcomes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<CriterionSummary>,
    /// `validated`, `invalidated` or `insufficient`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_verdict: Option<String>,
}

/// One success criterion and its outcome
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionSummary {
    /// Query name the criterion reads
    pub metric: String,
    /// `lt`, `lte`, `gt` or `gte`
    pub operator: String,
    /// Threshold as declared
    pub value: String,
    /// Human description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Outcome; unset when the criterion could not be resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    /// The scalar compared against the threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_value: Option<String>,
}

/// One target as it was provisioned
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    /// Target name
    pub name: String,
    /// Provisioned cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    /// `gke` or `hub`
    pub cluster_type: String,
    /// Effective machine type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    /// Effective node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,
    /// Deployed resources as `Kind/name`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<String>,
}

/// Validation workflow outcome
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    /// Workflow object name
    #[serde(default)]
    pub name: String,
    /// Template it was built from
    pub template: String,
    /// Last observed phase
    #[serde(default)]
    pub phase: String,
    /// Start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Finish time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Build the summary skeleton from an experiment's spec and status.
///
/// Metrics, verdict and cost are filled in by the caller.
pub fn collect_summary(experiment: &Experiment) -> ExperimentSummary {
    let spec = &experiment.spec;
    let status = experiment.status_or_default();
    let created_at = experiment
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_default();

    let hypothesis = spec.hypothesis.as_ref().map(|h| HypothesisContext {
        claim: h.claim.clone(),
        questions: h.questions.clone(),
        focus: h.focus.clone(),
        success_criteria: h
            .success_criteria
            .iter()
            .map(|c| CriterionSummary {
                metric: c.metric.clone(),
                operator: c.operator.clone(),
                value: c.value.clone(),
                description: c.description.clone(),
                passed: None,
                actual_value: None,
            })
            .collect(),
        machine_verdict: None,
    });

    let analyzer_config = spec
        .analyzer_config
        .as_ref()
        .filter(|c| !c.sections.is_empty())
        .map(|c| AnalyzerSections {
            sections: c.sections.clone(),
        });

    let targets = spec
        .targets
        .iter()
        .map(|target| {
            let observed = status.targets.iter().find(|t| t.name == target.name);
            TargetSummary {
                name: target.name.clone(),
                cluster_name: observed.and_then(|t| t.cluster_name.clone()),
                cluster_type: target.cluster.cluster_type.to_string(),
                machine_type: observed.and_then(|t| t.machine_type.clone()),
                node_count: observed.and_then(|t| t.node_count),
                components: observed.map(|t| t.components.clone()).unwrap_or_default(),
            }
        })
        .collect();

    let mut workflow = WorkflowSummary {
        template: spec.workflow.template.clone(),
        ..Default::default()
    };
    if let Some(ws) = &status.workflow_status {
        workflow.name = ws.name.clone();
        workflow.phase = ws.phase.clone();
        workflow.started_at = ws.started_at;
        workflow.finished_at = ws.finished_at;
    }

    ExperimentSummary {
        name: experiment.name_any(),
        namespace: experiment.namespace().unwrap_or_default(),
        description: spec.description.clone().unwrap_or_default(),
        created_at,
        completed_at: status.completed_at,
        duration_seconds: status
            .completed_at
            .map(|done| (done - created_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default(),
        phase: status.phase.to_string(),
        tags: spec.tags.clone(),
        hypothesis,
        analyzer_config,
        targets,
        workflow,
        metrics: None,
        cost_estimate: None,
        analysis: None,
    }
}

/// Sections to request: the experiment's own list, else the defaults.
///
/// An explicit empty list requests no analysis. The flag is true when the
/// defaults were used.
pub fn analyzer_sections(experiment: &Experiment) -> (Vec<String>, bool) {
    match experiment.spec.analyzer_config.as_ref() {
        Some(config) => (config.sections.clone(), false),
        None => (
            DEFAULT_ANALYZER_SECTIONS.iter().map(|s| s.to_string()).collect(),
            true,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use testbed_common::crd::{
        AnalyzerConfig, ClusterSpec, ClusterType, ExperimentPhase, ExperimentSpec,
        ExperimentStatus, HypothesisSpec, SuccessCriterion, Target, TargetStatus, WorkflowSpec,
        WorkflowStatus,
    };

    fn experiment() -> Experiment {
        let created = DateTime::from_timestamp(1_707_350_400, 0).unwrap();
        let mut exp = Experiment::new(
            "tsdb-comparison",
            ExperimentSpec {
                description: Some("Compare TSDBs".to_string()),
                targets: vec![
                    Target {
                        name: "app".to_string(),
                        cluster: ClusterSpec {
                            cluster_type: ClusterType::Gke,
                            machine_type: Some("e2-standard-2".to_string()),
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                    Target {
                        name: "loadgen".to_string(),
                        cluster: ClusterSpec {
                            cluster_type: ClusterType::Hub,
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                ],
                workflow: WorkflowSpec {
                    template: "tsdb-benchmark".to_string(),
                    ..Default::default()
                },
                tags: vec!["tsdb".to_string()],
                hypothesis: Some(HypothesisSpec {
                    claim: "VictoriaMetrics uses less memory".to_string(),
                    success_criteria: vec![SuccessCriterion {
                        metric: "memory_total".to_string(),
                        operator: "lt".to_string(),
                        value: "1e9".to_string(),
                        description: None,
                    }],
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        exp.metadata.namespace = Some("experiments".to_string());
        exp.metadata.creation_timestamp = Some(Time(created));
        exp.status = Some(ExperimentStatus {
            phase: ExperimentPhase::Complete,
            completed_at: Some(created + TimeDelta::minutes(90)),
            targets: vec![TargetStatus {
                cluster_name: Some("tsdb-comparison-app".to_string()),
                machine_type: Some("e2-standard-4".to_string()),
                node_count: Some(3),
                components: vec!["Deployment/vm".to_string()],
                ..TargetStatus::pending("app")
            }],
            workflow_status: Some(WorkflowStatus {
                name: "tsdb-comparison-validation".to_string(),
                phase: "Succeeded".to_string(),
                started_at: Some(created + TimeDelta::minutes(20)),
                ..Default::default()
            }),
            ..Default::default()
        });
        exp
    }

    #[test]
    fn summary_reads_effective_sizing_from_status() {
        let summary = collect_summary(&experiment());

        assert_eq!(summary.name, "tsdb-comparison");
        assert_eq!(summary.namespace, "experiments");
        assert_eq!(summary.phase, "Complete");
        assert_eq!(summary.duration_seconds, 5400.0);
        assert_eq!(summary.targets.len(), 2);
        assert_eq!(summary.targets[0].machine_type.as_deref(), Some("e2-standard-4"));
        assert_eq!(summary.targets[0].node_count, Some(3));
        assert_eq!(summary.targets[1].cluster_type, "hub");
        assert!(summary.targets[1].cluster_name.is_none());
        assert_eq!(summary.workflow.name, "tsdb-comparison-validation");
        assert_eq!(summary.workflow.template, "tsdb-benchmark");
    }

    #[test]
    fn summary_carries_hypothesis_without_outcomes() {
        let summary = collect_summary(&experiment());
        let hypothesis = summary.hypothesis.unwrap();
        assert_eq!(hypothesis.success_criteria.len(), 1);
        assert!(hypothesis.success_criteria[0].passed.is_none());
        assert!(hypothesis.machine_verdict.is_none());
    }

    #[test]
    fn analyzer_config_only_when_sections_listed() {
        let mut exp = experiment();
        assert!(collect_summary(&exp).analyzer_config.is_none());
        assert_eq!(analyzer_sections(&exp).0.len(), DEFAULT_ANALYZER_SECTIONS.len());
        assert!(analyzer_sections(&exp).1);

        exp.spec.analyzer_config = Some(AnalyzerConfig { sections: vec![] });
        assert!(collect_summary(&exp).analyzer_config.is_none());
        assert_eq!(analyzer_sections(&exp), (vec![], false));

        exp.spec.analyzer_config = Some(AnalyzerConfig {
            sections: vec!["abstract".to_string()],
        });
        assert_eq!(
            collect_summary(&exp).analyzer_config.unwrap().sections,
            vec!["abstract".to_string()]
        );
        assert_eq!(analyzer_sections(&exp), (vec!["abstract".to_string()], false));
    }

    #[test]
    fn summary_json_layout() {
        let json = serde_json::to_value(collect_summary(&experiment())).unwrap();
        assert_eq!(json["durationSeconds"], 5400.0);
        assert_eq!(json["targets"][0]["clusterType"], "gke");
        assert_eq!(json["hypothesis"]["successCriteria"][0]["metric"], "memory_total");
        assert!(json.get("metrics").is_none());
        assert!(json.get("analyzerConfig").is_none());
    }
}
