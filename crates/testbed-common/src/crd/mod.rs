//! Custom Resource Definitions for the experiment operator

mod component;
mod experiment;
mod types;

pub use component::{
    Component, ComponentObservability, ComponentParameter, ComponentSource, ComponentSpec,
    ComponentType, HelmConfig, HelmParameter,
};
pub use experiment::{
    AnalysisPhase, AnalyzerConfig, ClusterSpec, ClusterType, CompletionMode, CompletionSpec,
    ComponentRef, DeploymentLayer, DiscoveredService, Experiment, ExperimentPhase, ExperimentSpec,
    ExperimentStatus, HypothesisSpec, MetricsQuery, ObservabilitySpec, SuccessCriterion, Target,
    TargetPhase, TargetStatus, Transport, TutorialServiceRef, TutorialSpec, TutorialStatus,
    WorkflowSpec, WorkflowStatus,
};
pub use types::{set_condition, Condition, ConditionStatus};
