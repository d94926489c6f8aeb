//! Shared fixtures for reconciler tests
//!
//! Status updates are captured rather than matched with `withf()`, so tests
//! assert on what was persisted instead of how the handler got there.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{TimeDelta, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use testbed_cluster::MockClusterProvisioner;
use testbed_common::crd::{
    ClusterSpec, ClusterType, ComponentRef, Experiment, ExperimentPhase, ExperimentSpec,
    ExperimentStatus, Target, TargetPhase, TargetStatus, WorkflowSpec, WorkflowStatus,
};
use testbed_common::events::NoopEventPublisher;
use testbed_common::DEFAULT_FINALIZER;
use testbed_deploy::MockApplicationDeployer;
use testbed_metrics::{DataPoint, MetricsResult, MockMetricsSource, QueryResult, TimeRange};
use testbed_publish::{MockAnalysisJobs, MockObjectStore, MockResultsRepository};
use testbed_workflow::MockWorkflowController;

use crate::config::OperatorConfig;
use crate::controller::{Context, MockExperimentStore};
use crate::tutorial::MockTutorialResources;

/// Every status write seen by the mock store
#[derive(Clone, Default)]
pub struct StatusCapture {
    updates: Arc<Mutex<Vec<ExperimentStatus>>>,
}

impl StatusCapture {
    pub fn record(&self, status: ExperimentStatus) {
        self.updates
            .lock()
            .expect("mutex should not be poisoned")
            .push(status);
    }

    pub fn last(&self) -> Option<ExperimentStatus> {
        self.updates
            .lock()
            .expect("mutex should not be poisoned")
            .last()
            .cloned()
    }

    pub fn last_phase(&self) -> Option<ExperimentPhase> {
        self.last().map(|s| s.phase)
    }

    pub fn count(&self) -> usize {
        self.updates
            .lock()
            .expect("mutex should not be poisoned")
            .len()
    }
}

/// Mocks for every collaborator; unexpected calls panic
pub struct Mocks {
    pub store: MockExperimentStore,
    pub provisioner: MockClusterProvisioner,
    pub deployer: MockApplicationDeployer,
    pub workflows: MockWorkflowController,
    pub metrics: MockMetricsSource,
    pub objects: Option<MockObjectStore>,
    pub results_repo: Option<MockResultsRepository>,
    pub analysis: MockAnalysisJobs,
    pub tutorial: MockTutorialResources,
    pub config: OperatorConfig,
}

impl Mocks {
    pub fn new() -> Self {
        Self {
            store: MockExperimentStore::new(),
            provisioner: MockClusterProvisioner::new(),
            deployer: MockApplicationDeployer::new(),
            workflows: MockWorkflowController::new(),
            metrics: MockMetricsSource::new(),
            objects: None,
            results_repo: None,
            analysis: MockAnalysisJobs::new(),
            tutorial: MockTutorialResources::new(),
            config: OperatorConfig::default(),
        }
    }

    /// Mocks whose store records every status patch
    pub fn with_capture() -> (Self, StatusCapture) {
        let capture = StatusCapture::default();
        let recorder = capture.clone();
        let mut mocks = Self::new();
        mocks.store.expect_patch_status().returning(move |_, _, status| {
            recorder.record(status.clone());
            Ok(())
        });
        (mocks, capture)
    }

    pub fn into_context(self) -> Arc<Context> {
        Arc::new(Context {
            store: Arc::new(self.store),
            provisioner: Arc::new(self.provisioner),
            deployer: Arc::new(self.deployer),
            workflows: Arc::new(self.workflows),
            metrics: Arc::new(self.metrics),
            objects: self
                .objects
                .map(|o| Arc::new(o) as Arc<dyn testbed_publish::ObjectStore>),
            results_repo: self
                .results_repo
                .map(|r| Arc::new(r) as Arc<dyn testbed_publish::ResultsRepository>),
            analysis: Arc::new(self.analysis),
            tutorial: Arc::new(self.tutorial),
            events: Arc::new(NoopEventPublisher),
            config: self.config,
        })
    }
}

/// Experiment in the `experiments` namespace that already carries the
/// finalizer and was created an hour ago
pub fn experiment(name: &str, targets: Vec<Target>) -> Experiment {
    let mut exp = Experiment::new(
        name,
        ExperimentSpec {
            targets,
            workflow: WorkflowSpec {
                template: "validate".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    exp.metadata.namespace = Some("experiments".to_string());
    exp.metadata.finalizers = Some(vec![DEFAULT_FINALIZER.to_string()]);
    exp.metadata.creation_timestamp = Some(Time(Utc::now() - TimeDelta::hours(1)));
    exp
}

pub fn with_status(mut experiment: Experiment, status: ExperimentStatus) -> Experiment {
    experiment.status = Some(status);
    experiment
}

pub fn gke_target(name: &str) -> Target {
    Target {
        name: name.to_string(),
        cluster: ClusterSpec {
            cluster_type: ClusterType::Gke,
            ..Default::default()
        },
        components: vec![ComponentRef::app("podinfo")],
        ..Default::default()
    }
}

pub fn hub_target(name: &str) -> Target {
    Target {
        name: name.to_string(),
        cluster: ClusterSpec {
            cluster_type: ClusterType::Hub,
            ..Default::default()
        },
        components: vec![ComponentRef::app("loki")],
        ..Default::default()
    }
}

/// Target whose cluster is up and whose Applications exist
pub fn ready_target(name: &str, cluster: &str, endpoint: &str) -> TargetStatus {
    TargetStatus {
        name: name.to_string(),
        phase: TargetPhase::Ready,
        cluster_name: Some(cluster.to_string()),
        endpoint: Some(endpoint.to_string()),
        apps_created: true,
        ..Default::default()
    }
}

/// Status of an experiment whose workflow `demo-validation` is running
pub fn running_status(targets: Vec<TargetStatus>) -> ExperimentStatus {
    ExperimentStatus {
        phase: ExperimentPhase::Running,
        targets,
        workflow_status: Some(WorkflowStatus {
            name: "demo-validation".to_string(),
            phase: "Running".to_string(),
            started_at: Some(Utc::now() - TimeDelta::minutes(30)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Metrics carrying one sample for each named query
pub fn metrics_with(queries: &[(&str, f64)]) -> MetricsResult {
    let now = Utc::now();
    let mut result = MetricsResult::new(TimeRange {
        start: now - TimeDelta::hours(1),
        end: now,
        duration: "1h".to_string(),
        step_seconds: 0,
    });
    for (name, value) in queries {
        result.queries.insert(
            name.to_string(),
            QueryResult {
                query: format!("{}_query", name),
                query_type: "instant".to_string(),
                data: vec![DataPoint {
                    labels: BTreeMap::new(),
                    timestamp: now,
                    value: *value,
                }],
                ..Default::default()
            },
        );
    }
    result
}
