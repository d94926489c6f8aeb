//! Experiment controller: context, reconcile entry point and error policy
//!
//! Each pass reads the experiment's persisted status, dispatches on its
//! phase, and returns how long to wait before the next pass. Handlers never
//! sleep; waiting is always a requeue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use testbed_cluster::{ClusterProvisioner, GkeClusterProvisioner};
use testbed_common::crd::{Experiment, ExperimentPhase, ExperimentStatus};
use testbed_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use testbed_common::{Error, FIELD_MANAGER};
use testbed_deploy::{ApplicationDeployer, ArgoApplicationDeployer};
use testbed_metrics::{KubeMetricsSource, MetricsSource};
use testbed_publish::{
    AnalysisJobs, AnalyzerSettings, GitHubRepository, KubeAnalysisJobs, ObjectStore,
    ResultsRepository, S3ObjectStore,
};
use testbed_workflow::{ArgoWorkflowController, WorkflowController};

use crate::cleanup::cleanup_experiment;
use crate::config::OperatorConfig;
use crate::phases::{
    handle_complete, handle_pending, handle_provisioning, handle_ready, handle_running,
    publish_event,
};
use crate::tutorial::{KubeTutorialResources, TutorialResources};

/// Requeue after an error that may clear on its own
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue after an error that needs an operator to fix something
const CONFIG_ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Writes to Experiment objects
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Replace the status of experiment `name` in `namespace`
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExperimentStatus,
    ) -> Result<(), Error>;

    /// Add `finalizer` unless it is already present
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove `finalizer` if present
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// [`ExperimentStore`] backed by the API server
pub struct KubeExperimentStore {
    client: Client,
}

impl KubeExperimentStore {
    /// Create a store using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Experiment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.api(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExperimentStore for KubeExperimentStore {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExperimentStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({
            "status": status
        });
        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let experiment = self.api(namespace).get(name).await?;
        let mut finalizers = experiment.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(namespace, name, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let experiment = self.api(namespace).get(name).await?;
        let finalizers = experiment.metadata.finalizers.unwrap_or_default();
        if !finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let remaining = finalizers
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();
        self.patch_finalizers(namespace, name, remaining).await
    }
}

/// Shared state for every reconciliation
///
/// Each external system sits behind a trait object so tests can substitute
/// mocks. Use [`ContextBuilder`] to construct production instances.
pub struct Context {
    /// Experiment status and finalizer writes
    pub store: Arc<dyn ExperimentStore>,
    /// Cluster claims
    pub provisioner: Arc<dyn ClusterProvisioner>,
    /// ArgoCD Applications and cluster registrations
    pub deployer: Arc<dyn ApplicationDeployer>,
    /// Validation workflows
    pub workflows: Arc<dyn WorkflowController>,
    /// Metrics sources
    pub metrics: Arc<dyn MetricsSource>,
    /// Results bucket; None when no endpoint is configured
    pub objects: Option<Arc<dyn ObjectStore>>,
    /// Results repository; None when publishing is not configured
    pub results_repo: Option<Arc<dyn ResultsRepository>>,
    /// Analyzer Jobs
    pub analysis: Arc<dyn AnalysisJobs>,
    /// Tutorial secrets and service lookups
    pub tutorial: Arc<dyn TutorialResources>,
    /// Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Runtime configuration
    pub config: OperatorConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }
}

/// Builder for [`Context`]
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .build()?;
/// ```
///
/// Any collaborator not overridden is built from the client and config.
pub struct ContextBuilder {
    client: Client,
    config: OperatorConfig,
    store: Option<Arc<dyn ExperimentStore>>,
    provisioner: Option<Arc<dyn ClusterProvisioner>>,
    deployer: Option<Arc<dyn ApplicationDeployer>>,
    workflows: Option<Arc<dyn WorkflowController>>,
    metrics: Option<Arc<dyn MetricsSource>>,
    objects: Option<Arc<dyn ObjectStore>>,
    results_repo: Option<Arc<dyn ResultsRepository>>,
    analysis: Option<Arc<dyn AnalysisJobs>>,
    tutorial: Option<Arc<dyn TutorialResources>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: OperatorConfig::default(),
            store: None,
            provisioner: None,
            deployer: None,
            workflows: None,
            metrics: None,
            objects: None,
            results_repo: None,
            analysis: None,
            tutorial: None,
            events: None,
        }
    }

    /// Set the runtime configuration
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the experiment store
    pub fn store(mut self, store: Arc<dyn ExperimentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the cluster provisioner
    pub fn provisioner(mut self, provisioner: Arc<dyn ClusterProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Override the application deployer
    pub fn deployer(mut self, deployer: Arc<dyn ApplicationDeployer>) -> Self {
        self.deployer = Some(deployer);
        self
    }

    /// Override the workflow controller
    pub fn workflows(mut self, workflows: Arc<dyn WorkflowController>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    /// Override the metrics source
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the results bucket
    pub fn objects(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Override the results repository
    pub fn results_repository(mut self, repo: Arc<dyn ResultsRepository>) -> Self {
        self.results_repo = Some(repo);
        self
    }

    /// Override the analysis job manager
    pub fn analysis(mut self, analysis: Arc<dyn AnalysisJobs>) -> Self {
        self.analysis = Some(analysis);
        self
    }

    /// Override tutorial resource access
    pub fn tutorial(mut self, tutorial: Arc<dyn TutorialResources>) -> Self {
        self.tutorial = Some(tutorial);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context.
    ///
    /// Fails only when an HTTP client for a configured endpoint cannot be
    /// created.
    pub fn build(self) -> Result<Context, Error> {
        let client = self.client;
        let config = self.config;

        let metrics: Arc<dyn MetricsSource> = match self.metrics {
            Some(m) => m,
            None => Arc::new(KubeMetricsSource::new(config.metrics_url.as_deref())?),
        };

        let objects: Option<Arc<dyn ObjectStore>> = match (self.objects, &config.s3_endpoint) {
            (Some(o), _) => Some(o),
            (None, Some(endpoint)) => {
                Some(Arc::new(S3ObjectStore::new(endpoint, config.s3_bucket.clone())?))
            }
            (None, None) => None,
        };

        let results_repo: Option<Arc<dyn ResultsRepository>> =
            match (self.results_repo, &config.github) {
                (Some(r), _) => Some(r),
                (None, Some(gh)) => Some(Arc::new(GitHubRepository::new(
                    &gh.token,
                    &gh.repo,
                    &gh.branch,
                    &gh.data_path,
                )?)),
                (None, None) => None,
            };

        let analysis: Arc<dyn AnalysisJobs> = match self.analysis {
            Some(a) => a,
            None => {
                let settings = AnalyzerSettings {
                    image: config.analyzer_image.clone().unwrap_or_default(),
                    s3_endpoint: config.s3_endpoint.clone().unwrap_or_default(),
                    github_repo: config
                        .github
                        .as_ref()
                        .map(|gh| gh.repo.clone())
                        .unwrap_or_default(),
                };
                Arc::new(
                    KubeAnalysisJobs::new(client.clone(), settings)
                        .with_namespace(config.operator_namespace.clone()),
                )
            }
        };

        Ok(Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeExperimentStore::new(client.clone()))),
            provisioner: self.provisioner.unwrap_or_else(|| {
                Arc::new(
                    GkeClusterProvisioner::new(client.clone())
                        .with_claim_namespace(config.claim_namespace.clone()),
                )
            }),
            deployer: self.deployer.unwrap_or_else(|| {
                Arc::new(
                    ArgoApplicationDeployer::new(client.clone())
                        .with_namespace(config.argocd_namespace.clone()),
                )
            }),
            workflows: self.workflows.unwrap_or_else(|| {
                Arc::new(
                    ArgoWorkflowController::new(client.clone())
                        .with_namespace(config.workflow_namespace.clone()),
                )
            }),
            metrics,
            objects,
            results_repo,
            analysis,
            tutorial: self
                .tutorial
                .unwrap_or_else(|| Arc::new(KubeTutorialResources::new(client.clone()))),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER))),
            config,
        })
    }
}

pub(crate) fn has_finalizer(experiment: &Experiment, finalizer: &str) -> bool {
    experiment.finalizers().iter().any(|f| f == finalizer)
}

/// Cleaned up, with analysis resolved or never requested
pub(crate) fn is_finished(experiment: &Experiment) -> bool {
    experiment.phase().is_terminal()
        && experiment.status.as_ref().is_some_and(|s| {
            s.resources_cleaned && s.analysis_phase.map_or(true, |p| p.is_terminal())
        })
}

/// Reconcile an Experiment
///
/// Deletion is intercepted by the finalizer until cleanup succeeds. Otherwise
/// the finalizer is added first, then the experiment's phase picks the
/// handler. Finished experiments are kept as history without a finalizer.
#[instrument(skip(experiment, ctx), fields(experiment = %experiment.name_any()))]
pub async fn reconcile(experiment: Arc<Experiment>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = experiment.name_any();
    let namespace = experiment.namespace().unwrap_or_default();
    let finalizer = ctx.config.finalizer.as_str();

    if experiment.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&experiment, &ctx).await;
    }

    if !has_finalizer(&experiment, finalizer) && !is_finished(&experiment) {
        debug!("adding finalizer");
        ctx.store.add_finalizer(&namespace, &name, finalizer).await?;
        return Ok(Action::requeue(ctx.config.requeue.advance));
    }

    let phase = experiment.phase();
    debug!(%phase, "reconciling experiment");

    match phase {
        ExperimentPhase::Pending => handle_pending(&experiment, &ctx).await,
        ExperimentPhase::Provisioning => handle_provisioning(&experiment, &ctx).await,
        ExperimentPhase::Ready => handle_ready(&experiment, &ctx).await,
        ExperimentPhase::Running => handle_running(&experiment, &ctx).await,
        ExperimentPhase::Complete | ExperimentPhase::Failed => {
            handle_complete(&experiment, &ctx).await
        }
    }
}

/// Tear everything down before letting the object go.
///
/// The finalizer stays until every cluster is deleted.
async fn handle_deletion(experiment: &Experiment, ctx: &Context) -> Result<Action, Error> {
    let finalizer = ctx.config.finalizer.as_str();
    if !has_finalizer(experiment, finalizer) {
        return Ok(Action::await_change());
    }

    let cleaned = experiment
        .status
        .as_ref()
        .is_some_and(|s| s.resources_cleaned);
    if !cleaned {
        info!("experiment deleted, cleaning up");
        if let Err(e) = cleanup_experiment(experiment, ctx).await {
            warn!(error = %e, "cleanup failed, keeping finalizer");
            publish_event(
                experiment,
                ctx,
                EventType::Warning,
                reasons::CLEANUP_FAILED,
                actions::CLEANUP,
                Some(e.to_string()),
            )
            .await;
            return Ok(Action::requeue(ctx.config.requeue.cleanup_retry));
        }
    }

    let namespace = experiment.namespace().unwrap_or_default();
    ctx.store
        .remove_finalizer(&namespace, &experiment.name_any(), finalizer)
        .await?;
    info!("finalizer removed");
    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// Errors that may clear on their own retry quickly; configuration errors
/// wait longer so a fix has time to land.
pub fn error_policy(experiment: Arc<Experiment>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        experiment = %experiment.name_any(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::requeue(CONFIG_ERROR_REQUEUE)
    }
}
