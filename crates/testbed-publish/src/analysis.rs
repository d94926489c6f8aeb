//! AI analysis Jobs
//!
//! A published experiment gets one analyzer Job in the operator namespace.
//! The analyzer reads the stored summary, writes its findings back, and
//! pushes them to the results branch. Credentials are seeded from the
//! `claude-auth` secret into a PVC on first use so refreshed tokens survive
//! across runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, KeyToPath, PersistentVolumeClaimVolumeSource,
    PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements, SeccompProfile,
    SecretKeySelector, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

use testbed_common::kube_utils::{get_secret_data, is_not_found};
use testbed_common::{truncate_name, Error, OPERATOR_NAMESPACE};

use crate::github::results_branch;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

/// Secret holding the analyzer's credentials
pub const CREDENTIALS_SECRET: &str = "claude-auth";
/// Key inside [`CREDENTIALS_SECRET`]
pub const CREDENTIALS_KEY: &str = "credentials.json";
/// PVC the credentials are seeded into
pub const CREDENTIALS_PVC: &str = "claude-credentials-pvc";
/// Secret with the token the analyzer pushes with
pub const GITHUB_TOKEN_SECRET: &str = "github-api-token";

const INIT_IMAGE: &str = "busybox:1.37";
const SEED_SCRIPT: &str = "if [ ! -f /claude-home/.credentials.json ]; then \
cp /claude-secret/.credentials.json /claude-home/.credentials.json && \
chmod 600 /claude-home/.credentials.json && \
echo 'Seeded credentials from secret'; \
else echo 'Using existing credentials from PVC'; fi";

/// Name of the analyzer Job for `experiment`, capped at 63 characters
pub fn analysis_job_name(experiment: &str) -> String {
    truncate_name(&format!("experiment-analyzer-{}", experiment))
}

/// Settings shared by every analyzer Job
#[derive(Clone, Debug, Default)]
pub struct AnalyzerSettings {
    /// Analyzer container image
    pub image: String,
    /// Object store endpoint; the scheme is stripped before it is passed on
    pub s3_endpoint: String,
    /// Results repository as `owner/name`
    pub github_repo: String,
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint)
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Build the analyzer Job for `experiment`.
///
/// The Job carries no owner reference: it outlives neither its TTL nor the
/// experiment's deletion, and the experiment lives in another namespace.
pub fn build_analysis_job(experiment: &str, namespace: &str, settings: &AnalyzerSettings) -> Job {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "experiment-analyzer".to_string());
    labels.insert("experiment".to_string(), experiment.to_string());

    let init = Container {
        name: "copy-credentials".to_string(),
        image: Some(INIT_IMAGE.to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string(), SEED_SCRIPT.to_string()]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "claude-credentials".to_string(),
                mount_path: "/claude-secret".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "claude-home".to_string(),
                mount_path: "/claude-home".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let analyzer = Container {
        name: "analyzer".to_string(),
        image: Some(settings.image.clone()),
        env: Some(vec![
            env("EXPERIMENT_NAME", experiment),
            env("S3_ENDPOINT", strip_scheme(&settings.s3_endpoint)),
            EnvVar {
                name: "GITHUB_TOKEN".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: GITHUB_TOKEN_SECRET.to_string(),
                        key: "token".to_string(),
                        optional: Some(true),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            env("GITHUB_REPO", settings.github_repo.clone()),
            env("GITHUB_BRANCH", results_branch(experiment)),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "claude-home".to_string(),
            mount_path: "/home/node/.claude".to_string(),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("100m".to_string())),
                ("memory".to_string(), Quantity("256Mi".to_string())),
            ])),
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity("512Mi".to_string()),
            )])),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "claude-credentials".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(CREDENTIALS_SECRET.to_string()),
                items: Some(vec![KeyToPath {
                    key: CREDENTIALS_KEY.to_string(),
                    path: ".credentials.json".to_string(),
                    ..Default::default()
                }]),
                default_mode: Some(0o444),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "claude-home".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: CREDENTIALS_PVC.to_string(),
                read_only: None,
            }),
            ..Default::default()
        },
    ];

    Job {
        metadata: ObjectMeta {
            name: Some(analysis_job_name(experiment)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(1),
            ttl_seconds_after_finished: Some(3600),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        run_as_user: Some(1000),
                        seccomp_profile: Some(SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    init_containers: Some(vec![init]),
                    containers: vec![analyzer],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Observed state of an analyzer Job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Created, no pod running yet
    Pending,
    /// At least one pod active
    Running,
    /// Complete condition is True
    Succeeded,
    /// Failed condition is True, with its message
    Failed(String),
}

fn condition_true<'a>(job: &'a Job, type_: &str) -> Option<&'a k8s_openapi::api::batch::v1::JobCondition> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_ && c.status == "True")
}

/// Classify a Job by its conditions and active pod count
pub fn job_outcome(job: &Job) -> JobOutcome {
    if condition_true(job, "Complete").is_some() {
        return JobOutcome::Succeeded;
    }
    if let Some(failed) = condition_true(job, "Failed") {
        return JobOutcome::Failed(failed.message.clone().unwrap_or_default());
    }
    let active = job.status.as_ref().and_then(|s| s.active).unwrap_or(0);
    if active > 0 {
        JobOutcome::Running
    } else {
        JobOutcome::Pending
    }
}

/// Lifecycle of analyzer Jobs
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait AnalysisJobs: Send + Sync {
    /// Fail unless the credentials secret exists with a non-empty key
    async fn ensure_credentials(&self) -> Result<(), Error>;

    /// Create the Job for `experiment` unless it already exists; returns its name
    async fn create(&self, experiment: &str) -> Result<String, Error>;

    /// Current outcome of Job `name`, or `None` when it no longer exists
    async fn outcome(&self, name: &str) -> Result<Option<JobOutcome>, Error>;
}

/// [`AnalysisJobs`] backed by the hub API server
pub struct KubeAnalysisJobs {
    client: Client,
    namespace: String,
    settings: AnalyzerSettings,
}

impl KubeAnalysisJobs {
    /// Create a Job manager using `settings` for every Job
    pub fn new(client: Client, settings: AnalyzerSettings) -> Self {
        Self {
            client,
            namespace: OPERATOR_NAMESPACE.to_string(),
            settings,
        }
    }

    /// Run Jobs and read credentials in `namespace` instead of the operator's default
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn api(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl AnalysisJobs for KubeAnalysisJobs {
    async fn ensure_credentials(&self) -> Result<(), Error> {
        let data = get_secret_data(&self.client, CREDENTIALS_SECRET, &self.namespace, CREDENTIALS_KEY).await?;
        match data {
            Some(bytes) if !bytes.is_empty() => Ok(()),
            _ => Err(Error::configuration(format!(
                "{} secret missing or empty {} key",
                CREDENTIALS_SECRET, CREDENTIALS_KEY
            ))),
        }
    }

    async fn create(&self, experiment: &str) -> Result<String, Error> {
        let job = build_analysis_job(experiment, &self.namespace, &self.settings);
        let name = analysis_job_name(experiment);
        let api = self.api();

        match api.get(&name).await {
            Ok(_) => {
                debug!(job = %name, "analysis job already exists");
                return Ok(name);
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        api.create(&PostParams::default(), &job).await?;
        info!(job = %name, experiment, "created analysis job");
        Ok(name)
    }

    async fn outcome(&self, name: &str) -> Result<Option<JobOutcome>, Error> {
        match self.api().get(name).await {
            Ok(job) => Ok(Some(job_outcome(&job))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn settings() -> AnalyzerSettings {
        AnalyzerSettings {
            image: "ghcr.io/illm/experiment-analyzer:v1".to_string(),
            s3_endpoint: "http://seaweedfs-s3.seaweedfs:8333".to_string(),
            github_repo: "illm/k8s-lab".to_string(),
        }
    }

    fn pod_spec(job: &Job) -> &PodSpec {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a EnvVar> {
        container.env.as_ref()?.iter().find(|e| e.name == name)
    }

    fn job_with(conditions: Vec<(&str, &str, Option<&str>)>, active: Option<i32>) -> Job {
        Job {
            status: Some(JobStatus {
                active,
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|(t, s, m)| JobCondition {
                            type_: t.to_string(),
                            status: s.to_string(),
                            message: m.map(str::to_string),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn job_name_is_capped() {
        assert_eq!(analysis_job_name("tsdb"), "experiment-analyzer-tsdb");
        assert_eq!(analysis_job_name(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn job_metadata_and_policy() {
        let job = build_analysis_job("tsdb", OPERATOR_NAMESPACE, &settings());
        assert_eq!(job.metadata.namespace.as_deref(), Some(OPERATOR_NAMESPACE));
        assert!(job.metadata.owner_references.is_none());

        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app"], "experiment-analyzer");
        assert_eq!(labels["experiment"], "tsdb");

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(1));
        assert_eq!(spec.ttl_seconds_after_finished, Some(3600));
        assert_eq!(
            spec.template.metadata.as_ref().unwrap().labels.as_ref(),
            Some(labels)
        );

        let pod = pod_spec(&job);
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let sc = pod.security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_non_root, Some(true));
        assert_eq!(sc.run_as_user, Some(1000));
    }

    #[test]
    fn credentials_are_seeded_from_secret_into_pvc() {
        let job = build_analysis_job("tsdb", OPERATOR_NAMESPACE, &settings());
        let pod = pod_spec(&job);

        let volumes = pod.volumes.as_ref().unwrap();
        let secret = volumes[0].secret.as_ref().unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some(CREDENTIALS_SECRET));
        assert_eq!(secret.default_mode, Some(0o444));
        assert_eq!(secret.items.as_ref().unwrap()[0].path, ".credentials.json");
        assert_eq!(
            volumes[1].persistent_volume_claim.as_ref().unwrap().claim_name,
            CREDENTIALS_PVC
        );

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.image.as_deref(), Some("busybox:1.37"));
        let script = &init.command.as_ref().unwrap()[2];
        assert!(script.contains("if [ ! -f /claude-home/.credentials.json ]"));
        assert!(script.contains("chmod 600"));
    }

    /// Story: the analyzer learns which experiment to read, where the store
    /// is and which branch to push to, without ever seeing the raw token
    #[test]
    fn analyzer_environment() {
        let job = build_analysis_job("tsdb", OPERATOR_NAMESPACE, &settings());
        let analyzer = &pod_spec(&job).containers[0];

        assert_eq!(analyzer.image.as_deref(), Some("ghcr.io/illm/experiment-analyzer:v1"));
        assert_eq!(env_value(analyzer, "EXPERIMENT_NAME").unwrap().value.as_deref(), Some("tsdb"));
        assert_eq!(
            env_value(analyzer, "S3_ENDPOINT").unwrap().value.as_deref(),
            Some("seaweedfs-s3.seaweedfs:8333")
        );
        assert_eq!(
            env_value(analyzer, "GITHUB_BRANCH").unwrap().value.as_deref(),
            Some("experiment/tsdb")
        );
        let token = env_value(analyzer, "GITHUB_TOKEN").unwrap();
        assert!(token.value.is_none());
        let selector = token
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(selector.name, GITHUB_TOKEN_SECRET);
        assert_eq!(selector.optional, Some(true));

        let sc = analyzer.security_context.as_ref().unwrap();
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        let resources = analyzer.resources.as_ref().unwrap();
        assert_eq!(resources.limits.as_ref().unwrap()["memory"], Quantity("512Mi".to_string()));
    }

    #[test]
    fn https_scheme_is_stripped_too() {
        assert_eq!(strip_scheme("https://s3.example.com"), "s3.example.com");
        assert_eq!(strip_scheme("s3.example.com"), "s3.example.com");
    }

    #[test]
    fn outcome_from_conditions() {
        assert_eq!(job_outcome(&job_with(vec![("Complete", "True", None)], None)), JobOutcome::Succeeded);
        assert_eq!(
            job_outcome(&job_with(vec![("Failed", "True", Some("BackoffLimitExceeded"))], None)),
            JobOutcome::Failed("BackoffLimitExceeded".to_string())
        );
        assert_eq!(job_outcome(&job_with(vec![("Complete", "False", None)], Some(1))), JobOutcome::Running);
        assert_eq!(job_outcome(&Job::default()), JobOutcome::Pending);
    }
}
