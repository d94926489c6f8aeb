//! Operator configuration
//!
//! Everything the reconciler needs to know about its environment is carried
//! in [`OperatorConfig`] and handed to the [`Context`](crate::Context) when it
//! is built. [`OperatorArgs`] is the command-line and environment surface.

use std::time::Duration;

use clap::Args;

use testbed_common::{
    ARGOCD_NAMESPACE, DEFAULT_FINALIZER, EXPERIMENTS_NAMESPACE, OPERATOR_NAMESPACE,
    WORKFLOW_NAMESPACE,
};

/// In-cluster metrics collection attempts before falling back to the hub
pub const DEFAULT_METRICS_ATTEMPTS: u32 = 8;

/// Bucket summaries are written to unless overridden
pub const DEFAULT_RESULTS_BUCKET: &str = "experiment-results";

/// How long each phase waits before looking again
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequeueDelays {
    /// Some cluster is not ready yet
    pub not_ready: Duration,
    /// Some target still has no Applications
    pub apps_pending: Duration,
    /// Some Application is not healthy yet
    pub health: Duration,
    /// Workflow still running
    pub workflow_poll: Duration,
    /// Workflow submission or status lookup failed
    pub workflow_error: Duration,
    /// Storing results failed
    pub metrics_retry: Duration,
    /// In-cluster metrics came back empty and attempts remain
    pub metrics_attempt: Duration,
    /// Cleanup could not delete every cluster
    pub cleanup_retry: Duration,
    /// Analysis job still running
    pub analysis_poll: Duration,
    /// Manual-mode experiment whose workflow finished
    pub manual_hold: Duration,
    /// A phase advanced and the next one should start promptly
    pub advance: Duration,
}

impl Default for RequeueDelays {
    fn default() -> Self {
        Self {
            not_ready: Duration::from_secs(10),
            apps_pending: Duration::from_secs(15),
            health: Duration::from_secs(15),
            workflow_poll: Duration::from_secs(15),
            workflow_error: Duration::from_secs(10),
            metrics_retry: Duration::from_secs(15),
            metrics_attempt: Duration::from_secs(30),
            cleanup_retry: Duration::from_secs(30),
            analysis_poll: Duration::from_secs(30),
            manual_hold: Duration::from_secs(3600),
            advance: Duration::from_secs(1),
        }
    }
}

/// Results repository the operator opens pull requests against
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitHubSettings {
    /// API token
    pub token: String,
    /// Repository as `owner/name`
    pub repo: String,
    /// Branch pull requests target
    pub branch: String,
    /// Directory results are committed under
    pub data_path: String,
}

/// Runtime configuration of the reconciler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Finalizer guarding experiment deletion
    pub finalizer: String,
    /// Namespace cluster claims are created in
    pub claim_namespace: String,
    /// Namespace ArgoCD watches for Applications
    pub argocd_namespace: String,
    /// Namespace workflows are submitted to
    pub workflow_namespace: String,
    /// Namespace analysis jobs and their credentials live in
    pub operator_namespace: String,
    /// Hub metrics backend
    pub metrics_url: Option<String>,
    /// Object store endpoint; results are not stored without one
    pub s3_endpoint: Option<String>,
    /// Results bucket
    pub s3_bucket: String,
    /// Analyzer image; analysis is skipped without one
    pub analyzer_image: Option<String>,
    /// Results repository; publishing is skipped without one
    pub github: Option<GitHubSettings>,
    /// Requeue delays per situation
    pub requeue: RequeueDelays,
    /// In-cluster metrics attempts before the hub fallback
    pub metrics_attempts: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            finalizer: DEFAULT_FINALIZER.to_string(),
            claim_namespace: EXPERIMENTS_NAMESPACE.to_string(),
            argocd_namespace: ARGOCD_NAMESPACE.to_string(),
            workflow_namespace: WORKFLOW_NAMESPACE.to_string(),
            operator_namespace: OPERATOR_NAMESPACE.to_string(),
            metrics_url: None,
            s3_endpoint: None,
            s3_bucket: DEFAULT_RESULTS_BUCKET.to_string(),
            analyzer_image: None,
            github: None,
            requeue: RequeueDelays::default(),
            metrics_attempts: DEFAULT_METRICS_ATTEMPTS,
        }
    }
}

/// Command-line and environment settings for the controller
#[derive(Args, Debug, Clone, Default)]
pub struct OperatorArgs {
    /// Hub metrics backend (Prometheus-compatible)
    #[arg(long, env = "METRICS_URL")]
    pub metrics_url: Option<String>,

    /// S3-compatible endpoint results are stored in
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Results bucket
    #[arg(long, env = "S3_BUCKET", default_value = DEFAULT_RESULTS_BUCKET)]
    pub s3_bucket: String,

    /// Image of the AI analyzer Job
    #[arg(long, env = "ANALYZER_IMAGE")]
    pub analyzer_image: Option<String>,

    /// Token for the results repository
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Results repository as owner/name
    #[arg(long, env = "GITHUB_REPO")]
    pub github_repo: Option<String>,

    /// Branch results pull requests target
    #[arg(long, env = "GITHUB_BRANCH", default_value = "main")]
    pub github_branch: String,

    /// Directory results are committed under
    #[arg(long, env = "GITHUB_DATA_PATH", default_value = "site/data")]
    pub github_data_path: String,

    /// Finalizer guarding experiment deletion
    #[arg(long, env = "EXPERIMENT_FINALIZER", default_value = DEFAULT_FINALIZER)]
    pub finalizer: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl From<OperatorArgs> for OperatorConfig {
    fn from(args: OperatorArgs) -> Self {
        let github = match (non_empty(args.github_token), non_empty(args.github_repo)) {
            (Some(token), Some(repo)) => Some(GitHubSettings {
                token,
                repo,
                branch: args.github_branch,
                data_path: args.github_data_path,
            }),
            _ => None,
        };
        Self {
            finalizer: args.finalizer,
            metrics_url: non_empty(args.metrics_url),
            s3_endpoint: non_empty(args.s3_endpoint),
            s3_bucket: args.s3_bucket,
            analyzer_image: non_empty(args.analyzer_image),
            github,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: OperatorArgs,
    }

    #[test]
    fn defaults_match_deployment_layout() {
        let config = OperatorConfig::default();
        assert_eq!(config.finalizer, "experiments.illm.io/finalizer");
        assert_eq!(config.claim_namespace, "experiments");
        assert_eq!(config.s3_bucket, "experiment-results");
        assert_eq!(config.metrics_attempts, 8);
        assert_eq!(config.requeue.manual_hold, Duration::from_secs(3600));
        assert_eq!(config.requeue.not_ready, Duration::from_secs(10));
    }

    #[test]
    fn github_requires_token_and_repo() {
        let cli = TestCli::parse_from(["op", "--github-repo", "illm/k8s-lab"]);
        let config = OperatorConfig::from(cli.args);
        assert!(config.github.is_none());

        let cli = TestCli::parse_from([
            "op",
            "--github-repo",
            "illm/k8s-lab",
            "--github-token",
            "ghp_x",
        ]);
        let github = OperatorConfig::from(cli.args).github.unwrap();
        assert_eq!(github.branch, "main");
        assert_eq!(github.data_path, "site/data");
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cli = TestCli::parse_from(["op", "--s3-endpoint", "  ", "--metrics-url", ""]);
        let config = OperatorConfig::from(cli.args);
        assert!(config.s3_endpoint.is_none());
        assert!(config.metrics_url.is_none());
    }
}
