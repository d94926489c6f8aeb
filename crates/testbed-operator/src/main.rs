//! Experiment operator - provisions clusters, runs validation workflows and
//! publishes the results of multi-cluster experiments

use std::sync::Arc;

use clap::Parser;
use kube::{Api, Client, CustomResourceExt};

use testbed_common::crd::{Component, Experiment};
use testbed_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use testbed_common::FIELD_MANAGER;
use testbed_operator::controller_runner::run_experiment_controller;
use testbed_operator::{Context, OperatorArgs, OperatorConfig};

/// Experiment operator - CRD-driven multi-cluster experiment lifecycle
#[derive(Parser, Debug)]
#[command(name = "experiment-operator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format (json or text)
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(flatten)]
    operator: OperatorArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let experiment = serde_yaml::to_string(&Experiment::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Experiment CRD: {}", e))?;
        let component = serde_yaml::to_string(&Component::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Component CRD: {}", e))?;
        println!("{experiment}---\n{component}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        default_filter: None,
    })?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let config = OperatorConfig::from(cli.operator);
    tracing::info!(
        metrics = config.metrics_url.is_some(),
        storage = config.s3_endpoint.is_some(),
        github = config.github.is_some(),
        analyzer = config.analyzer_image.is_some(),
        "Starting experiment operator"
    );

    let ctx = Context::builder(client.clone()).config(config).build()?;
    run_experiment_controller(client, Arc::new(ctx)).await;

    tracing::info!("Experiment operator shut down");
    Ok(())
}

/// Ensure the Experiment and Component CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply so
/// their versions always match the operator.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Experiment CRD...");
    crds.patch(
        "experiments.experiments.illm.io",
        &params,
        &Patch::Apply(&Experiment::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Experiment CRD: {}", e))?;

    tracing::info!("Installing Component CRD...");
    crds.patch(
        "components.experiments.illm.io",
        &params,
        &Patch::Apply(&Component::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Component CRD: {}", e))?;

    tracing::info!("All experiment CRDs installed/updated");
    Ok(())
}
