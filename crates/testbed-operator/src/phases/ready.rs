//! Ready phase: wait for healthy Applications, then submit the workflow

use std::collections::BTreeMap;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use testbed_common::crd::{
    DeploymentLayer, Experiment, ExperimentPhase, ExperimentStatus, Target, TargetStatus,
    WorkflowStatus,
};
use testbed_common::events::{actions, reasons};
use testbed_common::Error;
use testbed_deploy::{classify_components, observability_refs};

use super::{publish_event, remote_server, update_status};
use crate::controller::Context;
use crate::tutorial::discover_services;

/// Where a layered target stands this pass
#[derive(Debug, PartialEq, Eq)]
enum LayerProgress {
    /// Some layer is not healthy yet
    Waiting,
    /// The workload layer was just created
    WorkloadCreated,
    /// Every layer is healthy
    Healthy,
}

/// Gate on Application health, then submit the validation workflow and move
/// to Running.
pub async fn handle_ready(experiment: &Experiment, ctx: &Context) -> Result<Action, Error> {
    let name = experiment.name_any();
    let mut status = experiment.status_or_default();
    let mut changed = false;
    let mut all_healthy = true;

    for (target, target_status) in experiment.spec.targets.iter().zip(status.targets.iter_mut()) {
        if target.components.is_empty() && !target.observability_enabled() {
            continue;
        }

        if target_status.is_layered() {
            match advance_layers(&name, ctx, target, target_status).await {
                LayerProgress::Healthy => {}
                LayerProgress::Waiting => all_healthy = false,
                LayerProgress::WorkloadCreated => {
                    all_healthy = false;
                    changed = true;
                }
            }
            continue;
        }

        match ctx.deployer.is_application_healthy(&name, &target.name).await {
            Ok(true) => match ctx.deployer.application_components(&name, &target.name).await {
                Ok(components) if components != target_status.components => {
                    target_status.components = components;
                    changed = true;
                }
                Ok(_) => {}
                Err(e) => warn!(target = %target.name, error = %e, "failed to read components"),
            },
            Ok(false) => {
                debug!(target = %target.name, "application not healthy yet");
                all_healthy = false;
            }
            Err(e) => {
                warn!(target = %target.name, error = %e, "health check failed");
                all_healthy = false;
            }
        }
    }

    if !all_healthy {
        if changed {
            update_status(experiment, ctx, &status).await?;
        }
        return Ok(Action::requeue(ctx.config.requeue.health));
    }

    discover_services(experiment, ctx, &mut status).await;

    let mut workflow = experiment.spec.workflow.clone();
    workflow.params.extend(workflow_params(experiment, &status));

    let workflow_name = match ctx.workflows.submit(&name, &workflow).await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "workflow submission failed");
            if changed {
                update_status(experiment, ctx, &status).await?;
            }
            return Ok(Action::requeue(ctx.config.requeue.workflow_error));
        }
    };

    info!(workflow = %workflow_name, "workflow submitted");
    publish_event(
        experiment,
        ctx,
        EventType::Normal,
        reasons::WORKFLOW_SUBMITTED,
        actions::VALIDATE,
        Some(format!("Submitted workflow {}", workflow_name)),
    )
    .await;

    status.workflow_status = Some(WorkflowStatus {
        name: workflow_name,
        phase: "Pending".to_string(),
        started_at: Some(Utc::now()),
        ..Default::default()
    });
    status.phase = ExperimentPhase::Running;
    update_status(experiment, ctx, &status).await?;
    Ok(Action::requeue(ctx.config.requeue.advance))
}

/// Walk a layered target forward: infra, then obs, then the workload.
async fn advance_layers(
    experiment: &str,
    ctx: &Context,
    target: &Target,
    target_status: &mut TargetStatus,
) -> LayerProgress {
    for layer in [DeploymentLayer::Infra, DeploymentLayer::Obs] {
        if !target_status.has_layer(layer) {
            continue;
        }
        match ctx.deployer.is_layer_healthy(experiment, &target.name, layer).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(target = %target.name, %layer, "layer not healthy yet");
                return LayerProgress::Waiting;
            }
            Err(e) => {
                warn!(target = %target.name, %layer, error = %e, "layer health check failed");
                return LayerProgress::Waiting;
            }
        }
    }

    if !target_status.has_layer(DeploymentLayer::Workload) {
        let refs = target
            .observability
            .as_ref()
            .map(|obs| observability_refs(obs, experiment))
            .unwrap_or_default();
        let classified = classify_components(&target.components, &refs);
        if classified.workload.is_empty() {
            return LayerProgress::Healthy;
        }
        let Some(endpoint) = target_status.endpoint.as_deref() else {
            warn!(target = %target.name, "layered target has no endpoint");
            return LayerProgress::Waiting;
        };

        return match ctx
            .deployer
            .create_layered_application(
                experiment,
                &target.name,
                &remote_server(endpoint),
                DeploymentLayer::Workload,
                &classified.workload,
            )
            .await
        {
            Ok(()) => {
                info!(target = %target.name, "workload layer created");
                target_status.deployed_layers.push(DeploymentLayer::Workload);
                LayerProgress::WorkloadCreated
            }
            Err(e) => {
                warn!(target = %target.name, error = %e, "failed to create workload layer");
                LayerProgress::Waiting
            }
        };
    }

    match ctx
        .deployer
        .is_layer_healthy(experiment, &target.name, DeploymentLayer::Workload)
        .await
    {
        Ok(true) => LayerProgress::Healthy,
        Ok(false) => LayerProgress::Waiting,
        Err(e) => {
            warn!(target = %target.name, error = %e, "workload health check failed");
            LayerProgress::Waiting
        }
    }
}

/// Parameters handed to the workflow: the experiment name and, per target
/// with a known endpoint, `{target}-endpoint` and `{target}-name`.
///
/// The first such target is also exposed as `target-endpoint` and
/// `target-name` for single-target templates.
pub fn workflow_params(experiment: &Experiment, status: &ExperimentStatus) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("experiment-name".to_string(), experiment.name_any());

    let mut first = true;
    for (target, target_status) in experiment.spec.targets.iter().zip(&status.targets) {
        let Some(endpoint) = target_status.endpoint.as_deref().filter(|e| !e.is_empty()) else {
            continue;
        };
        params.insert(format!("{}-endpoint", target.name), endpoint.to_string());
        params.insert(format!("{}-name", target.name), target.name.clone());
        if first {
            params.insert("target-endpoint".to_string(), endpoint.to_string());
            params.insert("target-name".to_string(), target.name.clone());
            first = false;
        }
    }
    params
}
