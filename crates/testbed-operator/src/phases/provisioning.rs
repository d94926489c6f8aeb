//! Provisioning phase: wait for clusters, then create Applications
//!
//! Targets deploy in dependency order: a target waits until every target it
//! depends on has Applications that report healthy.

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use testbed_common::crd::{
    DeploymentLayer, Experiment, ExperimentPhase, ExperimentStatus, Target, TargetPhase,
    TargetStatus,
};
use testbed_common::events::{actions, reasons};
use testbed_common::{Error, IN_CLUSTER_SERVER};
use testbed_deploy::{classify_components, observability_refs};

use super::pending::request_cluster;
use super::{aligned_status, publish_event, remote_server, update_status};
use crate::controller::Context;
use crate::tutorial::{expose_kubeconfigs, share_kubeconfigs};

/// Poll cluster readiness, then deploy each ready target whose dependencies
/// are healthy. Advances to Ready once every target has Applications.
pub async fn handle_provisioning(experiment: &Experiment, ctx: &Context) -> Result<Action, Error> {
    let mut status = aligned_status(experiment);

    let mut all_ready = true;
    for (target, target_status) in experiment.spec.targets.iter().zip(status.targets.iter_mut()) {
        if !poll_cluster(experiment, ctx, target, target_status).await {
            all_ready = false;
        }
    }

    if !all_ready {
        debug!("waiting for clusters");
        update_status(experiment, ctx, &status).await?;
        return Ok(Action::requeue(ctx.config.requeue.not_ready));
    }

    for i in 0..experiment.spec.targets.len() {
        let target = &experiment.spec.targets[i];
        if status.targets[i].phase != TargetPhase::Ready || status.targets[i].apps_created {
            continue;
        }
        if !dependencies_healthy(experiment, ctx, &status, &target.depends).await {
            info!(target = %target.name, depends = ?target.depends, "waiting for dependencies");
            continue;
        }
        if let Err(e) = deploy_target(experiment, ctx, target, &mut status.targets[i]).await {
            warn!(target = %target.name, error = %e, "failed to create applications");
        }
    }

    if experiment
        .spec
        .tutorial
        .as_ref()
        .is_some_and(|t| t.expose_kubeconfig)
    {
        expose_kubeconfigs(experiment, ctx, &mut status).await;
    }

    if !status.targets.iter().all(|t| t.apps_created) {
        update_status(experiment, ctx, &status).await?;
        return Ok(Action::requeue(ctx.config.requeue.apps_pending));
    }

    info!("all applications created");
    share_kubeconfigs(experiment, ctx, &status).await;
    publish_event(
        experiment,
        ctx,
        EventType::Normal,
        reasons::APPLICATIONS_CREATED,
        actions::DEPLOY,
        Some(format!("{} targets deployed", status.targets.len())),
    )
    .await;
    status.phase = ExperimentPhase::Ready;
    update_status(experiment, ctx, &status).await?;
    Ok(Action::requeue(ctx.config.requeue.advance))
}

/// Refresh one target's readiness and endpoint. Returns true when ready.
async fn poll_cluster(
    experiment: &Experiment,
    ctx: &Context,
    target: &Target,
    target_status: &mut TargetStatus,
) -> bool {
    let Some(cluster) = target_status.cluster_name.clone() else {
        request_cluster(experiment, ctx, target, target_status).await;
        return false;
    };
    let cluster_type = target.cluster.cluster_type;

    match ctx.provisioner.is_ready(&cluster, cluster_type).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(target = %target.name, cluster = %cluster, "cluster not ready");
            return false;
        }
        Err(e) => {
            warn!(target = %target.name, cluster = %cluster, error = %e, "readiness check failed");
            return false;
        }
    }

    match ctx.provisioner.endpoint(&cluster, cluster_type).await {
        Ok(Some(endpoint)) => target_status.endpoint = Some(endpoint),
        Ok(None) => {}
        Err(e) => warn!(target = %target.name, error = %e, "failed to read cluster endpoint"),
    }
    if target_status.phase != TargetPhase::Ready {
        info!(target = %target.name, cluster = %cluster, "cluster ready");
    }
    target_status.phase = TargetPhase::Ready;
    true
}

/// True when every named dependency has Applications that report healthy.
///
/// Unknown dependency names never become healthy.
async fn dependencies_healthy(
    experiment: &Experiment,
    ctx: &Context,
    status: &ExperimentStatus,
    depends: &[String],
) -> bool {
    let name = experiment.name_any();
    for dep in depends {
        let Some(index) = experiment.spec.targets.iter().position(|t| &t.name == dep) else {
            warn!(dependency = %dep, "dependency names no target");
            return false;
        };
        let Some(dep_status) = status.targets.get(index) else {
            return false;
        };
        if !dep_status.apps_created {
            return false;
        }

        if dep_status.is_layered() {
            for layer in &dep_status.deployed_layers {
                match ctx.deployer.is_layer_healthy(&name, dep, *layer).await {
                    Ok(true) => {}
                    Ok(false) => return false,
                    Err(e) => {
                        debug!(dependency = %dep, %layer, error = %e, "dependency health check failed");
                        return false;
                    }
                }
            }
        } else {
            match ctx.deployer.is_application_healthy(&name, dep).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    debug!(dependency = %dep, error = %e, "dependency health check failed");
                    return false;
                }
            }
        }
    }
    true
}

/// Create a target's Applications.
///
/// Hub targets deploy in-cluster as one Application. Remote targets are
/// registered with ArgoCD first; with observability enabled their infra and
/// observability layers are created here and the workload layer waits for
/// them in the Ready phase.
async fn deploy_target(
    experiment: &Experiment,
    ctx: &Context,
    target: &Target,
    target_status: &mut TargetStatus,
) -> Result<(), Error> {
    let name = experiment.name_any();

    if target.is_hub() {
        ctx.deployer
            .create_application(&name, target, IN_CLUSTER_SERVER)
            .await?;
        target_status.apps_created = true;
        info!(target = %target.name, "hub application created");
        return Ok(());
    }

    let (Some(cluster), Some(endpoint)) = (&target_status.cluster_name, &target_status.endpoint)
    else {
        debug!(target = %target.name, "cluster endpoint not yet known");
        return Ok(());
    };
    let server = remote_server(endpoint);

    let Some(kubeconfig) = ctx
        .provisioner
        .kubeconfig(cluster, target.cluster.cluster_type)
        .await?
    else {
        debug!(target = %target.name, "kubeconfig not yet available");
        return Ok(());
    };

    ctx.deployer
        .register_cluster(cluster, &server, &kubeconfig)
        .await?;

    if let Some(obs) = target.observability.as_ref().filter(|o| o.enabled) {
        let classified = classify_components(&target.components, &observability_refs(obs, &name));
        if classified.has_layers() {
            let mut deployed = Vec::new();
            for layer in [DeploymentLayer::Infra, DeploymentLayer::Obs] {
                let components = classified.layer(layer);
                if components.is_empty() {
                    continue;
                }
                ctx.deployer
                    .create_layered_application(&name, &target.name, &server, layer, components)
                    .await?;
                deployed.push(layer);
            }
            info!(target = %target.name, layers = ?deployed, "layered applications created");
            target_status.deployed_layers = deployed;
            target_status.apps_created = true;
            return Ok(());
        }
    }

    ctx.deployer
        .create_application(&name, target, &server)
        .await?;
    target_status.apps_created = true;
    info!(target = %target.name, "application created");
    Ok(())
}
