//! Teardown of everything an experiment created
//!
//! Only cluster deletion can fail a cleanup. Applications, registrations,
//! secrets and the workflow are removed best-effort because leaving them
//! behind costs nothing once their cluster is gone.

use kube::ResourceExt;
use tracing::{info, warn};

use testbed_common::crd::Experiment;
use testbed_common::{Error, HUB_CLUSTER_NAME};

use crate::controller::Context;
use crate::tutorial::delete_kubeconfig_secrets;

/// Delete the experiment's Applications, clusters, secrets and workflow.
///
/// Every target is attempted even after a cluster deletion fails; the first
/// such failure is returned so the caller retries.
pub async fn cleanup_experiment(experiment: &Experiment, ctx: &Context) -> Result<(), Error> {
    let name = experiment.name_any();
    let status = experiment.status_or_default();
    let mut first_error: Option<Error> = None;

    for (target, target_status) in experiment.spec.targets.iter().zip(&status.targets) {
        let deleted = if target_status.is_layered() {
            ctx.deployer.delete_layered_applications(&name, &target.name).await
        } else {
            ctx.deployer.delete_application(&name, &target.name).await
        };
        if let Err(e) = deleted {
            warn!(target = %target.name, error = %e, "failed to delete applications");
        }

        let Some(cluster) = target_status
            .cluster_name
            .as_deref()
            .filter(|c| *c != HUB_CLUSTER_NAME)
        else {
            continue;
        };

        if let Err(e) = ctx.deployer.unregister_cluster(cluster).await {
            warn!(cluster, error = %e, "failed to unregister cluster");
        }

        match ctx.provisioner.delete(cluster, target.cluster.cluster_type).await {
            Ok(()) => info!(target = %target.name, cluster, "cluster deleted"),
            Err(e) => {
                warn!(target = %target.name, cluster, error = %e, "failed to delete cluster");
                first_error.get_or_insert(e);
            }
        }
    }

    if let Err(e) = delete_kubeconfig_secrets(experiment, ctx, &status).await {
        warn!(error = %e, "failed to delete kubeconfig secrets");
    }

    if let Some(workflow) = &status.workflow_status {
        if let Err(e) = ctx.workflows.delete(&workflow.name).await {
            warn!(workflow = %workflow.name, error = %e, "failed to delete workflow");
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            info!("experiment resources cleaned up");
            Ok(())
        }
    }
}
