//! Pending phase: request a cluster for every target

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{info, warn};

use testbed_cluster::ClusterSizing;
use testbed_common::crd::{Experiment, ExperimentPhase, Target, TargetPhase, TargetStatus};
use testbed_common::events::{actions, reasons};
use testbed_common::Error;

use super::{aligned_status, publish_event, update_status};
use crate::controller::Context;

/// Request a cluster for each target that has none and move on to
/// Provisioning.
///
/// A target whose claim cannot be created is marked Failed and its siblings
/// proceed; Provisioning retries it.
pub async fn handle_pending(experiment: &Experiment, ctx: &Context) -> Result<Action, Error> {
    let mut status = aligned_status(experiment);

    for (target, target_status) in experiment.spec.targets.iter().zip(status.targets.iter_mut()) {
        if target_status.cluster_name.is_some() {
            continue;
        }
        request_cluster(experiment, ctx, target, target_status).await;
    }

    info!(targets = status.targets.len(), "clusters requested");
    status.phase = ExperimentPhase::Provisioning;
    update_status(experiment, ctx, &status).await?;
    Ok(Action::requeue(ctx.config.requeue.advance))
}

/// Create the target's claim and record the handle and effective sizing.
///
/// Shared between Pending and the Provisioning retry for failed targets.
pub(crate) async fn request_cluster(
    experiment: &Experiment,
    ctx: &Context,
    target: &Target,
    target_status: &mut TargetStatus,
) {
    let name = experiment.name_any();
    match ctx.provisioner.create(&name, target).await {
        Ok(cluster) => {
            info!(target = %target.name, cluster = %cluster, "cluster requested");
            if !target.is_hub() {
                let sizing = ClusterSizing::from_spec(&target.cluster);
                target_status.machine_type = Some(sizing.machine_type);
                target_status.node_count = Some(sizing.node_count);
            }
            target_status.cluster_name = Some(cluster);
            target_status.phase = TargetPhase::Provisioning;
        }
        Err(e) => {
            warn!(target = %target.name, error = %e, "failed to create cluster");
            target_status.phase = TargetPhase::Failed;
            publish_event(
                experiment,
                ctx,
                EventType::Warning,
                reasons::CLUSTER_CREATE_FAILED,
                actions::PROVISION,
                Some(format!("target {}: {}", target.name, e)),
            )
            .await;
        }
    }
}
