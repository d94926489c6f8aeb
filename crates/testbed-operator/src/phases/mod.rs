//! Phase handlers for the Experiment controller.
//!
//! Each phase of the experiment lifecycle is handled by its own module. A
//! handler reads the status it was given, probes external systems, persists
//! the new status and returns when it wants to be called again.

mod complete;
mod pending;
mod provisioning;
mod ready;
mod running;

pub use complete::handle_complete;
pub use pending::handle_pending;
pub use provisioning::handle_provisioning;
pub use ready::handle_ready;
pub use running::handle_running;

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};

use testbed_common::crd::{Experiment, ExperimentStatus};
use testbed_common::retry::{retry_with_backoff, RetryConfig};
use testbed_common::Error;

use crate::controller::Context;

/// Persist `status` on the experiment.
///
/// Transient API failures are retried a few times before the pass fails.
pub async fn update_status(
    experiment: &Experiment,
    ctx: &Context,
    status: &ExperimentStatus,
) -> Result<(), Error> {
    let namespace = experiment.namespace().unwrap_or_default();
    let name = experiment.name_any();
    let store = ctx.store.clone();

    retry_with_backoff(&RetryConfig::default(), "patch_status", || {
        let store = store.clone();
        let namespace = namespace.clone();
        let name = name.clone();
        let status = status.clone();
        async move { store.patch_status(&namespace, &name, &status).await }
    })
    .await
}

/// Publish a Kubernetes Event on the experiment
pub async fn publish_event(
    experiment: &Experiment,
    ctx: &Context,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&experiment.object_ref(&()), type_, reason, action, note)
        .await;
}

/// Status with one entry per spec target, in spec order.
///
/// Existing entries are kept; missing ones are appended as pending.
pub(crate) fn aligned_status(experiment: &Experiment) -> ExperimentStatus {
    let mut status = experiment.status_or_default();
    for (i, target) in experiment.spec.targets.iter().enumerate() {
        if status.targets.len() <= i {
            status
                .targets
                .push(testbed_common::crd::TargetStatus::pending(&target.name));
        }
    }
    status
}

/// Server address ArgoCD uses for a remote target
pub(crate) fn remote_server(endpoint: &str) -> String {
    format!("https://{}", endpoint)
}
