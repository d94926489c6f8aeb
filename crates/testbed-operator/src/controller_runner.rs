//! Controller runner - wires the Experiment reconciler into a kube-runtime
//! controller

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use testbed_common::crd::Experiment;

use crate::controller::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than the client read timeout
/// (30s) so the API server closes idle watches before the client gives up.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run the Experiment controller until a shutdown signal arrives
pub async fn run_experiment_controller(client: Client, ctx: Arc<Context>) {
    let experiments: Api<Experiment> = Api::all(client);

    tracing::info!("- Experiment controller");

    Controller::new(
        experiments,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("Experiment"))
    .await;
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => tracing::debug!(?object, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
