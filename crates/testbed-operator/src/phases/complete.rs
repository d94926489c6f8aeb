//! Complete and Failed phases: results, teardown, then analysis tracking
//!
//! The first stage runs until resources are cleaned: stamp the completion
//! time, store results once, delete everything. The second stage polls the
//! analyzer until it settles, after which the finalizer is dropped and the
//! experiment stays behind as history.

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use testbed_common::crd::Experiment;
use testbed_common::events::{actions, reasons};
use testbed_common::Error;

use super::{publish_event, update_status};
use crate::cleanup::cleanup_experiment;
use crate::controller::{has_finalizer, is_finished, Context};
use crate::results::{check_analysis, collect_and_store, CollectOutcome};

/// Drive a finished experiment through results, cleanup and analysis.
pub async fn handle_complete(experiment: &Experiment, ctx: &Context) -> Result<Action, Error> {
    if is_finished(experiment) {
        return release(experiment, ctx).await;
    }

    let mut status = experiment.status_or_default();

    if !status.resources_cleaned {
        if status.completed_at.is_none() {
            status.completed_at = Some(Utc::now());
        }

        if status.results_url.is_none() {
            match collect_and_store(experiment, ctx, &mut status).await {
                Ok(CollectOutcome::Stored) => update_status(experiment, ctx, &status).await?,
                Ok(CollectOutcome::RetryMetrics) => {
                    update_status(experiment, ctx, &status).await?;
                    return Ok(Action::requeue(ctx.config.requeue.metrics_attempt));
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "failed to store results, will retry");
                    update_status(experiment, ctx, &status).await?;
                    return Ok(Action::requeue(ctx.config.requeue.metrics_retry));
                }
            }
        }

        info!(phase = %status.phase, "cleaning up experiment resources");
        if let Err(e) = cleanup_experiment(experiment, ctx).await {
            warn!(error = %e, "cleanup incomplete, clusters may still be running");
            publish_event(
                experiment,
                ctx,
                EventType::Warning,
                reasons::CLEANUP_FAILED,
                actions::CLEANUP,
                Some(e.to_string()),
            )
            .await;
            update_status(experiment, ctx, &status).await?;
            return Ok(Action::requeue(ctx.config.requeue.cleanup_retry));
        }

        status.resources_cleaned = true;
        update_status(experiment, ctx, &status).await?;
        publish_event(
            experiment,
            ctx,
            EventType::Normal,
            reasons::RESOURCES_CLEANED,
            actions::CLEANUP,
            None,
        )
        .await;
        info!("resources cleaned, experiment kept as history");
    }

    if status.analysis_phase.is_some() && !status.analysis_terminal() {
        let before = status.clone();
        check_analysis(experiment, ctx, &mut status).await;
        if status != before {
            update_status(experiment, ctx, &status).await?;
        }
        if !status.analysis_terminal() {
            debug!(phase = ?status.analysis_phase, "analysis still in progress");
            return Ok(Action::requeue(ctx.config.requeue.analysis_poll));
        }
        info!(phase = ?status.analysis_phase, "analysis settled");
    }

    release(experiment, ctx).await
}

/// Drop the finalizer so deletion no longer waits on the operator
async fn release(experiment: &Experiment, ctx: &Context) -> Result<Action, Error> {
    let finalizer = ctx.config.finalizer.as_str();
    if has_finalizer(experiment, finalizer) {
        let namespace = experiment.namespace().unwrap_or_default();
        ctx.store
            .remove_finalizer(&namespace, &experiment.name_any(), finalizer)
            .await?;
        info!("finalizer removed");
    }
    Ok(Action::await_change())
}
