//! Running phase: poll the validation workflow

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use testbed_common::crd::{CompletionMode, Experiment, ExperimentPhase};
use testbed_common::events::{actions, reasons};
use testbed_common::Error;

use super::{publish_event, update_status};
use crate::controller::Context;

/// Mirror the workflow's progress onto the experiment and finish it once the
/// workflow is terminal.
///
/// Under manual completion a succeeded workflow does not finish the
/// experiment; it stays Running until deleted. A workflow that was deleted
/// out from under the experiment fails it.
pub async fn handle_running(experiment: &Experiment, ctx: &Context) -> Result<Action, Error> {
    let mut status = experiment.status_or_default();

    let Some(workflow) = status
        .workflow_status
        .as_mut()
        .filter(|w| !w.name.is_empty())
    else {
        warn!("running without a workflow, completing");
        status.phase = ExperimentPhase::Complete;
        update_status(experiment, ctx, &status).await?;
        return Ok(Action::requeue(ctx.config.requeue.advance));
    };

    let run = match ctx.workflows.status(&workflow.name).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            let message = format!("Workflow {} no longer exists", workflow.name);
            warn!(workflow = %workflow.name, "workflow disappeared, failing experiment");
            workflow.message = Some(message.clone());
            status.phase = ExperimentPhase::Failed;
            publish_event(
                experiment,
                ctx,
                EventType::Warning,
                reasons::WORKFLOW_FINISHED,
                actions::VALIDATE,
                Some(message),
            )
            .await;
            update_status(experiment, ctx, &status).await?;
            return Ok(Action::requeue(ctx.config.requeue.advance));
        }
        Err(e) => {
            warn!(workflow = %workflow.name, error = %e, "failed to read workflow status");
            return Ok(Action::requeue(ctx.config.requeue.workflow_error));
        }
    };

    let changed = workflow.phase != run.phase
        || workflow.finished_at != run.finished_at
        || workflow.message != run.message;
    workflow.phase = run.phase.clone();
    if run.started_at.is_some() {
        workflow.started_at = run.started_at;
    }
    workflow.finished_at = run.finished_at;
    workflow.message = run.message.clone();
    let workflow_name = workflow.name.clone();

    if !run.is_terminal() {
        debug!(workflow = %workflow_name, phase = %run.phase, "workflow in progress");
        if changed {
            update_status(experiment, ctx, &status).await?;
        }
        return Ok(Action::requeue(ctx.config.requeue.workflow_poll));
    }

    if run.is_succeeded() && experiment.completion_mode() == CompletionMode::Manual {
        debug!(workflow = %workflow_name, "workflow done, holding for manual completion");
        if changed {
            update_status(experiment, ctx, &status).await?;
        }
        return Ok(Action::requeue(ctx.config.requeue.manual_hold));
    }

    let (phase, type_) = if run.is_succeeded() {
        (ExperimentPhase::Complete, EventType::Normal)
    } else {
        (ExperimentPhase::Failed, EventType::Warning)
    };
    info!(workflow = %workflow_name, workflow_phase = %run.phase, phase = %phase, "workflow finished");

    publish_event(
        experiment,
        ctx,
        type_,
        reasons::WORKFLOW_FINISHED,
        actions::VALIDATE,
        Some(format!("Workflow {} {}", workflow_name, run.phase)),
    )
    .await;

    status.phase = phase;
    update_status(experiment, ctx, &status).await?;
    Ok(Action::requeue(ctx.config.requeue.advance))
}
