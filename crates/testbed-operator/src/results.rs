//! Results collection, storage, publishing and analysis tracking
//!
//! Runs once per experiment while it is being torn down. Metrics are swept
//! from the target clusters first and the hub fills whatever they lack; the
//! summary then goes to object storage and, for publishable experiments, to
//! the results repository and the analyzer.

use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use testbed_common::crd::{
    set_condition, AnalysisPhase, Condition, ConditionStatus, Experiment, ExperimentPhase,
    ExperimentStatus,
};
use testbed_common::events::{actions, reasons};
use testbed_common::{Error, HUB_CLUSTER_NAME};
use testbed_metrics::{
    all_queries_empty, analyzer_sections, collect_summary, estimate_cost,
    evaluate_success_criteria, query_names, AnalyzerSections, MetricsResult,
};
use testbed_publish::{metrics_snapshot_key, put_document, summary_key, JobOutcome};

use crate::controller::Context;
use crate::phases::publish_event;

/// Results URL recorded when object storage is not configured
pub const RESULTS_DISABLED: &str = "disabled";

/// Condition type recording how analysis ended
pub const ANALYSIS_CONDITION: &str = "AnalysisComplete";

/// What a collection pass achieved
#[derive(Debug, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Summary stored and follow-ups issued
    Stored,
    /// Target clusters have no data yet; try again later
    RetryMetrics,
}

/// Whether this experiment should get an analyzer Job
fn wants_analysis(
    experiment: &Experiment,
    ctx: &Context,
    status: &ExperimentStatus,
    sections: &[String],
) -> bool {
    experiment.spec.publish
        && status.phase == ExperimentPhase::Complete
        && ctx.config.analyzer_image.is_some()
        && !sections.is_empty()
}

/// Sweep every remote target for metrics.
///
/// Targets relaying telemetry over tailscale are scraped through cAdvisor
/// first, with any in-cluster backend overriding per query. Results from
/// several targets are merged with the earlier target winning.
async fn collect_from_targets(experiment: &Experiment, ctx: &Context) -> Option<MetricsResult> {
    let name = experiment.name_any();
    let status = experiment.status_or_default();
    let mut combined: Option<MetricsResult> = None;

    for (target, target_status) in experiment.spec.targets.iter().zip(&status.targets) {
        if target.is_hub() {
            continue;
        }
        let Some(cluster) = target_status
            .cluster_name
            .as_deref()
            .filter(|c| *c != HUB_CLUSTER_NAME)
        else {
            continue;
        };

        let kubeconfig = match ctx.provisioner.kubeconfig(cluster, target.cluster.cluster_type).await {
            Ok(Some(k)) => k,
            Ok(None) => {
                debug!(target = %target.name, "no kubeconfig for metrics");
                continue;
            }
            Err(e) => {
                warn!(target = %target.name, error = %e, "failed to read kubeconfig for metrics");
                continue;
            }
        };

        let mut result: Option<MetricsResult> = None;
        if target.uses_tailscale() {
            match ctx.metrics.collect_cadvisor(&kubeconfig, experiment).await {
                Ok(r) if !r.all_queries_empty() => result = Some(r),
                Ok(_) => debug!(target = %target.name, "cadvisor returned no data"),
                Err(e) => warn!(target = %target.name, error = %e, "cadvisor scrape failed"),
            }
        }

        match ctx.metrics.discover(&kubeconfig, &name).await {
            Ok(endpoints) if endpoints.is_empty() => {
                debug!(target = %target.name, "no monitoring endpoints yet");
            }
            Ok(endpoints) => {
                match ctx
                    .metrics
                    .collect_from_endpoints(&kubeconfig, &endpoints, experiment)
                    .await
                {
                    Ok(local) if !local.all_queries_empty() => match result.as_mut() {
                        Some(r) => r.override_with(local),
                        None => result = Some(local),
                    },
                    Ok(_) => debug!(target = %target.name, "target metrics still empty"),
                    Err(e) => warn!(target = %target.name, error = %e, "target metrics query failed"),
                }
            }
            Err(e) => warn!(target = %target.name, error = %e, "monitoring discovery failed"),
        }

        if let Some(r) = result {
            info!(target = %target.name, source = ?r.source, "collected target metrics");
            match combined.as_mut() {
                Some(c) => c.fill_missing_from(r),
                None => combined = Some(r),
            }
        }
    }
    combined
}

/// Collect metrics, build and store the summary, then publish and start
/// analysis for publishable experiments.
///
/// `status` is updated in place; the caller persists it. While the target
/// clusters report nothing and attempts remain, the pass stops early with
/// [`CollectOutcome::RetryMetrics`] and only the attempt counter changes.
/// Missing analyzer credentials fail the pass before anything is written.
pub async fn collect_and_store(
    experiment: &Experiment,
    ctx: &Context,
    status: &mut ExperimentStatus,
) -> Result<CollectOutcome, Error> {
    let name = experiment.name_any();
    let (sections, defaulted) = analyzer_sections(experiment);
    let analysis = wants_analysis(experiment, ctx, status, &sections);
    if analysis {
        ctx.analysis.ensure_credentials().await?;
    }

    let mut snapshot = experiment.clone();
    snapshot.status = Some(status.clone());

    let mut metrics = collect_from_targets(&snapshot, ctx).await;
    if all_queries_empty(metrics.as_ref()) {
        let attempt = status.metrics_attempts + 1;
        if attempt < ctx.config.metrics_attempts {
            info!(attempt, "no target metrics yet, will retry");
            status.metrics_attempts = attempt;
            return Ok(CollectOutcome::RetryMetrics);
        }
        info!(attempts = attempt, "target metrics exhausted, falling back to hub");
    }

    let expected = query_names(&experiment.spec.metrics);
    if metrics.as_ref().is_some_and(|m| m.covers(&expected)) {
        debug!("target metrics cover every query, skipping hub");
    } else {
        match ctx.metrics.collect_hub(&snapshot).await {
            Ok(Some(hub)) if !hub.all_queries_empty() => match metrics.as_mut() {
                Some(m) if !m.all_queries_empty() => m.fill_missing_from(hub),
                _ => metrics = Some(hub),
            },
            Ok(_) => debug!("hub returned no metrics"),
            Err(e) => warn!(error = %e, "hub metrics query failed, continuing without"),
        }
    }

    let mut summary = collect_summary(&snapshot);
    summary.metrics = metrics.clone();
    summary.cost_estimate = estimate_cost(&snapshot);
    if defaulted && !sections.is_empty() {
        summary.analyzer_config = Some(AnalyzerSections {
            sections: sections.clone(),
        });
    }
    let verdict = evaluate_success_criteria(&mut summary);
    if let (Some(v), Some(hypothesis)) = (verdict, summary.hypothesis.as_mut()) {
        hypothesis.machine_verdict = Some(v.as_str().to_string());
    }
    status.hypothesis_result = verdict.map(|v| v.as_str().to_string());

    match ctx.objects.as_deref() {
        Some(objects) => {
            put_document(objects, &summary_key(&name), &summary).await?;
            if let Some(m) = &metrics {
                if let Err(e) = put_document(objects, &metrics_snapshot_key(&name), m).await {
                    warn!(error = %e, "failed to upload metrics snapshot");
                }
            }
            status.results_url = Some(objects.results_url(&name));
            info!(url = ?status.results_url, "results stored");
            publish_event(
                experiment,
                ctx,
                EventType::Normal,
                reasons::RESULTS_STORED,
                actions::COLLECT,
                status.results_url.clone(),
            )
            .await;
        }
        None => {
            info!("object storage not configured, skipping upload");
            status.results_url = Some(RESULTS_DISABLED.to_string());
        }
    }

    if experiment.spec.publish && status.phase == ExperimentPhase::Complete {
        if let Some(repo) = ctx.results_repo.as_deref() {
            let document = serde_json::to_value(&summary)?;
            match repo.publish(&name, &document).await {
                Ok(published) => {
                    info!(pr = %published.pr_url, "results published for review");
                    status.published = true;
                    status.publish_branch = Some(published.branch);
                    status.publish_pr_number = Some(published.pr_number);
                    status.publish_pr_url = Some(published.pr_url);
                }
                Err(e) => warn!(error = %e, "failed to publish results"),
            }
        }
    }

    if !analysis {
        status.analysis_phase = Some(AnalysisPhase::Skipped);
        return Ok(CollectOutcome::Stored);
    }

    match ctx.analysis.create(&name).await {
        Ok(job) => {
            info!(job = %job, sections = ?sections, "analysis job created");
            status.analysis_job_name = Some(job);
            status.analysis_phase = Some(AnalysisPhase::Pending);
        }
        Err(e) => {
            warn!(error = %e, "failed to create analysis job");
            finish_analysis(
                experiment,
                ctx,
                status,
                AnalysisPhase::Failed,
                "JobCreateFailed",
                e.to_string(),
            )
            .await;
        }
    }
    Ok(CollectOutcome::Stored)
}

/// Map the analyzer Job's state onto the status.
///
/// A Job that is gone before its outcome was seen counts as failed, and a
/// failed analysis turns a completed publishable experiment into a failed
/// one. Lookup errors leave the status untouched.
pub async fn check_analysis(experiment: &Experiment, ctx: &Context, status: &mut ExperimentStatus) {
    let Some(job) = status.analysis_job_name.clone() else {
        warn!("analysis pending without a job");
        finish_analysis(
            experiment,
            ctx,
            status,
            AnalysisPhase::Failed,
            "JobMissing",
            "no analysis job recorded".to_string(),
        )
        .await;
        return;
    };

    match ctx.analysis.outcome(&job).await {
        Ok(Some(JobOutcome::Pending)) => status.analysis_phase = Some(AnalysisPhase::Pending),
        Ok(Some(JobOutcome::Running)) => status.analysis_phase = Some(AnalysisPhase::Running),
        Ok(Some(JobOutcome::Succeeded)) => {
            finish_analysis(
                experiment,
                ctx,
                status,
                AnalysisPhase::Succeeded,
                "JobSucceeded",
                format!("analysis job {} completed", job),
            )
            .await
        }
        Ok(Some(JobOutcome::Failed(message))) => {
            finish_analysis(experiment, ctx, status, AnalysisPhase::Failed, "JobFailed", message).await
        }
        Ok(None) => {
            finish_analysis(
                experiment,
                ctx,
                status,
                AnalysisPhase::Failed,
                "JobNotFound",
                format!("analysis job {} disappeared before completing", job),
            )
            .await
        }
        Err(e) => warn!(job = %job, error = %e, "failed to read analysis job"),
    }
}

async fn finish_analysis(
    experiment: &Experiment,
    ctx: &Context,
    status: &mut ExperimentStatus,
    phase: AnalysisPhase,
    reason: &str,
    message: String,
) {
    let succeeded = phase == AnalysisPhase::Succeeded;
    status.analysis_phase = Some(phase);
    set_condition(
        &mut status.conditions,
        Condition::new(
            ANALYSIS_CONDITION,
            if succeeded {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            reason,
            message.clone(),
        ),
    );

    if !succeeded && experiment.spec.publish && status.phase == ExperimentPhase::Complete {
        warn!(reason, "analysis failed, marking experiment failed");
        status.phase = ExperimentPhase::Failed;
    }

    publish_event(
        experiment,
        ctx,
        if succeeded {
            EventType::Normal
        } else {
            EventType::Warning
        },
        reasons::ANALYSIS_FINISHED,
        actions::COLLECT,
        Some(message),
    )
    .await;
}
