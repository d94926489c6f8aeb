//! Machine evaluation of hypothesis success criteria

use std::fmt;

use crate::summary::ExperimentSummary;
use crate::types::QueryResult;

/// Aggregate judgment over all success criteria
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HypothesisVerdict {
    /// Every resolved criterion passed
    Validated,
    /// At least one resolved criterion failed
    Invalidated,
    /// No criterion could be resolved against collected data
    Insufficient,
}

impl HypothesisVerdict {
    /// Wire name stored in status and the summary
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validated => "validated",
            Self::Invalidated => "invalidated",
            Self::Insufficient => "insufficient",
        }
    }
}

impl fmt::Display for HypothesisVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar a criterion compares: the sole value of a single-point instant
/// result, otherwise the arithmetic mean
fn scalar(result: &QueryResult) -> f64 {
    match result.data.as_slice() {
        [only] if result.query_type == "instant" => only.value,
        points => points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64,
    }
}

fn compare(operator: &str, actual: f64, threshold: f64) -> Option<bool> {
    match operator {
        "lt" => Some(actual < threshold),
        "lte" => Some(actual <= threshold),
        "gt" => Some(actual > threshold),
        "gte" => Some(actual >= threshold),
        _ => None,
    }
}

/// Evaluate the summary's criteria against its metrics, recording each
/// outcome on the summary.
///
/// Returns `None` when no criteria are declared. A criterion whose metric is
/// missing, errored or empty, or whose threshold or operator is invalid, is
/// left unresolved rather than failed.
pub fn evaluate_success_criteria(summary: &mut ExperimentSummary) -> Option<HypothesisVerdict> {
    let hypothesis = summary.hypothesis.as_mut()?;
    if hypothesis.success_criteria.is_empty() {
        return None;
    }
    let Some(metrics) = summary.metrics.as_ref().filter(|m| !m.queries.is_empty()) else {
        return Some(HypothesisVerdict::Insufficient);
    };

    let mut any_resolved = false;
    let mut all_passed = true;
    for criterion in &mut hypothesis.success_criteria {
        criterion.passed = None;
        criterion.actual_value = None;

        let Some(result) = metrics.queries.get(&criterion.metric).filter(|r| r.has_data()) else {
            continue;
        };
        let Ok(threshold) = criterion.value.trim().parse::<f64>() else {
            continue;
        };
        let actual = scalar(result);
        let Some(passed) = compare(&criterion.operator, actual, threshold) else {
            continue;
        };

        any_resolved = true;
        all_passed &= passed;
        criterion.passed = Some(passed);
        criterion.actual_value = Some(actual.to_string());
    }

    Some(match (any_resolved, all_passed) {
        (false, _) => HypothesisVerdict::Insufficient,
        (true, true) => HypothesisVerdict::Validated,
        (true, false) => HypothesisVerdict::Invalidated,
    })
}
