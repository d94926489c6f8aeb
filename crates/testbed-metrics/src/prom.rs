//! Prometheus HTTP API response handling
//!
//! Both the hub client and the in-cluster service proxy receive the same
//! `{status, data: {resultType, result}}` envelope; this module turns it into
//! flat [`DataPoint`] lists.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use testbed_common::Error;

use crate::query::{PlannedQuery, QueryKind, TimeWindow};
use crate::types::{DataPoint, QueryResult};

/// Response envelope of `/api/v1/query` and `/api/v1/query_range`
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromResponse {
    /// `success` or `error`
    #[serde(default)]
    pub status: String,
    /// Result payload
    #[serde(default)]
    pub data: PromData,
    /// Error message when `status` is `error`
    #[serde(default)]
    pub error: Option<String>,
}

/// Result payload of a query response
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromData {
    /// `vector`, `matrix`, `scalar` or `string`
    #[serde(default)]
    pub result_type: String,
    /// Series
    #[serde(default)]
    pub result: Vec<PromSeries>,
}

/// One series. Instant queries fill `value`, range queries fill `values`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PromSeries {
    /// Series labels
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    /// Single `[timestamp, "value"]` sample
    #[serde(default)]
    pub value: Option<(Value, Value)>,
    /// `[timestamp, "value"]` samples
    #[serde(default)]
    pub values: Vec<(Value, Value)>,
}

impl PromResponse {
    /// Parse a response body
    pub fn parse(body: &str) -> Result<Self, Error> {
        serde_json::from_str(body)
            .map_err(|e| Error::metrics(format!("failed to decode query response: {}", e)))
    }

    /// Parse a response body, requiring `status == "success"`
    pub fn parse_success(body: &str) -> Result<Self, Error> {
        let response = Self::parse(body)?;
        if response.status != "success" {
            return Err(Error::metrics(format!(
                "query returned status {:?}: {}",
                response.status,
                response.error.as_deref().unwrap_or("no error message")
            )));
        }
        Ok(response)
    }
}

/// Flatten an instant (vector) result to one point per series
pub fn flatten_instant(series: &[PromSeries]) -> Vec<DataPoint> {
    series
        .iter()
        .filter_map(|s| {
            let (ts, val) = s.value.as_ref()?;
            to_point(&s.metric, ts, val)
        })
        .collect()
}

/// Flatten a range (matrix) result to one point per sample, series in order
pub fn flatten_range(series: &[PromSeries]) -> Vec<DataPoint> {
    series
        .iter()
        .flat_map(|s| {
            s.values
                .iter()
                .filter_map(move |(ts, val)| to_point(&s.metric, ts, val))
        })
        .collect()
}

fn to_point(metric: &BTreeMap<String, String>, ts: &Value, val: &Value) -> Option<DataPoint> {
    match parse_sample(ts, val) {
        Ok((timestamp, value)) => Some(DataPoint {
            labels: metric.clone(),
            timestamp,
            value,
        }),
        Err(reason) => {
            debug!(reason = %reason, "skipping sample");
            None
        }
    }
}

/// Decode a `[timestamp, "value"]` pair.
///
/// Timestamps are float seconds since the epoch; values are strings. Values
/// that are not finite are rejected.
pub fn parse_sample(ts: &Value, val: &Value) -> Result<(DateTime<Utc>, f64), String> {
    let seconds = ts
        .as_f64()
        .ok_or_else(|| format!("timestamp {} is not a number", ts))?;
    let value = match val {
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|e| format!("value {:?} is not a float: {}", s, e))?,
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("value {} out of range", n))?,
        other => return Err(format!("value {} is not a string", other)),
    };
    if !value.is_finite() {
        return Err(format!("value {} is not finite", value));
    }

    let whole = seconds.trunc();
    let nanos = ((seconds - whole) * 1e9).round() as u32;
    let timestamp = DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
        .ok_or_else(|| format!("timestamp {} out of range", seconds))?;
    Ok((timestamp, value))
}

/// A Prometheus-compatible query endpoint
#[async_trait]
pub trait PromApi: Send + Sync {
    /// Evaluate `query` at `at`
    async fn instant(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<DataPoint>, Error>;

    /// Evaluate `query` across `window` every `step_seconds`
    async fn range(
        &self,
        query: &str,
        window: &TimeWindow,
        step_seconds: u64,
    ) -> Result<Vec<DataPoint>, Error>;
}

/// Outcome of running a query plan against one endpoint
#[derive(Debug, Default)]
pub struct PlanOutcome {
    /// Results keyed by query name
    pub queries: BTreeMap<String, QueryResult>,
    /// At least one query executed without error
    pub any_success: bool,
    /// At least one query returned samples
    pub any_data: bool,
}

/// Run every planned query sequentially, recording per-query errors
pub async fn run_plan(
    api: &dyn PromApi,
    plan: &[PlannedQuery],
    window: &TimeWindow,
    step_seconds: u64,
) -> PlanOutcome {
    let mut outcome = PlanOutcome::default();
    for planned in plan {
        let mut result = QueryResult {
            query: planned.query.clone(),
            query_type: planned.declared_type.clone(),
            unit: planned.unit.clone(),
            description: planned.description.clone(),
            ..Default::default()
        };
        let data = match &planned.kind {
            Ok(QueryKind::Instant) => api.instant(&planned.query, window.end).await,
            Ok(QueryKind::Range) => api.range(&planned.query, window, step_seconds).await,
            Err(reason) => Err(Error::metrics(reason.clone())),
        };
        match data {
            Ok(points) => {
                outcome.any_success = true;
                outcome.any_data |= !points.is_empty();
                result.data = points;
            }
            Err(e) => {
                debug!(query = %planned.name, error = %e, "query failed");
                result.error = Some(e.to_string());
            }
        }
        outcome.queries.insert(planned.name.clone(), result);
    }
    outcome
}

/// Decode a query response body into points according to the query kind
pub fn decode_points(body: &str, kind: QueryKind, require_success: bool) -> Result<Vec<DataPoint>, Error> {
    let response = if require_success {
        PromResponse::parse_success(body)?
    } else {
        PromResponse::parse(body)?
    };
    Ok(match kind {
        QueryKind::Instant => flatten_instant(&response.data.result),
        QueryKind::Range => flatten_range(&response.data.result),
    })
}
