//! Collected metrics snapshot model
//!
//! A [`MetricsResult`] is persisted verbatim as `metrics-snapshot.json` and
//! embedded in the experiment summary, so field names follow the JSON layout
//! consumed by the results site.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One metrics collection pass over an experiment's lifetime
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResult {
    /// When the collection ran
    pub collected_at: DateTime<Utc>,
    /// Where the data came from (`target:{ns}/{svc}`, `target:cadvisor`, or unset for the hub)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Queried window
    pub time_range: TimeRange,
    /// Results keyed by query name
    #[serde(default)]
    pub queries: BTreeMap<String, QueryResult>,
}

/// Queried time window
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    /// Window start (experiment creation)
    pub start: DateTime<Utc>,
    /// Window end (collection time)
    pub end: DateTime<Utc>,
    /// Human readable window length
    pub duration: String,
    /// Range query resolution; zero for instant snapshots
    #[serde(rename = "stepSeconds")]
    pub step_seconds: u64,
}

/// Outcome of a single named query
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// The query after variable substitution
    pub query: String,
    /// `instant` or `range`
    #[serde(rename = "type")]
    pub query_type: String,
    /// Display unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Display description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Query failure; `data` is empty when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Flattened samples
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataPoint>,
}

impl QueryResult {
    /// True when the query ran and returned at least one sample
    pub fn has_data(&self) -> bool {
        self.error.is_none() && !self.data.is_empty()
    }
}

/// One sample of one series
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Series labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Sample time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Sample value; always finite
    pub value: f64,
}

impl MetricsResult {
    /// Empty result over a window
    pub fn new(time_range: TimeRange) -> Self {
        Self {
            collected_at: Utc::now(),
            source: None,
            time_range,
            queries: BTreeMap::new(),
        }
    }

    /// Tag the result with its source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// True when no query returned any sample
    pub fn all_queries_empty(&self) -> bool {
        self.queries.values().all(|q| q.data.is_empty())
    }

    /// True when every named query is present with samples
    pub fn covers<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names
            .iter()
            .all(|name| self.queries.get(name.as_ref()).is_some_and(|q| !q.data.is_empty()))
    }

    /// Fill query names that are absent or empty here from `other`.
    ///
    /// Existing non-empty results always win.
    pub fn fill_missing_from(&mut self, other: MetricsResult) {
        for (name, result) in other.queries {
            let missing = self.queries.get(&name).map_or(true, |q| q.data.is_empty());
            if missing && (!result.data.is_empty() || !self.queries.contains_key(&name)) {
                self.queries.insert(name, result);
            }
        }
    }

    /// Overwrite this result's queries with every non-empty query of `other`
    pub fn override_with(&mut self, other: MetricsResult) {
        for (name, result) in other.queries {
            if !result.data.is_empty() {
                self.queries.insert(name, result);
            }
        }
        if other.source.is_some() {
            self.source = other.source;
        }
    }
}

/// True when `result` is absent or carries no samples at all
pub fn all_queries_empty(result: Option<&MetricsResult>) -> bool {
    result.map_or(true, MetricsResult::all_queries_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> TimeRange {
        TimeRange {
            start: DateTime::from_timestamp(1_707_350_400, 0).unwrap_or_default(),
            end: DateTime::from_timestamp(1_707_354_000, 0).unwrap_or_default(),
            duration: "1h".to_string(),
            step_seconds: 300,
        }
    }

    fn point(value: f64) -> DataPoint {
        DataPoint {
            labels: BTreeMap::new(),
            timestamp: DateTime::from_timestamp(1_707_350_400, 0).unwrap_or_default(),
            value,
        }
    }

    fn query(data: Vec<DataPoint>) -> QueryResult {
        QueryResult {
            query: "up".to_string(),
            query_type: "instant".to_string(),
            data,
            ..Default::default()
        }
    }

    #[test]
    fn covers_requires_samples_for_every_name() {
        let mut result = MetricsResult::new(window());
        result.queries.insert("cpu".to_string(), query(vec![point(0.5)]));
        result.queries.insert("memory".to_string(), query(vec![]));

        assert!(result.covers(&["cpu"]));
        assert!(!result.covers(&["cpu", "memory"]));
        assert!(!result.covers(&["cpu", "network"]));
    }

    #[test]
    fn absent_result_counts_as_empty() {
        assert!(all_queries_empty(None));
    }

    #[test]
    fn errored_queries_count_as_empty() {
        let mut result = MetricsResult::new(window());
        result.queries.insert(
            "cpu".to_string(),
            QueryResult {
                error: Some("timeout".to_string()),
                ..query(vec![])
            },
        );
        assert!(all_queries_empty(Some(&result)));

        result.queries.insert("mem".to_string(), query(vec![point(1.0)]));
        assert!(!all_queries_empty(Some(&result)));
    }

    #[test]
    fn fill_missing_keeps_existing_data() {
        let mut local = MetricsResult::new(window()).with_source("target:monitoring/prometheus");
        local.queries.insert("cpu".to_string(), query(vec![point(1.0)]));
        local.queries.insert("mem".to_string(), query(vec![]));

        let mut hub = MetricsResult::new(window());
        hub.queries.insert("cpu".to_string(), query(vec![point(9.0)]));
        hub.queries.insert("mem".to_string(), query(vec![point(2.0)]));
        hub.queries.insert("disk".to_string(), query(vec![point(3.0)]));

        local.fill_missing_from(hub);

        assert_eq!(local.queries["cpu"].data[0].value, 1.0);
        assert_eq!(local.queries["mem"].data[0].value, 2.0);
        assert_eq!(local.queries["disk"].data[0].value, 3.0);
        assert_eq!(local.source.as_deref(), Some("target:monitoring/prometheus"));
    }

    #[test]
    fn override_replaces_only_non_empty_queries() {
        let mut cadvisor = MetricsResult::new(window()).with_source("target:cadvisor");
        cadvisor.queries.insert("cpu_total".to_string(), query(vec![point(5.0)]));
        cadvisor.queries.insert("memory_total".to_string(), query(vec![point(6.0)]));

        let mut prom = MetricsResult::new(window()).with_source("target:monitoring/prometheus");
        prom.queries.insert("cpu_total".to_string(), query(vec![point(0.5)]));
        prom.queries.insert("memory_total".to_string(), query(vec![]));

        cadvisor.override_with(prom);

        assert_eq!(cadvisor.queries["cpu_total"].data[0].value, 0.5);
        assert_eq!(cadvisor.queries["memory_total"].data[0].value, 6.0);
        assert_eq!(cadvisor.source.as_deref(), Some("target:monitoring/prometheus"));
    }

    #[test]
    fn empty_labels_are_omitted_from_json() {
        let json = serde_json::to_value(point(42.5)).unwrap();
        assert!(json.get("labels").is_none());
        assert_eq!(json["value"], 42.5);
    }

    #[test]
    fn query_result_uses_type_key() {
        let json = serde_json::to_value(query(vec![])).unwrap();
        assert_eq!(json["type"], "instant");
        assert!(json.get("data").is_none());
        assert!(json.get("error").is_none());
    }
}
