//! Query plans: default queries, variable substitution and time windows

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};

use testbed_common::crd::{Experiment, MetricsQuery};
use testbed_common::Error;

use crate::types::TimeRange;

/// Namespaces whose workloads never count towards experiment usage
pub const SYSTEM_NAMESPACES: &[&str] = &[
    "kube-system",
    "gke-managed-system",
    "gmp-system",
    "gmp-public",
    "kube-node-lease",
    "kube-public",
    "observability",
];

/// Pod name prefixes of operator-injected infrastructure
pub const INFRA_POD_PREFIXES: &[&str] = &[
    "alloy-",
    "ts-vm-hub-",
    "prometheus-",
    "alertmanager-",
    "grafana-",
    "kube-state-metrics-",
    "node-exporter-",
    "kube-prometheus-stack-",
    "tailscale-operator-",
    "operator-",
];

/// Windows shorter than this many seconds hold too little data to query
pub const MIN_QUERY_WINDOW_SECS: i64 = 30;

/// Evaluation mode of a query
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    /// Single evaluation at the window end
    Instant,
    /// Evaluation across the window at a fixed step
    Range,
}

impl QueryKind {
    /// Parse a declared query type; unset means instant
    pub fn parse(declared: Option<&str>) -> Result<Self, Error> {
        match declared.unwrap_or_default() {
            "" | "instant" => Ok(Self::Instant),
            "range" => Ok(Self::Range),
            other => Err(Error::metrics(format!("unknown query type: {}", other))),
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Range => "range",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values substituted for `$EXPERIMENT`, `$NAMESPACE` and `$DURATION`
#[derive(Clone, Debug)]
pub struct QueryVars {
    /// Experiment name
    pub experiment: String,
    /// Namespace the workloads run in
    pub namespace: String,
    /// Window length in PromQL duration syntax
    pub duration: String,
}

impl QueryVars {
    /// Replace every occurrence of each variable in `query`
    pub fn substitute(&self, query: &str) -> String {
        query
            .replace("$EXPERIMENT", &self.experiment)
            .replace("$NAMESPACE", &self.namespace)
            .replace("$DURATION", &self.duration)
    }
}

/// Format a duration in PromQL syntax (`1h5m10s`).
///
/// Negative durations use their magnitude; anything below one second is `0s`.
pub fn prom_duration(d: TimeDelta) -> String {
    let total = d.num_seconds().unsigned_abs();
    if total == 0 {
        return "0s".to_string();
    }
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 {
        out.push_str(&format!("{}s", seconds));
    }
    out
}

/// Range query step for a window: finer for short experiments
pub fn select_step(d: TimeDelta) -> u64 {
    if d < TimeDelta::minutes(5) {
        15
    } else if d < TimeDelta::hours(1) {
        60
    } else {
        300
    }
}

/// Collection window from experiment creation to now
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeWindow {
    /// Experiment creation
    pub start: DateTime<Utc>,
    /// Collection time
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window ending now. Resources are still alive at collection time, so
    /// data scraped after the workflow finished is included.
    pub fn ending_now(start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: Utc::now(),
        }
    }

    /// Window from the experiment's creation to now
    pub fn for_experiment(experiment: &Experiment) -> Self {
        let end = Utc::now();
        let start = experiment
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or(end);
        Self { start, end }
    }

    /// Window length
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// True when the window is long enough to query
    pub fn is_queryable(&self) -> bool {
        self.duration() >= TimeDelta::seconds(MIN_QUERY_WINDOW_SECS)
    }

    /// Range query step in seconds
    pub fn step_seconds(&self) -> u64 {
        select_step(self.duration())
    }

    /// Serializable form, with the given step
    pub fn time_range(&self, step_seconds: u64) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
            duration: prom_duration(self.duration()),
            step_seconds,
        }
    }
}

/// A query ready to execute
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedQuery {
    /// Result key
    pub name: String,
    /// Query text after substitution
    pub query: String,
    /// Declared type, kept verbatim for the result
    pub declared_type: String,
    /// Parsed type, or the reason it could not be parsed
    pub kind: Result<QueryKind, String>,
    /// Display unit
    pub unit: Option<String>,
    /// Display description
    pub description: Option<String>,
}

/// Resolve declared queries, falling back to `defaults` when none are declared
pub fn plan_queries(
    declared: &[MetricsQuery],
    defaults: fn() -> Vec<MetricsQuery>,
    vars: &QueryVars,
) -> Vec<PlannedQuery> {
    let queries = if declared.is_empty() {
        defaults()
    } else {
        declared.to_vec()
    };
    queries
        .into_iter()
        .map(|q| {
            let kind = QueryKind::parse(q.query_type.as_deref()).map_err(|e| e.to_string());
            let declared_type = match &kind {
                Ok(k) => k.as_str().to_string(),
                Err(_) => q.query_type.clone().unwrap_or_default(),
            };
            PlannedQuery {
                name: q.name,
                query: vars.substitute(&q.query),
                declared_type,
                kind,
                unit: q.unit,
                description: q.description,
            }
        })
        .collect()
}

fn pod_filters(experiment_selector: &str, exclude_pause: bool) -> String {
    let mut filters = format!(
        "{}namespace!~\"{}\",pod!~\"{}\"",
        experiment_selector,
        SYSTEM_NAMESPACES.join("|"),
        INFRA_POD_PREFIXES
            .iter()
            .map(|p| format!("{}.*", p))
            .collect::<Vec<_>>()
            .join("|"),
    );
    if exclude_pause {
        filters.push_str(",container!=\"POD\",container!=\"\"");
    }
    filters
}

fn usage_queries(experiment_selector: &str) -> Vec<MetricsQuery> {
    let per_container = pod_filters(experiment_selector, true);
    let per_pod = pod_filters(experiment_selector, false);
    vec![
        MetricsQuery {
            name: "cpu_by_pod".to_string(),
            query: format!(
                "sum(rate(container_cpu_usage_seconds_total{{{}}}[1m])) by (pod)",
                per_container
            ),
            query_type: Some("range".to_string()),
            unit: Some("cores".to_string()),
            description: Some("CPU usage by pod".to_string()),
            group: None,
        },
        MetricsQuery {
            name: "memory_by_pod".to_string(),
            query: format!(
                "sum(container_memory_working_set_bytes{{{}}}) by (pod)",
                per_container
            ),
            query_type: Some("range".to_string()),
            unit: Some("bytes".to_string()),
            description: Some("Memory working set by pod".to_string()),
            group: None,
        },
        MetricsQuery {
            name: "cpu_total".to_string(),
            query: format!("sum(rate(container_cpu_usage_seconds_total{{{}}}[1m]))", per_pod),
            query_type: Some("range".to_string()),
            unit: Some("cores".to_string()),
            description: Some("Total CPU usage".to_string()),
            group: None,
        },
        MetricsQuery {
            name: "memory_total".to_string(),
            query: format!("sum(container_memory_working_set_bytes{{{}}})", per_pod),
            query_type: Some("range".to_string()),
            unit: Some("bytes".to_string()),
            description: Some("Total memory working set".to_string()),
            group: None,
        },
    ]
}

/// Default queries against the central backend, scoped by the `experiment` label
/// the metrics agent attaches
pub fn default_queries() -> Vec<MetricsQuery> {
    usage_queries("experiment=\"$EXPERIMENT\",")
}

/// Default queries against an in-cluster backend, which only sees its own cluster
pub fn default_target_queries() -> Vec<MetricsQuery> {
    usage_queries("")
}

/// Names of the queries an experiment collects: its declared ones, or the
/// defaults when it declares none
pub fn query_names(declared: &[MetricsQuery]) -> Vec<String> {
    if declared.is_empty() {
        default_queries().into_iter().map(|q| q.name).collect()
    } else {
        declared.iter().map(|q| q.name.clone()).collect()
    }
}
