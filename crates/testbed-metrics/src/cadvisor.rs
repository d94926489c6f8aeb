//! Per-node cAdvisor scraping
//!
//! Targets that relay telemetry over an indirect transport may have no
//! queryable backend of their own; the kubelet's cAdvisor endpoint still
//! exposes container usage, which is summed here per pod.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::query::{INFRA_POD_PREFIXES, SYSTEM_NAMESPACES};
use crate::types::{DataPoint, MetricsResult, QueryResult, TimeRange};

/// Source tag of cAdvisor-derived results
pub const CADVISOR_SOURCE: &str = "target:cadvisor";

const CPU_METRIC: &str = "container_cpu_usage_seconds_total";
const MEMORY_METRIC: &str = "container_memory_working_set_bytes";

/// Per-pod usage accumulated across node scrapes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodUsage {
    /// Cumulative CPU seconds by pod
    pub cpu: BTreeMap<String, f64>,
    /// Working set bytes by pod
    pub memory: BTreeMap<String, f64>,
}

impl PodUsage {
    /// True when no workload sample was accepted
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.memory.is_empty()
    }

    /// Accumulate one node's exposition text
    pub fn add_scrape(&mut self, text: &str) {
        for line in text.lines() {
            let Some(sample) = parse_line(line) else {
                continue;
            };
            if !is_workload(&sample.labels) {
                continue;
            }
            let Some(pod) = sample.labels.get("pod") else {
                continue;
            };
            let bucket = if sample.metric == CPU_METRIC {
                &mut self.cpu
            } else {
                &mut self.memory
            };
            *bucket.entry(pod.clone()).or_default() += sample.value;
        }
    }

    /// Render as a metrics result with `cpu_by_pod`, `cpu_total`,
    /// `memory_by_pod` and `memory_total` instant queries
    pub fn into_result(self, start: DateTime<Utc>, now: DateTime<Utc>) -> MetricsResult {
        let mut result = MetricsResult::new(TimeRange {
            start,
            end: now,
            duration: crate::query::prom_duration(now - start),
            step_seconds: 0,
        })
        .with_source(CADVISOR_SOURCE);
        result.collected_at = now;

        let (cpu_by_pod, cpu_total) = per_pod_points(&self.cpu, now);
        let (memory_by_pod, memory_total) = per_pod_points(&self.memory, now);

        result.queries.insert(
            "cpu_by_pod".to_string(),
            instant(
                "container_cpu_usage_seconds_total by pod (cadvisor)",
                "cores",
                "CPU usage by pod (cumulative seconds)",
                cpu_by_pod,
            ),
        );
        result.queries.insert(
            "cpu_total".to_string(),
            instant(
                "sum(container_cpu_usage_seconds_total) (cadvisor)",
                "cores",
                "Total CPU usage (cumulative seconds)",
                vec![cpu_total],
            ),
        );
        result.queries.insert(
            "memory_by_pod".to_string(),
            instant(
                "container_memory_working_set_bytes by pod (cadvisor)",
                "bytes",
                "Memory working set by pod",
                memory_by_pod,
            ),
        );
        result.queries.insert(
            "memory_total".to_string(),
            instant(
                "sum(container_memory_working_set_bytes) (cadvisor)",
                "bytes",
                "Total memory working set",
                vec![memory_total],
            ),
        );
        result
    }
}

fn instant(query: &str, unit: &str, description: &str, data: Vec<DataPoint>) -> QueryResult {
    QueryResult {
        query: query.to_string(),
        query_type: "instant".to_string(),
        unit: Some(unit.to_string()),
        description: Some(description.to_string()),
        error: None,
        data,
    }
}

fn per_pod_points(values: &BTreeMap<String, f64>, now: DateTime<Utc>) -> (Vec<DataPoint>, DataPoint) {
    let points = values
        .iter()
        .map(|(pod, value)| DataPoint {
            labels: BTreeMap::from([("pod".to_string(), pod.clone())]),
            timestamp: now,
            value: *value,
        })
        .collect();
    let total = DataPoint {
        labels: BTreeMap::from([("scope".to_string(), "total".to_string())]),
        timestamp: now,
        value: values.values().sum(),
    };
    (points, total)
}

/// One parsed exposition sample of a tracked metric
#[derive(Debug, PartialEq)]
struct Sample {
    metric: &'static str,
    labels: BTreeMap<String, String>,
    value: f64,
}

/// Parse a tracked metric line; other metrics, comments and zero values yield `None`
fn parse_line(line: &str) -> Option<Sample> {
    let metric = [CPU_METRIC, MEMORY_METRIC]
        .into_iter()
        .find(|m| line.strip_prefix(m).is_some_and(|rest| rest.starts_with('{')))?;

    let body = &line[metric.len() + 1..];
    let close = body.rfind("} ")?;
    let labels = parse_labels(&body[..close]);
    let value = parse_value(&body[close + 2..])?;
    if value == 0.0 {
        return None;
    }
    Some(Sample {
        metric,
        labels,
        value,
    })
}

/// Parse `a="x",b="y"` honouring escaped quotes inside values
fn parse_labels(block: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut rest = block;
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim_start_matches(',').trim();
        let mut value = String::new();
        let mut chars = rest[eq + 2..].char_indices();
        let mut end = None;
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(match escaped {
                            'n' => '\n',
                            other => other,
                        });
                    }
                }
                '"' => {
                    end = Some(eq + 2 + i + 1);
                    break;
                }
                other => value.push(other),
            }
        }
        let Some(end) = end else {
            break;
        };
        labels.insert(key.to_string(), value);
        rest = &rest[end..];
    }
    labels
}

/// Sample value, ignoring an optional trailing timestamp
fn parse_value(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn is_workload(labels: &BTreeMap<String, String>) -> bool {
    let field = |name: &str| labels.get(name).map(String::as_str).unwrap_or_default();
    let (namespace, pod, container) = (field("namespace"), field("pod"), field("container"));

    if namespace.is_empty() || namespace == "tailscale" || SYSTEM_NAMESPACES.contains(&namespace) {
        return false;
    }
    if container.is_empty() || container == "POD" || pod.is_empty() {
        return false;
    }
    !INFRA_POD_PREFIXES.iter().any(|p| pod.starts_with(p))
}
