//! Metrics collection, hypothesis evaluation and cost estimation
//!
//! Metrics come from three places, tried in order of locality: a
//! Prometheus-compatible backend discovered on each target cluster, per-node
//! cAdvisor scrapes for targets relaying telemetry indirectly, and the hub's
//! central backend as the fallback.

#![deny(missing_docs)]

pub mod cadvisor;
pub mod cost;
pub mod criteria;
pub mod hub;
pub mod prom;
pub mod query;
pub mod summary;
pub mod target;
pub mod types;

pub use cost::{estimate_cost, CostEstimate};
pub use criteria::{evaluate_success_criteria, HypothesisVerdict};
pub use hub::HubMetricsClient;
pub use query::{
    default_queries, default_target_queries, query_names, QueryKind, QueryVars, TimeWindow,
};
pub use summary::{
    analyzer_sections, collect_summary, AnalyzerSections, ExperimentSummary,
    DEFAULT_ANALYZER_SECTIONS,
};
#[cfg(any(test, feature = "mock"))]
pub use target::MockMetricsSource;
pub use target::{KubeMetricsSource, MetricsSource, MonitoringEndpoint};
pub use types::{all_queries_empty, DataPoint, MetricsResult, QueryResult, TimeRange};
