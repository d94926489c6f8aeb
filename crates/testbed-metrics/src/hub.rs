//! Central metrics backend on the hub cluster
//!
//! Metrics agents on every target ship samples, labelled with the experiment
//! name, to one Prometheus-compatible backend. Querying it is the fallback
//! when no in-cluster backend produced data.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info};

use testbed_common::crd::Experiment;
use testbed_common::Error;

use crate::prom::{decode_points, run_plan, PromApi};
use crate::query::{default_queries, plan_queries, prom_duration, QueryKind, QueryVars, TimeWindow};
use crate::types::{DataPoint, MetricsResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the hub metrics backend
#[derive(Clone)]
pub struct HubMetricsClient {
    http: reqwest::Client,
    base_url: String,
}

impl HubMetricsClient {
    /// Create a client for `base_url` (e.g. `http://vmsingle.observability:8428`)
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::metrics(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str, params: &[(&str, String)], kind: QueryKind) -> Result<Vec<DataPoint>, Error> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| Error::metrics(format!("metrics query: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::metrics(format!("read metrics response: {}", e)))?;
        if status != reqwest::StatusCode::OK {
            return Err(Error::metrics(format!(
                "metrics server returned {}: {}",
                status.as_u16(),
                body
            )));
        }
        decode_points(&body, kind, false)
    }

    /// Collect the experiment's declared (or default) queries over `window`.
    ///
    /// Returns `None` when the window is too short to hold meaningful data.
    /// Individual query failures are recorded on their result, not returned.
    pub async fn collect(
        &self,
        experiment: &Experiment,
        window: TimeWindow,
    ) -> Result<Option<MetricsResult>, Error> {
        if !window.is_queryable() {
            debug!(experiment = %experiment.name_any(), "experiment too short for hub metrics");
            return Ok(None);
        }

        let step = window.step_seconds();
        let vars = QueryVars {
            experiment: experiment.name_any(),
            namespace: experiment.namespace().unwrap_or_default(),
            duration: prom_duration(window.duration()),
        };
        let plan = plan_queries(&experiment.spec.metrics, default_queries, &vars);
        let outcome = run_plan(self, &plan, &window, step).await;

        info!(
            experiment = %vars.experiment,
            queries = outcome.queries.len(),
            any_data = outcome.any_data,
            "collected hub metrics"
        );
        let mut result = MetricsResult::new(window.time_range(step));
        result.queries = outcome.queries;
        Ok(Some(result))
    }
}

#[async_trait]
impl PromApi for HubMetricsClient {
    async fn instant(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<DataPoint>, Error> {
        let params = [("query", query.to_string()), ("time", at.timestamp().to_string())];
        self.get("/api/v1/query", &params, QueryKind::Instant).await
    }

    async fn range(
        &self,
        query: &str,
        window: &TimeWindow,
        step_seconds: u64,
    ) -> Result<Vec<DataPoint>, Error> {
        let params = [
            ("query", query.to_string()),
            ("start", window.start.timestamp().to_string()),
            ("end", window.end.timestamp().to_string()),
            ("step", format!("{}s", step_seconds)),
        ];
        self.get("/api/v1/query_range", &params, QueryKind::Range).await
    }
}
