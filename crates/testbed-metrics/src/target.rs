//! In-cluster metrics on target clusters
//!
//! Discovery lists services in well-known monitoring namespaces, matches them
//! against read-path names of common Prometheus-compatible stacks and probes
//! each candidate through the API server service proxy before trusting it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use testbed_common::crd::Experiment;
use testbed_common::kube_utils::{client_from_kubeconfig, get_raw_with_timeout};
use testbed_common::Error;

use crate::cadvisor::PodUsage;
use crate::hub::HubMetricsClient;
use crate::prom::{decode_points, run_plan, PromApi};
use crate::query::{
    default_target_queries, plan_queries, prom_duration, QueryKind, QueryVars, TimeWindow,
    MIN_QUERY_WINDOW_SECS,
};
use crate::types::{DataPoint, MetricsResult};

/// Namespaces searched after the experiment's own namespace, in order
pub const MONITORING_NAMESPACES: &[&str] = &[
    "monitoring",
    "observability",
    "kube-prometheus-stack",
    "victoria-metrics",
    "mimir",
    "default",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(15);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A Prometheus-compatible service on a target cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitoringEndpoint {
    /// Service name
    pub service: String,
    /// Service namespace
    pub namespace: String,
    /// Service port serving the query API
    pub port: i32,
}

impl MonitoringEndpoint {
    /// Source tag recorded on results from this endpoint
    pub fn source(&self) -> String {
        format!("target:{}/{}", self.namespace, self.service)
    }

    fn proxy_path(&self, api_path: &str) -> String {
        format!(
            "/api/v1/namespaces/{}/services/{}:{}/proxy{}",
            self.namespace, self.service, self.port, api_path
        )
    }
}

/// Match a service against known query-capable backends
pub fn match_monitoring_service(svc: &Service) -> Option<MonitoringEndpoint> {
    let name = svc.name_any().to_lowercase();
    let excluded = ["operator", "alertmanager", "node-exporter", "grafana", "kube-state-metrics"];

    let default_port = if name.contains("prometheus") && !excluded.iter().any(|e| name.contains(e)) {
        9090
    } else if ["victoria-metrics", "vmsingle", "vmselect"].iter().any(|p| name.contains(p)) {
        8428
    } else if name.contains("mimir")
        && ["query-frontend", "querier", "nginx"].iter().any(|p| name.contains(p))
    {
        // Distributors, ingesters and compactors do not serve the read API
        8080
    } else {
        return None;
    };

    Some(MonitoringEndpoint {
        service: svc.name_any(),
        namespace: svc.namespace().unwrap_or_default(),
        port: find_port(svc, default_port),
    })
}

/// The default port if the service exposes it, else its first port
pub fn find_port(svc: &Service, default_port: i32) -> i32 {
    let ports = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    if ports.iter().any(|p| p.port == default_port) {
        return default_port;
    }
    ports.first().map(|p| p.port).unwrap_or(default_port)
}

/// Encode query parameters for an API server proxy path
fn encode_query(params: &[(&str, String)]) -> Result<String, Error> {
    let mut url = Url::parse("http://proxy.invalid/")
        .map_err(|e| Error::internal_with_context("encode_query", e.to_string()))?;
    url.query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
    Ok(url.query().unwrap_or_default().to_string())
}

/// Queries a monitoring service through the API server service proxy
struct ServiceProxyApi<'a> {
    client: &'a Client,
    endpoint: &'a MonitoringEndpoint,
}

impl ServiceProxyApi<'_> {
    async fn get(&self, api_path: &str, params: &[(&str, String)], kind: QueryKind) -> Result<Vec<DataPoint>, Error> {
        let path = format!("{}?{}", self.endpoint.proxy_path(api_path), encode_query(params)?);
        let body = get_raw_with_timeout(self.client, &path, QUERY_TIMEOUT)
            .await
            .map_err(|e| Error::metrics(format!("proxy {}: {}", api_path, e)))?;
        decode_points(&body, kind, true)
    }
}

#[async_trait]
impl PromApi for ServiceProxyApi<'_> {
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

#[derive(Deserialize)]
struct BuildInfo {
    #[serde(default)]
    status: String,
}

/// Where experiment metrics can be collected from
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Find verified query endpoints on a target cluster. Empty when none respond.
    async fn discover(
        &self,
        kubeconfig: &[u8],
        experiment: &str,
    ) -> Result<Vec<MonitoringEndpoint>, Error>;

    /// Run the experiment's queries against the first endpoint where any query succeeds
    async fn collect_from_endpoints(
        &self,
        kubeconfig: &[u8],
        endpoints: &[MonitoringEndpoint],
        experiment: &Experiment,
    ) -> Result<MetricsResult, Error>;

    /// Sum per-pod usage from every node's cAdvisor endpoint
    async fn collect_cadvisor(
        &self,
        kubeconfig: &[u8],
        experiment: &Experiment,
    ) -> Result<MetricsResult, Error>;

    /// Query the hub's central backend; `None` when unconfigured or too early
    async fn collect_hub(&self, experiment: &Experiment) -> Result<Option<MetricsResult>, Error>;
}

/// [`MetricsSource`] reaching target clusters through their kubeconfigs
pub struct KubeMetricsSource {
    hub: Option<HubMetricsClient>,
}

impl KubeMetricsSource {
    /// Create a source; an empty or absent hub URL disables the hub fallback
    pub fn new(hub_url: Option<&str>) -> Result<Self, Error> {
        let hub = match hub_url.filter(|u| !u.is_empty()) {
            Some(url) => Some(HubMetricsClient::new(url)?),
            None => None,
        };
        Ok(Self { hub })
    }

    async fn probe(client: &Client, endpoint: &MonitoringEndpoint) -> Result<(), Error> {
        let body = get_raw_with_timeout(
            client,
            &endpoint.proxy_path("/api/v1/status/buildinfo"),
            PROBE_TIMEOUT,
        )
        .await?;
        let info: BuildInfo = serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(200).collect();
            Error::metrics(format!("unexpected buildinfo response: {} (body: {})", e, preview))
        })?;
        if info.status != "success" {
            return Err(Error::metrics(format!("unexpected buildinfo status: {:?}", info.status)));
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsSource for KubeMetricsSource {
    async fn discover(
        &self,
        kubeconfig: &[u8],
        experiment: &str,
    ) -> Result<Vec<MonitoringEndpoint>, Error> {
        let client = client_from_kubeconfig(kubeconfig, CLIENT_READ_TIMEOUT).await?;

        let mut candidates = Vec::new();
        for ns in std::iter::once(experiment).chain(MONITORING_NAMESPACES.iter().copied()) {
            let api: Api<Service> = Api::namespaced(client.clone(), ns);
            match api.list(&ListParams::default()).await {
                Ok(list) => candidates.extend(list.items.iter().filter_map(match_monitoring_service)),
                Err(e) => debug!(namespace = %ns, error = %e, "skipping namespace"),
            }
        }

        if candidates.is_empty() {
            let api: Api<Service> = Api::all(client.clone());
            if let Ok(list) = api.list(&ListParams::default()).await {
                candidates.extend(list.items.iter().filter_map(match_monitoring_service));
            }
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = candidates.len(), "matched monitoring service candidates");

        let mut verified = Vec::new();
        for endpoint in candidates {
            match Self::probe(&client, &endpoint).await {
                Ok(()) => {
                    info!(service = %endpoint.service, namespace = %endpoint.namespace, port = endpoint.port, "probe succeeded");
                    verified.push(endpoint);
                }
                Err(e) => {
                    debug!(service = %endpoint.service, namespace = %endpoint.namespace, error = %e, "probe failed");
                }
            }
        }
        if verified.is_empty() {
            info!("no monitoring endpoint answered the probe");
        }
        Ok(verified)
    }

    async fn collect_from_endpoints(
        &self,
        kubeconfig: &[u8],
        endpoints: &[MonitoringEndpoint],
        experiment: &Experiment,
    ) -> Result<MetricsResult, Error> {
        if endpoints.is_empty() {
            return Err(Error::metrics("no monitoring endpoints provided"));
        }
        let window = TimeWindow::for_experiment(experiment);
        if !window.is_queryable() {
            return Err(Error::metrics(format!(
                "experiment duration too short for metrics: {} (minimum {}s)",
                prom_duration(window.duration()),
                MIN_QUERY_WINDOW_SECS
            )));
        }

        let client = client_from_kubeconfig(kubeconfig, CLIENT_READ_TIMEOUT).await?;
        let step = window.step_seconds();
        // Target workloads run in a namespace named after the experiment
        let vars = QueryVars {
            experiment: experiment.name_any(),
            namespace: experiment.name_any(),
            duration: prom_duration(window.duration()),
        };
        let plan = plan_queries(&experiment.spec.metrics, default_target_queries, &vars);

        for endpoint in endpoints {
            let api = ServiceProxyApi {
                client: &client,
                endpoint,
            };
            let outcome = run_plan(&api, &plan, &window, step).await;
            if !outcome.any_success {
                info!(service = %endpoint.service, namespace = %endpoint.namespace, "all queries failed for endpoint");
                continue;
            }
            if outcome.any_data {
                info!(service = %endpoint.service, namespace = %endpoint.namespace, "collected metrics from target");
            } else {
                info!(service = %endpoint.service, "queries succeeded but returned no data");
            }
            let mut result = MetricsResult::new(window.time_range(step)).with_source(endpoint.source());
            result.queries = outcome.queries;
            return Ok(result);
        }

        Err(Error::metrics(format!(
            "all {} monitoring endpoints failed",
            endpoints.len()
        )))
    }

    async fn collect_cadvisor(
        &self,
        kubeconfig: &[u8],
        experiment: &Experiment,
    ) -> Result<MetricsResult, Error> {
        let client = client_from_kubeconfig(kubeconfig, CLIENT_READ_TIMEOUT).await?;
        let nodes: Api<Node> = Api::all(client.clone());
        let nodes = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::metrics(format!("list nodes: {}", e)))?;
        if nodes.items.is_empty() {
            return Err(Error::metrics("no nodes found"));
        }

        let mut usage = PodUsage::default();
        for node in &nodes.items {
            let node_name = node.name_any();
            let path = format!("/api/v1/nodes/{}/proxy/metrics/cadvisor", node_name);
            match get_raw_with_timeout(&client, &path, SCRAPE_TIMEOUT).await {
                Ok(text) => {
                    usage.add_scrape(&text);
                    debug!(node = %node_name, cpu_pods = usage.cpu.len(), memory_pods = usage.memory.len(), "scraped cadvisor");
                }
                Err(e) => warn!(node = %node_name, error = %e, "failed to scrape cadvisor"),
            }
        }
        if usage.is_empty() {
            return Err(Error::metrics("no cadvisor metrics found on any node"));
        }

        let window = TimeWindow::for_experiment(experiment);
        Ok(usage.into_result(window.start, window.end))
    }

    async fn collect_hub(&self, experiment: &Experiment) -> Result<Option<MetricsResult>, Error> {
        match &self.hub {
            Some(hub) => hub.collect(experiment, TimeWindow::for_experiment(experiment)).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    fn service(name: &str, ports: &[i32]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("monitoring".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .map(|p| ServicePort {
                            port: *p,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn matches_prometheus_read_path() {
        let ep = match_monitoring_service(&service("kube-prometheus-stack-prometheus", &[9090, 8080])).unwrap();
        assert_eq!(ep.port, 9090);
        assert_eq!(ep.namespace, "monitoring");
        assert_eq!(ep.source(), "target:monitoring/kube-prometheus-stack-prometheus");
    }

    #[test]
    fn skips_prometheus_auxiliaries() {
        for name in [
            "prometheus-operator",
            "kube-prometheus-stack-alertmanager",
            "prometheus-node-exporter",
            "prometheus-grafana",
            "prometheus-kube-state-metrics",
            "redis",
        ] {
            assert!(match_monitoring_service(&service(name, &[9090])).is_none(), "{}", name);
        }
    }

    #[test]
    fn matches_victoria_metrics_variants() {
        for name in ["victoria-metrics-single-server", "vmsingle-vm", "vmselect-cluster"] {
            let ep = match_monitoring_service(&service(name, &[8428])).unwrap();
            assert_eq!(ep.port, 8428, "{}", name);
        }
    }

    #[test]
    fn matches_only_mimir_query_services() {
        assert!(match_monitoring_service(&service("mimir-query-frontend", &[8080])).is_some());
        assert!(match_monitoring_service(&service("mimir-nginx", &[80])).is_some());
        assert!(match_monitoring_service(&service("mimir-distributor", &[8080])).is_none());
        assert!(match_monitoring_service(&service("mimir-ingester", &[8080])).is_none());
    }

    #[test]
    fn find_port_falls_back_to_first_then_default() {
        assert_eq!(find_port(&service("x", &[80, 9090]), 9090), 9090);
        assert_eq!(find_port(&service("x", &[80, 443]), 9090), 80);
        assert_eq!(find_port(&service("x", &[]), 9090), 9090);
        let mut bare = service("x", &[]);
        bare.spec = None;
        assert_eq!(find_port(&bare, 8428), 8428);
    }

    #[test]
    fn proxy_path_targets_service_port() {
        let ep = MonitoringEndpoint {
            service: "prometheus".to_string(),
            namespace: "monitoring".to_string(),
            port: 9090,
        };
        assert_eq!(
            ep.proxy_path("/api/v1/query"),
            "/api/v1/namespaces/monitoring/services/prometheus:9090/proxy/api/v1/query"
        );
    }

    #[test]
    fn query_parameters_are_encoded() {
        let encoded = encode_query(&[
            ("query", "sum(rate(x{pod!~\"a.*\"}[1m]))".to_string()),
            ("time", "1707350400".to_string()),
        ])
        .unwrap();
        assert!(encoded.starts_with("query=sum%28rate%28x%7Bpod%21%7E%22a.*%22%7D%5B1m%5D%29%29"));
        assert!(encoded.ends_with("&time=1707350400"));
    }

    #[tokio::test]
    async fn hub_disabled_without_url() {
        let source = KubeMetricsSource::new(Some("")).unwrap();
        let exp = Experiment::new("demo", Default::default());
        assert!(source.collect_hub(&exp).await.unwrap().is_none());
    }
}
