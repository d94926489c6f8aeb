//! Layered rollout classification
//!
//! With observability enabled a target is deployed as up to three
//! Applications applied in order: infra (configuration and mesh plumbing),
//! obs (metrics agents) and workload (everything under test). The workload
//! layer is only created once infra and obs report healthy.

use testbed_common::crd::{ComponentRef, DeploymentLayer, ObservabilitySpec, Transport};

/// Injected config exposing the hub's metrics ingest
pub const METRICS_EGRESS: &str = "metrics-egress";
/// Injected metrics agent
pub const METRICS_AGENT: &str = "metrics-agent";
/// Injected mesh operator for tailscale transport
pub const TAILSCALE_OPERATOR: &str = "tailscale-operator";

/// Helm parameter carrying the experiment name into the metrics agent
pub const METRICS_AGENT_EXPERIMENT_PARAM: &str = "alloy.extraEnv[0].value";

const INFRA_APPS: &[&str] = &[TAILSCALE_OPERATOR];
const OBS_APPS: &[&str] = &[METRICS_AGENT, "kube-prometheus-stack"];

/// Components injected when observability is enabled
pub fn observability_refs(obs: &ObservabilitySpec, experiment: &str) -> Vec<ComponentRef> {
    let mut refs = vec![
        ComponentRef::config(METRICS_EGRESS),
        ComponentRef::app(METRICS_AGENT).with_param(METRICS_AGENT_EXPERIMENT_PARAM, experiment),
    ];
    if obs.transport == Transport::Tailscale {
        refs.push(ComponentRef::app(TAILSCALE_OPERATOR));
    }
    refs
}

/// Component references partitioned by layer
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassifiedComponents {
    /// Configuration and mesh plumbing
    pub infra: Vec<ComponentRef>,
    /// Metrics agents
    pub obs: Vec<ComponentRef>,
    /// Components under test
    pub workload: Vec<ComponentRef>,
}

impl ClassifiedComponents {
    /// True when there is anything to deploy ahead of the workload
    pub fn has_layers(&self) -> bool {
        !self.infra.is_empty() || !self.obs.is_empty()
    }

    /// References in a layer
    pub fn layer(&self, layer: DeploymentLayer) -> &[ComponentRef] {
        match layer {
            DeploymentLayer::Infra => &self.infra,
            DeploymentLayer::Obs => &self.obs,
            DeploymentLayer::Workload => &self.workload,
        }
    }
}

/// Layer a single reference belongs to
pub fn layer_for(reference: &ComponentRef) -> DeploymentLayer {
    if reference.config.as_deref().is_some_and(|c| !c.is_empty()) {
        return DeploymentLayer::Infra;
    }
    match reference.app.as_deref() {
        Some(app) if INFRA_APPS.contains(&app) => DeploymentLayer::Infra,
        Some(app) if OBS_APPS.contains(&app) => DeploymentLayer::Obs,
        _ => DeploymentLayer::Workload,
    }
}

/// Partition a target's components and the injected observability refs.
///
/// Declared components keep their order and precede injected ones within a layer.
pub fn classify_components(
    components: &[ComponentRef],
    obs_refs: &[ComponentRef],
) -> ClassifiedComponents {
    let mut classified = ClassifiedComponents::default();
    for reference in components.iter().chain(obs_refs) {
        let bucket = match layer_for(reference) {
            DeploymentLayer::Infra => &mut classified.infra,
            DeploymentLayer::Obs => &mut classified.obs,
            DeploymentLayer::Workload => &mut classified.workload,
        };
        bucket.push(reference.clone());
    }
    classified
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(transport: Transport) -> ObservabilitySpec {
        ObservabilitySpec {
            enabled: true,
            transport,
            tenant: None,
        }
    }

    #[test]
    fn direct_transport_injects_egress_and_agent() {
        let refs = observability_refs(&obs(Transport::Direct), "tsdb");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].config.as_deref(), Some("metrics-egress"));
        assert_eq!(refs[1].app.as_deref(), Some("metrics-agent"));
        assert_eq!(refs[1].params[METRICS_AGENT_EXPERIMENT_PARAM], "tsdb");
    }

    #[test]
    fn tailscale_transport_adds_operator() {
        let refs = observability_refs(&obs(Transport::Tailscale), "tsdb");
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[2].app.as_deref(), Some("tailscale-operator"));
    }

    #[test]
    fn classification_splits_layers() {
        let components = vec![
            ComponentRef::app("victoria-metrics"),
            ComponentRef::config("dashboards"),
            ComponentRef::workflow("k6-loadgen"),
        ];
        let injected = observability_refs(&obs(Transport::Tailscale), "tsdb");
        let classified = classify_components(&components, &injected);

        let names = |refs: &[ComponentRef]| -> Vec<String> {
            refs.iter()
                .map(|r| {
                    r.app
                        .clone()
                        .or_else(|| r.config.clone())
                        .or_else(|| r.workflow.clone())
                        .unwrap_or_default()
                })
                .collect()
        };
        assert_eq!(
            names(&classified.infra),
            vec!["dashboards", "metrics-egress", "tailscale-operator"]
        );
        assert_eq!(names(&classified.obs), vec!["metrics-agent"]);
        assert_eq!(names(&classified.workload), vec!["victoria-metrics", "k6-loadgen"]);
        assert!(classified.has_layers());
        assert_eq!(classified.layer(DeploymentLayer::Obs).len(), 1);
    }

    #[test]
    fn workload_only_has_no_layers() {
        let classified = classify_components(&[ComponentRef::app("nginx")], &[]);
        assert!(!classified.has_layers());
        assert_eq!(classified.workload.len(), 1);
    }
}
