//! Component resolution
//!
//! A [`ComponentRef`] names a component by kind. When a `Component` object of
//! that name exists its sources are used verbatim; otherwise the component is
//! assumed to live in the default repository under a conventional path.
//! Caller parameters always override a component's default helm parameters.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::Api;
use kube::Client;
use tracing::{debug, info};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use testbed_common::crd::{Component, ComponentRef, ComponentType};
use testbed_common::kube_utils::is_not_found;
use testbed_common::Error;

/// Repository used for components without a `Component` object
pub const DEFAULT_REPO_URL: &str = "https://github.com/illMadeCoder/k8s-ai-cloud-testbed.git";

/// Revision used when none is declared
pub const DEFAULT_REVISION: &str = "HEAD";

/// Category directories for components injected by the operator itself.
/// Everything else is placed by kind.
const BUILTIN_CATEGORIES: &[(&str, &str)] = &[
    ("metrics-agent", "observability"),
    ("metrics-egress", "observability"),
    ("tailscale-operator", "core"),
];

/// A component with its deployable sources
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedComponent {
    /// Component name
    pub name: String,
    /// Component kind
    pub component_type: ComponentType,
    /// Sources, in declaration order
    pub sources: Vec<ResolvedSource>,
}

/// One deployable source
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedSource {
    /// Repository URL
    pub repo_url: String,
    /// Revision
    pub target_revision: String,
    /// Path within the repository
    pub path: String,
    /// Chart name for package-repository sources
    pub chart: Option<String>,
    /// Helm settings
    pub helm: Option<ResolvedHelm>,
}

/// Helm settings with defaults and overrides merged
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedHelm {
    /// Release name
    pub release_name: Option<String>,
    /// Values files
    pub values_files: Vec<String>,
    /// Merged parameters
    pub parameters: BTreeMap<String, String>,
}

impl ResolvedComponent {
    /// True when any source's values files reference the shared `$values` source
    pub fn uses_values_ref(&self) -> bool {
        self.sources.iter().any(|s| {
            s.helm
                .as_ref()
                .is_some_and(|h| h.values_files.iter().any(|f| f.starts_with("$values")))
        })
    }
}

/// Source of `Component` definitions
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ComponentCatalog: Send + Sync {
    /// Look up a component by name; `None` when it is not declared
    async fn get(&self, name: &str) -> Result<Option<Component>, Error>;
}

/// [`ComponentCatalog`] reading cluster-scoped `Component` objects
pub struct KubeComponentCatalog {
    api: Api<Component>,
}

impl KubeComponentCatalog {
    /// Create a catalog backed by the API server
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ComponentCatalog for KubeComponentCatalog {
    async fn get(&self, name: &str) -> Result<Option<Component>, Error> {
        match self.api.get(name).await {
            Ok(c) => Ok(Some(c)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Resolves component references through a [`ComponentCatalog`]
#[derive(Clone)]
pub struct ComponentResolver {
    catalog: Arc<dyn ComponentCatalog>,
}

impl ComponentResolver {
    /// Create a resolver over a catalog
    pub fn new(catalog: Arc<dyn ComponentCatalog>) -> Self {
        Self { catalog }
    }

    /// Resolve one reference
    pub async fn resolve(&self, reference: &ComponentRef) -> Result<ResolvedComponent, Error> {
        let (name, component_type) = ref_identity(reference)?;
        match self.catalog.get(name).await? {
            Some(component) => {
                info!(component = %name, "resolved component from definition");
                Ok(resolve_from_definition(&component, &reference.params))
            }
            None => {
                debug!(component = %name, kind = %component_type, "no component definition, using conventional path");
                Ok(fallback_component(name, component_type, &reference.params))
            }
        }
    }

    /// Resolve references in order, failing on the first error
    pub async fn resolve_all(
        &self,
        references: &[ComponentRef],
    ) -> Result<Vec<ResolvedComponent>, Error> {
        let mut resolved = Vec::with_capacity(references.len());
        for reference in references {
            resolved.push(self.resolve(reference).await?);
        }
        Ok(resolved)
    }
}

/// Name and kind named by a reference
pub fn ref_identity(reference: &ComponentRef) -> Result<(&str, ComponentType), Error> {
    if let Some(app) = reference.app.as_deref().filter(|n| !n.is_empty()) {
        Ok((app, ComponentType::App))
    } else if let Some(wf) = reference.workflow.as_deref().filter(|n| !n.is_empty()) {
        Ok((wf, ComponentType::Workflow))
    } else if let Some(cfg) = reference.config.as_deref().filter(|n| !n.is_empty()) {
        Ok((cfg, ComponentType::Config))
    } else {
        Err(Error::validation(
            "component reference has no app, workflow, or config",
        ))
    }
}

/// Resolve from a declared definition, overlaying caller parameters on helm defaults
pub fn resolve_from_definition(
    component: &Component,
    params: &BTreeMap<String, String>,
) -> ResolvedComponent {
    let sources = component
        .spec
        .sources
        .iter()
        .map(|source| {
            let helm = source.helm.as_ref().map(|h| {
                let mut parameters: BTreeMap<String, String> = h
                    .parameters
                    .iter()
                    .map(|p| (p.name.clone(), p.value.clone()))
                    .collect();
                parameters.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
                ResolvedHelm {
                    release_name: h.release_name.clone().filter(|r| !r.is_empty()),
                    values_files: h.values_files.clone(),
                    parameters,
                }
            });
            ResolvedSource {
                repo_url: source.repo_url.clone(),
                target_revision: source
                    .target_revision
                    .clone()
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| DEFAULT_REVISION.to_string()),
                path: source.path.clone(),
                chart: source.chart.clone().filter(|c| !c.is_empty()),
                helm,
            }
        })
        .collect();

    ResolvedComponent {
        name: kube::ResourceExt::name_any(component),
        component_type: component.spec.component_type,
        sources,
    }
}

/// Conventional single-source resolution for undeclared components
pub fn fallback_component(
    name: &str,
    component_type: ComponentType,
    params: &BTreeMap<String, String>,
) -> ResolvedComponent {
    let category = BUILTIN_CATEGORIES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, c)| *c)
        .unwrap_or_else(|| component_type.directory());

    let helm = (!params.is_empty()).then(|| ResolvedHelm {
        parameters: params.clone(),
        ..Default::default()
    });

    ResolvedComponent {
        name: name.to_string(),
        component_type,
        sources: vec![ResolvedSource {
            repo_url: DEFAULT_REPO_URL.to_string(),
            target_revision: DEFAULT_REVISION.to_string(),
            path: format!("components/{}/{}", category, name),
            chart: None,
            helm,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbed_common::crd::{ComponentSource, ComponentSpec, HelmConfig, HelmParameter};

    fn helm_component() -> Component {
        Component::new(
            "victoria-metrics",
            ComponentSpec {
                component_type: ComponentType::App,
                sources: vec![ComponentSource {
                    repo_url: "https://victoriametrics.github.io/helm-charts".to_string(),
                    chart: Some("victoria-metrics-single".to_string()),
                    helm: Some(HelmConfig {
                        release_name: Some("vm".to_string()),
                        values_files: vec!["$values/components/observability/vm/values.yaml".to_string()],
                        parameters: vec![
                            HelmParameter {
                                name: "server.retentionPeriod".to_string(),
                                value: "1d".to_string(),
                                force_string: false,
                            },
                            HelmParameter {
                                name: "server.replicas".to_string(),
                                value: "1".to_string(),
                                force_string: false,
                            },
                        ],
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    // ===== Fallback =====

    #[test]
    fn fallback_places_apps_by_kind() {
        let resolved = fallback_component("nginx", ComponentType::App, &BTreeMap::new());
        assert_eq!(resolved.name, "nginx");
        assert_eq!(resolved.component_type, ComponentType::App);
        assert_eq!(resolved.sources.len(), 1);
        assert_eq!(resolved.sources[0].path, "components/apps/nginx");
        assert_eq!(resolved.sources[0].target_revision, "HEAD");
        assert_eq!(resolved.sources[0].repo_url, DEFAULT_REPO_URL);
        assert!(resolved.sources[0].helm.is_none());
    }

    #[test]
    fn fallback_places_workflows_and_configs() {
        let wf = fallback_component("k6-loadgen", ComponentType::Workflow, &BTreeMap::new());
        assert_eq!(wf.sources[0].path, "components/workflows/k6-loadgen");

        let cfg = fallback_component("alloy", ComponentType::Config, &BTreeMap::new());
        assert_eq!(cfg.sources[0].path, "components/configs/alloy");
    }

    #[test]
    fn fallback_uses_builtin_category_for_injected_components() {
        let egress = fallback_component("metrics-egress", ComponentType::Config, &BTreeMap::new());
        assert_eq!(egress.sources[0].path, "components/observability/metrics-egress");

        let ts = fallback_component("tailscale-operator", ComponentType::App, &BTreeMap::new());
        assert_eq!(ts.sources[0].path, "components/core/tailscale-operator");
    }

    #[test]
    fn fallback_carries_params_as_helm() {
        let params = BTreeMap::from([
            ("replicaCount".to_string(), "5".to_string()),
            ("image".to_string(), "nginx:latest".to_string()),
        ]);
        let resolved = fallback_component("nginx", ComponentType::App, &params);
        let helm = resolved.sources[0].helm.as_ref().unwrap();
        assert_eq!(helm.parameters["replicaCount"], "5");
        assert_eq!(helm.parameters["image"], "nginx:latest");
        assert!(helm.release_name.is_none());
    }

    #[test]
    fn empty_reference_is_rejected() {
        assert!(ref_identity(&ComponentRef::default()).is_err());
    }

    // ===== Definitions =====

    #[test]
    fn caller_params_override_definition_defaults() {
        let params = BTreeMap::from([("server.retentionPeriod".to_string(), "7d".to_string())]);
        let resolved = resolve_from_definition(&helm_component(), &params);

        let source = &resolved.sources[0];
        assert_eq!(source.chart.as_deref(), Some("victoria-metrics-single"));
        assert_eq!(source.target_revision, "HEAD");
        let helm = source.helm.as_ref().unwrap();
        assert_eq!(helm.release_name.as_deref(), Some("vm"));
        assert_eq!(helm.parameters["server.retentionPeriod"], "7d");
        assert_eq!(helm.parameters["server.replicas"], "1");
        assert!(resolved.uses_values_ref());
    }

    /// Story: a declared component wins over the conventional path, while an
    /// undeclared one still resolves so deployments never block on catalog gaps.
    #[tokio::test]
    async fn story_resolver_prefers_definitions_and_falls_back() {
        let mut catalog = MockComponentCatalog::new();
        catalog
            .expect_get()
            .returning(|name| match name {
                "victoria-metrics" => Ok(Some(helm_component())),
                _ => Ok(None),
            });
        let resolver = ComponentResolver::new(Arc::new(catalog));

        let resolved = resolver
            .resolve_all(&[
                ComponentRef::app("victoria-metrics"),
                ComponentRef::workflow("k6-loadgen"),
            ])
            .await
            .unwrap();

        assert_eq!(resolved[0].sources[0].repo_url, "https://victoriametrics.github.io/helm-charts");
        assert_eq!(resolved[1].sources[0].path, "components/workflows/k6-loadgen");
    }

    #[tokio::test]
    async fn catalog_errors_propagate() {
        let mut catalog = MockComponentCatalog::new();
        catalog
            .expect_get()
            .returning(|_| Err(Error::internal("connection refused")));
        let resolver = ComponentResolver::new(Arc::new(catalog));

        assert!(resolver.resolve(&ComponentRef::app("nginx")).await.is_err());
    }
}
