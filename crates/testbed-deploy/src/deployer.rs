//! Application deployment through ArgoCD

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use testbed_common::crd::{ComponentRef, DeploymentLayer, Target};
use testbed_common::kube_utils::{
    apply_resource, ensure_namespace_with_labels, is_not_found, HasApiResource,
};
use testbed_common::{Error, ARGOCD_NAMESPACE, FIELD_MANAGER, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

use crate::application::{application_name, build_application, Application, ApplicationStatus};
use crate::cluster_secret::{build_cluster_secret, cluster_secret_name};
use crate::layers::observability_refs;
use crate::resolver::{ComponentResolver, KubeComponentCatalog, ResolvedComponent};

const ALL_LAYERS: [DeploymentLayer; 3] = [
    DeploymentLayer::Infra,
    DeploymentLayer::Obs,
    DeploymentLayer::Workload,
];

/// Deploys target components as GitOps Applications and reports their health.
///
/// Creation is create-or-update keyed by a deterministic name; deletes treat
/// not-found as success.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ApplicationDeployer: Send + Sync {
    /// Register a remote cluster so Applications can target it
    async fn register_cluster(
        &self,
        cluster_name: &str,
        server: &str,
        kubeconfig: &[u8],
    ) -> Result<(), Error>;

    /// Remove a remote cluster's registration
    async fn unregister_cluster(&self, cluster_name: &str) -> Result<(), Error>;

    /// Create the single Application holding all of a target's components,
    /// plus the observability stack when enabled.
    async fn create_application(
        &self,
        experiment: &str,
        target: &Target,
        server: &str,
    ) -> Result<(), Error>;

    /// Create the Application for one layer of a target
    async fn create_layered_application(
        &self,
        experiment: &str,
        target: &str,
        server: &str,
        layer: DeploymentLayer,
        components: &[ComponentRef],
    ) -> Result<(), Error>;

    /// Delete a target's single Application
    async fn delete_application(&self, experiment: &str, target: &str) -> Result<(), Error>;

    /// Delete every layer Application of a target
    async fn delete_layered_applications(&self, experiment: &str, target: &str)
        -> Result<(), Error>;

    /// Health of a target's single Application
    async fn is_application_healthy(&self, experiment: &str, target: &str) -> Result<bool, Error>;

    /// Health of one layer Application
    async fn is_layer_healthy(
        &self,
        experiment: &str,
        target: &str,
        layer: DeploymentLayer,
    ) -> Result<bool, Error>;

    /// Resources managed by a target's single Application, as `Kind/name`
    async fn application_components(
        &self,
        experiment: &str,
        target: &str,
    ) -> Result<Vec<String>, Error>;
}

/// [`ApplicationDeployer`] writing ArgoCD Applications on the hub
pub struct ArgoApplicationDeployer {
    client: Client,
    resolver: ComponentResolver,
    namespace: String,
}

impl ArgoApplicationDeployer {
    /// Create a deployer resolving components from `Component` objects
    pub fn new(client: Client) -> Self {
        let resolver = ComponentResolver::new(Arc::new(KubeComponentCatalog::new(client.clone())));
        Self {
            client,
            resolver,
            namespace: ARGOCD_NAMESPACE.to_string(),
        }
    }

    /// Override the ArgoCD namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Override the component resolver
    pub fn with_resolver(mut self, resolver: ComponentResolver) -> Self {
        self.resolver = resolver;
        self
    }

    fn applications(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &Application::api_resource())
    }

    async fn apply(
        &self,
        experiment: &str,
        target: &str,
        layer: Option<DeploymentLayer>,
        server: &str,
        resolved: &[ResolvedComponent],
    ) -> Result<(), Error> {
        let Some(app) = build_application(experiment, target, layer, server, &self.namespace, resolved)
        else {
            info!(target = %target, "no components resolved, skipping application");
            return Ok(());
        };

        // PodSecurity labels must exist before ArgoCD syncs workloads
        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            ("pod-security.kubernetes.io/enforce".to_string(), "privileged".to_string()),
            ("pod-security.kubernetes.io/enforce-version".to_string(), "latest".to_string()),
        ]);
        if let Err(e) = ensure_namespace_with_labels(&self.client, experiment, &labels, FIELD_MANAGER).await {
            warn!(namespace = %experiment, error = %e, "failed to ensure namespace labels");
        }

        apply_resource(&self.client, &app, FIELD_MANAGER)
            .await
            .map_err(|e| Error::deployment(target, e.to_string()))?;
        info!(application = %app.metadata.name, target = %target, "applied ArgoCD Application");
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ApplicationStatus, Error> {
        let obj = self.applications().get(name).await.map_err(|e| {
            Error::deployment(name, format!("failed to get application: {}", e))
        })?;
        Ok(ApplicationStatus::from_object_data(&obj.data))
    }

    async fn delete_named(&self, name: &str) -> Result<(), Error> {
        match self.applications().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(application = %name, "deleted ArgoCD Application");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(application = %name, "ArgoCD Application already deleted");
                Ok(())
            }
            Err(e) => Err(Error::deployment(
                name,
                format!("failed to delete application: {}", e),
            )),
        }
    }
}

#[async_trait]
impl ApplicationDeployer for ArgoApplicationDeployer {
    async fn register_cluster(
        &self,
        cluster_name: &str,
        server: &str,
        kubeconfig: &[u8],
    ) -> Result<(), Error> {
        let secret = build_cluster_secret(cluster_name, server, &self.namespace, kubeconfig)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        api.patch(
            &cluster_secret_name(cluster_name),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        info!(cluster = %cluster_name, server = %server, "registered cluster with ArgoCD");
        Ok(())
    }

    async fn unregister_cluster(&self, cluster_name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.delete(&cluster_secret_name(cluster_name), &DeleteParams::default()).await {
            Ok(_) => {
                info!(cluster = %cluster_name, "unregistered cluster from ArgoCD");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_application(
        &self,
        experiment: &str,
        target: &Target,
        server: &str,
    ) -> Result<(), Error> {
        let mut resolved = self
            .resolver
            .resolve_all(&target.components)
            .await
            .map_err(|e| Error::deployment(&target.name, format!("failed to resolve components: {}", e)))?;

        if let Some(obs) = target.observability.as_ref().filter(|o| o.enabled) {
            match self.resolver.resolve_all(&observability_refs(obs, experiment)).await {
                Ok(extra) => resolved.extend(extra),
                Err(e) => warn!(
                    target = %target.name,
                    error = %e,
                    "failed to resolve observability components, continuing without them"
                ),
            }
        }

        self.apply(experiment, &target.name, None, server, &resolved).await
    }

    async fn create_layered_application(
        &self,
        experiment: &str,
        target: &str,
        server: &str,
        layer: DeploymentLayer,
        components: &[ComponentRef],
    ) -> Result<(), Error> {
        let resolved = self.resolver.resolve_all(components).await.map_err(|e| {
            Error::deployment(target, format!("failed to resolve {} layer: {}", layer, e))
        })?;
        self.apply(experiment, target, Some(layer), server, &resolved).await
    }

    async fn delete_application(&self, experiment: &str, target: &str) -> Result<(), Error> {
        self.delete_named(&application_name(experiment, target, None)).await
    }

    async fn delete_layered_applications(
        &self,
        experiment: &str,
        target: &str,
    ) -> Result<(), Error> {
        let mut first_error = None;
        for layer in ALL_LAYERS {
            if let Err(e) = self
                .delete_named(&application_name(experiment, target, Some(layer)))
                .await
            {
                warn!(target = %target, layer = %layer, error = %e, "failed to delete layer application");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn is_application_healthy(&self, experiment: &str, target: &str) -> Result<bool, Error> {
        Ok(self
            .status(&application_name(experiment, target, None))
            .await?
            .is_healthy())
    }

    async fn is_layer_healthy(
        &self,
        experiment: &str,
        target: &str,
        layer: DeploymentLayer,
    ) -> Result<bool, Error> {
        Ok(self
            .status(&application_name(experiment, target, Some(layer)))
            .await?
            .is_healthy())
    }

    async fn application_components(
        &self,
        experiment: &str,
        target: &str,
    ) -> Result<Vec<String>, Error> {
        Ok(self
            .status(&application_name(experiment, target, None))
            .await?
            .components())
    }
}
