//! Cluster provisioning trait and its Crossplane-backed implementation

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use testbed_common::crd::{ClusterType, Target};
use testbed_common::kube_utils::{get_secret_data, is_conflict, is_not_found};
use testbed_common::{Error, CROSSPLANE_NAMESPACE, EXPERIMENTS_NAMESPACE, HUB_CLUSTER_NAME};

use crate::claim::{build_claim, claim_api_resource, ClaimView};

/// Creates, polls and destroys ephemeral clusters.
///
/// Every call is safe to repeat: creating an existing claim and deleting an
/// absent one both succeed.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Issue a claim for the target's cluster and return its handle.
    ///
    /// Hub targets return [`HUB_CLUSTER_NAME`] without touching the API.
    async fn create(&self, experiment: &str, target: &Target) -> Result<String, Error>;

    /// Whether the cluster reports Ready
    async fn is_ready(&self, cluster_name: &str, cluster_type: ClusterType) -> Result<bool, Error>;

    /// API endpoint, `None` while not yet reported
    async fn endpoint(
        &self,
        cluster_name: &str,
        cluster_type: ClusterType,
    ) -> Result<Option<String>, Error>;

    /// Admin kubeconfig, `None` while not yet available
    async fn kubeconfig(
        &self,
        cluster_name: &str,
        cluster_type: ClusterType,
    ) -> Result<Option<Vec<u8>>, Error>;

    /// Delete the cluster's claim
    async fn delete(&self, cluster_name: &str, cluster_type: ClusterType) -> Result<(), Error>;
}

/// Deterministic cluster name for a target
pub fn cluster_name(experiment: &str, target: &str) -> String {
    format!("{}-{}", experiment, target)
}

/// [`ClusterProvisioner`] backed by `GKECluster` claims
pub struct GkeClusterProvisioner {
    client: Client,
    claim_namespace: String,
    connection_namespace: String,
}

impl GkeClusterProvisioner {
    /// Create a provisioner using the default claim namespace
    pub fn new(client: Client) -> Self {
        Self {
            client,
            claim_namespace: EXPERIMENTS_NAMESPACE.to_string(),
            connection_namespace: CROSSPLANE_NAMESPACE.to_string(),
        }
    }

    /// Override the namespace claims are created in
    pub fn with_claim_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.claim_namespace = namespace.into();
        self
    }

    fn claims(&self) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            &self.claim_namespace,
            &claim_api_resource(),
        )
    }

    async fn get_claim(&self, cluster_name: &str) -> Result<Option<ClaimView>, Error> {
        match self.claims().get(cluster_name).await {
            Ok(obj) => Ok(Some(ClaimView::from_object(&obj)?)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(Error::provisioning(
                cluster_name,
                format!("failed to get GKECluster claim: {}", e),
            )),
        }
    }
}

#[async_trait]
impl ClusterProvisioner for GkeClusterProvisioner {
    async fn create(&self, experiment: &str, target: &Target) -> Result<String, Error> {
        if target.cluster.cluster_type == ClusterType::Hub {
            info!(target = %target.name, "using existing hub cluster");
            return Ok(HUB_CLUSTER_NAME.to_string());
        }

        let name = cluster_name(experiment, &target.name);
        let claim = build_claim(&name, &self.claim_namespace, &target.cluster);
        match self.claims().create(&PostParams::default(), &claim).await {
            Ok(_) => {
                info!(cluster = %name, namespace = %self.claim_namespace, "created GKECluster claim");
                Ok(name)
            }
            Err(e) if is_conflict(&e) => {
                debug!(cluster = %name, "GKECluster claim already exists");
                Ok(name)
            }
            Err(e) => Err(Error::provisioning(
                &name,
                format!("failed to create GKECluster claim: {}", e),
            )),
        }
    }

    async fn is_ready(&self, cluster_name: &str, cluster_type: ClusterType) -> Result<bool, Error> {
        if cluster_type == ClusterType::Hub {
            return Ok(true);
        }
        Ok(self
            .get_claim(cluster_name)
            .await?
            .is_some_and(|claim| claim.is_ready()))
    }

    async fn endpoint(
        &self,
        cluster_name: &str,
        cluster_type: ClusterType,
    ) -> Result<Option<String>, Error> {
        if cluster_type == ClusterType::Hub {
            return Ok(None);
        }
        Ok(self
            .get_claim(cluster_name)
            .await?
            .and_then(|claim| claim.endpoint()))
    }

    async fn kubeconfig(
        &self,
        cluster_name: &str,
        cluster_type: ClusterType,
    ) -> Result<Option<Vec<u8>>, Error> {
        if cluster_type == ClusterType::Hub {
            return Ok(None);
        }
        let Some(claim) = self.get_claim(cluster_name).await? else {
            return Ok(None);
        };
        let Some(composite) = claim.composite_name() else {
            debug!(cluster = %cluster_name, "claim not yet bound to a composite resource");
            return Ok(None);
        };

        get_secret_data(
            &self.client,
            &format!("{}-cluster-conn", composite),
            &self.connection_namespace,
            "kubeconfig",
        )
        .await
    }

    async fn delete(&self, cluster_name: &str, cluster_type: ClusterType) -> Result<(), Error> {
        if cluster_type == ClusterType::Hub {
            debug!("skipping deletion of hub cluster");
            return Ok(());
        }
        match self.claims().delete(cluster_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(cluster = %cluster_name, "deleted GKECluster claim");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(cluster = %cluster_name, "GKECluster claim already deleted");
                Ok(())
            }
            Err(e) => Err(Error::provisioning(
                cluster_name,
                format!("failed to delete GKECluster claim: {}", e),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testbed_common::crd::ClusterSpec;

    #[test]
    fn cluster_name_joins_experiment_and_target() {
        assert_eq!(cluster_name("tsdb-comparison", "app"), "tsdb-comparison-app");
    }

    /// Story: callers depend on the trait, so a mocked provisioner can stand
    /// in for Crossplane and report a hub cluster as instantly ready.
    #[tokio::test]
    async fn story_mocked_provisioner_reports_hub_ready() {
        let mut mock = MockClusterProvisioner::new();
        mock.expect_create()
            .returning(|_, _| Ok(HUB_CLUSTER_NAME.to_string()));
        mock.expect_is_ready()
            .withf(|name, ty| name == "hub" && *ty == ClusterType::Hub)
            .returning(|_, _| Ok(true));

        let target = Target {
            name: "loadgen".to_string(),
            cluster: ClusterSpec {
                cluster_type: ClusterType::Hub,
                ..Default::default()
            },
            ..Default::default()
        };
        let provisioner: &dyn ClusterProvisioner = &mock;
        let handle = provisioner.create("exp", &target).await.unwrap();
        assert_eq!(handle, "hub");
        assert!(provisioner.is_ready(&handle, ClusterType::Hub).await.unwrap());
    }
}
