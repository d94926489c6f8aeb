//! Tutorial support: kubeconfig secrets and service discovery
//!
//! Interactive walkthroughs need two things the core lifecycle does not:
//! kubeconfigs for the provisioned clusters and reachable addresses for the
//! services they talk to. Everything here is best-effort; a failure is logged
//! and retried on a later pass, never surfaced as a reconcile error.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use testbed_common::crd::{
    DiscoveredService, Experiment, ExperimentStatus, TargetStatus, TutorialStatus,
};
use testbed_common::kube_utils::{
    client_from_kubeconfig, ensure_namespace_with_labels, is_not_found,
};
use testbed_common::{
    Error, EXPERIMENT_LABEL, FIELD_MANAGER, HUB_CLUSTER_NAME, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    TARGET_LABEL,
};

use crate::controller::Context;

/// Data key holding the kubeconfig in every secret written here
pub const KUBECONFIG_KEY: &str = "kubeconfig";

const REMOTE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Secret and Service access for tutorial resources
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait TutorialResources: Send + Sync {
    /// Create or update a secret on the hub
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Delete a secret on the hub; absent secrets are not an error
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Look up a Service on the hub
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create or update a secret on a remote cluster, creating its namespace
    async fn apply_remote_secret(&self, kubeconfig: &[u8], secret: &Secret) -> Result<(), Error>;
}

/// [`TutorialResources`] backed by the Kubernetes API
pub struct KubeTutorialResources {
    client: Client,
}

impl KubeTutorialResources {
    /// Create a new instance talking to the hub through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn apply_secret_with(client: &Client, secret: &Secret) -> Result<(), Error> {
    let namespace = secret.namespace().unwrap_or_default();
    let name = secret.name_any();
    let api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(secret),
    )
    .await?;
    Ok(())
}

#[async_trait]
impl TutorialResources for KubeTutorialResources {
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        apply_secret_with(&self.client, secret).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_remote_secret(&self, kubeconfig: &[u8], secret: &Secret) -> Result<(), Error> {
        let client = client_from_kubeconfig(kubeconfig, REMOTE_READ_TIMEOUT).await?;
        let namespace = secret.namespace().unwrap_or_default();
        let labels = BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_VALUE.to_string(),
        )]);
        ensure_namespace_with_labels(&client, &namespace, &labels, FIELD_MANAGER).await?;
        apply_secret_with(&client, secret).await
    }
}

fn opaque_secret(
    name: String,
    namespace: &str,
    labels: BTreeMap<String, String>,
    kubeconfig: &[u8],
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            KUBECONFIG_KEY.to_string(),
            ByteString(kubeconfig.to_vec()),
        )])),
        ..Default::default()
    }
}

/// Name of the hub secret exposing a target's kubeconfig
pub fn kubeconfig_secret_name(experiment: &str, target: &str) -> String {
    format!("{}-{}-kubeconfig", experiment, target)
}

/// Hub secret exposing one target's kubeconfig next to the experiment
pub fn kubeconfig_secret(experiment: &str, namespace: &str, target: &str, kubeconfig: &[u8]) -> Secret {
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (EXPERIMENT_LABEL.to_string(), experiment.to_string()),
        (TARGET_LABEL.to_string(), target.to_string()),
    ]);
    opaque_secret(
        kubeconfig_secret_name(experiment, target),
        namespace,
        labels,
        kubeconfig,
    )
}

/// Secret placed on a peer cluster holding `source`'s kubeconfig.
///
/// Lands in a namespace named after the experiment.
pub fn peer_kubeconfig_secret(experiment: &str, source: &str, kubeconfig: &[u8]) -> Secret {
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (EXPERIMENT_LABEL.to_string(), experiment.to_string()),
    ]);
    opaque_secret(
        format!("{}-cluster-kubeconfig", source),
        experiment,
        labels,
        kubeconfig,
    )
}

fn remote_cluster(target_status: &TargetStatus) -> Option<&str> {
    target_status
        .cluster_name
        .as_deref()
        .filter(|c| *c != HUB_CLUSTER_NAME)
}

/// Copy each remote target's kubeconfig into a hub secret and record it.
pub async fn expose_kubeconfigs(experiment: &Experiment, ctx: &Context, status: &mut ExperimentStatus) {
    let name = experiment.name_any();
    let namespace = experiment.namespace().unwrap_or_default();

    for (target, target_status) in experiment.spec.targets.iter().zip(status.targets.iter_mut()) {
        if target.is_hub() || target_status.kubeconfig_secret.is_some() {
            continue;
        }
        let Some(cluster) = remote_cluster(target_status) else {
            continue;
        };

        let kubeconfig = match ctx.provisioner.kubeconfig(cluster, target.cluster.cluster_type).await {
            Ok(Some(k)) => k,
            Ok(None) => {
                debug!(target = %target.name, "kubeconfig not yet available");
                continue;
            }
            Err(e) => {
                warn!(target = %target.name, error = %e, "failed to read kubeconfig");
                continue;
            }
        };

        let secret = kubeconfig_secret(&name, &namespace, &target.name, &kubeconfig);
        let secret_name = secret.name_any();
        if let Err(e) = ctx.tutorial.apply_secret(&secret).await {
            warn!(target = %target.name, error = %e, "failed to expose kubeconfig");
            continue;
        }

        info!(target = %target.name, secret = %secret_name, "kubeconfig exposed");
        target_status.kubeconfig_secret = Some(secret_name.clone());
        status
            .tutorial_status
            .get_or_insert_with(TutorialStatus::default)
            .kubeconfig_secrets
            .insert(target.name.clone(), secret_name);
    }
}

/// Give every remote cluster the kubeconfigs of its remote peers.
///
/// Only runs for experiments spanning two or more remote clusters.
pub async fn share_kubeconfigs(experiment: &Experiment, ctx: &Context, status: &ExperimentStatus) {
    let name = experiment.name_any();

    let mut remotes = Vec::new();
    for (target, target_status) in experiment.spec.targets.iter().zip(&status.targets) {
        if target.is_hub() {
            continue;
        }
        let Some(cluster) = remote_cluster(target_status) else {
            continue;
        };
        match ctx.provisioner.kubeconfig(cluster, target.cluster.cluster_type).await {
            Ok(Some(kubeconfig)) => remotes.push((target.name.as_str(), kubeconfig)),
            Ok(None) => debug!(target = %target.name, "kubeconfig not yet available"),
            Err(e) => warn!(target = %target.name, error = %e, "failed to read kubeconfig"),
        }
    }
    if remotes.len() < 2 {
        return;
    }

    for (source, source_kubeconfig) in &remotes {
        let secret = peer_kubeconfig_secret(&name, source, source_kubeconfig);
        for (dest, dest_kubeconfig) in &remotes {
            if source == dest {
                continue;
            }
            match ctx.tutorial.apply_remote_secret(dest_kubeconfig, &secret).await {
                Ok(()) => debug!(source = %source, dest = %dest, "kubeconfig shared"),
                Err(e) => warn!(source = %source, dest = %dest, error = %e, "failed to share kubeconfig"),
            }
        }
    }
}

/// Address a client should use for `service`.
///
/// A LoadBalancer ingress wins over the cluster IP; headless services have
/// no address. Without an explicit port the first service port is used, and
/// the standard web ports are left off the URL.
pub fn service_endpoint(service: &Service, port: Option<i32>) -> Option<String> {
    let ingress_host = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()))
        .filter(|h| !h.is_empty());

    let spec = service.spec.as_ref();
    let host = ingress_host.or_else(|| {
        spec.and_then(|s| s.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None")
    })?;

    let port = port.filter(|p| *p != 0).or_else(|| {
        spec.and_then(|s| s.ports.as_ref())
            .and_then(|ports| ports.first())
            .map(|p| p.port)
    });

    Some(match port {
        None | Some(0) | Some(80) | Some(443) => format!("http://{}", host),
        Some(p) => format!("http://{}:{}", host, p),
    })
}

/// Resolve the tutorial's services on hub targets and record their addresses.
pub async fn discover_services(experiment: &Experiment, ctx: &Context, status: &mut ExperimentStatus) {
    let Some(tutorial) = experiment.spec.tutorial.as_ref() else {
        return;
    };
    if tutorial.services.is_empty() {
        return;
    }

    let mut discovered = Vec::with_capacity(tutorial.services.len());
    for svc in &tutorial.services {
        let on_hub = experiment
            .spec
            .targets
            .iter()
            .any(|t| t.name == svc.target && t.is_hub());
        if !on_hub {
            debug!(service = %svc.name, target = %svc.target, "service is not on a hub target");
            discovered.push(DiscoveredService {
                name: svc.name.clone(),
                ..Default::default()
            });
            continue;
        }

        let endpoint = match ctx.tutorial.get_service(&svc.namespace, &svc.service).await {
            Ok(Some(service)) => service_endpoint(&service, svc.port),
            Ok(None) => {
                debug!(service = %svc.name, "service not found");
                None
            }
            Err(e) => {
                warn!(service = %svc.name, error = %e, "failed to look up service");
                None
            }
        };
        discovered.push(DiscoveredService {
            name: svc.name.clone(),
            ready: endpoint.is_some(),
            endpoint,
        });
    }

    status
        .tutorial_status
        .get_or_insert_with(TutorialStatus::default)
        .services = discovered;
}

/// Delete every hub kubeconfig secret recorded for the experiment.
///
/// Returns the first failure after attempting all of them.
pub async fn delete_kubeconfig_secrets(
    experiment: &Experiment,
    ctx: &Context,
    status: &ExperimentStatus,
) -> Result<(), Error> {
    let namespace = experiment.namespace().unwrap_or_default();

    let mut names: Vec<&str> = status
        .targets
        .iter()
        .filter_map(|t| t.kubeconfig_secret.as_deref())
        .collect();
    if let Some(tutorial) = &status.tutorial_status {
        names.extend(tutorial.kubeconfig_secrets.values().map(String::as_str));
    }
    names.sort_unstable();
    names.dedup();

    let mut first_error = None;
    for name in names {
        if let Err(e) = ctx.tutorial.delete_secret(&namespace, name).await {
            warn!(secret = %name, error = %e, "failed to delete kubeconfig secret");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServicePort, ServiceSpec, ServiceStatus,
    };
    use testbed_common::crd::{TutorialServiceRef, TutorialSpec};

    fn service(cluster_ip: &str, lb_ip: Option<&str>, port: i32) -> Service {
        Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some(cluster_ip.to_string()),
                ports: Some(vec![ServicePort {
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: lb_ip.map(|ip| ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn with_tutorial(mut exp: Experiment, tutorial: TutorialSpec) -> Experiment {
        exp.spec.tutorial = Some(tutorial);
        exp
    }

    #[test]
    fn load_balancer_ingress_wins_over_cluster_ip() {
        let svc = service("10.96.0.12", Some("34.120.1.9"), 3000);
        assert_eq!(
            service_endpoint(&svc, None).as_deref(),
            Some("http://34.120.1.9:3000")
        );
    }

    #[test]
    fn cluster_ip_is_used_without_ingress() {
        let svc = service("10.96.0.12", None, 9090);
        assert_eq!(
            service_endpoint(&svc, None).as_deref(),
            Some("http://10.96.0.12:9090")
        );
    }

    #[test]
    fn web_ports_are_left_off() {
        let svc = service("10.96.0.12", None, 8080);
        assert_eq!(
            service_endpoint(&svc, Some(80)).as_deref(),
            Some("http://10.96.0.12")
        );
        assert_eq!(
            service_endpoint(&svc, Some(443)).as_deref(),
            Some("http://10.96.0.12")
        );
    }

    #[test]
    fn explicit_port_overrides_service_port() {
        let svc = service("10.96.0.12", None, 80);
        assert_eq!(
            service_endpoint(&svc, Some(3100)).as_deref(),
            Some("http://10.96.0.12:3100")
        );
    }

    #[test]
    fn headless_service_has_no_endpoint() {
        let svc = service("None", None, 80);
        assert_eq!(service_endpoint(&svc, None), None);
    }

    #[test]
    fn secrets_are_named_and_labelled() {
        let secret = kubeconfig_secret("demo", "experiments", "app", b"apiVersion: v1");
        assert_eq!(secret.name_any(), "demo-app-kubeconfig");
        assert_eq!(secret.namespace().as_deref(), Some("experiments"));
        assert_eq!(secret.labels()[TARGET_LABEL], "app");
        assert_eq!(
            secret.data.unwrap()[KUBECONFIG_KEY].0,
            b"apiVersion: v1".to_vec()
        );

        let peer = peer_kubeconfig_secret("demo", "app", b"apiVersion: v1");
        assert_eq!(peer.name_any(), "app-cluster-kubeconfig");
        assert_eq!(peer.namespace().as_deref(), Some("demo"));
        assert_eq!(peer.labels()[EXPERIMENT_LABEL], "demo");
    }

    #[tokio::test]
    async fn exposes_remote_kubeconfigs_once() {
        let mut mocks = Mocks::new();
        mocks
            .provisioner
            .expect_kubeconfig()
            .withf(|cluster, _| cluster == "demo-app")
            .times(1)
            .returning(|_, _| Ok(Some(b"kubeconfig-app".to_vec())));
        mocks
            .tutorial
            .expect_apply_secret()
            .withf(|s| s.name_any() == "demo-app-kubeconfig")
            .times(1)
            .returning(|_| Ok(()));
        let ctx = mocks.into_context();

        let exp = experiment("demo", vec![hub_target("obs"), gke_target("app"), gke_target("db")]);
        let mut status = ExperimentStatus {
            targets: vec![
                TargetStatus {
                    cluster_name: Some(HUB_CLUSTER_NAME.to_string()),
                    ..TargetStatus::pending("obs")
                },
                ready_target("app", "demo-app", "10.0.0.1"),
                TargetStatus {
                    kubeconfig_secret: Some("demo-db-kubeconfig".to_string()),
                    ..ready_target("db", "demo-db", "10.0.0.2")
                },
            ],
            ..Default::default()
        };

        expose_kubeconfigs(&exp, &ctx, &mut status).await;

        assert_eq!(
            status.targets[1].kubeconfig_secret.as_deref(),
            Some("demo-app-kubeconfig")
        );
        let tutorial = status.tutorial_status.unwrap();
        assert_eq!(tutorial.kubeconfig_secrets["app"], "demo-app-kubeconfig");
        assert!(status.targets[0].kubeconfig_secret.is_none());
    }

    #[tokio::test]
    async fn sharing_copies_each_kubeconfig_to_every_peer() {
        let mut mocks = Mocks::new();
        mocks
            .provisioner
            .expect_kubeconfig()
            .returning(|cluster, _| Ok(Some(format!("kubeconfig-{}", cluster).into_bytes())));
        mocks
            .tutorial
            .expect_apply_remote_secret()
            .withf(|dest, secret| {
                let dest = String::from_utf8_lossy(dest);
                let source = secret.name_any().trim_end_matches("-cluster-kubeconfig").to_string();
                !dest.ends_with(&source)
            })
            .times(6)
            .returning(|_, _| Ok(()));
        let ctx = mocks.into_context();

        let exp = experiment("demo", vec![gke_target("a"), gke_target("b"), gke_target("c")]);
        let status = ExperimentStatus {
            targets: vec![
                ready_target("a", "demo-a", "10.0.0.1"),
                ready_target("b", "demo-b", "10.0.0.2"),
                ready_target("c", "demo-c", "10.0.0.3"),
            ],
            ..Default::default()
        };

        share_kubeconfigs(&exp, &ctx, &status).await;
    }

    #[tokio::test]
    async fn sharing_needs_two_remote_clusters() {
        let mut mocks = Mocks::new();
        mocks
            .provisioner
            .expect_kubeconfig()
            .returning(|_, _| Ok(Some(b"kubeconfig".to_vec())));
        mocks.tutorial.expect_apply_remote_secret().never();
        let ctx = mocks.into_context();

        let exp = experiment("demo", vec![hub_target("obs"), gke_target("app")]);
        let status = ExperimentStatus {
            targets: vec![
                TargetStatus {
                    cluster_name: Some(HUB_CLUSTER_NAME.to_string()),
                    ..TargetStatus::pending("obs")
                },
                ready_target("app", "demo-app", "10.0.0.1"),
            ],
            ..Default::default()
        };

        share_kubeconfigs(&exp, &ctx, &status).await;
    }

    /// Story: tutorial services on the hub resolve to reachable URLs while
    /// services declared on remote targets are listed without an address
    #[tokio::test]
    async fn story_tutorial_services_are_discovered() {
        let mut mocks = Mocks::new();
        mocks
            .tutorial
            .expect_get_service()
            .returning(|namespace, name| match (namespace, name) {
                ("monitoring", "grafana") => Ok(Some(service("10.96.0.5", Some("34.1.2.3"), 80))),
                _ => Ok(None),
            });
        let ctx = mocks.into_context();

        let exp = with_tutorial(
            experiment("demo", vec![hub_target("obs"), gke_target("app")]),
            TutorialSpec {
                services: vec![
                    TutorialServiceRef {
                        name: "grafana".to_string(),
                        target: "obs".to_string(),
                        service: "grafana".to_string(),
                        namespace: "monitoring".to_string(),
                        port: None,
                    },
                    TutorialServiceRef {
                        name: "loki".to_string(),
                        target: "obs".to_string(),
                        service: "loki-gateway".to_string(),
                        namespace: "monitoring".to_string(),
                        port: Some(3100),
                    },
                    TutorialServiceRef {
                        name: "podinfo".to_string(),
                        target: "app".to_string(),
                        service: "podinfo".to_string(),
                        namespace: "demo".to_string(),
                        port: None,
                    },
                ],
                ..Default::default()
            },
        );
        let mut status = ExperimentStatus::default();

        discover_services(&exp, &ctx, &mut status).await;

        let services = status.tutorial_status.unwrap().services;
        assert_eq!(services.len(), 3);
        assert_eq!(services[0].endpoint.as_deref(), Some("http://34.1.2.3"));
        assert!(services[0].ready);
        assert!(services[1].endpoint.is_none());
        assert!(!services[1].ready);
        assert_eq!(services[2].name, "podinfo");
        assert!(!services[2].ready);
    }

    #[tokio::test]
    async fn deletes_recorded_secrets_and_reports_failures() {
        let mut mocks = Mocks::new();
        mocks
            .tutorial
            .expect_delete_secret()
            .withf(|ns, _| ns == "experiments")
            .times(2)
            .returning(|_, name| {
                if name == "demo-db-kubeconfig" {
                    Err(Error::internal("api unavailable"))
                } else {
                    Ok(())
                }
            });
        let ctx = mocks.into_context();

        let exp = experiment("demo", vec![gke_target("app"), gke_target("db")]);
        let status = ExperimentStatus {
            targets: vec![
                TargetStatus {
                    kubeconfig_secret: Some("demo-app-kubeconfig".to_string()),
                    ..TargetStatus::pending("app")
                },
                TargetStatus {
                    kubeconfig_secret: Some("demo-db-kubeconfig".to_string()),
                    ..TargetStatus::pending("db")
                },
            ],
            tutorial_status: Some(TutorialStatus {
                kubeconfig_secrets: BTreeMap::from([(
                    "app".to_string(),
                    "demo-app-kubeconfig".to_string(),
                )]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(delete_kubeconfig_secrets(&exp, &ctx, &status).await.is_err());
    }
}
