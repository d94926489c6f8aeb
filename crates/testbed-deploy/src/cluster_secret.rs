//! ArgoCD cluster registration secrets
//!
//! ArgoCD discovers remote clusters through secrets labelled
//! `argocd.argoproj.io/secret-type=cluster` whose `config` key holds TLS
//! material and credentials. These are derived from the cluster's kubeconfig.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

use testbed_common::{Error, CLUSTER_LABEL};

/// Label marking a secret as an ArgoCD cluster
pub const SECRET_TYPE_LABEL: &str = "argocd.argoproj.io/secret-type";

/// Name of the registration secret for a cluster
pub fn cluster_secret_name(cluster_name: &str) -> String {
    format!("cluster-{}", cluster_name)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigView {
    #[serde(default)]
    current_context: String,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextView,
}

#[derive(Debug, Deserialize)]
struct ContextView {
    cluster: String,
    #[serde(default)]
    user: String,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterView {
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserView {
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key_data: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// The JSON document ArgoCD expects under the secret's `config` key.
///
/// Certificate fields are base64, exactly as carried in the kubeconfig.
#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArgoClusterConfig {
    /// TLS settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_client_config: Option<ArgoTlsClientConfig>,
    /// Bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

/// TLS settings for a registered cluster
#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArgoTlsClientConfig {
    /// CA bundle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_data: Option<String>,
    /// Client certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_data: Option<String>,
    /// Client key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_data: Option<String>,
    /// Skip server verification
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
}

/// Derive the ArgoCD cluster config from a kubeconfig's current context
pub fn build_cluster_config(kubeconfig: &[u8]) -> Result<ArgoClusterConfig, Error> {
    let view: KubeconfigView = serde_yaml::from_slice(kubeconfig)?;
    let context = view
        .contexts
        .iter()
        .find(|c| c.name == view.current_context)
        .map(|c| &c.context)
        .ok_or_else(|| {
            Error::configuration(format!(
                "current-context {:?} not found in kubeconfig",
                view.current_context
            ))
        })?;

    let mut config = ArgoClusterConfig::default();
    if let Some(cluster) = view.clusters.iter().find(|c| c.name == context.cluster) {
        config.tls_client_config = Some(ArgoTlsClientConfig {
            ca_data: cluster.cluster.certificate_authority_data.clone(),
            insecure: cluster.cluster.insecure_skip_tls_verify,
            ..Default::default()
        });
    }

    if let Some(user) = view.users.iter().find(|u| u.name == context.user) {
        let user = &user.user;
        if user.client_certificate_data.is_some() || user.client_key_data.is_some() {
            let tls = config.tls_client_config.get_or_insert_with(Default::default);
            tls.cert_data = user.client_certificate_data.clone();
            tls.key_data = user.client_key_data.clone();
        }
        config.bearer_token = user.token.clone().filter(|t| !t.is_empty());
    }
    Ok(config)
}

/// Build the registration secret for a cluster
pub fn build_cluster_secret(
    cluster_name: &str,
    server: &str,
    namespace: &str,
    kubeconfig: &[u8],
) -> Result<Secret, Error> {
    let config = serde_json::to_string(&build_cluster_config(kubeconfig)?)?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(cluster_secret_name(cluster_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (SECRET_TYPE_LABEL.to_string(), "cluster".to_string()),
                (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
            ])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            ("name".to_string(), cluster_name.to_string()),
            ("server".to_string(), server.to_string()),
            ("config".to_string(), config),
        ])),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: gke
contexts:
  - name: other
    context: { cluster: other, user: other }
  - name: gke
    context: { cluster: gke-cluster, user: gke-admin }
clusters:
  - name: other
    cluster: { server: "https://10.0.0.1" }
  - name: gke-cluster
    cluster:
      server: https://34.1.2.3
      certificate-authority-data: Q0EtREFUQQ==
users:
  - name: gke-admin
    user:
      client-certificate-data: Q0VSVA==
      client-key-data: S0VZ
"#;

    #[test]
    fn config_uses_current_context() {
        let config = build_cluster_config(CERT_KUBECONFIG.as_bytes()).unwrap();
        let tls = config.tls_client_config.unwrap();
        assert_eq!(tls.ca_data.as_deref(), Some("Q0EtREFUQQ=="));
        assert_eq!(tls.cert_data.as_deref(), Some("Q0VSVA=="));
        assert_eq!(tls.key_data.as_deref(), Some("S0VZ"));
        assert!(!tls.insecure);
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn token_users_get_bearer_token() {
        let kubeconfig = r#"
current-context: c
contexts: [{ name: c, context: { cluster: k, user: u } }]
clusters: [{ name: k, cluster: { server: "https://x", insecure-skip-tls-verify: true } }]
users: [{ name: u, user: { token: abc123 } }]
"#;
        let config = build_cluster_config(kubeconfig.as_bytes()).unwrap();
        assert_eq!(config.bearer_token.as_deref(), Some("abc123"));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["tlsClientConfig"]["insecure"], true);
        assert!(json["tlsClientConfig"].get("certData").is_none());
    }

    #[test]
    fn missing_current_context_is_an_error() {
        let kubeconfig = "current-context: nope\ncontexts: []\n";
        assert!(build_cluster_config(kubeconfig.as_bytes()).is_err());
    }

    #[test]
    fn secret_is_labelled_for_argocd() {
        let secret =
            build_cluster_secret("tsdb-app", "https://34.1.2.3", "argocd", CERT_KUBECONFIG.as_bytes())
                .unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("cluster-tsdb-app"));
        let labels = secret.metadata.labels.unwrap();
        assert_eq!(labels[SECRET_TYPE_LABEL], "cluster");
        assert_eq!(labels[CLUSTER_LABEL], "tsdb-app");

        let data = secret.string_data.unwrap();
        assert_eq!(data["server"], "https://34.1.2.3");
        let config: serde_json::Value = serde_json::from_str(&data["config"]).unwrap();
        assert_eq!(config["tlsClientConfig"]["caData"], "Q0EtREFUQQ==");
    }
}
