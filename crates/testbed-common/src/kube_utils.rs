//! Kubernetes helpers shared by the operator crates

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};

use crate::Error;

/// Known plural forms for the kinds this operator touches
const KIND_PLURALS: &[(&str, &str)] = &[
    ("application", "applications"),
    ("workflow", "workflows"),
    ("workflowtemplate", "workflowtemplates"),
    ("gkecluster", "gkeclusters"),
];

/// True when the error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True when the error is an API 409 (AlreadyExists or Conflict)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Split an apiVersion into (group, version); core types have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(s, _)| *s == lower) {
        return (*plural).to_string();
    }
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an ApiResource for a CRD kind without running discovery.
///
/// # Example
/// ```ignore
/// let ar = build_api_resource("argoproj.io/v1alpha1", "Application");
/// let api: Api<DynamicObject> = Api::namespaced_with(client, "argocd", &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Trait for external kinds whose apiVersion and kind are fixed at compile time.
///
/// # Example
/// ```ignore
/// impl HasApiResource for Application {
///     const API_VERSION: &'static str = "argoproj.io/v1alpha1";
///     const KIND: &'static str = "Application";
/// }
/// let ar = Application::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version
    const API_VERSION: &'static str;
    /// Resource kind
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Metadata for typed external objects built by this operator.
///
/// Always carries the managed-by label.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create metadata with the managed-by label
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let labels = BTreeMap::from([(
            crate::MANAGED_BY_LABEL.to_string(),
            crate::MANAGED_BY_VALUE.to_string(),
        )]);
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Create or update a typed object with server-side apply.
pub async fn apply_resource<T>(client: &Client, resource: &T, field_manager: &str) -> Result<(), Error>
where
    T: serde::Serialize + HasApiResource,
{
    let ar = T::api_resource();
    let value = serde_json::to_value(resource)?;
    let name = value
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);
    api.patch(name, &PatchParams::apply(field_manager).force(), &Patch::Apply(&value))
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "apply_resource",
                format!("failed to apply {}/{}: {}", ar.kind, name, e),
            )
        })?;
    Ok(())
}

/// Read one key of a secret.
///
/// Returns `Ok(None)` when the secret or the key does not exist.
pub async fn get_secret_data(
    client: &Client,
    name: &str,
    namespace: &str,
    key: &str,
) -> Result<Option<Vec<u8>>, Error> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = match secrets.get(name).await {
        Ok(s) => s,
        Err(e) if is_not_found(&e) => return Ok(None),
        Err(e) => {
            return Err(Error::internal_with_context(
                "get_secret_data",
                format!("Failed to get secret {}/{}: {}", namespace, name, e),
            ))
        }
    };
    Ok(secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone()))
}

/// Ensure a namespace exists with specific labels (idempotent).
///
/// Uses server-side apply so it never fails on "already exists".
pub async fn ensure_namespace_with_labels(
    client: &Client,
    name: &str,
    labels: &BTreeMap<String, String>,
    field_manager: &str,
) -> Result<(), kube::Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "labels": labels
        }
    });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Apply(&ns))
        .await?;
    Ok(())
}

/// Build a client for a remote cluster from raw kubeconfig bytes.
pub async fn client_from_kubeconfig(
    kubeconfig: &[u8],
    read_timeout: Duration,
) -> Result<Client, Error> {
    let raw = std::str::from_utf8(kubeconfig).map_err(|e| {
        Error::internal_with_context("client_from_kubeconfig", format!("kubeconfig is not UTF-8: {}", e))
    })?;
    let kubeconfig = Kubeconfig::from_yaml(raw).map_err(|e| {
        Error::internal_with_context("client_from_kubeconfig", format!("failed to parse kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("client_from_kubeconfig", format!("failed to load kubeconfig: {}", e))
        })?;
    config.connect_timeout = Some(Duration::from_secs(10));
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("client_from_kubeconfig", format!("failed to create client: {}", e))
    })
}

/// GET a raw API server path (service or node proxy) with a deadline.
pub async fn get_raw_with_timeout(
    client: &Client,
    path: &str,
    timeout: Duration,
) -> Result<String, Error> {
    let request = http::Request::get(path)
        .body(Vec::new())
        .map_err(|e| Error::internal_with_context("get_raw", format!("invalid request path {}: {}", path, e)))?;
    match tokio::time::timeout(timeout, client.request_text(request)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::internal_with_context(
            "get_raw",
            format!("request to {} timed out after {:?}", path, timeout),
        )),
    }
}
