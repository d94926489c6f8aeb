//! Common types for the experiment operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group shared by the Experiment and Component CRDs
pub const EXPERIMENTS_GROUP: &str = "experiments.illm.io";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "experiment-operator";

/// Finalizer guarding experiment deletion until cleanup completes
pub const DEFAULT_FINALIZER: &str = "experiments.illm.io/finalizer";

/// Namespace where cluster claims are created
pub const EXPERIMENTS_NAMESPACE: &str = "experiments";

/// Namespace where ArgoCD Applications and cluster secrets live
pub const ARGOCD_NAMESPACE: &str = "argocd";

/// Namespace where Argo Workflows are submitted
pub const WORKFLOW_NAMESPACE: &str = "argo-workflows";

/// Namespace the operator runs in (analysis jobs, shared secrets)
pub const OPERATOR_NAMESPACE: &str = "experiment-operator-system";

/// Namespace holding Crossplane connection secrets
pub const CROSSPLANE_NAMESPACE: &str = "crossplane-system";

/// Cluster type naming the pre-existing hub cluster
pub const HUB_CLUSTER_TYPE: &str = "hub";

/// Sentinel cluster handle returned for hub targets
pub const HUB_CLUSTER_NAME: &str = "hub";

/// In-cluster API server address used when deploying to the hub
pub const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";

/// Label marking resources owned by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "experiment-operator";

/// Label carrying the owning experiment name
pub const EXPERIMENT_LABEL: &str = "experiments.illm.io/experiment";

/// Label carrying the owning target name
pub const TARGET_LABEL: &str = "experiments.illm.io/target";

/// Label carrying the provisioned cluster name
pub const CLUSTER_LABEL: &str = "experiments.illm.io/cluster";

/// Truncate a Kubernetes object name to the 63 character label limit
pub fn truncate_name(name: &str) -> String {
    name.chars().take(63).collect()
}
