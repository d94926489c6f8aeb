//! Ephemeral cluster provisioning
//!
//! Clusters are requested through declarative Crossplane claims. Creation is
//! fire-and-forget; readiness, endpoint and credentials are polled.

#![deny(missing_docs)]

pub mod claim;
pub mod provisioner;

pub use claim::{ClusterSizing, GKE_CLAIM_API_VERSION, GKE_CLAIM_KIND};
#[cfg(any(test, feature = "mock"))]
pub use provisioner::MockClusterProvisioner;
pub use provisioner::{cluster_name, ClusterProvisioner, GkeClusterProvisioner};
