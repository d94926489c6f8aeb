//! Deployment of experiment components onto target clusters
//!
//! Components are resolved to git or helm sources and deployed as ArgoCD
//! Applications, either as one Application per target or as ordered layers
//! when the observability stack is injected.

#![deny(missing_docs)]

pub mod application;
pub mod cluster_secret;
pub mod deployer;
pub mod layers;
pub mod resolver;

pub use application::{application_name, build_application, Application, ApplicationStatus};
pub use cluster_secret::{build_cluster_config, build_cluster_secret, cluster_secret_name};
#[cfg(any(test, feature = "mock"))]
pub use deployer::MockApplicationDeployer;
pub use deployer::{ApplicationDeployer, ArgoApplicationDeployer};
pub use layers::{classify_components, observability_refs, ClassifiedComponents};
pub use resolver::{
    ComponentCatalog, ComponentResolver, KubeComponentCatalog, ResolvedComponent, ResolvedSource,
};
