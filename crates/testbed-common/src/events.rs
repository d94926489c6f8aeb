//! Kubernetes Event recording for the experiment controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so phase transitions show up in `kubectl describe experiment`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Trait for publishing Kubernetes Events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "WorkflowSubmitted")
    /// * `action` - What action was taken (e.g. "Deploy")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A target's cluster claim could not be created
    pub const CLUSTER_CREATE_FAILED: &str = "ClusterCreateFailed";
    /// Every target's clusters reported ready
    pub const CLUSTERS_READY: &str = "ClustersReady";
    /// ArgoCD applications were created for a target
    pub const APPLICATIONS_CREATED: &str = "ApplicationsCreated";
    /// The validation workflow was submitted
    pub const WORKFLOW_SUBMITTED: &str = "WorkflowSubmitted";
    /// The validation workflow reached a terminal phase
    pub const WORKFLOW_FINISHED: &str = "WorkflowFinished";
    /// The results summary was written to durable storage
    pub const RESULTS_STORED: &str = "ResultsStored";
    /// Cleanup of external resources failed and will be retried
    pub const CLEANUP_FAILED: &str = "CleanupFailed";
    /// All billable resources were released
    pub const RESOURCES_CLEANED: &str = "ResourcesCleaned";
    /// The analysis job reached a terminal phase
    pub const ANALYSIS_FINISHED: &str = "AnalysisFinished";
}

/// Well-known event action strings.
pub mod actions {
    /// Provisioning clusters
    pub const PROVISION: &str = "Provision";
    /// Creating GitOps applications
    pub const DEPLOY: &str = "Deploy";
    /// Driving the validation workflow
    pub const VALIDATE: &str = "Validate";
    /// Collecting and publishing results
    pub const COLLECT: &str = "Collect";
    /// Tearing down external resources
    pub const CLEANUP: &str = "Cleanup";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::WORKFLOW_SUBMITTED, "WorkflowSubmitted");
        assert_eq!(reasons::CLEANUP_FAILED, "CleanupFailed");
        assert_eq!(actions::CLEANUP, "Cleanup");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::CLEANUP_FAILED,
                actions::CLEANUP,
                Some("test".to_string()),
            )
            .await;
    }
}
