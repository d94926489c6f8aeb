//! Workflow submission and tracking

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use testbed_common::crd::WorkflowSpec;
use testbed_common::kube_utils::{is_conflict, is_not_found, HasApiResource};
use testbed_common::{Error, WORKFLOW_NAMESPACE};

use crate::workflow::{
    build_inline_workflow, build_template_workflow, workflow_name, Workflow, WorkflowRun,
    WorkflowTemplate,
};

/// Submits and tracks an experiment's validation workflow
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait WorkflowController: Send + Sync {
    /// Submit the workflow and return its name.
    ///
    /// An existing workflow with the same name counts as already submitted.
    async fn submit(&self, experiment: &str, spec: &WorkflowSpec) -> Result<String, Error>;

    /// Current status of a submitted workflow, or `None` if it no longer
    /// exists
    async fn status(&self, name: &str) -> Result<Option<WorkflowRun>, Error>;

    /// Delete a workflow; an absent workflow is success
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

/// [`WorkflowController`] backed by Argo Workflows
pub struct ArgoWorkflowController {
    client: Client,
    namespace: String,
}

impl ArgoWorkflowController {
    /// Create a controller for the default workflow namespace
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: WORKFLOW_NAMESPACE.to_string(),
        }
    }

    /// Override the workflow namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn workflows(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &Workflow::api_resource())
    }

    async fn template_exists(&self, template: &str) -> Result<bool, Error> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            &self.namespace,
            &WorkflowTemplate::api_resource(),
        );
        match api.get(template).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(Error::workflow(format!(
                "failed to look up WorkflowTemplate {}: {}",
                template, e
            ))),
        }
    }
}

#[async_trait]
impl WorkflowController for ArgoWorkflowController {
    async fn submit(&self, experiment: &str, spec: &WorkflowSpec) -> Result<String, Error> {
        let name = workflow_name(experiment);
        let workflow = if self.template_exists(&spec.template).await? {
            build_template_workflow(experiment, &self.namespace, spec)
        } else {
            info!(template = %spec.template, "WorkflowTemplate not found, submitting inline workflow");
            build_inline_workflow(experiment, &self.namespace, spec)
        };

        let obj: DynamicObject = serde_json::from_value(serde_json::to_value(&workflow)?)?;
        match self.workflows().create(&PostParams::default(), &obj).await {
            Ok(_) => {
                info!(workflow = %name, template = %spec.template, "submitted workflow");
                Ok(name)
            }
            Err(e) if is_conflict(&e) => {
                debug!(workflow = %name, "workflow already submitted");
                Ok(name)
            }
            Err(e) => Err(Error::workflow(format!("failed to create workflow {}: {}", name, e))),
        }
    }

    async fn status(&self, name: &str) -> Result<Option<WorkflowRun>, Error> {
        let obj = self
            .workflows()
            .get_opt(name)
            .await
            .map_err(|e| Error::workflow(format!("failed to get workflow {}: {}", name, e)))?;
        Ok(obj.map(|obj| WorkflowRun::from_object_data(&obj.data)))
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.workflows().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(workflow = %name, "deleted workflow");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::workflow(format!("failed to delete workflow {}: {}", name, e))),
        }
    }
}
