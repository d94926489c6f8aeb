//! Validation workflow submission and tracking through Argo Workflows

#![deny(missing_docs)]

pub mod controller;
pub mod workflow;

#[cfg(any(test, feature = "mock"))]
pub use controller::MockWorkflowController;
pub use controller::{ArgoWorkflowController, WorkflowController};
pub use workflow::{
    build_inline_workflow, build_template_workflow, is_succeeded, is_terminal, workflow_name,
    Workflow, WorkflowRun,
};
