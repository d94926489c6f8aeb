//! Experiment operator
//!
//! Drives each `Experiment` through provisioning, deployment, validation and
//! teardown, then stores and publishes what it measured. The reconcile loop
//! is level-triggered: every pass re-reads persisted status and returns the
//! delay until the next one, never blocking in-process.

#![deny(missing_docs)]

pub mod cleanup;
pub mod config;
pub mod controller;
pub mod controller_runner;
pub mod phases;
pub mod results;
pub mod tutorial;

#[cfg(test)]
mod test_fixtures;

pub use config::{OperatorArgs, OperatorConfig, RequeueDelays};
pub use controller::{error_policy, reconcile, Context, ContextBuilder, ExperimentStore};
