//! Where experiment results go once an experiment finishes
//!
//! Summaries are stored in an S3-compatible bucket, optionally published to
//! a results repository through a pull request, and optionally handed to an
//! AI analyzer running as a Kubernetes Job.

#![deny(missing_docs)]

pub mod analysis;
pub mod github;
pub mod store;

#[cfg(any(test, feature = "mock"))]
pub use analysis::MockAnalysisJobs;
pub use analysis::{
    analysis_job_name, build_analysis_job, job_outcome, AnalysisJobs, AnalyzerSettings,
    JobOutcome, KubeAnalysisJobs,
};
#[cfg(any(test, feature = "mock"))]
pub use github::MockResultsRepository;
pub use github::{results_branch, GitHubRepository, PublishedResult, ResultsRepository};
#[cfg(any(test, feature = "mock"))]
pub use store::MockObjectStore;
pub use store::{
    metrics_snapshot_key, put_document, summary_key, ObjectStore, S3ObjectStore,
};
