//! Error types for the experiment operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant names the experiment, target or subsystem involved.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for experiment operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid experiment or component definition
    #[error("validation error for {experiment}: {message}")]
    Validation {
        /// Name of the experiment with invalid configuration
        experiment: String,
        /// Description of what's invalid
        message: String,
    },

    /// Cluster provisioning error
    #[error("provisioning error for {cluster}: {message}")]
    Provisioning {
        /// Cluster claim name
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Application deployment error
    #[error("deployment error for {target}: {message}")]
    Deployment {
        /// Target (or application) being deployed
        target: String,
        /// Description of what failed
        message: String,
    },

    /// Workflow engine error
    #[error("workflow error: {message}")]
    Workflow {
        /// Description of what failed
        message: String,
    },

    /// Metrics discovery or query error
    #[error("metrics error: {message}")]
    Metrics {
        /// Description of what failed
        message: String,
    },

    /// Durable storage error
    #[error("storage error: {message}")]
    Storage {
        /// Description of what failed
        message: String,
    },

    /// Results repository error
    #[error("publish error: {message}")]
    Publish {
        /// Description of what failed
        message: String,
    },

    /// Missing credentials or operator configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what is missing
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "cleanup")
        context: String,
    },
}

impl Error {
    /// Create a validation error without experiment context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            experiment: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named experiment
    pub fn validation_for(experiment: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            experiment: experiment.into(),
            message: msg.into(),
        }
    }

    /// Create a provisioning error for a cluster claim
    pub fn provisioning(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a deployment error for a target or application
    pub fn deployment(target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Deployment {
            target: target.into(),
            message: msg.into(),
        }
    }

    /// Create a workflow error
    pub fn workflow(msg: impl Into<String>) -> Self {
        Self::Workflow {
            message: msg.into(),
        }
    }

    /// Create a metrics error
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics {
            message: msg.into(),
        }
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
        }
    }

    /// Create a publish error
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with default context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with a specific context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Invalid definitions and missing configuration need a human to fix them;
    /// everything else talks to an eventually-consistent external system.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Validation { .. } => false,
            Error::Provisioning { .. } => true,
            Error::Deployment { .. } => true,
            Error::Workflow { .. } => true,
            Error::Metrics { .. } => true,
            Error::Storage { .. } => true,
            Error::Publish { .. } => true,
            Error::Configuration { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
