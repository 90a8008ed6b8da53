//! Error types for the scaler application.

use ondemand_scaler_cluster::ClusterError;
use ondemand_scaler_pool::PoolError;
use thiserror::Error;

use crate::expr::ExprError;

/// Result type for scaler operations.
pub type Result<T> = std::result::Result<T, ScalerError>;

/// Errors that can occur while configuring or starting the scaler.
#[derive(Error, Debug)]
pub enum ScalerError {
    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML.
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// The allowed-free expression does not compile.
    #[error("invalid allowed-free expression: {0}")]
    Expression(#[from] ExprError),

    /// Pool definitions or providers failed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The cluster manager could not be reached or answered badly.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A task group cannot be placed even on a freshly provisioned node.
    #[error("task group {task_group} of job {job} does not fit on a new {pool} node")]
    Unplaceable {
        /// Job key (`namespace/job`).
        job: String,
        /// Task group name.
        task_group: String,
        /// Pool the estimate ran against.
        pool: String,
    },
}

impl ScalerError {
    /// Whether the error is fatal at startup.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        match self {
            Self::Config(_) | Self::Io { .. } | Self::Toml(_) | Self::Expression(_) => true,
            Self::Pool(e) => e.is_config(),
            Self::Cluster(_) | Self::Unplaceable { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_startup_errors() {
        assert!(ScalerError::Config("pool_config is required".into()).is_config());
        assert!(ScalerError::Expression(ExprError::UnknownVariable("x".into())).is_config());
        assert!(!ScalerError::Cluster(ClusterError::Stream("closed".into())).is_config());
        assert!(!ScalerError::Unplaceable {
            job: "default/shop".into(),
            task_group: "web".into(),
            pool: "cpu:1000".into(),
        }
        .is_config());
    }
}
