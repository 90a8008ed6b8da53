//! Error types for pools and providers.

use ondemand_scaler_core::{ContextError, CoreError};
use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that can occur in pool and provider operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Pool specification is malformed.
    #[error("invalid pool spec: {0}")]
    Spec(String),

    /// A spec attribute had the wrong type.
    #[error(transparent)]
    Attribute(#[from] CoreError),

    /// Pool specification file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Pool specification file is not valid YAML.
    #[error("failed to parse pool definitions: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Provider descriptor names an unknown provider.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Provider parameters are missing or invalid.
    #[error("invalid {provider} provider params: {message}")]
    ProviderConfig {
        /// Provider name.
        provider: &'static str,
        /// What is wrong.
        message: String,
    },

    /// The provider cannot perform the operation.
    #[error("{operation} is not supported by the {provider} provider")]
    Unsupported {
        /// Provider name.
        provider: &'static str,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// The provider already tracks more nodes than requested.
    #[error("provider tracks {tracked} nodes, more than the requested {desired}")]
    Overprovisioned {
        /// Requested total.
        desired: usize,
        /// Nodes tracked by the provider, including in-flight ones.
        tracked: usize,
    },

    /// The provider's backend failed.
    #[error("provider backend error: {0}")]
    Backend(String),

    /// Kubernetes API error.
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The wait was cancelled or timed out.
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl PoolError {
    /// Whether the error is a wait deadline being hit.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Context(ContextError::DeadlineExceeded))
    }

    /// Whether the error is an explicit cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Context(ContextError::Cancelled))
    }

    /// Whether the error is a configuration problem (fatal at startup).
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Spec(_)
                | Self::Attribute(_)
                | Self::Io { .. }
                | Self::Yaml(_)
                | Self::UnknownProvider(_)
                | Self::ProviderConfig { .. }
        )
    }
}
