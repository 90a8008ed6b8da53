//! Error types for the cluster client.

use thiserror::Error;

/// Result type for cluster API operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors returned by the cluster manager API.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("{path}: status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Request path.
        path: String,
        /// Response body, trimmed.
        message: String,
    },

    /// The requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A response body could not be decoded.
    #[error("decode {context}: {source}")]
    Decode {
        /// What was being decoded.
        context: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The event stream reported an error or ended unexpectedly.
    #[error("event stream: {0}")]
    Stream(String),

    /// The client was misconfigured.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClusterError {
    /// Build a decode error for `context`.
    #[must_use]
    pub fn decode(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            context: context.into(),
            source,
        }
    }

    /// Whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Stream(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound(_) | Self::Decode { .. } | Self::Config(_) => false,
        }
    }

    /// Whether the error means the object is gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
