//! Common error types for the ondemand scaler.
//!
//! This module provides shared error types that are used across multiple crates.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the scaler.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A variant value had a different type than the caller required.
    #[error("attribute {key}: expected {expected}, found {found}")]
    VariantType {
        /// Attribute key that was inspected.
        key: String,
        /// Type the caller expected.
        expected: &'static str,
        /// Type actually present.
        found: &'static str,
    },

    /// A required attribute was missing.
    #[error("missing attribute: {0}")]
    MissingAttribute(String),

    /// A value could not be converted into a variant.
    #[error("invalid variant value: {0}")]
    InvalidVariant(String),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Build a type mismatch error for `key`.
    #[must_use]
    pub fn variant_type(key: impl Into<String>, expected: &'static str, found: &'static str) -> Self {
        Self::VariantType {
            key: key.into(),
            expected,
            found,
        }
    }
}
