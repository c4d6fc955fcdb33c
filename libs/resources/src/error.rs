//! Error types for resource model operations.

use thiserror::Error;

/// Errors from parsing or validating resource fields.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    /// Size string could not be parsed.
    #[error("invalid size '{0}'")]
    InvalidSize(String),

    /// A key segment (group, namespace, id) is empty or contains '/'.
    #[error("invalid key segment '{segment}': {reason}")]
    InvalidKey {
        segment: String,
        reason: &'static str,
    },
}
