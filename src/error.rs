/// Error types for Specularium operations.
///
/// This module provides the error hierarchy shared by every service in the
/// system. All errors are well-typed and can be pattern-matched for precise
/// handling; the HTTP layer maps each variant onto a status code.
use thiserror::Error;

/// The main error type for Specularium operations.
///
/// All fallible operations return `Result<T, SpecularError>`. The variants
/// mirror the HTTP surface: `NotFound` → 404, `Validation` → 400,
/// `Conflict` → 409, `Forbidden` → 403, `Unavailable` → 503, and the
/// remaining variants → 500.
#[derive(Error, Debug)]
pub enum SpecularError {
    /// A resource lookup returned nothing
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// The kind of resource (node, edge, discrepancy, ...)
        kind: &'static str,
        /// The identifier that was looked up
        id: String,
    },

    /// Malformed input or an invariant violation
    #[error("Validation failed: {reason}")]
    Validation {
        /// Description of what was rejected
        reason: String,
    },

    /// An identifier collided with an existing resource
    #[error("{kind} '{id}' already exists")]
    Conflict {
        /// The kind of resource
        kind: &'static str,
        /// The colliding identifier
        id: String,
    },

    /// Mutation of an immutable resource or field
    #[error("Forbidden: {reason}")]
    Forbidden {
        /// Why the mutation was refused
        reason: String,
    },

    /// An optional collaborator is not configured
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SpecularError {
    /// Shorthand for a `NotFound` over a node id.
    pub fn node_not_found(id: impl Into<String>) -> Self {
        SpecularError::NotFound {
            kind: "node",
            id: id.into(),
        }
    }

    /// Shorthand for a `Validation` error.
    pub fn validation(reason: impl Into<String>) -> Self {
        SpecularError::Validation {
            reason: reason.into(),
        }
    }
}

/// Result type alias for Specularium operations.
pub type SpecularResult<T> = Result<T, SpecularError>;
