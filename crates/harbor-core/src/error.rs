//! # Error Types
//!
//! Domain-specific error types for harbor-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  harbor-core errors (this file)                                        │
//! │  ├── CoreError        - Signing, record envelope, dataset naming       │
//! │  └── ValidationError  - Order snapshot validation failures             │
//! │                                                                         │
//! │  harbor-db errors (separate crate)                                     │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  harbor-sync errors (separate crate)                                   │
//! │  └── SyncError        - Network, auth, conflict, storage taxonomy      │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → status surface        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The persisted signing secret is not valid hex (or is empty).
    ///
    /// ## When This Occurs
    /// - Credential row was corrupted on disk
    /// - Backend issued a secret in an unexpected encoding
    #[error("Invalid signing secret: {0}")]
    InvalidSecret(String),

    /// A dataset name that is not one of the synced datasets.
    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    /// A backend record that cannot be turned into a `Record` envelope.
    #[error("Malformed {dataset} record: {reason}")]
    MalformedRecord { dataset: String, reason: String },

    /// A payload could not be serialized for signing or storage.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised for input that cannot be stored at all: an order with no lines or
/// a malformed operator-supplied id. These never depend on connectivity.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Invalid format (e.g., invalid UUID).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
