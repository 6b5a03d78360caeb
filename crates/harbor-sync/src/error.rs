//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │ Transient (net) │  │   Authentication        │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  Unauthorized (401/403) │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  PairingRequired        │ │
//! │  │  ConfigLoad     │  │  Server (5xx)   │  │  PairingDenied/Expired  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │ Business        │  │    Storage      │  │      Protocol           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  OrderConflict  │  │  Storage(Db)    │  │  Rejected (4xx)         │ │
//! │  │                 │  │                 │  │  InvalidResponse        │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Structural data problems (orphan or cyclic categories) are not errors:
//! they are reported in an `ApplyReport` and the sync proceeds.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid backend URL.
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The backend could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A request exceeded its timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The backend answered 5xx.
    #[error("Backend error {status}: {message}")]
    Server { status: u16, message: String },

    // =========================================================================
    // Identity Errors
    // =========================================================================
    /// The backend rejected the device signature or credential (401/403).
    ///
    /// ## When This Occurs
    /// - Credential revoked on the backend
    /// - Signing secret rotated and the local cache is stale
    ///
    /// Shown to the operator as "device not recognized".
    #[error("Device not recognized by backend (HTTP {status})")]
    Unauthorized { status: u16 },

    /// No usable credential; the terminal must be paired.
    #[error("Pairing required")]
    PairingRequired,

    /// The operator declined the pairing request.
    #[error("Pairing was denied")]
    PairingDenied,

    /// The device code expired before approval.
    #[error("Pairing code expired; start pairing again")]
    PairingExpired,

    /// Pairing was cancelled locally.
    #[error("Pairing cancelled")]
    PairingCancelled,

    /// No host identifier could be read to derive the fingerprint.
    #[error("Hardware fingerprint unavailable: {0}")]
    FingerprintUnavailable(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// The backend refused the request as invalid (4xx other than auth).
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// A response body did not match its documented shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Failed to serialize a request.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Business Errors
    // =========================================================================
    /// An order that cannot be applied safely; needs operator review.
    #[error("Order {local_id} conflicts with backend state: {reason}")]
    OrderConflict { local_id: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Local storage failed. Nothing from the failing batch was committed.
    #[error("Storage error: {0}")]
    Storage(#[from] harbor_db::DbError),

    /// A domain-level failure (signing secret, record envelope, validation).
    #[error(transparent)]
    Core(#[from] harbor_core::CoreError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<harbor_core::ValidationError> for SyncError {
    fn from(err: harbor_core::ValidationError) -> Self {
        SyncError::Core(err.into())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Maps a non-success HTTP status to the matching category.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => SyncError::Unauthorized { status },
            500..=599 => SyncError::Server { status, message },
            _ => SyncError::Rejected { status, message },
        }
    }

    /// Returns true if the next cycle may succeed without any change.
    ///
    /// ## Transient
    /// - Connection failures and timeouts
    /// - 5xx responses
    /// - A busy or exhausted local database
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::ConnectionFailed(_)
            | SyncError::Timeout(_)
            | SyncError::Server { .. } => true,
            SyncError::Storage(db) => db.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the backend no longer accepts this device.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized { .. } | SyncError::PairingRequired
        )
    }

    /// Returns true for business conflicts that need operator review.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::OrderConflict { .. })
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if pairing ended and must be restarted by the operator.
    pub fn is_pairing_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::PairingDenied | SyncError::PairingExpired | SyncError::PairingCancelled
        )
    }
}
