//! # Error Handling
//!
//! Error types for the chainkey core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Request Errors (client-fixable, no state mutation)                │
//! │  │   ├── InvalidInput          - Missing/malformed field, bad enum     │
//! │  │   ├── NotFound              - Unknown device/subset/gateway/task    │
//! │  │   └── Conflict              - Duplicate, already revoked, terminal  │
//! │  │                                                                      │
//! │  ├── Trust Errors                                                      │
//! │  │   ├── Unauthorized          - Bad signature, missing credential     │
//! │  │   ├── Forbidden             - Credential valid for someone else     │
//! │  │   └── CryptoFailure         - Decryption/verification failure       │
//! │  │                                                                      │
//! │  ├── Topology Errors                                                   │
//! │  │   └── Unreachable           - No (online) gateway for a subset      │
//! │  │                                                                      │
//! │  └── Infrastructure Errors                                             │
//! │      ├── DatabaseError         - SQLite failure                        │
//! │      ├── SerializationError    - JSON encode/decode failure            │
//! │      ├── TransportError        - HTTP / broker failure                 │
//! │      └── Internal              - Anything else                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Surfacing Errors
//!
//! ```text
//! Result<T, Error>  ──►  (http_status, code, message)  ──►  ApiResponse JSON
//!
//! Err(Error::Unreachable(..))  →  404 { ok: false, code: 400, error: "..." }
//! Err(Error::CryptoFailure(..)) → 401 { ok: false, code: 202, error: "..." }
//! ```

use thiserror::Error;

/// Result type alias for chainkey operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chainkey
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Request Errors (100-199)
    // ========================================================================

    /// A field is missing, malformed or carries an unsupported value
    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    /// The named entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current state
    #[error("Conflict: {0}")]
    Conflict(String),

    // ========================================================================
    // Trust Errors (200-299)
    // ========================================================================

    /// Missing or invalid credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Credential is valid but does not grant this action
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Decryption or signature verification failed
    #[error("Cryptographic failure: {0}")]
    CryptoFailure(String),

    // ========================================================================
    // Topology Errors (400-499)
    // ========================================================================

    /// No gateway is available to reach a subset
    #[error("Unreachable: {0}")]
    Unreachable(String),

    // ========================================================================
    // Infrastructure Errors (900-999)
    // ========================================================================

    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Outbound transport failed
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidInput`]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Get the numeric error code
    pub fn code(&self) -> i32 {
        match self {
            // Request (100-199)
            Error::InvalidInput { .. } => 100,
            Error::NotFound(_) => 101,
            Error::Conflict(_) => 102,

            // Trust (200-299)
            Error::Unauthorized(_) => 200,
            Error::Forbidden(_) => 201,
            Error::CryptoFailure(_) => 202,

            // Topology (400-499)
            Error::Unreachable(_) => 400,

            // Infrastructure (900-999)
            Error::DatabaseError(_) => 900,
            Error::SerializationError(_) => 901,
            Error::TransportError(_) => 902,
            Error::Internal(_) => 999,
        }
    }

    /// HTTP status a caller should see for this error.
    ///
    /// `Unreachable` is reported as 404 and `CryptoFailure` as 401; callers
    /// never learn which of the two underlying conditions occurred.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidInput { .. } => 400,
            Error::NotFound(_) | Error::Unreachable(_) => 404,
            Error::Conflict(_) => 409,
            Error::Unauthorized(_) | Error::CryptoFailure(_) => 401,
            Error::Forbidden(_) => 403,
            Error::DatabaseError(_)
            | Error::SerializationError(_)
            | Error::TransportError(_)
            | Error::Internal(_) => 500,
        }
    }

    /// Whether the caller can fix the request and retry
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("IO error: {}", err))
    }
}

// ============================================================================
// TESTS
// ============================================================================
