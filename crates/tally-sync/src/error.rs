//! # Sync Error Types
//!
//! Error types for ingestion and delivery.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Delivery Error Categories                         │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Input               │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Service-       │  │  MalformedInput         │ │
//! │  │  InvalidUrl     │  │   Unavailable   │  │  (record dropped)       │ │
//! │  │  ConfigLoad/    │  │  Io             │  │                         │ │
//! │  │   SaveFailed    │  │  MalformedUrl   │  │                         │ │
//! │  └─────────────────┘  │  OutOfMemory    │  └─────────────────────────┘ │
//! │                       └─────────────────┘                               │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │    Storage      │  │              Worker                         │  │
//! │  │                 │  │                                             │  │
//! │  │  Database       │  │  Internal (terminates the worker when it    │  │
//! │  │  Store          │  │  escapes a command handler)                 │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  Retry-after values are normalized to Duration here, at the boundary.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Error type covering ingestion and delivery failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An endpoint URL failed validation.
    #[error("Invalid endpoint URL: {0}")]
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
    /// The server answered 5xx. Carries its Retry-After hint.
    #[error("Service unavailable (retry after {}s)", retry_after.as_secs())]
    ServiceUnavailable { retry_after: Duration },

    /// Connection, timeout, or body I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The request URL could not be parsed.
    #[error("Malformed URL: {0}")]
    MalformedUrl(String),

    /// Memory or storage ran out while preparing a request.
    #[error("Out of memory")]
    OutOfMemory,

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// A single record could not be built; it is dropped.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A record store implementation failed.
    #[error("Store error: {0}")]
    Store(String),

    // =========================================================================
    // Worker Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<tally_db::DbError> for SyncError {
    fn from(err: tally_db::DbError) -> Self {
        if err.is_storage_full() {
            SyncError::OutOfMemory
        } else {
            SyncError::Database(err.to_string())
        }
    }
}

impl From<tally_core::CoreError> for SyncError {
    fn from(err: tally_core::CoreError) -> Self {
        SyncError::MalformedInput(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedInput(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::MalformedUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            SyncError::MalformedUrl(err.to_string())
        } else {
            SyncError::Io(err.to_string())
        }
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
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Builds a Service-Unavailable error from a Retry-After value in seconds.
    pub fn service_unavailable(retry_after_secs: u64) -> Self {
        SyncError::ServiceUnavailable {
            retry_after: Duration::from_secs(retry_after_secs),
        }
    }

    /// The server's retry-after hint, if this is a Service-Unavailable error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::ServiceUnavailable { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns true for failures retried on the plain exponential schedule.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_) | SyncError::MalformedUrl(_) | SyncError::OutOfMemory
        )
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
}
