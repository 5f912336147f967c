//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  └── CoreError        - Malformed caller input                         │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  └── SyncError        - Transport, config, worker failures             │
//! │                                                                         │
//! │  Flow: CoreError → SyncError::MalformedInput → logged, record dropped  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Malformed input detected while building a record.
///
/// A `CoreError` never stops the pipeline: the offending record is dropped
/// and logged, and the worker moves on to the next command.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The event name is empty (or only whitespace).
    #[error("Event name is empty")]
    EmptyEventName,

    /// A profile update payload is not a JSON object.
    #[error("Profile update must be a JSON object, got {0}")]
    InvalidProfilePayload(String),

    /// A record could not be serialized.
    #[error("Record serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
