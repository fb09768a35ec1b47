//! Unified error handling for the route engine.
//!
//! Validation and consistency failures are rejected before any storage
//! mutation. Not-found is never an error: lookups return `Option` or an
//! empty collection instead.

use thiserror::Error;

/// Unified error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-supplied input failed validation
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// A GPS track cannot be stored or processed
    #[error("Track '{activity_id}' is invalid: {message}")]
    InvalidTrack {
        activity_id: String,
        message: String,
    },

    /// An operation referenced an activity that is not in the store
    #[error("Unknown activity '{0}'")]
    UnknownActivity(String),

    /// A time stream does not line up with the activity's GPS points
    #[error("Time stream for '{activity_id}' has {actual} samples, track has {expected} points")]
    TimeStreamMismatch {
        activity_id: String,
        expected: usize,
        actual: usize,
    },

    /// A user payload exceeded the byte ceiling
    #[error("Payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// SQLite error
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Schema migration error
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    /// Blob or JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A section detection job is already running
    #[error("Section detection is already running")]
    DetectionInProgress,

    /// The engine singleton has not been initialized
    #[error("Engine not initialized")]
    NotInitialized,

    /// The engine is bound to a different store
    #[error("Engine already initialized with '{current}', refusing '{requested}'")]
    PathMismatch { current: String, requested: String },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Shorthand for a validation failure on `field`.
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// True for errors the caller can fix by changing its input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::Validation { .. }
                | EngineError::InvalidTrack { .. }
                | EngineError::UnknownActivity(_)
                | EngineError::TimeStreamMismatch { .. }
                | EngineError::PayloadTooLarge { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Extension trait for converting Option to EngineError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an unknown activity error.
    fn ok_or_unknown_activity(self, activity_id: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_unknown_activity(self, activity_id: &str) -> Result<T> {
        self.ok_or_else(|| EngineError::UnknownActivity(activity_id.to_string()))
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| EngineError::Internal(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::TimeStreamMismatch {
            activity_id: "test-1".to_string(),
            expected: 10,
            actual: 9,
        };
        assert!(err.to_string().contains("test-1"));
        assert!(err.to_string().contains("9 samples"));
        assert!(err.is_validation());
    }

    #[test]
    fn test_storage_is_not_validation() {
        let err = EngineError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(!err.is_validation());
        assert!(err.to_string().starts_with("Storage error"));
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_unknown_activity("missing");
        assert!(matches!(result, Err(EngineError::UnknownActivity(id)) if id == "missing"));
        assert_eq!(Some(3).ok_or_internal("unused").unwrap(), 3);
    }
}
