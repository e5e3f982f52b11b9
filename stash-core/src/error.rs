//! Error types for stash operations

use thiserror::Error;

/// Errors produced by a document store.
///
/// This is a closed set. Store adapters translate whatever their backend
/// reports into one of these kinds and the key-value layer matches on them
/// exhaustively.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Document not found: {id}")]
    NotFound { id: String },

    #[error("Document update conflict: {id}")]
    Conflict { id: String },

    #[error("Store connection closing: {reason}")]
    ConnectionClosing { reason: String },

    #[error("Store operation failed: {reason}")]
    Fatal { reason: String },
}

impl StoreError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    pub fn closing(reason: impl Into<String>) -> Self {
        Self::ConnectionClosing {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether the connection must be reopened before the operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionClosing { .. })
    }
}

/// Value encoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to serialize value for {key}: {reason}")]
    Serialize { key: String, reason: String },

    #[error("Failed to deserialize value for {key}: {reason}")]
    Deserialize { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all stash errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StashError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for stash operations.
pub type StashResult<T> = Result<T, StashError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_not_found() {
        let err = StoreError::not_found("user:1");
        let msg = format!("{}", err);
        assert!(msg.contains("not found"));
        assert!(msg.contains("user:1"));
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::not_found("a").is_not_found());
        assert!(StoreError::conflict("a").is_conflict());
        assert!(StoreError::closing("torn down").is_transient());
        assert!(!StoreError::fatal("disk full").is_transient());
        assert!(!StoreError::conflict("a").is_transient());
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "max_attempts".to_string(),
            value: "0".to_string(),
            reason: "must be at least 1".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("max_attempts"));
        assert!(msg.contains("0"));
        assert!(msg.contains("must be at least 1"));
    }

    #[test]
    fn test_stash_error_from_store_error() {
        let err: StashError = StoreError::fatal("boom").into();
        assert!(matches!(err, StashError::Store(StoreError::Fatal { .. })));
        assert!(err.to_string().contains("boom"));
    }
}
