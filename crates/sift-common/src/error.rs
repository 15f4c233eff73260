//! Error taxonomy for the workspace cache.

use thiserror::Error;

/// Result type alias using SiftError.
pub type Result<T> = std::result::Result<T, SiftError>;

/// Primary error type for cache, pyramid and pipeline operations.
///
/// Payloads are plain strings so a single failure can be cloned and handed
/// to every caller waiting on the same build.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SiftError {
    // === Source Errors ===
    #[error("source read error: {0}")]
    SourceRead(String),

    // === Store Errors ===
    #[error("integrity error for key {key}: {message}")]
    Integrity { key: String, message: String },

    #[error("quota exceeded: write of {requested} bytes does not fit in quota of {quota} bytes ({reclaimable} bytes reclaimable)")]
    QuotaExceeded {
        requested: u64,
        quota: u64,
        reclaimable: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    // === Build Errors ===
    #[error("build failure: {0}")]
    BuildFailure(String),

    #[error("projection error: {0}")]
    Projection(String),

    // === Infrastructure Errors ===
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl SiftError {
    /// Create a SourceRead error.
    pub fn source_read(msg: impl Into<String>) -> Self {
        Self::SourceRead(msg.into())
    }

    /// Create an Integrity error for a key.
    pub fn integrity(key: impl ToString, msg: impl Into<String>) -> Self {
        Self::Integrity {
            key: key.to_string(),
            message: msg.into(),
        }
    }

    /// Create a BuildFailure error.
    pub fn build_failure(msg: impl Into<String>) -> Self {
        Self::BuildFailure(msg.into())
    }

    /// Create a Storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a Metadata error.
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    /// Create a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Short machine-readable name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            SiftError::SourceRead(_) => "source_read",
            SiftError::Integrity { .. } => "integrity",
            SiftError::QuotaExceeded { .. } => "quota_exceeded",
            SiftError::Storage(_) => "storage",
            SiftError::Metadata(_) => "metadata",
            SiftError::BuildFailure(_) => "build_failure",
            SiftError::Projection(_) => "projection",
            SiftError::Config(_) => "config",
            SiftError::NotFound(_) => "not_found",
            SiftError::Cancelled(_) => "cancelled",
        }
    }

    /// Whether re-running the same request could succeed.
    ///
    /// Bad sources and programming errors are never retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SiftError::Storage(_) | SiftError::QuotaExceeded { .. } | SiftError::Cancelled(_)
        )
    }
}

impl From<std::io::Error> for SiftError {
    fn from(err: std::io::Error) -> Self {
        SiftError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SiftError {
    fn from(err: serde_json::Error) -> Self {
        SiftError::Metadata(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(SiftError::source_read("x").kind(), "source_read");
        assert_eq!(SiftError::integrity("abc", "x").kind(), "integrity");
        assert_eq!(SiftError::build_failure("x").kind(), "build_failure");
    }

    #[test]
    fn test_source_errors_not_retryable() {
        assert!(!SiftError::source_read("missing file").is_retryable());
        assert!(!SiftError::integrity("k", "mismatch").is_retryable());
        assert!(SiftError::storage("disk full").is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SiftError = io.into();
        assert!(matches!(err, SiftError::Storage(ref m) if m.contains("gone")));
    }
}
