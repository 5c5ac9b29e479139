//! Error types for the mapped-model store.

use thiserror::Error;

/// Errors surfaced by the model store and file codecs.
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ModelError {
    /// Magic, version or structural check failed while parsing.
    #[error("invalid model file: {reason}")]
    InvalidFile { reason: String },

    /// File I/O failed while reading layer bytes.
    #[error("weight load: {0}")]
    Io(#[from] std::io::Error),

    /// A descriptor does not match the file it points into.
    #[error("weight load failed: {reason}")]
    WeightLoad { reason: String },

    /// The cache cannot evict enough inactive layers to fit a load.
    #[error("cache full: need {needed} bytes over a {budget} byte budget")]
    CacheFull { needed: usize, budget: usize },

    /// A layer was requested at a precision it is not stored in.
    #[error("precision mismatch: expected {expected} bits, found {found}")]
    PrecisionMismatch { expected: u32, found: u32 },

    /// The request itself is nonsense.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

impl ModelError {
    /// Retryable errors clear up after a guard drops or the budget grows.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CacheFull { .. })
    }

    /// Create an invalid-file error
    pub fn invalid_file(reason: impl Into<String>) -> Self {
        Self::InvalidFile {
            reason: reason.into(),
        }
    }

    /// Create a weight-load error
    pub fn weight_load(reason: impl Into<String>) -> Self {
        Self::WeightLoad {
            reason: reason.into(),
        }
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// Result type for model operations
pub type ModelResult<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_full_is_retryable() {
        let err = ModelError::CacheFull {
            needed: 1024,
            budget: 512,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err = ModelError::from(io);
        assert!(err.to_string().starts_with("weight load"));
        assert!(!err.is_retryable());
    }
}
