//! Standalone error types for tinyinfer-memory
//!
//! Uses thiserror for clean, idiomatic Rust error definitions.

use thiserror::Error;

use crate::config::{SizeClass, UsagePattern};

/// Memory pool errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum MemoryError {
    /// The request itself is nonsense (zero size, null handle, ...).
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Alignment is not a power of two.
    #[error("invalid alignment: {alignment}")]
    InvalidAlignment { alignment: usize },

    /// Every candidate pool is exhausted and growth is not possible.
    #[error(
        "out of memory: {requested} bytes ({usage:?}/{class:?}) with {align} byte alignment"
    )]
    OutOfMemory {
        requested: usize,
        align: usize,
        usage: UsagePattern,
        class: SizeClass,
    },

    /// Size calculation overflowed.
    #[error("size overflow during {operation}")]
    SizeOverflow { operation: String },

    /// A pointer was handed back that no region owns.
    #[error("unknown pointer: {addr:#x}")]
    UnknownPointer { addr: usize },

    /// Configuration failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl MemoryError {
    /// Check if error is retryable after a free, `optimize` or `compact`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "MEM:ARG:INVALID",
            Self::InvalidAlignment { .. } => "MEM:ARG:ALIGN",
            Self::OutOfMemory { .. } => "MEM:ALLOC:OOM",
            Self::SizeOverflow { .. } => "MEM:ALLOC:OVERFLOW",
            Self::UnknownPointer { .. } => "MEM:FREE:UNKNOWN",
            Self::InvalidConfig { .. } => "MEM:CONFIG:INVALID",
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid alignment error
    #[must_use]
    pub fn invalid_alignment(alignment: usize) -> Self {
        Self::InvalidAlignment { alignment }
    }

    /// Create an out-of-memory error
    #[must_use]
    pub fn out_of_memory(
        requested: usize,
        align: usize,
        usage: UsagePattern,
        class: SizeClass,
    ) -> Self {
        Self::OutOfMemory {
            requested,
            align,
            usage,
            class,
        }
    }

    /// Create a size overflow error
    pub fn size_overflow(operation: impl Into<String>) -> Self {
        Self::SizeOverflow {
            operation: operation.into(),
        }
    }

    /// Create an unknown pointer error
    #[must_use]
    pub fn unknown_pointer(addr: usize) -> Self {
        Self::UnknownPointer { addr }
    }

    /// Create an invalid config error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Result type for memory operations
pub type MemoryResult<T> = core::result::Result<T, MemoryError>;
