//! Scheduler error types.

use thiserror::Error;

use tinyinfer_memory::MemoryError;
use tinyinfer_model::ModelError;

/// Errors raised by the kernel collaborator, surfaced verbatim.
pub type KernelError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while planning or executing a forward pass.
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EngineError {
    /// A plan entry references a dependency outside the current plan.
    #[error("bad plan: {reason}")]
    BadPlan { reason: String },

    /// Activation memory would exceed the scheduler's cap.
    #[error("out of memory: activations need {needed} bytes over a {cap} byte cap")]
    OutOfMemory { needed: usize, cap: usize },

    /// The allocator failed underneath the scheduler.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// The mapped model could not produce layer weights.
    #[error("weight load: {0}")]
    WeightLoad(#[from] ModelError),

    /// The external kernel failed; its error passes through untouched.
    #[error("kernel failed on layer {layer}: {source}")]
    Kernel {
        layer: u32,
        #[source]
        source: KernelError,
    },

    /// An operation does not fit the scheduler's current state.
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
}

impl EngineError {
    /// Create a bad-plan error
    pub fn bad_plan(reason: impl Into<String>) -> Self {
        Self::BadPlan {
            reason: reason.into(),
        }
    }

    /// Create an invalid-state error
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}

/// Result type for scheduler operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;
