//! # tinyinfer-engine
//!
//! Forward-pass scheduler for quantized models: walks a dependency-ordered
//! layer plan under a memory ceiling, pulls weights from the mapped model
//! store, allocates activation outputs just-in-time from the hierarchical
//! pool, and frees them the moment no successor needs them.
//!
//! Numeric kernels are collaborators behind the [`scheduler::LayerKernel`]
//! trait; the crate ships a no-op reference stub.

// Activation buffers cross the kernel boundary as raw spans; opt out of the
// workspace-wide `unsafe_code` warn.
#![allow(unsafe_code)]

pub mod error;
pub mod plan;
pub mod scheduler;

pub use crate::error::{EngineError, EngineResult, KernelError};
pub use crate::plan::{ExecLayer, ExecutionPlan, LayerDependency};
pub use crate::scheduler::{ExecMode, ForwardScheduler, KernelContext, LayerKernel, NoopKernel};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::{EngineError, EngineResult};
    pub use crate::plan::{ExecutionPlan, LayerDependency};
    pub use crate::scheduler::{
        ExecMode, ForwardScheduler, KernelContext, LayerKernel, NoopKernel, optimal_batch,
    };
}
