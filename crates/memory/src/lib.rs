//! # tinyinfer-memory
//!
//! Hierarchical, size-classed memory pool for running quantized models on
//! hosts where the model is measured in gigabytes and the budget in
//! megabytes.
//!
//! The crate provides:
//! - Region arenas with free-list coalescing and fragmentation tracking
//! - Size-classed pools segregated by usage (weights / activations / general)
//! - A hierarchical front end with an O(1) pointer cache and pressure
//!   reporting
//! - SIMD-aligned specialized allocators for packed 4-bit weights and f32
//!   activations
//! - A read-only allocation analyzer (rates, lifetimes, trends, leaks)
//!
//! ## Quick Start
//!
//! ```rust
//! use tinyinfer_memory::prelude::*;
//!
//! # fn main() -> MemoryResult<()> {
//! let mut pool = HierarchicalPool::new(PoolConfig::default())?;
//! let ptr = pool.alloc(1024, 16, UsagePattern::Activations)?;
//! // ... hand the buffer to a kernel ...
//! pool.free(ptr)?;
//! # Ok(())
//! # }
//! ```
//!
//! Buffers are exclusively owned by the caller between `alloc` and `free`;
//! the pool never relocates a live payload.

// Handing out raw payload pointers is this crate's contract; opt out of the
// workspace-wide `unsafe_code` warn.
#![allow(unsafe_code)]

pub mod analyzer;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod pool;
pub mod region;
pub mod tensor;
pub mod thread_safe;
pub mod utils;

pub use crate::config::{ClassConfig, PoolConfig, SizeClass, UsagePattern};
pub use crate::error::{MemoryError, MemoryResult};
pub use crate::hierarchy::{HierarchicalPool, MemoryStats};
pub use crate::thread_safe::ThreadSafePool;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::analyzer::{AllocationAnalyzer, AnalyzerConfig, AnalyzerReport};
    pub use crate::config::{ClassConfig, PoolConfig, SizeClass, UsagePattern};
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::hierarchy::{HierarchicalPool, MemoryStats, TensorRole};
    pub use crate::tensor::{SimdPolicy, TensorAllocator};
    pub use crate::thread_safe::ThreadSafePool;
}
