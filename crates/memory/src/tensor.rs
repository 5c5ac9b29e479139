//! Specialized tensor allocators: thin adapters over the hierarchical pool
//! that enforce SIMD alignment and compute packed 4-bit byte counts.

use core::ptr::NonNull;
use std::sync::Arc;

use crate::config::UsagePattern;
use crate::error::{MemoryError, MemoryResult};
use crate::thread_safe::ThreadSafePool;
use crate::utils::{checked_add, checked_mul};

/// Runtime SIMD capability, passed to allocators and kernels instead of a
/// process-wide flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimdPolicy {
    simd: bool,
}

impl SimdPolicy {
    /// Force SIMD alignment on or off.
    #[must_use]
    pub const fn new(simd: bool) -> Self {
        Self { simd }
    }

    /// Probe the host for vector support.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            Self::new(std::arch::is_x86_feature_detected!("avx2"))
        }
        #[cfg(target_arch = "aarch64")]
        {
            // NEON is baseline on aarch64.
            Self::new(true)
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
        {
            Self::new(false)
        }
    }

    /// Whether vector kernels should be selected.
    #[must_use]
    pub const fn enabled(self) -> bool {
        self.simd
    }

    /// Payload alignment for tensor buffers: 32 bytes for SIMD loads,
    /// 16 otherwise.
    #[must_use]
    pub const fn alignment(self) -> usize {
        if self.simd { 32 } else { 16 }
    }
}

/// Bytes needed for a packed 4-bit `rows × cols` matrix: two values per
/// byte, rounded up.
pub fn packed4_bytes(rows: usize, cols: usize) -> MemoryResult<usize> {
    if rows == 0 || cols == 0 {
        return Err(MemoryError::invalid_argument("empty weight matrix"));
    }
    let elements = checked_mul(rows, cols, "rows * cols")?;
    Ok(checked_add(elements, 1, "packed length")? / 2)
}

/// Bytes needed for `count` f32 activations.
pub fn activation_bytes(count: usize) -> MemoryResult<usize> {
    if count == 0 {
        return Err(MemoryError::invalid_argument("empty activation tensor"));
    }
    checked_mul(count, core::mem::size_of::<f32>(), "count * 4")
}

/// Adapter that routes weight and activation buffers through the pool with
/// the SIMD alignment the policy dictates.
#[derive(Debug, Clone)]
pub struct TensorAllocator {
    pool: Arc<ThreadSafePool>,
    simd: SimdPolicy,
}

impl TensorAllocator {
    /// Bind an allocator to a pool under the given SIMD policy.
    #[must_use]
    pub fn new(pool: Arc<ThreadSafePool>, simd: SimdPolicy) -> Self {
        Self { pool, simd }
    }

    /// The policy in effect.
    #[must_use]
    pub fn simd(&self) -> SimdPolicy {
        self.simd
    }

    /// Allocate a packed 4-bit `rows × cols` weight matrix.
    pub fn alloc_weights_4bit(&self, rows: usize, cols: usize) -> MemoryResult<NonNull<u8>> {
        let bytes = packed4_bytes(rows, cols)?;
        self.pool
            .alloc(bytes, self.simd.alignment(), UsagePattern::Weights)
    }

    /// Allocate `count` f32 activations.
    pub fn alloc_activations(&self, count: usize) -> MemoryResult<NonNull<u8>> {
        let bytes = activation_bytes(count)?;
        self.pool
            .alloc(bytes, self.simd.alignment(), UsagePattern::Activations)
    }

    /// Release a buffer obtained from this allocator.
    pub fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        self.pool.free(ptr)
    }
}
