//! Mutex wrapper giving the hierarchical pool a shared-reference API.
//!
//! The lock discipline is a single pool-wide mutex: every public operation
//! acquires it once and the layers below (class pools, regions) are entered
//! only while it is held, so lock order is always hierarchy → pool → region
//! with no reverse edges.

use core::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::analyzer::AllocationAnalyzer;
use crate::config::{PoolConfig, UsagePattern};
use crate::error::MemoryResult;
use crate::hierarchy::{HierarchicalPool, MemoryStats, PressureCallback, TensorRole};

/// Thread-safe façade over [`HierarchicalPool`].
pub struct ThreadSafePool {
    inner: Mutex<HierarchicalPool>,
}

impl ThreadSafePool {
    /// Create a pool guarded by one pool-wide mutex.
    pub fn new(config: PoolConfig) -> MemoryResult<Self> {
        Ok(Self {
            inner: Mutex::new(HierarchicalPool::new(config)?),
        })
    }

    /// See [`HierarchicalPool::alloc`].
    pub fn alloc(
        &self,
        size: usize,
        align: usize,
        usage: UsagePattern,
    ) -> MemoryResult<NonNull<u8>> {
        self.inner.lock().alloc(size, align, usage)
    }

    /// See [`HierarchicalPool::free`].
    pub fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        self.inner.lock().free(ptr)
    }

    /// See [`HierarchicalPool::realloc`].
    pub fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> MemoryResult<NonNull<u8>> {
        self.inner.lock().realloc(ptr, new_size)
    }

    /// See [`HierarchicalPool::optimize`].
    pub fn optimize(&self) -> MemoryResult<()> {
        self.inner.lock().optimize()
    }

    /// See [`HierarchicalPool::compact`].
    pub fn compact(&self) {
        self.inner.lock().compact();
    }

    /// See [`HierarchicalPool::pressure`].
    pub fn pressure(&self) -> u8 {
        self.inner.lock().pressure()
    }

    /// See [`HierarchicalPool::set_pressure_callback`].
    pub fn set_pressure_callback(&self, callback: PressureCallback) {
        self.inner.lock().set_pressure_callback(callback);
    }

    /// See [`HierarchicalPool::attach_analyzer`].
    pub fn attach_analyzer(&self, analyzer: Arc<AllocationAnalyzer>) {
        self.inner.lock().attach_analyzer(analyzer);
    }

    /// See [`HierarchicalPool::register_tensor_op`].
    pub fn register_tensor_op(
        &self,
        name: impl Into<String>,
        input_sizes: &[usize],
        output_sizes: &[usize],
    ) {
        self.inner
            .lock()
            .register_tensor_op(name, input_sizes, output_sizes);
    }

    /// See [`HierarchicalPool::tensor_op_buffer`].
    pub fn tensor_op_buffer(
        &self,
        op: &str,
        role: TensorRole,
        index: usize,
    ) -> MemoryResult<NonNull<u8>> {
        self.inner.lock().tensor_op_buffer(op, role, index)
    }

    /// See [`HierarchicalPool::unregister_tensor_op`].
    pub fn unregister_tensor_op(&self, op: &str) -> MemoryResult<()> {
        self.inner.lock().unregister_tensor_op(op)
    }

    /// See [`HierarchicalPool::payload_size`].
    pub fn payload_size(&self, ptr: NonNull<u8>) -> MemoryResult<usize> {
        self.inner.lock().payload_size(ptr)
    }

    /// See [`HierarchicalPool::stats`].
    pub fn stats(&self) -> MemoryStats {
        self.inner.lock().stats()
    }

    /// Run a closure under the pool lock, for multi-step invariants.
    pub fn with<R>(&self, f: impl FnOnce(&mut HierarchicalPool) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl core::fmt::Debug for ThreadSafePool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadSafePool").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_alloc_free() {
        let pool = Arc::new(
            ThreadSafePool::new(PoolConfig {
                alloc_pattern: None,
                dealloc_pattern: None,
                ..PoolConfig::default()
            })
            .unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let size = 64 + (t * 97 + i * 13) % 4000;
                        let ptr = pool.alloc(size, 16, UsagePattern::General).unwrap();
                        unsafe { std::ptr::write_bytes(ptr.as_ptr(), t as u8, size) };
                        pool.free(ptr).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.stats().total_used, 0);
    }
}
