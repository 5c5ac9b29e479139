//! Forward-pass scheduler: walks the layer plan under a memory ceiling,
//! acquiring weights from the mapped model, allocating activation outputs
//! just-in-time and discarding them as soon as no successor needs them.

use core::ptr::NonNull;
use std::sync::Arc;

use tracing::trace;

use tinyinfer_memory::config::UsagePattern;
use tinyinfer_memory::tensor::SimdPolicy;
use tinyinfer_memory::thread_safe::ThreadSafePool;
use tinyinfer_model::cache::MappedModel;

use crate::error::{EngineError, EngineResult, KernelError};
use crate::plan::{ExecutionPlan, LayerDependency};

/// Execution mode of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Keep weights and activations resident for the whole pass.
    #[default]
    Normal,
    /// Acquire weights per layer and free dead activations eagerly.
    MemoryOpt,
    /// Like normal, but intended for token-at-a-time decoding loops.
    Streaming,
    /// Reserved for a self-tuning policy; currently identical to
    /// [`ExecMode::MemoryOpt`].
    Adaptive,
}

impl ExecMode {
    /// Whether this mode acquires weights per tick and sweeps dead
    /// activations. Adaptive shares the memory-opt path until it grows a
    /// policy of its own.
    #[must_use]
    pub fn manages_memory(self) -> bool {
        matches!(self, ExecMode::MemoryOpt | ExecMode::Adaptive)
    }
}

/// Everything a kernel gets to see for one layer invocation.
pub struct KernelContext<'a> {
    /// Model layer being executed.
    pub layer_id: u32,
    /// Raw (still packed) weight bytes, when the mode manages weights.
    pub weights: Option<&'a [u8]>,
    /// The dependency's output, or the caller-supplied pass input.
    pub input: Option<&'a [u8]>,
    /// The layer's activation output buffer.
    pub output: Option<&'a mut [u8]>,
    /// Vector capability to select kernel variants with.
    pub simd: SimdPolicy,
}

/// The numeric collaborator. The scheduler treats it as opaque and surfaces
/// its errors verbatim.
pub trait LayerKernel: Send + Sync {
    fn execute(&self, ctx: KernelContext<'_>) -> Result<(), KernelError>;
}

/// Reference stub used when no kernel is wired in; it touches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopKernel;

impl LayerKernel for NoopKernel {
    fn execute(&self, _ctx: KernelContext<'_>) -> Result<(), KernelError> {
        Ok(())
    }
}

/// Batch size fitting the ceiling:
/// `clamp((max_memory − weights − intermediate) / per_sample, 1, max_batch)`,
/// where `max_memory == 0` means uncapped.
#[must_use]
pub fn optimal_batch(
    max_memory: usize,
    weights_bytes: usize,
    intermediate_bytes: usize,
    per_sample: usize,
    max_batch: usize,
) -> usize {
    if max_batch == 0 {
        return 0;
    }
    if max_memory == 0 || per_sample == 0 {
        return max_batch;
    }
    let available = max_memory.saturating_sub(weights_bytes + intermediate_bytes);
    (available / per_sample).clamp(1, max_batch)
}

/// Dependency-driven executor over one [`ExecutionPlan`].
pub struct ForwardScheduler {
    model: Arc<MappedModel>,
    pool: Arc<ThreadSafePool>,
    kernel: Box<dyn LayerKernel>,
    simd: SimdPolicy,
    mode: ExecMode,
    max_memory: usize,
    current_bytes: usize,
    peak_bytes: usize,
    current_layer: Option<usize>,
    plan: ExecutionPlan,
}

impl ForwardScheduler {
    /// Create a scheduler with the no-op reference kernel.
    #[must_use]
    pub fn new(
        model: Arc<MappedModel>,
        pool: Arc<ThreadSafePool>,
        mode: ExecMode,
        max_memory: usize,
    ) -> Self {
        Self::with_kernel(model, pool, mode, max_memory, Box::new(NoopKernel))
    }

    /// Create a scheduler driving a real kernel.
    #[must_use]
    pub fn with_kernel(
        model: Arc<MappedModel>,
        pool: Arc<ThreadSafePool>,
        mode: ExecMode,
        max_memory: usize,
        kernel: Box<dyn LayerKernel>,
    ) -> Self {
        Self {
            model,
            pool,
            kernel,
            simd: SimdPolicy::detect(),
            mode,
            max_memory,
            current_bytes: 0,
            peak_bytes: 0,
            current_layer: None,
            plan: ExecutionPlan::new(),
        }
    }

    /// Override the detected SIMD policy.
    pub fn set_simd(&mut self, simd: SimdPolicy) {
        self.simd = simd;
    }

    /// Append a layer to the plan. Residual/attention targets must lie
    /// inside the plan built so far.
    pub fn push_layer(
        &mut self,
        id: u32,
        dependency: LayerDependency,
        output_bytes: usize,
    ) -> EngineResult<usize> {
        self.plan.push_layer(id, dependency, output_bytes)
    }

    /// Reset the pass: clear executed/needed flags and release every held
    /// output buffer.
    pub fn prepare(&mut self) -> EngineResult<()> {
        let mut released = 0;
        for layer in self.plan.layers_mut() {
            if let Some(addr) = layer.output_addr.take() {
                let ptr = NonNull::new(addr as *mut u8).expect("plan holds non-null addrs");
                self.pool.free(ptr)?;
                released += layer.output_bytes;
            }
            layer.executed = false;
            layer.output_needed = false;
        }
        self.current_bytes = self.current_bytes.saturating_sub(released);
        debug_assert_eq!(self.current_bytes, 0);
        self.current_bytes = 0;
        self.peak_bytes = 0;
        self.current_layer = None;
        Ok(())
    }

    /// Execute the next executable layer.
    ///
    /// Returns `Ok(false)`, with no side effect, when no unexecuted layer
    /// has its dependency satisfied. On the final plan entry the layer
    /// output is copied into `output` when one is supplied.
    pub fn execute_next(
        &mut self,
        input: Option<&[u8]>,
        output: Option<&mut [u8]>,
    ) -> EngineResult<bool> {
        let Some(index) = self.plan.next_executable() else {
            return Ok(false);
        };
        let (layer_id, output_bytes) = {
            let layer = &self.plan.layers()[index];
            (layer.id, layer.output_bytes)
        };
        trace!(index, layer_id, "executing layer");

        // Weights are acquired only in the memory-managed modes; the guard
        // drop at the end of this tick is the release.
        let weights_guard = if self.mode.manages_memory() {
            Some(self.model.acquire(layer_id as usize)?)
        } else {
            None
        };

        // Just-in-time activation allocation under the ceiling.
        if output_bytes > 0 && !self.plan.layers()[index].has_output() {
            if self.max_memory > 0 && self.current_bytes + output_bytes > self.max_memory {
                return Err(EngineError::OutOfMemory {
                    needed: self.current_bytes + output_bytes,
                    cap: self.max_memory,
                });
            }
            let ptr = self
                .pool
                .alloc(output_bytes, self.simd.alignment(), UsagePattern::Activations)?;
            let layer = &mut self.plan.layers_mut()[index];
            layer.output_addr = Some(ptr.as_ptr() as usize);
            layer.output_needed = true;
            self.current_bytes += output_bytes;
            if self.current_bytes > self.peak_bytes {
                self.peak_bytes = self.current_bytes;
            }
        }

        // Invoke the opaque kernel.
        let input_span = self.dependency_input(index);
        let output_span = {
            let layer = &self.plan.layers()[index];
            layer.output_addr.map(|addr| (addr, layer.output_bytes))
        };
        {
            // SAFETY: both spans point into live pool allocations that are
            // exclusively owned by this scheduler; a layer never feeds its
            // own output buffer, so the slices cannot alias.
            let input_slice = input_span
                .map(|(addr, len)| unsafe {
                    std::slice::from_raw_parts(addr as *const u8, len)
                })
                .or(input);
            let output_slice = output_span.map(|(addr, len)| unsafe {
                std::slice::from_raw_parts_mut(addr as *mut u8, len)
            });
            let ctx = KernelContext {
                layer_id,
                weights: weights_guard.as_deref(),
                input: input_slice,
                output: output_slice,
                simd: self.simd,
            };
            self.kernel
                .execute(ctx)
                .map_err(|source| EngineError::Kernel {
                    layer: layer_id,
                    source,
                })?;
        }
        drop(weights_guard);

        self.plan.layers_mut()[index].executed = true;
        self.current_layer = Some(index);

        // Drop activations no future layer reads. The entry executed this
        // tick is exempt so a trailing copy-out still sees its bytes.
        if self.mode.manages_memory() {
            self.sweep_dead_outputs(index)?;
        }

        if index == self.plan.len() - 1 {
            if let (Some(out), Some((addr, len))) = (output, output_span) {
                let copy = out.len().min(len);
                // SAFETY: the output buffer is still held by this entry
                // (exempt from the sweep above).
                unsafe {
                    std::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), copy);
                }
            }
        }

        Ok(true)
    }

    /// Run the whole plan, returning the number of executed layers.
    pub fn run(
        &mut self,
        input: Option<&[u8]>,
        mut output: Option<&mut [u8]>,
    ) -> EngineResult<usize> {
        let mut executed = 0;
        while self.execute_next(input, output.as_deref_mut())? {
            executed += 1;
        }
        Ok(executed)
    }

    /// Batch size that fits the ceiling next to the resident weights and
    /// the plan's intermediate activations.
    #[must_use]
    pub fn optimal_batch_size(
        &self,
        input_bytes: usize,
        output_bytes: usize,
        max_batch: usize,
    ) -> usize {
        let intermediate: usize = self.plan.layers().iter().map(|l| l.output_bytes).sum();
        optimal_batch(
            self.max_memory,
            self.model.memory_usage(),
            intermediate,
            input_bytes + output_bytes,
            max_batch,
        )
    }

    /// Live activation bytes.
    #[must_use]
    pub fn current_memory_usage(&self) -> usize {
        self.current_bytes
    }

    /// High-water mark of live activation bytes in this pass.
    #[must_use]
    pub fn peak_memory_usage(&self) -> usize {
        self.peak_bytes
    }

    /// Configured ceiling; 0 means uncapped.
    #[must_use]
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Mode of this scheduler.
    #[must_use]
    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Index of the most recently executed plan entry.
    #[must_use]
    pub fn current_layer(&self) -> Option<usize> {
        self.current_layer
    }

    /// The plan, inspectable also after a halted pass.
    #[must_use]
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Where this layer reads from: its dependency's output when present.
    fn dependency_input(&self, index: usize) -> Option<(usize, usize)> {
        let source = match self.plan.layers()[index].dependency {
            LayerDependency::None => return None,
            LayerDependency::Sequential => index.checked_sub(1)?,
            LayerDependency::Residual { target } | LayerDependency::Attention { target } => target,
        };
        let layer = &self.plan.layers()[source];
        layer.output_addr.map(|addr| (addr, layer.output_bytes))
    }

    fn sweep_dead_outputs(&mut self, current: usize) -> EngineResult<()> {
        let victims: Vec<usize> = (0..self.plan.len())
            .filter(|&j| {
                j != current
                    && self.plan.layers()[j].executed
                    && self.plan.layers()[j].has_output()
                    && !self.plan.has_future_consumer(j)
            })
            .collect();
        for j in victims {
            let layer = &mut self.plan.layers_mut()[j];
            let addr = layer.output_addr.take().expect("filtered on has_output");
            layer.output_needed = false;
            let bytes = layer.output_bytes;
            let ptr = NonNull::new(addr as *mut u8).expect("plan holds non-null addrs");
            self.pool.free(ptr)?;
            self.current_bytes = self.current_bytes.saturating_sub(bytes);
            trace!(index = j, bytes, "released dead activation");
        }
        Ok(())
    }
}

impl Drop for ForwardScheduler {
    fn drop(&mut self) {
        for layer in self.plan.layers_mut() {
            if let Some(addr) = layer.output_addr.take() {
                if let Some(ptr) = NonNull::new(addr as *mut u8) {
                    // Best-effort; a poisoned pool at teardown is not
                    // recoverable from here.
                    let _ = self.pool.free(ptr);
                }
            }
        }
    }
}

impl core::fmt::Debug for ForwardScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ForwardScheduler")
            .field("mode", &self.mode)
            .field("plan_len", &self.plan.len())
            .field("current_bytes", &self.current_bytes)
            .field("peak_bytes", &self.peak_bytes)
            .field("max_memory", &self.max_memory)
            .finish()
    }
}
