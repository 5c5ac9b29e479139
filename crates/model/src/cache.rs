//! File-backed layer store with on-demand paging and priority-aware
//! eviction.
//!
//! The model file stays open for the lifetime of the store, either memory
//! mapped or read with positioned I/O. Layer bytes are cached in owned
//! buffers under a byte budget; guards returned by [`MappedModel::acquire`]
//! hold their layer active, and active layers are never evicted. All file
//! I/O happens with the cache mutex released; concurrent requests for the
//! same unloaded layer coalesce into a single load through the condvar.

use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{ModelError, ModelResult};
use crate::format::{
    DESCRIPTOR_SIZE, HEADER_SIZE, LayerDescriptor, ModelHeader, Precision,
};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct ModelCacheConfig {
    /// Byte budget for cached layer buffers; 0 means unbounded.
    pub max_cache_bytes: usize,
    /// Map the file instead of using positioned reads.
    pub use_mmap: bool,
    /// Honor prefetch requests (they may still be dropped under pressure).
    pub prefetch_enabled: bool,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 64 * 1024 * 1024,
            use_mmap: true,
            prefetch_enabled: true,
        }
    }
}

/// Cache lifecycle of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

impl LayerState {
    fn can_transition(self, to: LayerState) -> bool {
        matches!(
            (self, to),
            (LayerState::Unloaded, LayerState::Loading)
                | (LayerState::Loading, LayerState::Loaded)
                | (LayerState::Loading, LayerState::Unloaded)
                | (LayerState::Loaded, LayerState::Unloading)
                | (LayerState::Unloading, LayerState::Unloaded)
        )
    }
}

/// Mutable runtime companion of an immutable descriptor.
#[derive(Debug)]
struct LayerRuntime {
    state: LayerState,
    bytes: Option<Arc<[u8]>>,
    active: u32,
    priority: f32,
    last_tick: u64,
    access_count: u64,
}

impl LayerRuntime {
    fn new() -> Self {
        Self {
            state: LayerState::Unloaded,
            bytes: None,
            active: 0,
            priority: 1.0,
            last_tick: 0,
            access_count: 0,
        }
    }

    fn transition(&mut self, to: LayerState) {
        debug_assert!(
            self.state.can_transition(to),
            "invalid layer state transition {:?} -> {to:?}",
            self.state
        );
        self.state = to;
    }

    /// Eviction key: priority scaled by a monotone recency-frequency score.
    /// Lower keys are evicted first.
    fn eviction_key(&self, tick: u64) -> f64 {
        let age = tick.saturating_sub(self.last_tick) as f64;
        f64::from(self.priority) * (self.access_count as f64 / (age + 1.0))
    }
}

enum Backing {
    Mapped(Mmap),
    Read(File),
}

struct CacheState {
    layers: Vec<LayerRuntime>,
    cached_bytes: usize,
    tick: u64,
}

/// Cache-level counters for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCacheStats {
    pub cached_bytes: usize,
    pub budget: usize,
    pub cached_layers: usize,
    pub active_layers: usize,
}

/// A model file with its layer cache.
pub struct MappedModel {
    header: ModelHeader,
    descriptors: Vec<LayerDescriptor>,
    backing: Backing,
    config: ModelCacheConfig,
    inner: Mutex<CacheState>,
    loaded_cv: Condvar,
}

/// Borrowed view of one cached layer's bytes.
///
/// The guard keeps its layer active; drop it to let the cache evict the
/// layer again. The bytes stay valid for the guard's whole lifetime even if
/// an eviction round runs in between.
#[derive(Debug)]
pub struct LayerGuard<'a> {
    model: &'a MappedModel,
    index: usize,
    bytes: Arc<[u8]>,
}

impl LayerGuard<'_> {
    /// Index of the layer this guard pins.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for LayerGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for LayerGuard<'_> {
    fn drop(&mut self) {
        self.model.release(self.index);
    }
}

impl MappedModel {
    /// Open a model file, parse header and descriptor table, and prepare
    /// the payload backing.
    pub fn open(path: impl AsRef<Path>, config: ModelCacheConfig) -> ModelResult<Self> {
        let file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();

        let mut header_bytes = [0u8; HEADER_SIZE];
        read_exact_at(&file, &mut header_bytes, 0)?;
        let header = ModelHeader::decode(&header_bytes)?;

        let count = header.layer_count as usize;
        let mut table = vec![0u8; count * DESCRIPTOR_SIZE];
        read_exact_at(&file, &mut table, HEADER_SIZE as u64)?;

        let mut descriptors = Vec::with_capacity(count);
        for index in 0..count {
            let descriptor =
                LayerDescriptor::decode(index as u32, &table[index * DESCRIPTOR_SIZE..])?;
            let end = u64::from(descriptor.offset) + u64::from(descriptor.size);
            if end > file_len {
                return Err(ModelError::weight_load(format!(
                    "layer {index} spans {end} bytes of a {file_len} byte file"
                )));
            }
            descriptors.push(descriptor);
        }

        let backing = if config.use_mmap {
            // SAFETY: the file is opened read-only and the mapping is never
            // written through. Out-of-band truncation of the model file
            // while mapped is outside the store's contract.
            let map = unsafe { Mmap::map(&file)? };
            Backing::Mapped(map)
        } else {
            Backing::Read(file)
        };

        debug!(
            name = %header.name,
            layers = count,
            mmap = config.use_mmap,
            budget = config.max_cache_bytes,
            "opened model"
        );

        Ok(Self {
            header,
            descriptors,
            backing,
            config,
            inner: Mutex::new(CacheState {
                layers: (0..count).map(|_| LayerRuntime::new()).collect(),
                cached_bytes: 0,
                tick: 0,
            }),
            loaded_cv: Condvar::new(),
        })
    }

    /// Parsed header.
    #[must_use]
    pub fn header(&self) -> &ModelHeader {
        &self.header
    }

    /// Number of layers in the file.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Immutable descriptor of one layer.
    pub fn descriptor(&self, index: usize) -> ModelResult<&LayerDescriptor> {
        self.descriptors.get(index).ok_or_else(|| {
            ModelError::invalid_argument(format!(
                "layer {index} out of range ({} layers)",
                self.descriptors.len()
            ))
        })
    }

    /// Acquire a layer's bytes, loading and evicting as needed.
    ///
    /// The returned guard holds the layer active until dropped.
    pub fn acquire(&self, index: usize) -> ModelResult<LayerGuard<'_>> {
        let descriptor = *self.descriptor(index)?;
        let mut state = self.inner.lock();

        loop {
            match state.layers[index].state {
                LayerState::Loaded => {
                    state.tick += 1;
                    let tick = state.tick;
                    let rt = &mut state.layers[index];
                    rt.active += 1;
                    rt.access_count += 1;
                    rt.last_tick = tick;
                    let bytes = rt.bytes.clone().expect("loaded layer has bytes");
                    return Ok(LayerGuard {
                        model: self,
                        index,
                        bytes,
                    });
                }
                // Another caller is reading the same layer; coalesce.
                LayerState::Loading | LayerState::Unloading => {
                    self.loaded_cv.wait(&mut state);
                }
                LayerState::Unloaded => {
                    state.layers[index].transition(LayerState::Loading);
                    drop(state);
                    let loaded = self.read_layer_bytes(&descriptor);
                    state = self.inner.lock();

                    let bytes = match loaded {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            state.layers[index].transition(LayerState::Unloaded);
                            self.loaded_cv.notify_all();
                            return Err(err);
                        }
                    };

                    if let Err(err) = Self::evict_for(
                        &mut state,
                        bytes.len(),
                        self.config.max_cache_bytes,
                    ) {
                        state.layers[index].transition(LayerState::Unloaded);
                        self.loaded_cv.notify_all();
                        return Err(err);
                    }

                    state.tick += 1;
                    let tick = state.tick;
                    state.cached_bytes += bytes.len();
                    let rt = &mut state.layers[index];
                    rt.bytes = Some(Arc::clone(&bytes));
                    rt.transition(LayerState::Loaded);
                    rt.active += 1;
                    rt.access_count += 1;
                    rt.last_tick = tick;
                    self.loaded_cv.notify_all();
                    trace!(layer = index, bytes = bytes.len(), "layer loaded");
                    return Ok(LayerGuard {
                        model: self,
                        index,
                        bytes,
                    });
                }
            }
        }
    }

    /// [`MappedModel::acquire`] with a precision check; refuses mismatched
    /// layers instead of converting.
    pub fn acquire_as(&self, index: usize, precision: Precision) -> ModelResult<LayerGuard<'_>> {
        let found = self.descriptor(index)?.precision;
        if found != precision {
            return Err(ModelError::PrecisionMismatch {
                expected: precision.bits(),
                found: found.bits(),
            });
        }
        self.acquire(index)
    }

    /// Prime a layer's bytes without holding it active. Silently ignored
    /// when prefetch is disabled, the layer is already resident, or the
    /// budget has no room.
    pub fn prefetch(&self, index: usize) -> ModelResult<()> {
        if !self.config.prefetch_enabled {
            return Ok(());
        }
        let descriptor = *self.descriptor(index)?;
        let size = descriptor.size as usize;

        {
            let mut state = self.inner.lock();
            match state.layers[index].state {
                // Idempotent on anything already resident or in flight.
                LayerState::Loaded | LayerState::Loading | LayerState::Unloading => {
                    return Ok(());
                }
                LayerState::Unloaded => {}
            }
            let budget = self.config.max_cache_bytes;
            if budget != 0 && state.cached_bytes + size > budget {
                trace!(layer = index, "prefetch dropped under pressure");
                return Ok(());
            }
            state.layers[index].transition(LayerState::Loading);
        }

        let loaded = self.read_layer_bytes(&descriptor);
        let mut state = self.inner.lock();
        match loaded {
            Ok(bytes) => {
                // Pressure may have built while reading; drop the prefetch
                // rather than evicting on its behalf.
                let budget = self.config.max_cache_bytes;
                if budget != 0 && state.cached_bytes + bytes.len() > budget {
                    state.layers[index].transition(LayerState::Unloaded);
                } else {
                    state.tick += 1;
                    let tick = state.tick;
                    state.cached_bytes += bytes.len();
                    let rt = &mut state.layers[index];
                    rt.bytes = Some(bytes);
                    rt.transition(LayerState::Loaded);
                    rt.last_tick = tick;
                }
                self.loaded_cv.notify_all();
                Ok(())
            }
            Err(err) => {
                state.layers[index].transition(LayerState::Unloaded);
                self.loaded_cv.notify_all();
                Err(err)
            }
        }
    }

    /// Bias a layer's survival in eviction rounds. Higher keeps it longer.
    pub fn set_priority(&self, index: usize, priority: f32) -> ModelResult<()> {
        self.descriptor(index)?;
        self.inner.lock().layers[index].priority = priority;
        Ok(())
    }

    /// Whether a layer's bytes are currently resident.
    pub fn is_cached(&self, index: usize) -> bool {
        self.inner
            .lock()
            .layers
            .get(index)
            .is_some_and(|rt| rt.state == LayerState::Loaded)
    }

    /// Bytes currently held by the cache.
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().cached_bytes
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> ModelCacheStats {
        let state = self.inner.lock();
        ModelCacheStats {
            cached_bytes: state.cached_bytes,
            budget: self.config.max_cache_bytes,
            cached_layers: state
                .layers
                .iter()
                .filter(|rt| rt.state == LayerState::Loaded)
                .count(),
            active_layers: state.layers.iter().filter(|rt| rt.active > 0).count(),
        }
    }

    /// Drop every inactive cached layer.
    pub fn clear_cache(&self) {
        let mut state = self.inner.lock();
        let mut released = 0;
        for rt in &mut state.layers {
            if rt.state == LayerState::Loaded && rt.active == 0 {
                released += rt.bytes.take().map_or(0, |b| b.len());
                rt.transition(LayerState::Unloading);
                rt.transition(LayerState::Unloaded);
            }
        }
        state.cached_bytes -= released;
    }

    fn release(&self, index: usize) {
        let mut state = self.inner.lock();
        let rt = &mut state.layers[index];
        debug_assert!(rt.active > 0, "release without a matching acquire");
        rt.active = rt.active.saturating_sub(1);
    }

    /// Make room for `incoming` bytes by evicting inactive layers in
    /// ascending priority·recency-frequency order; ties fall to the lower
    /// access count, then the older tick.
    fn evict_for(
        state: &mut CacheState,
        incoming: usize,
        budget: usize,
    ) -> ModelResult<()> {
        if budget == 0 {
            return Ok(());
        }
        if incoming > budget {
            return Err(ModelError::CacheFull {
                needed: incoming,
                budget,
            });
        }
        if state.cached_bytes + incoming <= budget {
            return Ok(());
        }

        let tick = state.tick;
        let mut candidates: Vec<usize> = state
            .layers
            .iter()
            .enumerate()
            .filter(|(_, rt)| rt.state == LayerState::Loaded && rt.active == 0)
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by(|&a, &b| {
            let (ra, rb) = (&state.layers[a], &state.layers[b]);
            ra.eviction_key(tick)
                .partial_cmp(&rb.eviction_key(tick))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(ra.access_count.cmp(&rb.access_count))
                .then(ra.last_tick.cmp(&rb.last_tick))
        });

        for index in candidates {
            if state.cached_bytes + incoming <= budget {
                break;
            }
            let rt = &mut state.layers[index];
            let len = rt.bytes.take().map_or(0, |b| b.len());
            rt.transition(LayerState::Unloading);
            rt.transition(LayerState::Unloaded);
            state.cached_bytes -= len;
            debug!(layer = index, bytes = len, "evicted layer");
        }

        if state.cached_bytes + incoming > budget {
            warn!(
                incoming,
                cached = state.cached_bytes,
                budget,
                "cache full: nothing left to evict"
            );
            return Err(ModelError::CacheFull {
                needed: incoming,
                budget,
            });
        }
        Ok(())
    }

    fn read_layer_bytes(&self, descriptor: &LayerDescriptor) -> ModelResult<Arc<[u8]>> {
        let start = descriptor.offset as usize;
        let len = descriptor.size as usize;
        match &self.backing {
            Backing::Mapped(map) => {
                let slice = map.get(start..start + len).ok_or_else(|| {
                    ModelError::weight_load(format!(
                        "layer {} outside mapped range",
                        descriptor.index
                    ))
                })?;
                Ok(Arc::from(slice))
            }
            Backing::Read(file) => {
                let mut buf = vec![0u8; len];
                read_exact_at(file, &mut buf, u64::from(descriptor.offset))?;
                Ok(Arc::from(buf))
            }
        }
    }
}

impl core::fmt::Debug for MappedModel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MappedModel")
            .field("name", &self.header.name)
            .field("layers", &self.descriptors.len())
            .field("cached_bytes", &self.memory_usage())
            .finish()
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short positioned read",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ModelFileBuilder;
    use std::io::Write;

    fn model_file(layers: usize, layer_bytes: usize) -> tempfile::NamedTempFile {
        let mut builder = ModelFileBuilder::new("test-model");
        for i in 0..layers {
            // First byte identifies the layer, the rest is a fill pattern.
            let mut payload = vec![(i & 0xFF) as u8; layer_bytes];
            if layer_bytes > 1 {
                payload[layer_bytes - 1] = 0xEE;
            }
            builder = builder.layer(Precision::Bits4, payload);
        }
        let bytes = builder.build().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn open(
        file: &tempfile::NamedTempFile,
        budget: usize,
        use_mmap: bool,
    ) -> MappedModel {
        MappedModel::open(
            file.path(),
            ModelCacheConfig {
                max_cache_bytes: budget,
                use_mmap,
                prefetch_enabled: true,
            },
        )
        .unwrap()
    }

    #[test]
    fn bytes_match_file_contents() {
        let file = model_file(4, 1024);
        for use_mmap in [true, false] {
            let model = open(&file, 0, use_mmap);
            for i in 0..4 {
                let guard = model.acquire(i).unwrap();
                assert_eq!(guard.len(), 1024);
                assert_eq!(guard[0], i as u8);
                assert_eq!(guard[1023], 0xEE);
            }
        }
    }

    #[test]
    fn state_machine_loads_once() {
        let file = model_file(2, 256);
        let model = open(&file, 0, true);
        assert!(!model.is_cached(0));
        let a = model.acquire(0).unwrap();
        assert!(model.is_cached(0));
        let b = model.acquire(0).unwrap();
        assert_eq!(model.memory_usage(), 256, "coalesced, not duplicated");
        drop(a);
        drop(b);
        assert!(model.is_cached(0), "release keeps bytes cached");
    }

    #[test]
    fn eviction_respects_active_guards() {
        let file = model_file(4, 1000);
        // Budget fits two layers.
        let model = open(&file, 2000, true);
        let held = model.acquire(0).unwrap();
        let _ = model.acquire(1).unwrap(); // dropped immediately
        let _ = model.acquire(2).unwrap(); // evicts layer 1
        assert!(model.memory_usage() <= 2000);
        assert!(model.is_cached(0), "active layer must survive eviction");
        drop(held);
    }

    #[test]
    fn cache_full_when_everything_is_active() {
        let file = model_file(3, 1000);
        let model = open(&file, 2000, true);
        let _a = model.acquire(0).unwrap();
        let _b = model.acquire(1).unwrap();
        let err = model.acquire(2).unwrap_err();
        assert!(matches!(err, ModelError::CacheFull { .. }));
        assert!(err.is_retryable());
        // Dropping a guard makes the same request succeed.
        drop(_a);
        assert!(model.acquire(2).is_ok());
    }

    #[test]
    fn layer_larger_than_budget_fails_fast() {
        let file = model_file(1, 4096);
        let model = open(&file, 1024, true);
        assert!(matches!(
            model.acquire(0),
            Err(ModelError::CacheFull { .. })
        ));
    }

    #[test]
    fn priority_orders_eviction() {
        let file = model_file(3, 1000);
        let model = open(&file, 2000, true);
        model.set_priority(0, 100.0).unwrap();
        model.set_priority(1, 0.01).unwrap();
        drop(model.acquire(0).unwrap());
        drop(model.acquire(1).unwrap());
        // Loading layer 2 must evict the low-priority layer 1.
        drop(model.acquire(2).unwrap());
        assert!(model.is_cached(0));
        assert!(!model.is_cached(1));
    }

    #[test]
    fn prefetch_is_passive_and_droppable() {
        let file = model_file(3, 1000);
        let model = open(&file, 2000, true);
        model.prefetch(0).unwrap();
        assert!(model.is_cached(0));
        assert_eq!(model.cache_stats().active_layers, 0);

        model.prefetch(1).unwrap();
        // No room left: the third prefetch is silently dropped.
        model.prefetch(2).unwrap();
        assert!(!model.is_cached(2));
    }

    #[test]
    fn precision_gate() {
        let file = model_file(1, 64);
        let model = open(&file, 0, true);
        assert!(model.acquire_as(0, Precision::Bits4).is_ok());
        assert!(matches!(
            model.acquire_as(0, Precision::Bits8),
            Err(ModelError::PrecisionMismatch {
                expected: 8,
                found: 4
            })
        ));
    }

    #[test]
    fn truncated_payload_rejected_at_open() {
        let file = model_file(2, 512);
        let len = file.as_file().metadata().unwrap().len();
        file.as_file().set_len(len - 100).unwrap();
        let err = MappedModel::open(file.path(), ModelCacheConfig::default()).unwrap_err();
        assert!(matches!(err, ModelError::WeightLoad { .. }));
    }

    #[test]
    fn concurrent_acquires_coalesce() {
        let file = model_file(1, 64 * 1024);
        let model = std::sync::Arc::new(open(&file, 0, false));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let model = std::sync::Arc::clone(&model);
                std::thread::spawn(move || {
                    let guard = model.acquire(0).unwrap();
                    assert_eq!(guard[0], 0);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(model.memory_usage(), 64 * 1024);
    }

    #[test]
    fn clear_cache_skips_active() {
        let file = model_file(2, 500);
        let model = open(&file, 0, true);
        let held = model.acquire(0).unwrap();
        drop(model.acquire(1).unwrap());
        model.clear_cache();
        assert!(model.is_cached(0));
        assert!(!model.is_cached(1));
        drop(held);
    }
}
