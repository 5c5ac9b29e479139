//! Size-class pool: an ordered run of regions serving one (usage, class)
//! bucket, growing by whole regions while the configured ceiling allows.

use core::ptr::NonNull;

use tracing::{debug, trace};

use crate::config::{ClassConfig, SizeClass, UsagePattern};
use crate::error::{MemoryError, MemoryResult};
use crate::region::{Region, fragmentation_score};
use crate::utils::align_up;

/// Aggregated statistics across the pool's regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub used_bytes: usize,
    pub peak_used: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
    pub fragmentation_pct: u8,
    pub regions: usize,
    pub allocations: u64,
    pub frees: u64,
}

/// Identity tag shared by a pool and its regions, for diagnostics.
#[must_use]
pub fn pool_tag(usage: UsagePattern, class: SizeClass) -> u64 {
    let u = UsagePattern::ALL.iter().position(|x| *x == usage).unwrap_or(0) as u64;
    let c = SizeClass::ALL.iter().position(|x| *x == class).unwrap_or(0) as u64;
    (u << 8) | c
}

/// One (usage, class) bucket.
pub struct ClassPool {
    usage: UsagePattern,
    class: SizeClass,
    config: ClassConfig,
    regions: Vec<Region>,
    peak_used: usize,
    allocations: u64,
    frees: u64,
    alloc_pattern: Option<u8>,
    dealloc_pattern: Option<u8>,
}

impl ClassPool {
    /// Create the pool with its initial region.
    pub fn new(
        usage: UsagePattern,
        class: SizeClass,
        config: ClassConfig,
        alloc_pattern: Option<u8>,
        dealloc_pattern: Option<u8>,
    ) -> MemoryResult<Self> {
        if !config.enabled || config.initial_capacity == 0 {
            return Err(MemoryError::invalid_config(format!(
                "{}/{:?}: pool constructed from a disabled config",
                usage.tag(),
                class
            )));
        }
        let tag = pool_tag(usage, class);
        let first = Region::new(config.initial_capacity, tag, alloc_pattern, dealloc_pattern)?;
        Ok(Self {
            usage,
            class,
            config,
            regions: vec![first],
            peak_used: 0,
            allocations: 0,
            frees: 0,
            alloc_pattern,
            dealloc_pattern,
        })
    }

    #[inline]
    pub fn usage(&self) -> UsagePattern {
        self.usage
    }

    #[inline]
    pub fn class(&self) -> SizeClass {
        self.class
    }

    /// Sum of region capacities.
    pub fn capacity(&self) -> usize {
        self.regions.iter().map(Region::capacity).sum()
    }

    /// Sum of used span bytes.
    pub fn used_bytes(&self) -> usize {
        self.regions.iter().map(Region::used_bytes).sum()
    }

    /// Walk regions in order; append one when everything is full and the
    /// ceiling still has room.
    pub fn alloc(&mut self, size: usize, align: usize) -> MemoryResult<NonNull<u8>> {
        for region in &mut self.regions {
            if let Some(ptr) = region.alloc(size, align) {
                self.note_alloc();
                return Ok(ptr);
            }
        }

        if self.config.growable {
            // A fresh region must fit the aligned payload plus the split
            // slack even when the request exceeds the hint.
            let wanted = align_up(size, 64).saturating_add(128);
            let new_capacity = wanted.max(self.config.region_hint);
            if self.capacity().saturating_add(new_capacity) <= self.config.max_capacity {
                debug!(
                    usage = self.usage.tag(),
                    class = ?self.class,
                    new_capacity,
                    "growing pool with a fresh region"
                );
                let region = Region::new(
                    new_capacity,
                    pool_tag(self.usage, self.class),
                    self.alloc_pattern,
                    self.dealloc_pattern,
                )?;
                self.regions.push(region);
                if let Some(ptr) = self
                    .regions
                    .last_mut()
                    .and_then(|r| r.alloc(size, align))
                {
                    self.note_alloc();
                    return Ok(ptr);
                }
            }
        }

        trace!(
            usage = self.usage.tag(),
            class = ?self.class,
            size,
            "pool exhausted"
        );
        Err(MemoryError::out_of_memory(size, align, self.usage, self.class))
    }

    /// Dispatch a free by containment.
    pub fn free(&mut self, ptr: NonNull<u8>) -> MemoryResult<usize> {
        for region in &mut self.regions {
            if region.contains(ptr) {
                let freed = region.free(ptr)?;
                self.frees += 1;
                return Ok(freed);
            }
        }
        Err(MemoryError::unknown_pointer(ptr.as_ptr() as usize))
    }

    /// Whether any region owns `ptr`.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.regions.iter().any(|r| r.contains(ptr))
    }

    /// Recorded payload size of a live allocation.
    pub fn payload_size(&self, ptr: NonNull<u8>) -> MemoryResult<usize> {
        self.payload_layout(ptr).map(|(size, _)| size)
    }

    /// Recorded (size, alignment) of a live allocation.
    pub fn payload_layout(&self, ptr: NonNull<u8>) -> MemoryResult<(usize, usize)> {
        for region in &self.regions {
            if region.contains(ptr) {
                return region.payload_layout(ptr);
            }
        }
        Err(MemoryError::unknown_pointer(ptr.as_ptr() as usize))
    }

    /// In-place resize attempt within the owning region.
    pub fn try_extend(&mut self, ptr: NonNull<u8>, new_size: usize) -> MemoryResult<bool> {
        for region in &mut self.regions {
            if region.contains(ptr) {
                return region.try_extend(ptr, new_size);
            }
        }
        Err(MemoryError::unknown_pointer(ptr.as_ptr() as usize))
    }

    /// Coalesce free blocks in every region.
    pub fn compact(&mut self) -> usize {
        self.regions.iter_mut().map(Region::compact).sum()
    }

    /// Grow capacity by 50% (clamped to the ceiling) when utilization is
    /// high. Returns `true` when a region was appended.
    pub fn grow_by_half(&mut self) -> MemoryResult<bool> {
        let capacity = self.capacity();
        if capacity >= self.config.max_capacity {
            return Ok(false);
        }
        let grow = (capacity / 2).min(self.config.max_capacity - capacity);
        if grow < crate::region::MIN_SPLIT_BYTES {
            return Ok(false);
        }
        let region = Region::new(
            grow,
            pool_tag(self.usage, self.class),
            self.alloc_pattern,
            self.dealloc_pattern,
        )?;
        self.regions.push(region);
        Ok(true)
    }

    /// Utilization ratio 0..1 against current capacity.
    pub fn utilization(&self) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 / capacity as f64
    }

    /// Ceiling from the class config.
    pub fn max_capacity(&self) -> usize {
        self.config.max_capacity
    }

    /// Aggregate region statistics.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            regions: self.regions.len(),
            peak_used: self.peak_used,
            allocations: self.allocations,
            frees: self.frees,
            ..PoolStats::default()
        };
        for region in &self.regions {
            let r = region.stats();
            stats.capacity += r.capacity;
            stats.used_bytes += r.used_bytes;
            stats.free_bytes += r.free_bytes;
            stats.free_blocks += r.free_blocks;
            stats.largest_free = stats.largest_free.max(r.largest_free);
        }
        stats.fragmentation_pct = fragmentation_score(stats.free_bytes, stats.largest_free);
        stats
    }

    fn note_alloc(&mut self) {
        self.allocations += 1;
        let used = self.used_bytes();
        if used > self.peak_used {
            self.peak_used = used;
        }
    }
}

impl core::fmt::Debug for ClassPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClassPool")
            .field("usage", &self.usage.tag())
            .field("class", &self.class)
            .field("regions", &self.regions.len())
            .field("capacity", &self.capacity())
            .field("used", &self.used_bytes())
            .finish()
    }
}
