//! Size classes, usage patterns and pool configuration.

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};

/// Byte-size constants used by the default class table.
pub mod size {
    /// 1 Kilobyte
    pub const KB: usize = 1024;
    /// 1 Megabyte
    pub const MB: usize = 1024 * KB;
}

/// Coarse allocation bucket.
///
/// Class limits strictly increase; `Huge` has no upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SizeClass {
    /// ≤ 64 bytes
    Tiny,
    /// ≤ 256 bytes
    Small,
    /// ≤ 1 KiB
    Medium,
    /// ≤ 4 KiB
    Large,
    /// ≤ 64 KiB
    XLarge,
    /// everything above
    Huge,
}

impl SizeClass {
    /// All classes, ascending.
    pub const ALL: [SizeClass; 6] = [
        SizeClass::Tiny,
        SizeClass::Small,
        SizeClass::Medium,
        SizeClass::Large,
        SizeClass::XLarge,
        SizeClass::Huge,
    ];

    /// Upper payload bound of the class; `None` for `Huge`.
    #[must_use]
    pub const fn upper_bound(self) -> Option<usize> {
        match self {
            SizeClass::Tiny => Some(64),
            SizeClass::Small => Some(256),
            SizeClass::Medium => Some(size::KB),
            SizeClass::Large => Some(4 * size::KB),
            SizeClass::XLarge => Some(64 * size::KB),
            SizeClass::Huge => None,
        }
    }

    /// Route a request size to its class.
    #[must_use]
    pub const fn classify(size: usize) -> SizeClass {
        match size {
            0..=64 => SizeClass::Tiny,
            65..=256 => SizeClass::Small,
            257..=1024 => SizeClass::Medium,
            1025..=4096 => SizeClass::Large,
            4097..=65536 => SizeClass::XLarge,
            _ => SizeClass::Huge,
        }
    }
}

/// Routing tag distinguishing read-mostly weights, short-lived activations
/// and everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsagePattern {
    /// Read-mostly quantized weight matrices.
    Weights,
    /// Short-lived activation tensors.
    Activations,
    /// Anything without a better home.
    General,
}

impl UsagePattern {
    /// All patterns.
    pub const ALL: [UsagePattern; 3] = [
        UsagePattern::Weights,
        UsagePattern::Activations,
        UsagePattern::General,
    ];

    /// Short tag for analyzer source labels and logs.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            UsagePattern::Weights => "weights",
            UsagePattern::Activations => "activations",
            UsagePattern::General => "general",
        }
    }
}

/// Per-(usage, class) pool configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassConfig {
    /// Capacity of the first region.
    pub initial_capacity: usize,
    /// Ceiling across all regions of the pool.
    pub max_capacity: usize,
    /// Preferred capacity for regions appended on growth.
    pub region_hint: usize,
    /// Whether the pool may append regions at all.
    pub growable: bool,
    /// Whether the (usage, class) combination is routed to at all; disabled
    /// combinations fall back to the General pool of the same class.
    pub enabled: bool,
}

impl ClassConfig {
    /// Marker config for combinations that route to the General fallback.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            initial_capacity: 0,
            max_capacity: 0,
            region_hint: 0,
            growable: false,
            enabled: false,
        }
    }

    fn validate(&self, usage: UsagePattern, class: SizeClass) -> MemoryResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.initial_capacity == 0 {
            return Err(MemoryError::invalid_config(format!(
                "{}/{class:?}: zero initial capacity",
                usage.tag()
            )));
        }
        if self.max_capacity < self.initial_capacity {
            return Err(MemoryError::invalid_config(format!(
                "{}/{class:?}: max capacity {} below initial {}",
                usage.tag(),
                self.max_capacity,
                self.initial_capacity
            )));
        }
        Ok(())
    }
}

/// Default class table.
///
/// Weight matrices never land in the tiny/small buckets and activations never
/// in tiny, so those combinations are disabled and serve the General
/// fallback path instead.
fn default_class_config(usage: UsagePattern, class: SizeClass) -> ClassConfig {
    use SizeClass::*;
    use UsagePattern::*;

    let disabled = matches!(
        (usage, class),
        (Weights, Tiny) | (Weights, Small) | (Activations, Tiny)
    );
    if disabled {
        return ClassConfig::disabled();
    }

    // Initial capacities scale with the class; weights get the largest
    // budgets since packed matrices dominate a resident model.
    let initial = match class {
        Tiny => 16 * size::KB,
        Small => 64 * size::KB,
        Medium => 256 * size::KB,
        Large => size::MB,
        XLarge => 4 * size::MB,
        Huge => 8 * size::MB,
    };
    let factor = match usage {
        Weights => 4,
        Activations => 2,
        General => 1,
    };

    ClassConfig {
        initial_capacity: initial * factor,
        max_capacity: initial * factor * 16,
        region_hint: initial * factor,
        growable: true,
        enabled: true,
    }
}

/// Hierarchical pool configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Overrides of the default class table, sparse.
    #[serde(default, skip)]
    pub class_overrides: Vec<(UsagePattern, SizeClass, ClassConfig)>,
    /// Capacity of the pointer → pool cache; misses fall back to a scan.
    pub alloc_cache_capacity: usize,
    /// Pressure percentage at which the pressure callback fires.
    pub high_water_pct: u8,
    /// Compact every pool during `optimize`.
    pub aggressive_defrag: bool,
    /// Fill freshly carved payloads with this pattern (debug builds).
    pub alloc_pattern: Option<u8>,
    /// Fill released payloads with this pattern (debug builds).
    pub dealloc_pattern: Option<u8>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            class_overrides: Vec::new(),
            alloc_cache_capacity: 4096,
            high_water_pct: 85,
            aggressive_defrag: false,
            alloc_pattern: if cfg!(debug_assertions) { Some(0xBB) } else { None },
            dealloc_pattern: if cfg!(debug_assertions) { Some(0xDD) } else { None },
        }
    }
}

impl PoolConfig {
    /// Production configuration - no debug fills, bigger cache.
    #[must_use]
    pub fn production() -> Self {
        Self {
            alloc_cache_capacity: 16384,
            alloc_pattern: None,
            dealloc_pattern: None,
            ..Self::default()
        }
    }

    /// Debug configuration - fills and aggressive defragmentation.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            aggressive_defrag: true,
            alloc_pattern: Some(0xBB),
            dealloc_pattern: Some(0xDD),
            ..Self::default()
        }
    }

    /// Effective config for a (usage, class) pair.
    #[must_use]
    pub fn class_config(&self, usage: UsagePattern, class: SizeClass) -> ClassConfig {
        self.class_overrides
            .iter()
            .rev()
            .find(|(u, c, _)| *u == usage && *c == class)
            .map_or_else(|| default_class_config(usage, class), |(_, _, cfg)| *cfg)
    }

    /// Register an override for one (usage, class) pair.
    pub fn override_class(
        &mut self,
        usage: UsagePattern,
        class: SizeClass,
        config: ClassConfig,
    ) -> &mut Self {
        self.class_overrides.push((usage, class, config));
        self
    }

    /// Validate the whole table.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.high_water_pct > 100 {
            return Err(MemoryError::invalid_config(format!(
                "high water mark {}% above 100%",
                self.high_water_pct
            )));
        }
        for usage in UsagePattern::ALL {
            for class in SizeClass::ALL {
                self.class_config(usage, class).validate(usage, class)?;
            }
            // General is the fallback target and must exist for every class.
            if usage == UsagePattern::General {
                for class in SizeClass::ALL {
                    if !self.class_config(usage, class).enabled {
                        return Err(MemoryError::invalid_config(format!(
                            "general/{class:?} pool cannot be disabled"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("alloc_cache_capacity", &self.alloc_cache_capacity)
            .field("high_water_pct", &self.high_water_pct)
            .field("aggressive_defrag", &self.aggressive_defrag)
            .field("overrides", &self.class_overrides.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_limits_strictly_increase() {
        let mut prev = 0usize;
        for class in SizeClass::ALL {
            match class.upper_bound() {
                Some(limit) => {
                    assert!(limit > prev, "{class:?} limit must exceed {prev}");
                    prev = limit;
                }
                None => assert_eq!(class, SizeClass::Huge),
            }
        }
    }

    #[test]
    fn classify_boundaries() {
        assert_eq!(SizeClass::classify(0), SizeClass::Tiny);
        assert_eq!(SizeClass::classify(64), SizeClass::Tiny);
        assert_eq!(SizeClass::classify(65), SizeClass::Small);
        assert_eq!(SizeClass::classify(1024), SizeClass::Medium);
        assert_eq!(SizeClass::classify(4096), SizeClass::Large);
        assert_eq!(SizeClass::classify(65536), SizeClass::XLarge);
        assert_eq!(SizeClass::classify(65537), SizeClass::Huge);
    }

    #[test]
    fn default_table_validates() {
        PoolConfig::default().validate().unwrap();
        PoolConfig::production().validate().unwrap();
        PoolConfig::debug().validate().unwrap();
    }

    #[test]
    fn weights_tiny_routes_to_fallback() {
        let cfg = PoolConfig::default();
        assert!(!cfg.class_config(UsagePattern::Weights, SizeClass::Tiny).enabled);
        assert!(cfg.class_config(UsagePattern::General, SizeClass::Tiny).enabled);
    }

    #[test]
    fn overrides_win_and_validate() {
        let mut cfg = PoolConfig::default();
        cfg.override_class(
            UsagePattern::General,
            SizeClass::Tiny,
            ClassConfig {
                initial_capacity: 1024,
                max_capacity: 512,
                region_hint: 1024,
                growable: true,
                enabled: true,
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn per_class_max_at_least_initial() {
        let cfg = PoolConfig::default();
        for usage in UsagePattern::ALL {
            for class in SizeClass::ALL {
                let cc = cfg.class_config(usage, class);
                if cc.enabled {
                    assert!(cc.max_capacity >= cc.initial_capacity);
                }
            }
        }
    }
}
