//! # tinyinfer-model
//!
//! Memory-mapped store for quantized model files: header and descriptor
//! parsing, the packed 4-bit weight codec, and a budgeted layer cache with
//! priority-aware eviction and prefetch.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tinyinfer_model::prelude::*;
//!
//! # fn main() -> ModelResult<()> {
//! let model = MappedModel::open("model.tmai", ModelCacheConfig::default())?;
//! let weights = model.acquire(0)?;
//! // `weights` derefs to the layer's raw bytes and keeps the layer
//! // resident until dropped.
//! assert_eq!(weights.len(), model.descriptor(0)?.size as usize);
//! # Ok(())
//! # }
//! ```

// The mmap backing needs one unsafe call; opt out of the workspace-wide
// `unsafe_code` warn.
#![allow(unsafe_code)]

pub mod cache;
pub mod error;
pub mod format;
pub mod quant;

pub use crate::cache::{LayerGuard, MappedModel, ModelCacheConfig};
pub use crate::error::{ModelError, ModelResult};
pub use crate::format::{LayerDescriptor, ModelHeader, Precision};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::cache::{LayerGuard, MappedModel, ModelCacheConfig, ModelCacheStats};
    pub use crate::error::{ModelError, ModelResult};
    pub use crate::format::{
        LayerDescriptor, ModelFileBuilder, ModelHeader, Precision, WeightsFile,
    };
    pub use crate::quant::{dequantize, pack_nibbles, packed_len, unpack_nibbles};
}
