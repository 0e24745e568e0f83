//! Readium Cache Library
//!
//! Bitmap caching and buffer pooling for the thumbnail pipeline:
//! a bounded-cost LRU, a JPEG-compressed page cache shared by render
//! workers, an adaptive LRU/LFU cache for consumers, and a pixel buffer pool.

pub mod adaptive;
pub mod compressed;
pub mod config;
pub mod lru;
pub mod pool;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use adaptive::{AdaptivePageCache, CacheStrategy, EvictionPolicy};
pub use compressed::{CacheKey, CacheStats, CodecError, CompressedPageCache};
pub use config::{CacheConfig, CacheConfigFile, ConfigError};
pub use lru::CostLru;
pub use pool::{MemoryPool, PoolStats, PooledBuffer};

/// An RGBA8 raster, the unit every cache in this crate stores.
pub type Bitmap = image::RgbaImage;

/// Bytes occupied by the raw pixels of a bitmap.
pub fn bitmap_bytes(bitmap: &Bitmap) -> usize {
    bitmap.as_raw().len()
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
