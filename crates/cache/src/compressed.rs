//! JPEG-compressed page cache
//!
//! Rendered pages are stored JPEG-encoded under byte-cost accounting so
//! that far more pages fit in the same budget than raw RGBA would allow.
//! Encoding and decoding happen outside the cache lock; render workers
//! share one instance. The RGB staging buffer the codec works on comes
//! from the memory pool when one is attached.

use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use image::codecs::jpeg::{JpegDecoder, JpegEncoder};
use image::{ColorType, DynamicImage, ExtendedColorType, ImageDecoder};

use crate::lru::CostLru;
use crate::pool::{MemoryPool, PooledBuffer};
use crate::{lock, Bitmap, CacheConfig};

/// Default JPEG quality for cached pages.
pub const DEFAULT_COMPRESSION_QUALITY: u8 = 85;

/// Identifies one rendered variant of a page.
///
/// DPI is kept to one decimal place and quality as a percentage, so a
/// change to either produces a new key while other variants stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub page: u32,
    pub width: u32,
    pub height: u32,
    pub dpi_tenths: u32,
    pub quality_pct: u32,
}

impl CacheKey {
    pub fn new(page: u32, width: u32, height: u32, dpi: f64, quality: f64) -> Self {
        Self {
            page,
            width,
            height,
            dpi_tenths: (dpi.max(0.0) * 10.0).round() as u32,
            quality_pct: (quality.max(0.0) * 100.0).round() as u32,
        }
    }

    pub fn dpi(&self) -> f64 {
        f64::from(self.dpi_tenths) / 10.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}x{}_{:.1}dpi_q{}",
            self.page,
            self.width,
            self.height,
            self.dpi(),
            self.quality_pct
        )
    }
}

/// Errors from the JPEG codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {width}x{height} bitmap: {source}")]
    Encode {
        width: u32,
        height: u32,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to decode cached page: {0}")]
    Decode(#[source] image::ImageError),
    #[error("decoded page does not fill {width}x{height}")]
    Truncated { width: u32, height: u32 },
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Number of entries currently cached
    pub entries: usize,

    /// Compressed bytes held
    pub bytes_used: usize,

    /// Byte capacity
    pub capacity: usize,

    pub hits: u64,
    pub misses: u64,

    /// Entries evicted to make room
    pub evictions: u64,

    /// Inserts dropped because a single entry exceeded capacity
    pub rejected: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fraction of capacity in use
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.bytes_used as f64 / self.capacity as f64
        }
    }
}

struct CompressedEntry {
    bytes: Arc<Vec<u8>>,
    access_count: u32,
}

struct CacheState {
    entries: CostLru<CacheKey, CompressedEntry>,
    stats: CacheStats,
}

/// Thread-safe compressed page cache.
///
/// # Example
///
/// ```
/// use readium_cache::{Bitmap, CacheKey, CompressedPageCache};
///
/// let cache = CompressedPageCache::new(4 * 1024 * 1024, 85);
/// let key = CacheKey::new(0, 120, 160, 72.0, 1.0);
/// let page = Bitmap::from_pixel(120, 160, image::Rgba([200, 200, 200, 255]));
///
/// assert!(cache.insert(key, &page).unwrap());
/// let restored = cache.lookup(&key).unwrap();
/// assert_eq!(restored.dimensions(), (120, 160));
/// ```
pub struct CompressedPageCache {
    state: Mutex<CacheState>,
    quality: AtomicU8,
    pool: Option<MemoryPool>,
}

impl CompressedPageCache {
    /// Create a cache holding at most `capacity` compressed bytes.
    pub fn new(capacity: usize, quality: u8) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: CostLru::new(capacity),
                stats: CacheStats {
                    capacity,
                    ..Default::default()
                },
            }),
            quality: AtomicU8::new(quality.clamp(1, 100)),
            pool: None,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.compressed_cache_size, config.compression_quality)
    }

    /// Stage codec pixels in buffers borrowed from `pool`.
    pub fn with_pool(mut self, pool: MemoryPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Decode the cached bitmap for `key`, if present.
    ///
    /// A hit refreshes recency and bumps the access count. An entry that
    /// fails to decode is dropped and reported as a miss.
    pub fn lookup(&self, key: &CacheKey) -> Option<Bitmap> {
        let bytes = {
            let mut state = lock(&self.state);
            let bytes = state.entries.get_mut(key).map(|entry| {
                entry.access_count = entry.access_count.saturating_add(1);
                Arc::clone(&entry.bytes)
            });
            match bytes {
                Some(bytes) => {
                    state.stats.hits += 1;
                    bytes
                }
                None => {
                    state.stats.misses += 1;
                    return None;
                }
            }
        };

        match decode(&bytes, self.pool.as_ref()) {
            Ok(bitmap) => Some(bitmap),
            Err(err) => {
                log::warn!("Dropping unreadable cache entry {key}: {err}");
                let mut state = lock(&self.state);
                state.entries.remove(key);
                state.stats.hits = state.stats.hits.saturating_sub(1);
                state.stats.misses += 1;
                Self::sync_sizes(&mut state);
                None
            }
        }
    }

    /// Compress and store a bitmap.
    ///
    /// Returns `Ok(false)` when the compressed entry alone is larger than
    /// the whole cache; the insert is then dropped without error.
    pub fn insert(&self, key: CacheKey, bitmap: &Bitmap) -> Result<bool, CodecError> {
        let bytes = encode(bitmap, self.quality(), self.pool.as_ref())?;
        let cost = bytes.len();
        let entry = CompressedEntry {
            bytes: Arc::new(bytes),
            access_count: 0,
        };

        let mut state = lock(&self.state);
        match state.entries.insert(key, entry, cost) {
            Ok(evicted) => {
                state.stats.evictions += evicted.len() as u64;
                Self::sync_sizes(&mut state);
                Ok(true)
            }
            Err(_) => {
                state.stats.rejected += 1;
                log::debug!(
                    "Cache insert for {key} rejected: {cost} bytes exceeds capacity {}",
                    state.entries.max_cost()
                );
                Ok(false)
            }
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        lock(&self.state).entries.contains(key)
    }

    /// Number of lookups that have hit this entry.
    pub fn access_count(&self, key: &CacheKey) -> Option<u32> {
        lock(&self.state)
            .entries
            .peek(key)
            .map(|entry| entry.access_count)
    }

    /// Drop every variant cached for one page.
    pub fn invalidate_page(&self, page: u32) -> usize {
        let mut state = lock(&self.state);
        let removed = state.entries.remove_where(|key| key.page == page);
        Self::sync_sizes(&mut state);
        removed
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        Self::sync_sizes(&mut state);
    }

    /// Change the byte capacity, evicting LRU entries that no longer fit.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = lock(&self.state);
        let evicted = state.entries.set_max_cost(capacity);
        state.stats.evictions += evicted.len() as u64;
        state.stats.capacity = capacity;
        Self::sync_sizes(&mut state);
    }

    pub fn capacity(&self) -> usize {
        lock(&self.state).entries.max_cost()
    }

    pub fn current_cost(&self) -> usize {
        lock(&self.state).entries.current_cost()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set the JPEG quality used for future inserts (clamped to 1-100).
    pub fn set_quality(&self, quality: u8) {
        self.quality.store(quality.clamp(1, 100), Ordering::Relaxed);
    }

    pub fn quality(&self) -> u8 {
        self.quality.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        lock(&self.state).stats
    }

    fn sync_sizes(state: &mut CacheState) {
        state.stats.entries = state.entries.len();
        state.stats.bytes_used = state.entries.current_cost();
    }
}

impl Default for CompressedPageCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// First `len` bytes of the pooled buffer, or of `fallback` when the pool
/// had nothing to lend.
fn staging<'a>(
    pooled: &'a mut Option<PooledBuffer>,
    fallback: &'a mut Vec<u8>,
    len: usize,
) -> &'a mut [u8] {
    match pooled {
        Some(buffer) if buffer.len() >= len => &mut buffer[..len],
        _ => {
            fallback.resize(len, 0);
            fallback.as_mut_slice()
        }
    }
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// JPEG has no alpha channel; pages are opaque so alpha is dropped.
fn encode(bitmap: &Bitmap, quality: u8, pool: Option<&MemoryPool>) -> Result<Vec<u8>, CodecError> {
    let (width, height) = bitmap.dimensions();
    let mut pooled = pool.and_then(|pool| pool.acquire(width, height));
    let mut fallback = Vec::new();
    let rgb = staging(&mut pooled, &mut fallback, rgb_len(width, height));
    for (dst, pixel) in rgb.chunks_exact_mut(3).zip(bitmap.pixels()) {
        dst.copy_from_slice(&pixel.0[..3]);
    }

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|source| CodecError::Encode {
            width,
            height,
            source,
        })?;
    Ok(bytes)
}

fn decode(bytes: &[u8], pool: Option<&MemoryPool>) -> Result<Bitmap, CodecError> {
    let decoder = JpegDecoder::new(Cursor::new(bytes)).map_err(CodecError::Decode)?;
    if decoder.color_type() != ColorType::Rgb8 {
        return DynamicImage::from_decoder(decoder)
            .map(DynamicImage::into_rgba8)
            .map_err(CodecError::Decode);
    }

    let (width, height) = decoder.dimensions();
    let mut pooled = pool.and_then(|pool| pool.acquire(width, height));
    let mut fallback = Vec::new();
    let rgb = staging(&mut pooled, &mut fallback, rgb_len(width, height));
    decoder.read_image(rgb).map_err(CodecError::Decode)?;

    let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
    for pixel in rgb.chunks_exact(3) {
        rgba.extend_from_slice(&[pixel[0], pixel[1], pixel[2], u8::MAX]);
    }
    Bitmap::from_raw(width, height, rgba).ok_or(CodecError::Truncated { width, height })
}
