//! Adaptive page cache for thumbnail consumers
//!
//! Holds decoded bitmaps keyed by page index. The eviction policy follows
//! the observed hit rate: while most lookups hit, recency is a good
//! predictor and LRU is used; once the hit rate drops to 0.7 or below the
//! cache switches to LFU. Overflow sweeps remove at least a quarter of the
//! entries at a time, and a throttled cleanup drops cold entries that have
//! sat idle for several minutes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::compressed::CacheStats;
use crate::config::MIN_PAGE_CACHE_MEMORY;
use crate::{bitmap_bytes, lock, Bitmap, CacheConfig};

/// Hit rate above which LRU is preferred over LFU.
pub const LRU_HIT_RATE_THRESHOLD: f64 = 0.7;
/// Minimum spacing between two cleanup passes.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
/// Entries idle for longer than this are candidates for cleanup.
pub const IDLE_EVICTION_AGE: Duration = Duration::from_secs(5 * 60);
/// Entries with fewer accesses than this are considered cold.
pub const COLD_ACCESS_COUNT: u32 = 2;

/// How the cache chooses eviction victims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    Lru,
    Lfu,
    /// LRU or LFU depending on the running hit rate
    #[default]
    Adaptive,
    /// Largest bitmaps first
    MemoryAware,
}

/// Policy actually applied for one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    LargestFirst,
}

struct PageEntry {
    bitmap: Arc<Bitmap>,
    bytes: usize,
    last_accessed: Instant,
    access_count: u32,
}

struct CacheState {
    entries: HashMap<u32, PageEntry>,
    bytes_used: usize,
    max_items: usize,
    max_bytes: usize,
    strategy: CacheStrategy,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejected: u64,
    last_cleanup: Instant,
}

impl CacheState {
    fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn policy(&self) -> EvictionPolicy {
        match self.strategy {
            CacheStrategy::Lru => EvictionPolicy::Lru,
            CacheStrategy::Lfu => EvictionPolicy::Lfu,
            CacheStrategy::MemoryAware => EvictionPolicy::LargestFirst,
            CacheStrategy::Adaptive => {
                if self.hit_rate() > LRU_HIT_RATE_THRESHOLD {
                    EvictionPolicy::Lru
                } else {
                    EvictionPolicy::Lfu
                }
            }
        }
    }

    fn over_limit(&self) -> bool {
        self.entries.len() > self.max_items || self.bytes_used > self.max_bytes
    }

    fn remove(&mut self, page: u32) -> Option<PageEntry> {
        let entry = self.entries.remove(&page)?;
        self.bytes_used -= entry.bytes;
        Some(entry)
    }

    /// Evict in batches of at least 25% until back under both limits.
    fn sweep(&mut self, protect: Option<u32>) {
        while self.over_limit() {
            let policy = self.policy();
            let mut candidates: Vec<(u32, &PageEntry)> = self
                .entries
                .iter()
                .filter(|(page, _)| Some(**page) != protect)
                .map(|(page, entry)| (*page, entry))
                .collect();
            if candidates.is_empty() {
                break;
            }

            match policy {
                EvictionPolicy::Lru => candidates.sort_by_key(|(_, e)| e.last_accessed),
                EvictionPolicy::Lfu => {
                    candidates.sort_by_key(|(_, e)| (e.access_count, e.last_accessed))
                }
                EvictionPolicy::LargestFirst => candidates
                    .sort_by_key(|(_, e)| (std::cmp::Reverse(e.bytes), e.last_accessed)),
            }

            let batch = self.entries.len().div_ceil(4).max(1);
            let victims: Vec<u32> = candidates
                .into_iter()
                .take(batch)
                .map(|(page, _)| page)
                .collect();
            log::debug!("Evicting {} pages with {:?} policy", victims.len(), policy);
            for page in victims {
                self.remove(page);
                self.evictions += 1;
            }
        }
    }
}

/// Thread-safe adaptive cache of decoded page bitmaps.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use readium_cache::{AdaptivePageCache, Bitmap};
///
/// let cache = AdaptivePageCache::new(2, 64 * 1024 * 1024);
/// for page in 0..3 {
///     cache.insert(page, Arc::new(Bitmap::new(10, 10)));
/// }
/// assert!(cache.len() <= 2);
/// assert!(cache.contains(2));
/// ```
pub struct AdaptivePageCache {
    state: Mutex<CacheState>,
}

impl AdaptivePageCache {
    /// Create a cache bounded by item count and total bitmap bytes.
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                bytes_used: 0,
                max_items: max_items.max(1),
                max_bytes: max_bytes.max(MIN_PAGE_CACHE_MEMORY),
                strategy: CacheStrategy::default(),
                hits: 0,
                misses: 0,
                evictions: 0,
                rejected: 0,
                last_cleanup: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.page_cache_items, config.page_cache_memory)
    }

    /// Fetch a page, counting a hit or a miss.
    pub fn get(&self, page: u32) -> Option<Arc<Bitmap>> {
        let mut state = lock(&self.state);
        let found = state.entries.get_mut(&page).map(|entry| {
            entry.last_accessed = Instant::now();
            entry.access_count = entry.access_count.saturating_add(1);
            Arc::clone(&entry.bitmap)
        });
        if found.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        found
    }

    /// Fetch a page without affecting statistics or eviction order.
    pub fn peek(&self, page: u32) -> Option<Arc<Bitmap>> {
        lock(&self.state)
            .entries
            .get(&page)
            .map(|entry| Arc::clone(&entry.bitmap))
    }

    pub fn contains(&self, page: u32) -> bool {
        lock(&self.state).entries.contains_key(&page)
    }

    /// Store a bitmap, sweeping if either limit is exceeded.
    ///
    /// The page just inserted is never chosen as a victim of its own
    /// sweep. A bitmap larger than the whole memory limit is not stored.
    pub fn insert(&self, page: u32, bitmap: Arc<Bitmap>) -> bool {
        let bytes = bitmap_bytes(&bitmap);
        let mut state = lock(&self.state);
        if bytes > state.max_bytes {
            state.rejected += 1;
            return false;
        }

        state.remove(page);
        state.entries.insert(
            page,
            PageEntry {
                bitmap,
                bytes,
                last_accessed: Instant::now(),
                access_count: 1,
            },
        );
        state.bytes_used += bytes;
        state.sweep(Some(page));
        true
    }

    pub fn remove(&self, page: u32) -> Option<Arc<Bitmap>> {
        lock(&self.state).remove(page).map(|entry| entry.bitmap)
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.bytes_used = 0;
    }

    pub fn set_max_items(&self, max_items: usize) {
        let mut state = lock(&self.state);
        state.max_items = max_items.max(1);
        state.sweep(None);
    }

    pub fn set_max_bytes(&self, max_bytes: usize) {
        let mut state = lock(&self.state);
        state.max_bytes = max_bytes.max(MIN_PAGE_CACHE_MEMORY);
        state.sweep(None);
    }

    pub fn set_strategy(&self, strategy: CacheStrategy) {
        lock(&self.state).strategy = strategy;
    }

    pub fn strategy(&self) -> CacheStrategy {
        lock(&self.state).strategy
    }

    /// Running hit rate; 1.0 before any lookups.
    pub fn hit_rate(&self) -> f64 {
        lock(&self.state).hit_rate()
    }

    /// The policy the next sweep would apply.
    pub fn current_policy(&self) -> EvictionPolicy {
        lock(&self.state).policy()
    }

    pub fn access_count(&self, page: u32) -> Option<u32> {
        lock(&self.state)
            .entries
            .get(&page)
            .map(|entry| entry.access_count)
    }

    /// Drop cold, idle entries. Runs at most once every 30 seconds.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// [`cleanup`](Self::cleanup) against an explicit clock reading.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let mut state = lock(&self.state);
        if now.saturating_duration_since(state.last_cleanup) < CLEANUP_INTERVAL {
            return 0;
        }
        state.last_cleanup = now;

        let stale: Vec<u32> = state
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.access_count < COLD_ACCESS_COUNT
                    && now.saturating_duration_since(entry.last_accessed) > IDLE_EVICTION_AGE
            })
            .map(|(page, _)| *page)
            .collect();

        for page in &stale {
            state.remove(*page);
            state.evictions += 1;
        }
        if !stale.is_empty() {
            log::debug!("Cleanup dropped {} idle pages", stale.len());
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_used(&self) -> usize {
        lock(&self.state).bytes_used
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        CacheStats {
            entries: state.entries.len(),
            bytes_used: state.bytes_used,
            capacity: state.max_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            rejected: state.rejected,
        }
    }
}

impl Default for AdaptivePageCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(side: u32) -> Arc<Bitmap> {
        Arc::new(Bitmap::new(side, side))
    }

    #[test]
    fn test_hit_rate_defaults_to_one() {
        let cache = AdaptivePageCache::new(10, 64 * 1024 * 1024);
        assert_eq!(cache.hit_rate(), 1.0);
        assert_eq!(cache.current_policy(), EvictionPolicy::Lru);
    }

    #[test]
    fn test_switches_to_lfu_on_low_hit_rate() {
        let cache = AdaptivePageCache::new(10, 64 * 1024 * 1024);
        cache.insert(0, bitmap(4));
        cache.get(0);
        cache.get(1);
        cache.get(2);

        assert!(cache.hit_rate() <= LRU_HIT_RATE_THRESHOLD);
        assert_eq!(cache.current_policy(), EvictionPolicy::Lfu);
    }

    #[test]
    fn test_lru_eviction_batch() {
        let cache = AdaptivePageCache::new(8, 64 * 1024 * 1024);
        for page in 0..8 {
            cache.insert(page, bitmap(4));
            std::thread::sleep(Duration::from_millis(2));
        }
        // Keep the hit rate high and make page 0 recent
        cache.get(0);

        cache.insert(8, bitmap(4));

        // 9 entries over a limit of 8: a quarter (3) go in one sweep
        assert_eq!(cache.len(), 6);
        assert!(cache.contains(0));
        assert!(cache.contains(8));
        assert!(!cache.contains(1));
        assert!(!cache.contains(2));
        assert!(!cache.contains(3));
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn test_lfu_eviction_prefers_rarely_used() {
        let cache = AdaptivePageCache::new(4, 64 * 1024 * 1024);
        cache.set_strategy(CacheStrategy::Lfu);
        for page in 0..4 {
            cache.insert(page, bitmap(4));
        }
        for _ in 0..3 {
            for page in [0, 1, 3] {
                cache.get(page);
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        cache.insert(4, bitmap(4));

        // Batch of two: the single-use page, then the oldest of the ties
        assert!(!cache.contains(2));
        assert!(!cache.contains(0));
        assert!(cache.contains(1));
        assert!(cache.contains(3));
        assert!(cache.contains(4));
    }

    #[test]
    fn test_memory_aware_evicts_largest() {
        let cache = AdaptivePageCache::new(3, 64 * 1024 * 1024);
        cache.set_strategy(CacheStrategy::MemoryAware);
        cache.insert(0, bitmap(4));
        cache.insert(1, bitmap(64));
        cache.insert(2, bitmap(8));
        cache.insert(3, bitmap(4));

        assert!(!cache.contains(1));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_memory_limit_enforced() {
        // 1 MB limit, each bitmap 256 KB
        let cache = AdaptivePageCache::new(100, 1024 * 1024);
        for page in 0..10 {
            cache.insert(page, bitmap(256));
            assert!(cache.bytes_used() <= 1024 * 1024);
        }
        assert!(cache.contains(9));
    }

    #[test]
    fn test_oversized_bitmap_rejected() {
        let cache = AdaptivePageCache::new(10, 1024 * 1024);
        assert!(!cache.insert(0, bitmap(1024)));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().rejected, 1);
    }

    #[test]
    fn test_cleanup_throttled_and_drops_cold_entries() {
        let cache = AdaptivePageCache::new(10, 64 * 1024 * 1024);
        cache.insert(0, bitmap(4));
        cache.insert(1, bitmap(4));
        cache.get(1);

        assert_eq!(cache.cleanup_at(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(6 * 60);
        assert_eq!(cache.cleanup_at(later), 1);
        assert!(!cache.contains(0));
        assert!(cache.contains(1));

        // Second pass inside the interval does nothing
        assert_eq!(cache.cleanup_at(later + Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_shrinking_limits_sweeps() {
        let cache = AdaptivePageCache::new(20, 64 * 1024 * 1024);
        for page in 0..20 {
            cache.insert(page, bitmap(4));
        }
        cache.set_max_items(5);
        assert!(cache.len() <= 5);
    }

    #[test]
    fn test_get_counts_access() {
        let cache = AdaptivePageCache::new(10, 64 * 1024 * 1024);
        cache.insert(3, bitmap(4));
        cache.get(3);
        cache.get(3);
        assert_eq!(cache.access_count(3), Some(3));
        assert!(cache.peek(3).is_some());
        assert_eq!(cache.access_count(3), Some(3));
    }
}
