//! Consumer-side thumbnail model
//!
//! Sits between a thumbnail list view and the generator: serves bitmaps
//! from an adaptive page cache, turns misses into generation requests
//! prioritized by the viewport, and tracks per-page load and error state.
//! Call [`sync`](ThumbnailModel::sync) after ticking the generator to pull
//! finished thumbnails into the cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use readium_cache::{AdaptivePageCache, Bitmap, CacheConfig, CacheStats, CacheStrategy};
use readium_render::{PageSource, TargetSize};
use readium_scheduler::{ViewportPriority, DEFAULT_PRIORITY, QUALITY_EPSILON};

use crate::config::ModelConfig;
use crate::events::GeneratorEvent;
use crate::generator::ThumbnailGenerator;
use crate::lock;
use crate::state::PageState;

#[derive(Debug, Clone, Default)]
struct ItemState {
    loading: bool,
    error: Option<String>,
}

/// Thumbnail cache and load state for one document view.
pub struct ThumbnailModel {
    generator: Arc<ThumbnailGenerator>,
    events: flume::Receiver<GeneratorEvent>,
    cache: AdaptivePageCache,
    items: Mutex<HashMap<usize, ItemState>>,
    viewport: Mutex<Option<ViewportPriority>>,
    config: ModelConfig,
}

impl ThumbnailModel {
    pub fn new(generator: Arc<ThumbnailGenerator>, config: ModelConfig) -> Self {
        Self::with_cache_config(generator, config, &CacheConfig::default())
    }

    /// Model whose page cache is sized from `cache_config`.
    pub fn with_cache_config(
        generator: Arc<ThumbnailGenerator>,
        config: ModelConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        let cache = AdaptivePageCache::from_config(cache_config);
        if !config.adaptive_caching {
            cache.set_strategy(CacheStrategy::Lru);
        }
        let events = generator.subscribe();

        Self {
            generator,
            events,
            cache,
            items: Mutex::new(HashMap::new()),
            viewport: Mutex::new(None),
            config,
        }
    }

    pub fn generator(&self) -> &Arc<ThumbnailGenerator> {
        &self.generator
    }

    pub fn config(&self) -> ModelConfig {
        self.config
    }

    /// Switch documents, forgetting every cached thumbnail and page state.
    pub fn set_document(&self, source: Option<Arc<dyn PageSource>>) {
        self.generator.set_document(source);
        self.reset();
    }

    /// Cached thumbnail for `page`, requesting it on a miss.
    ///
    /// With lazy loading on and a viewport set, pages outside the viewport
    /// margin are not requested.
    pub fn request_thumbnail(&self, page: usize) -> Option<Arc<Bitmap>> {
        if let Some(bitmap) = self.cache.get(page as u32) {
            return Some(bitmap);
        }
        if self.is_loading(page) || !self.wants(page) {
            return None;
        }

        self.submit(page);
        None
    }

    /// Request every page in `start..=end`. Returns how many were already
    /// cached.
    pub fn request_thumbnail_range(&self, start: usize, end: usize) -> usize {
        (start.min(end)..=start.max(end))
            .filter(|page| self.request_thumbnail(*page).is_some())
            .count()
    }

    /// Cached thumbnail without requesting anything.
    pub fn thumbnail(&self, page: usize) -> Option<Arc<Bitmap>> {
        self.cache.peek(page as u32)
    }

    /// Apply pending generator events. Returns the number of pages updated.
    pub fn sync(&self) -> usize {
        let mut updated = 0;
        for event in self.events.try_iter() {
            match event {
                GeneratorEvent::ThumbnailGenerated { page, size, quality, bitmap } => {
                    if !self.is_current(size, quality) {
                        log::trace!("Ignoring page {page} thumbnail rendered at {size:?}");
                        continue;
                    }
                    if !self.cache.insert(page as u32, bitmap) {
                        log::debug!("Thumbnail for page {page} too large for the page cache");
                    }
                    lock(&self.items).insert(page, ItemState::default());
                    updated += 1;
                }
                GeneratorEvent::ThumbnailError { page, message } => {
                    lock(&self.items).insert(
                        page,
                        ItemState {
                            loading: false,
                            error: Some(message),
                        },
                    );
                    updated += 1;
                }
                GeneratorEvent::ThumbnailCancelled { page } => {
                    // The page may have been requested again since
                    if self.generator.page_state(page) == PageState::Cancelled
                        && lock(&self.items).remove(&page).is_some()
                    {
                        updated += 1;
                    }
                }
                _ => {}
            }
        }
        updated
    }

    pub fn is_loading(&self, page: usize) -> bool {
        lock(&self.items).get(&page).is_some_and(|item| item.loading)
    }

    pub fn has_error(&self, page: usize) -> bool {
        lock(&self.items)
            .get(&page)
            .is_some_and(|item| item.error.is_some())
    }

    pub fn error_message(&self, page: usize) -> Option<String> {
        lock(&self.items).get(&page).and_then(|item| item.error.clone())
    }

    /// Set the visible pages and reprioritize everything still queued:
    /// visible pages first, then the margin, then the rest.
    pub fn set_viewport_range(&self, start: usize, end: usize, margin: usize) {
        let viewport = ViewportPriority::new(start, end, margin);
        *lock(&self.viewport) = Some(viewport);

        let loading: Vec<usize> = lock(&self.items)
            .iter()
            .filter(|(_, item)| item.loading)
            .map(|(page, _)| *page)
            .collect();
        for page in loading {
            self.generator.set_priority(page, viewport.priority_for(page));
        }
    }

    pub fn viewport(&self) -> Option<ViewportPriority> {
        *lock(&self.viewport)
    }

    /// Request uncached pages around `first..=last`, widened by the preload
    /// range. Returns how many requests were made.
    pub fn preload_visible_range(&self, first: usize, last: usize) -> usize {
        let page_count = self.generator.page_count();
        if page_count == 0 {
            return 0;
        }

        let (first, last) = (first.min(last), first.max(last));
        let start = first.saturating_sub(self.config.preload_range);
        let end = last
            .saturating_add(self.config.preload_range)
            .min(page_count - 1);
        if start > end {
            return 0;
        }

        (start..=end)
            .filter(|page| !self.cache.contains(*page as u32) && !self.is_loading(*page))
            .filter(|page| self.submit(*page))
            .count()
    }

    /// Drop the cached thumbnail for `page` and render it again.
    pub fn refresh_thumbnail(&self, page: usize) {
        self.cache.remove(page as u32);
        self.generator.backend().cache().invalidate_page(page as u32);
        self.generator.cancel_request(page);
        lock(&self.items).remove(&page);
        self.submit(page);
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Maximum number of cached thumbnails.
    pub fn set_cache_size(&self, items: usize) {
        self.cache.set_max_items(items);
    }

    /// Maximum bytes of cached thumbnails.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.cache.set_max_bytes(bytes);
    }

    /// Evict cold, idle thumbnails. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        self.cache.cleanup()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Change the thumbnail size, dropping every cached thumbnail.
    pub fn set_thumbnail_size(&self, size: TargetSize) {
        if size == self.generator.thumbnail_size() {
            return;
        }
        self.generator.set_thumbnail_size(size);
        self.reset();
    }

    /// Change the quality, dropping every cached thumbnail.
    pub fn set_quality(&self, quality: f64) {
        self.generator.set_quality(quality);
        self.reset();
    }

    fn reset(&self) {
        self.cache.clear();
        lock(&self.items).clear();
        // Events from before the reset describe thumbnails that no longer apply
        self.events.try_iter().for_each(drop);
    }

    /// Whether a thumbnail matches the generator's current size and quality.
    fn is_current(&self, size: TargetSize, quality: f64) -> bool {
        size == self.generator.thumbnail_size()
            && (quality - self.generator.quality()).abs() < QUALITY_EPSILON
    }

    fn wants(&self, page: usize) -> bool {
        if !self.config.lazy_loading {
            return true;
        }
        match *lock(&self.viewport) {
            Some(viewport) => viewport
                .margin_range()
                .is_some_and(|range| range.contains(&page)),
            None => true,
        }
    }

    fn priority_for(&self, page: usize) -> i32 {
        lock(&self.viewport).map_or(DEFAULT_PRIORITY, |viewport| viewport.priority_for(page))
    }

    /// Submit one page, recording loading or the rejection.
    fn submit(&self, page: usize) -> bool {
        match self.generator.generate_thumbnail(page, self.priority_for(page)) {
            Ok(()) => {
                lock(&self.items).insert(
                    page,
                    ItemState {
                        loading: true,
                        error: None,
                    },
                );
                true
            }
            Err(err) => {
                log::debug!("Thumbnail request for page {page} rejected: {err}");
                lock(&self.items).insert(
                    page,
                    ItemState {
                        loading: false,
                        error: Some(err.to_string()),
                    },
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use readium_render::SyntheticDocument;

    use crate::config::GeneratorConfig;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn model(pages: usize, config: ModelConfig) -> ThumbnailModel {
        let generator = Arc::new(ThumbnailGenerator::new(
            GeneratorConfig::default().with_thumbnail_size(40, 60),
        ));
        let model = ThumbnailModel::new(generator, config);
        model.set_document(Some(Arc::new(SyntheticDocument::letter(pages))));
        model
    }

    #[test]
    fn test_miss_then_hit() {
        let model = model(3, ModelConfig::default());

        assert!(model.request_thumbnail(1).is_none());
        assert!(model.is_loading(1));
        assert!(model.thumbnail(1).is_none());

        assert!(model.generator().wait_idle(TIMEOUT));
        assert_eq!(model.sync(), 1);

        assert!(!model.is_loading(1));
        let bitmap = model.request_thumbnail(1).unwrap();
        assert!(bitmap.width() <= 40 && bitmap.height() <= 60);
        assert_eq!(model.cache_stats().hits, 1);
    }

    #[test]
    fn test_rejected_request_sets_error() {
        let model = model(2, ModelConfig::default());

        assert!(model.request_thumbnail(7).is_none());
        assert!(model.has_error(7));
        assert!(!model.is_loading(7));
        assert!(model.error_message(7).unwrap().contains("Invalid page number 7"));
    }

    #[test]
    fn test_lazy_loading_skips_far_pages() {
        let lazy = model(30, ModelConfig::default().with_viewport_margin(1));
        lazy.generator().pause();
        lazy.set_viewport_range(10, 12, 1);

        lazy.request_thumbnail(20);
        lazy.request_thumbnail(9);
        assert!(!lazy.is_loading(20));
        assert!(lazy.is_loading(9));

        let eager = model(30, ModelConfig::default().with_lazy_loading(false));
        eager.generator().pause();
        eager.set_viewport_range(10, 12, 1);
        eager.request_thumbnail(20);
        assert!(eager.is_loading(20));
    }

    #[test]
    fn test_preload_clamped_to_document() {
        let model = model(8, ModelConfig::default().with_preload_range(2));
        model.generator().pause();

        assert_eq!(model.preload_visible_range(5, 6), 5);
        assert!(model.is_loading(3));
        assert!(model.is_loading(7));
        assert!(!model.is_loading(2));

        // Already loading
        assert_eq!(model.preload_visible_range(5, 6), 0);
    }

    #[test]
    fn test_refresh_rerenders() {
        let model = model(2, ModelConfig::default());
        model.request_thumbnail(0);
        assert!(model.generator().wait_idle(TIMEOUT));
        model.sync();
        assert!(model.thumbnail(0).is_some());

        model.refresh_thumbnail(0);
        assert!(model.thumbnail(0).is_none());
        assert!(model.is_loading(0));

        assert!(model.generator().wait_idle(TIMEOUT));
        model.sync();
        assert!(model.thumbnail(0).is_some());
    }

    #[test]
    fn test_set_quality_clears_cache() {
        let model = model(2, ModelConfig::default());
        model.request_thumbnail_range(0, 1);
        assert!(model.generator().wait_idle(TIMEOUT));
        model.sync();
        assert_eq!(model.cache_stats().entries, 2);

        model.set_quality(2.0);
        assert_eq!(model.cache_stats().entries, 0);
        assert_eq!(model.generator().quality(), 2.0);
    }

    #[test]
    fn test_cancel_clears_loading() {
        let model = model(4, ModelConfig::default());
        model.generator().pause();
        model.request_thumbnail_range(0, 3);
        assert!(model.is_loading(2));

        model.generator().cancel_request(2);
        assert_eq!(model.sync(), 1);
        assert!(!model.is_loading(2));
        assert!(model.is_loading(1));

        model.generator().clear_queue();
        model.sync();
        for page in 0..4 {
            assert!(!model.is_loading(page), "page {page} still loading");
        }

        // Cleared pages can be requested again
        assert!(model.request_thumbnail(1).is_none());
        assert!(model.is_loading(1));
        model.generator().stop();
        model.sync();
        assert!(!model.is_loading(1));
    }

    #[test]
    fn test_refresh_of_queued_page_keeps_loading() {
        let model = model(2, ModelConfig::default());
        model.generator().pause();
        model.request_thumbnail(0);
        model.refresh_thumbnail(0);

        // The cancel is stale by the time it is synced
        model.sync();
        assert!(model.is_loading(0));
        assert_eq!(model.generator().page_state(0), PageState::Queued);
    }

    #[test]
    fn test_stale_size_result_ignored() {
        let model = model(2, ModelConfig::default());
        let generator = Arc::clone(model.generator());
        let events = generator.subscribe();
        model.request_thumbnail(0);
        assert!(generator.wait_idle(TIMEOUT));

        // Replay the finished event after the size changed underneath it
        generator.set_thumbnail_size(TargetSize::new(80, 120));
        let stale = events
            .try_iter()
            .find(|event| matches!(event, GeneratorEvent::ThumbnailGenerated { .. }));
        assert!(stale.is_some());
        assert_eq!(model.sync(), 0);
        assert!(model.thumbnail(0).is_none());
        assert!(model.is_loading(0));
    }

    #[test]
    fn test_non_adaptive_cache_uses_lru() {
        let generator = Arc::new(ThumbnailGenerator::default());
        let model = ThumbnailModel::new(generator, ModelConfig::default().with_adaptive_caching(false));
        assert_eq!(model.cache.strategy(), CacheStrategy::Lru);

        model.set_cache_size(1);
        model.cache.insert(0, Arc::new(Bitmap::new(4, 4)));
        model.cache.insert(1, Arc::new(Bitmap::new(4, 4)));
        assert_eq!(model.cache_stats().entries, 1);
        assert!(model.thumbnail(1).is_some());
    }
}
