//! Render backend
//!
//! Produces one thumbnail bitmap per request:
//!
//! 1. validate the request against the document
//! 2. pick a DPI for the page and target box
//! 3. serve from the compressed cache when possible
//! 4. rasterize on the GPU when selected and available, otherwise (or on
//!    any GPU failure) on the CPU through the page source
//! 5. scale to fit the target box, keeping the aspect ratio
//! 6. compress into the cache
//!
//! The backend is shared by all render workers. Its memory pool lends the
//! JPEG codec its staging buffers.
//!
//! Full pages for the viewer go through [`RenderBackend::render_page`],
//! which follows a [`ViewerDpiProfile`] and skips the thumbnail cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::imageops::{self, FilterType};
use readium_cache::{Bitmap, CacheConfig, CacheKey, CompressedPageCache, MemoryPool};

use crate::dpi::{DpiCalculator, ViewerDpiProfile};
use crate::error::{RenderError, RenderResult};
use crate::source::{PageSource, TargetSize};

/// Targets up to this width count as small thumbnails.
pub const SMALL_THUMBNAIL_WIDTH: u32 = 150;

/// Fit ratios above this are cheap enough for nearest-neighbour scaling.
const FAST_SCALE_RATIO: f64 = 0.8;

/// Which rasterizer a request would like to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendPreference {
    CpuOnly,
    GpuAccelerated,
    /// GPU for large targets, CPU for small thumbnails
    #[default]
    Hybrid,
}

/// Resampling filter used to fit a raster into its target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    /// Nearest neighbour
    Fast,
    /// Bilinear
    Smooth,
}

impl ScalingMode {
    /// Fast when the raster barely changes size or the target is a small
    /// thumbnail, smooth otherwise.
    pub fn choose(fit_ratio: f64, target: TargetSize) -> Self {
        if fit_ratio > FAST_SCALE_RATIO || target.width <= SMALL_THUMBNAIL_WIDTH {
            ScalingMode::Fast
        } else {
            ScalingMode::Smooth
        }
    }
}

/// Optional hardware rasterizer.
///
/// Any error makes the backend fall back to the CPU path for that request.
pub trait GpuRasterizer: Send + Sync {
    fn is_available(&self) -> bool;

    fn rasterize(&self, source: &dyn PageSource, page: usize, dpi: f64) -> RenderResult<Bitmap>;
}

/// One page to turn into a thumbnail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRequest {
    pub page: usize,
    pub target: TargetSize,
    pub quality: f64,
    pub preference: BackendPreference,
}

impl RenderRequest {
    pub fn new(page: usize, target: TargetSize) -> Self {
        Self {
            page,
            target,
            quality: 1.0,
            preference: BackendPreference::default(),
        }
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_preference(mut self, preference: BackendPreference) -> Self {
        self.preference = preference;
        self
    }
}

/// Shared thumbnail renderer.
///
/// # Example
///
/// ```
/// use readium_render::{RenderBackend, RenderRequest, SyntheticDocument, TargetSize};
///
/// let backend = RenderBackend::default();
/// let doc = SyntheticDocument::letter(3);
///
/// let thumb = backend
///     .render(&doc, &RenderRequest::new(1, TargetSize::new(100, 150)))
///     .unwrap();
/// assert!(thumb.width() <= 100 && thumb.height() <= 150);
/// ```
pub struct RenderBackend {
    dpi: DpiCalculator,
    cache: Arc<CompressedPageCache>,
    pool: MemoryPool,
    gpu: Option<Arc<dyn GpuRasterizer>>,
    gpu_enabled: AtomicBool,
    compression_enabled: AtomicBool,
}

impl RenderBackend {
    pub fn new(config: &CacheConfig, device_pixel_ratio: f64) -> Self {
        let pool = MemoryPool::from_config(config);
        Self {
            dpi: DpiCalculator::new(device_pixel_ratio),
            cache: Arc::new(CompressedPageCache::from_config(config).with_pool(pool.clone())),
            pool,
            gpu: None,
            gpu_enabled: AtomicBool::new(true),
            compression_enabled: AtomicBool::new(config.compression_enabled),
        }
    }

    /// Attach a hardware rasterizer.
    pub fn with_gpu(mut self, gpu: Arc<dyn GpuRasterizer>) -> Self {
        self.gpu = Some(gpu);
        self
    }

    /// Render one request against `source`.
    pub fn render(&self, source: &dyn PageSource, request: &RenderRequest) -> RenderResult<Bitmap> {
        let RenderRequest {
            page,
            target,
            quality,
            ..
        } = *request;

        if target.is_empty() {
            return Err(RenderError::ZeroTargetSize {
                width: target.width,
                height: target.height,
            });
        }
        let page_count = source.num_pages();
        let page_size = source
            .page_size(page)
            .filter(|_| page < page_count)
            .ok_or(RenderError::InvalidPage { page, page_count })?;

        let dpi = self.dpi.thumbnail_dpi(target, page_size, quality);
        let key = CacheKey::new(page as u32, target.width, target.height, dpi, quality);
        let use_cache = self.compression_enabled();

        if use_cache {
            if let Some(bitmap) = self.cache.lookup(&key) {
                log::trace!("Page {page} served from cache ({key})");
                return Ok(bitmap);
            }
        }

        let raster = self.rasterize(source, request, dpi)?;
        if raster.width() == 0 || raster.height() == 0 {
            return Err(RenderError::EmptyRaster { page });
        }

        let thumbnail = Self::scale_to_fit(raster, target);

        if use_cache {
            if let Err(err) = self.cache.insert(key, &thumbnail) {
                log::debug!("Not caching page {page}: {err}");
            }
        }

        Ok(thumbnail)
    }

    /// Rasterize a whole page for viewing at `zoom`.
    ///
    /// DPI comes from `profile` and the device pixel ratio, within the
    /// viewer bounds of [72, 600]. Always rendered on the CPU path.
    pub fn render_page(
        &self,
        source: &dyn PageSource,
        page: usize,
        profile: &ViewerDpiProfile,
        zoom: f64,
    ) -> RenderResult<Bitmap> {
        let page_count = source.num_pages();
        if page >= page_count {
            return Err(RenderError::InvalidPage { page, page_count });
        }

        let (dpi_x, dpi_y) = profile.effective_dpi(zoom, self.dpi.device_pixel_ratio());
        log::debug!("Viewer render of page {page} at {dpi_x:.0}x{dpi_y:.0} DPI");
        let raster = source
            .render_page_to_image(page, dpi_x, dpi_y, None)
            .map_err(|source| RenderError::Source { page, source })?;
        if raster.width() == 0 || raster.height() == 0 {
            return Err(RenderError::EmptyRaster { page });
        }
        Ok(raster)
    }

    fn rasterize(
        &self,
        source: &dyn PageSource,
        request: &RenderRequest,
        dpi: f64,
    ) -> RenderResult<Bitmap> {
        if let Some(gpu) = self.selected_gpu(request) {
            match gpu.rasterize(source, request.page, dpi) {
                Ok(raster) => return Ok(raster),
                Err(err) => {
                    log::debug!(
                        "GPU render of page {} failed, falling back to CPU: {err}",
                        request.page
                    );
                }
            }
        }

        source
            .render_page_to_image(request.page, dpi, dpi, None)
            .map_err(|source| RenderError::Source {
                page: request.page,
                source,
            })
    }

    fn selected_gpu(&self, request: &RenderRequest) -> Option<&Arc<dyn GpuRasterizer>> {
        if !self.gpu_enabled() {
            return None;
        }
        let wants_gpu = match request.preference {
            BackendPreference::CpuOnly => false,
            BackendPreference::GpuAccelerated => true,
            BackendPreference::Hybrid => request.target.width > SMALL_THUMBNAIL_WIDTH,
        };
        if !wants_gpu {
            return None;
        }
        self.gpu.as_ref().filter(|gpu| gpu.is_available())
    }

    /// Fit `raster` inside `target`, preserving its aspect ratio.
    fn scale_to_fit(raster: Bitmap, target: TargetSize) -> Bitmap {
        let (width, height) = raster.dimensions();
        let ratio = (target.width as f64 / width as f64).min(target.height as f64 / height as f64);
        let out_width = ((width as f64 * ratio).round() as u32).clamp(1, target.width);
        let out_height = ((height as f64 * ratio).round() as u32).clamp(1, target.height);

        if (out_width, out_height) == (width, height) {
            return raster;
        }

        let filter = match ScalingMode::choose(ratio, target) {
            ScalingMode::Fast => FilterType::Nearest,
            ScalingMode::Smooth => FilterType::Triangle,
        };
        imageops::resize(&raster, out_width, out_height, filter)
    }

    pub fn dpi_calculator(&self) -> &DpiCalculator {
        &self.dpi
    }

    pub fn cache(&self) -> &Arc<CompressedPageCache> {
        &self.cache
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Whether a GPU rasterizer is attached and reports itself usable.
    pub fn gpu_available(&self) -> bool {
        self.gpu.as_ref().is_some_and(|gpu| gpu.is_available())
    }

    pub fn set_gpu_enabled(&self, enabled: bool) {
        self.gpu_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn gpu_enabled(&self) -> bool {
        self.gpu_enabled.load(Ordering::Relaxed)
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.compression_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled.load(Ordering::Relaxed)
    }
}

impl Default for RenderBackend {
    fn default() -> Self {
        Self::new(&CacheConfig::default(), 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dpi::RenderQuality;
    use crate::source::{CropRect, PageSize, SourceError, SyntheticDocument};
    use std::sync::atomic::AtomicUsize;

    /// Counts CPU rasterizations.
    struct CountingSource {
        inner: SyntheticDocument,
        renders: AtomicUsize,
    }

    impl CountingSource {
        fn new(pages: usize) -> Self {
            Self {
                inner: SyntheticDocument::letter(pages),
                renders: AtomicUsize::new(0),
            }
        }

        fn renders(&self) -> usize {
            self.renders.load(Ordering::SeqCst)
        }
    }

    impl PageSource for CountingSource {
        fn num_pages(&self) -> usize {
            self.inner.num_pages()
        }

        fn page_size(&self, page: usize) -> Option<PageSize> {
            self.inner.page_size(page)
        }

        fn render_page_to_image(
            &self,
            page: usize,
            dpi_x: f64,
            dpi_y: f64,
            crop: Option<CropRect>,
        ) -> Result<Bitmap, SourceError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            self.inner.render_page_to_image(page, dpi_x, dpi_y, crop)
        }
    }

    struct BlankSource;

    impl PageSource for BlankSource {
        fn num_pages(&self) -> usize {
            1
        }

        fn page_size(&self, _page: usize) -> Option<PageSize> {
            Some(PageSize::letter())
        }

        fn render_page_to_image(
            &self,
            _page: usize,
            _dpi_x: f64,
            _dpi_y: f64,
            _crop: Option<CropRect>,
        ) -> Result<Bitmap, SourceError> {
            Ok(Bitmap::new(0, 0))
        }
    }

    struct FakeGpu {
        available: bool,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeGpu {
        fn new(available: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                available,
                fail,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl GpuRasterizer for FakeGpu {
        fn is_available(&self) -> bool {
            self.available
        }

        fn rasterize(&self, source: &dyn PageSource, page: usize, dpi: f64) -> RenderResult<Bitmap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RenderError::Gpu("device lost".into()));
            }
            let size = source.page_size(page).unwrap_or(PageSize::letter());
            let (w, h) = size.pixels_at(dpi, dpi);
            Ok(Bitmap::from_pixel(w, h, image::Rgba([1, 2, 3, 255])))
        }
    }

    fn uncached() -> RenderBackend {
        RenderBackend::new(&CacheConfig::default().with_compression(false), 1.0)
    }

    #[test]
    fn test_renders_within_target() {
        let backend = uncached();
        let doc = SyntheticDocument::letter(3);
        for page in 0..3 {
            let thumb = backend
                .render(&doc, &RenderRequest::new(page, TargetSize::new(100, 150)))
                .unwrap();
            let (w, h) = thumb.dimensions();
            assert!(w <= 100 && h <= 150);
            assert!(w == 100 || h == 150);
        }
    }

    #[test]
    fn test_aspect_ratio_kept() {
        let backend = uncached();
        let doc = SyntheticDocument::new(1, PageSize::new(200.0, 100.0));
        let thumb = backend
            .render(&doc, &RenderRequest::new(0, TargetSize::new(400, 400)))
            .unwrap();
        assert_eq!(thumb.dimensions(), (400, 200));
    }

    #[test]
    fn test_rejects_bad_requests() {
        let backend = uncached();
        let doc = SyntheticDocument::letter(2);

        assert_eq!(
            backend.render(&doc, &RenderRequest::new(0, TargetSize::new(0, 10))),
            Err(RenderError::ZeroTargetSize { width: 0, height: 10 })
        );
        assert_eq!(
            backend.render(&doc, &RenderRequest::new(2, TargetSize::default())),
            Err(RenderError::InvalidPage { page: 2, page_count: 2 })
        );
    }

    #[test]
    fn test_empty_raster_is_error() {
        let backend = uncached();
        let result = backend.render(&BlankSource, &RenderRequest::new(0, TargetSize::default()));
        assert_eq!(result, Err(RenderError::EmptyRaster { page: 0 }));
    }

    #[test]
    fn test_cache_serves_second_request() {
        let backend = RenderBackend::default();
        let doc = CountingSource::new(2);
        let request = RenderRequest::new(1, TargetSize::default());

        let first = backend.render(&doc, &request).unwrap();
        let second = backend.render(&doc, &request).unwrap();

        assert_eq!(doc.renders(), 1);
        assert_eq!(first.dimensions(), second.dimensions());
        assert_eq!(backend.cache().stats().hits, 1);
    }

    #[test]
    fn test_quality_change_misses_cache() {
        let backend = RenderBackend::default();
        let doc = CountingSource::new(1);
        let target = TargetSize::new(400, 500);

        backend.render(&doc, &RenderRequest::new(0, target)).unwrap();
        backend
            .render(&doc, &RenderRequest::new(0, target).with_quality(2.0))
            .unwrap();

        assert_eq!(doc.renders(), 2);
        assert_eq!(backend.cache().len(), 2);
    }

    #[test]
    fn test_compression_disabled_skips_cache() {
        let backend = uncached();
        let doc = CountingSource::new(1);
        let request = RenderRequest::new(0, TargetSize::default());

        backend.render(&doc, &request).unwrap();
        backend.render(&doc, &request).unwrap();

        assert_eq!(doc.renders(), 2);
        assert!(backend.cache().is_empty());
    }

    #[test]
    fn test_gpu_failure_falls_back_to_cpu() {
        let gpu = FakeGpu::new(true, true);
        let backend = uncached().with_gpu(gpu.clone());
        let doc = CountingSource::new(1);

        let request = RenderRequest::new(0, TargetSize::default())
            .with_preference(BackendPreference::GpuAccelerated);
        assert!(backend.render(&doc, &request).is_ok());

        assert_eq!(gpu.calls(), 1);
        assert_eq!(doc.renders(), 1);
    }

    #[test]
    fn test_gpu_used_when_selected() {
        let gpu = FakeGpu::new(true, false);
        let backend = uncached().with_gpu(gpu.clone());
        let doc = CountingSource::new(1);

        let request = RenderRequest::new(0, TargetSize::default())
            .with_preference(BackendPreference::GpuAccelerated);
        let thumb = backend.render(&doc, &request).unwrap();

        assert_eq!(gpu.calls(), 1);
        assert_eq!(doc.renders(), 0);
        assert_eq!(thumb.get_pixel(0, 0).0, [1, 2, 3, 255]);
    }

    #[test]
    fn test_hybrid_routes_by_target_width() {
        let gpu = FakeGpu::new(true, false);
        let backend = uncached().with_gpu(gpu.clone());
        let doc = CountingSource::new(1);

        backend
            .render(&doc, &RenderRequest::new(0, TargetSize::new(120, 160)))
            .unwrap();
        assert_eq!(gpu.calls(), 0);

        backend
            .render(&doc, &RenderRequest::new(0, TargetSize::new(300, 400)))
            .unwrap();
        assert_eq!(gpu.calls(), 1);
    }

    #[test]
    fn test_gpu_skipped_when_disabled_or_unavailable() {
        let doc = CountingSource::new(1);
        let request = RenderRequest::new(0, TargetSize::default())
            .with_preference(BackendPreference::GpuAccelerated);

        let unavailable = FakeGpu::new(false, false);
        let backend = uncached().with_gpu(unavailable.clone());
        assert!(!backend.gpu_available());
        backend.render(&doc, &request).unwrap();
        assert_eq!(unavailable.calls(), 0);

        let gpu = FakeGpu::new(true, false);
        let backend = uncached().with_gpu(gpu.clone());
        backend.set_gpu_enabled(false);
        backend.render(&doc, &request).unwrap();
        assert_eq!(gpu.calls(), 0);
        assert_eq!(doc.renders(), 2);
    }

    #[test]
    fn test_scaling_mode_choice() {
        assert_eq!(ScalingMode::choose(0.9, TargetSize::new(400, 400)), ScalingMode::Fast);
        assert_eq!(ScalingMode::choose(0.3, TargetSize::new(150, 200)), ScalingMode::Fast);
        assert_eq!(ScalingMode::choose(0.3, TargetSize::new(400, 400)), ScalingMode::Smooth);
    }

    #[test]
    fn test_viewer_page_follows_profile() {
        let backend = RenderBackend::new(&CacheConfig::default(), 2.0);
        let doc = CountingSource::new(2);

        // 72 * 1.0 zoom * 1.0 (Normal) * 2.0 ratio = 144 DPI, twice the points
        let profile = ViewerDpiProfile::new(72.0, 72.0, RenderQuality::Normal);
        let page = backend.render_page(&doc, 1, &profile, 1.0).unwrap();
        assert_eq!(page.dimensions(), PageSize::letter().pixels_at(144.0, 144.0));

        // 72 * 0.5 * 0.5 (Draft) * 2.0 = 36, floored at 72 DPI
        let draft = ViewerDpiProfile::new(72.0, 72.0, RenderQuality::Draft);
        let page = backend.render_page(&doc, 0, &draft, 0.5).unwrap();
        assert_eq!(page.dimensions(), PageSize::letter().pixels_at(72.0, 72.0));

        assert!(matches!(
            backend.render_page(&doc, 5, &profile, 1.0),
            Err(RenderError::InvalidPage { page: 5, .. })
        ));
        assert!(matches!(
            backend.render_page(&BlankSource, 0, &profile, 1.0),
            Err(RenderError::EmptyRaster { page: 0 })
        ));
        // Viewer pages never touch the thumbnail cache
        assert_eq!(doc.renders(), 2);
        assert_eq!(backend.cache().stats().entries, 0);
    }

    #[test]
    fn test_pool_buffers_reused_across_renders() {
        let backend = RenderBackend::default();
        let doc = SyntheticDocument::letter(3);
        for page in 0..3 {
            backend
                .render(&doc, &RenderRequest::new(page, TargetSize::new(100, 150)))
                .unwrap();
        }
        // Served from the cache through the same staging buffer
        backend
            .render(&doc, &RenderRequest::new(1, TargetSize::new(100, 150)))
            .unwrap();

        let stats = backend.pool().stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.reuses, 3);
        assert_eq!(stats.in_use, 0);
        assert_eq!(backend.cache().stats().hits, 1);
    }
}
