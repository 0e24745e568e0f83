//! DPI selection
//!
//! Two independent profiles: thumbnails, where DPI is derived from how
//! much the page has to shrink to fit its target box, and the full-page
//! viewer, where DPI follows the zoom level and a quality preset.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::source::{PageSize, TargetSize, POINTS_PER_INCH};

pub const MIN_THUMBNAIL_DPI: f64 = 72.0;
pub const MAX_THUMBNAIL_DPI: f64 = 200.0;
pub const MIN_VIEWER_DPI: f64 = 72.0;
pub const MAX_VIEWER_DPI: f64 = 600.0;

/// Thumbnails at most this wide start from 72 DPI, larger ones from 96.
const SMALL_TARGET_WIDTH: u32 = 150;
const SMALL_BASE_DPI: f64 = 72.0;
const LARGE_BASE_DPI: f64 = 96.0;

/// Number of memoized thumbnail DPI results.
pub const DPI_CACHE_CAPACITY: usize = 100;

/// Replace a non-positive or non-finite device pixel ratio with 1.0.
pub fn sanitize_device_pixel_ratio(ratio: f64) -> f64 {
    if ratio > 0.0 && ratio.is_finite() {
        ratio
    } else {
        1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DpiKey {
    target_width: u32,
    target_height: u32,
    page_width: i64,
    page_height: i64,
    quality_pct: i64,
}

#[derive(Default)]
struct DpiCache {
    values: HashMap<DpiKey, f64>,
    order: VecDeque<DpiKey>,
}

impl DpiCache {
    fn insert(&mut self, key: DpiKey, dpi: f64) {
        if self.values.insert(key, dpi).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > DPI_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.values.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.values.clear();
        self.order.clear();
    }
}

/// Thumbnail DPI calculator with a small memo table.
///
/// ```
/// use readium_render::{DpiCalculator, PageSize, TargetSize};
///
/// let calc = DpiCalculator::new(1.0);
/// // A letter page squeezed into a 120x160 box barely needs 72 DPI
/// let dpi = calc.thumbnail_dpi(TargetSize::new(120, 160), PageSize::letter(), 1.0);
/// assert_eq!(dpi, 72.0);
/// ```
pub struct DpiCalculator {
    device_pixel_ratio: AtomicU64,
    cache: Mutex<DpiCache>,
}

impl DpiCalculator {
    pub fn new(device_pixel_ratio: f64) -> Self {
        Self {
            device_pixel_ratio: AtomicU64::new(
                sanitize_device_pixel_ratio(device_pixel_ratio).to_bits(),
            ),
            cache: Mutex::new(DpiCache::default()),
        }
    }

    pub fn device_pixel_ratio(&self) -> f64 {
        f64::from_bits(self.device_pixel_ratio.load(Ordering::Relaxed))
    }

    /// Change the device pixel ratio; memoized results are discarded.
    pub fn set_device_pixel_ratio(&self, ratio: f64) {
        let ratio = sanitize_device_pixel_ratio(ratio);
        let previous = self.device_pixel_ratio.swap(ratio.to_bits(), Ordering::Relaxed);
        if f64::from_bits(previous) != ratio {
            self.cache().clear();
        }
    }

    /// DPI for rendering `page` into a `target` box at `quality`.
    ///
    /// `base * min(tw/pw, th/ph) * quality * device_pixel_ratio`, where
    /// base is 72 for targets up to 150 px wide and 96 otherwise, clamped
    /// to [72, 200]. Empty page or target sizes yield 72.
    pub fn thumbnail_dpi(&self, target: TargetSize, page: PageSize, quality: f64) -> f64 {
        if target.is_empty() || page.is_empty() {
            return MIN_THUMBNAIL_DPI;
        }

        let key = DpiKey {
            target_width: target.width,
            target_height: target.height,
            page_width: page.width as i64,
            page_height: page.height as i64,
            quality_pct: (quality * 100.0) as i64,
        };
        if let Some(dpi) = self.cache().values.get(&key) {
            return *dpi;
        }

        let scale = (target.width as f64 / page.width).min(target.height as f64 / page.height);
        let base = if target.width <= SMALL_TARGET_WIDTH {
            SMALL_BASE_DPI
        } else {
            LARGE_BASE_DPI
        };
        let dpi = (base * scale * quality * self.device_pixel_ratio())
            .clamp(MIN_THUMBNAIL_DPI, MAX_THUMBNAIL_DPI);

        self.cache().insert(key, dpi);
        dpi
    }

    /// Number of memoized results.
    pub fn cached_entries(&self) -> usize {
        self.cache().values.len()
    }

    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    fn cache(&self) -> MutexGuard<'_, DpiCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DpiCalculator {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Quality preset for full-page viewing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderQuality {
    Draft,
    Normal,
    #[default]
    High,
    Ultra,
}

impl std::str::FromStr for RenderQuality {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "draft" => Ok(RenderQuality::Draft),
            "normal" => Ok(RenderQuality::Normal),
            "high" => Ok(RenderQuality::High),
            "ultra" => Ok(RenderQuality::Ultra),
            other => Err(format!("unknown render quality '{other}' (draft, normal, high, ultra)")),
        }
    }
}

impl RenderQuality {
    pub fn multiplier(self) -> f64 {
        match self {
            RenderQuality::Draft => 0.5,
            RenderQuality::Normal => 1.0,
            RenderQuality::High => 1.5,
            RenderQuality::Ultra => 2.0,
        }
    }
}

/// DPI profile for the page viewer, separate from thumbnails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewerDpiProfile {
    base_dpi_x: f64,
    base_dpi_y: f64,
    pub quality: RenderQuality,
}

impl ViewerDpiProfile {
    /// Non-positive base DPI values fall back to 72.
    pub fn new(base_dpi_x: f64, base_dpi_y: f64, quality: RenderQuality) -> Self {
        let sanitize = |dpi: f64| {
            if dpi > 0.0 && dpi.is_finite() {
                dpi
            } else {
                log::warn!("Invalid viewer DPI {dpi}, using {POINTS_PER_INCH}");
                POINTS_PER_INCH
            }
        };
        Self {
            base_dpi_x: sanitize(base_dpi_x),
            base_dpi_y: sanitize(base_dpi_y),
            quality,
        }
    }

    pub fn base_dpi(&self) -> (f64, f64) {
        (self.base_dpi_x, self.base_dpi_y)
    }

    /// Effective (x, y) DPI at a zoom level on a display.
    ///
    /// `base * max(0.1, zoom) * quality multiplier * device_pixel_ratio`,
    /// clamped to [72, 600].
    pub fn effective_dpi(&self, zoom: f64, device_pixel_ratio: f64) -> (f64, f64) {
        let ratio = sanitize_device_pixel_ratio(device_pixel_ratio);
        let zoom = if zoom.is_finite() { zoom.max(0.1) } else { 1.0 };
        let factor = zoom * self.quality.multiplier() * ratio;
        (
            (self.base_dpi_x * factor).clamp(MIN_VIEWER_DPI, MAX_VIEWER_DPI),
            (self.base_dpi_y * factor).clamp(MIN_VIEWER_DPI, MAX_VIEWER_DPI),
        )
    }
}

impl Default for ViewerDpiProfile {
    fn default() -> Self {
        Self::new(POINTS_PER_INCH, POINTS_PER_INCH, RenderQuality::default())
    }
}
