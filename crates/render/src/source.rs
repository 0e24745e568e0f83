//! Page source capability
//!
//! The render pipeline never sees a concrete document library. Anything
//! that can report page geometry and rasterize a page at a given DPI can
//! feed it.

use image::Rgba;
use readium_cache::Bitmap;

/// Points per inch, the unit page sizes are reported in.
pub const POINTS_PER_INCH: f64 = 72.0;

/// Page dimensions in points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

impl PageSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// US Letter, 612 x 792 points.
    pub fn letter() -> Self {
        Self::new(612.0, 792.0)
    }

    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }

    /// Pixel dimensions of this page rasterized at `dpi`.
    pub fn pixels_at(&self, dpi_x: f64, dpi_y: f64) -> (u32, u32) {
        (
            (self.width * dpi_x / POINTS_PER_INCH).round().max(0.0) as u32,
            (self.height * dpi_y / POINTS_PER_INCH).round().max(0.0) as u32,
        )
    }
}

/// Requested thumbnail dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl Default for TargetSize {
    /// The default thumbnail size, 120 x 160.
    fn default() -> Self {
        Self::new(120, 160)
    }
}

/// Sub-rectangle of a page in points, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Failure reported by a page source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SourceError {
    message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A document as seen by the render pipeline.
///
/// Implementations are called from several worker threads at once.
pub trait PageSource: Send + Sync {
    fn num_pages(&self) -> usize;

    /// Page dimensions in points, `None` for an unknown page.
    fn page_size(&self, page: usize) -> Option<PageSize>;

    /// Rasterize a page (or a crop of it) at the given resolution.
    fn render_page_to_image(
        &self,
        page: usize,
        dpi_x: f64,
        dpi_y: f64,
        crop: Option<CropRect>,
    ) -> Result<Bitmap, SourceError>;
}

/// In-memory document that paints each page with a distinct gradient.
///
/// Used by the command-line tool and throughout the tests.
#[derive(Debug, Clone)]
pub struct SyntheticDocument {
    pages: Vec<PageSize>,
}

impl SyntheticDocument {
    /// `page_count` pages of identical size.
    pub fn new(page_count: usize, size: PageSize) -> Self {
        Self {
            pages: vec![size; page_count],
        }
    }

    pub fn with_pages(pages: Vec<PageSize>) -> Self {
        Self { pages }
    }

    /// `page_count` US Letter pages.
    pub fn letter(page_count: usize) -> Self {
        Self::new(page_count, PageSize::letter())
    }

    /// Color of the pixel at (`x`, `y`) of a full page raster.
    fn paint(page: usize, x: u32, y: u32, width: u32, height: u32) -> Rgba<u8> {
        let fx = x as f64 / width.max(1) as f64;
        let fy = y as f64 / height.max(1) as f64;
        let hue = ((page * 47) % 256) as u8;
        Rgba([
            hue,
            (fx * 255.0) as u8,
            (fy * 255.0) as u8,
            255,
        ])
    }
}

impl PageSource for SyntheticDocument {
    fn num_pages(&self) -> usize {
        self.pages.len()
    }

    fn page_size(&self, page: usize) -> Option<PageSize> {
        self.pages.get(page).copied()
    }

    fn render_page_to_image(
        &self,
        page: usize,
        dpi_x: f64,
        dpi_y: f64,
        crop: Option<CropRect>,
    ) -> Result<Bitmap, SourceError> {
        let size = self
            .page_size(page)
            .ok_or_else(|| SourceError::new(format!("no page {page}")))?;
        let (full_width, full_height) = size.pixels_at(dpi_x, dpi_y);

        let (left, top, width, height) = match crop {
            Some(rect) => {
                let left = (rect.x * dpi_x / POINTS_PER_INCH).round().max(0.0) as u32;
                let top = (rect.y * dpi_y / POINTS_PER_INCH).round().max(0.0) as u32;
                let width = (rect.width * dpi_x / POINTS_PER_INCH).round().max(0.0) as u32;
                let height = (rect.height * dpi_y / POINTS_PER_INCH).round().max(0.0) as u32;
                (
                    left.min(full_width),
                    top.min(full_height),
                    width.min(full_width.saturating_sub(left)),
                    height.min(full_height.saturating_sub(top)),
                )
            }
            None => (0, 0, full_width, full_height),
        };

        Ok(Bitmap::from_fn(width, height, |x, y| {
            Self::paint(page, left + x, top + y, full_width, full_height)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixels_at() {
        let size = PageSize::letter();
        assert_eq!(size.pixels_at(72.0, 72.0), (612, 792));
        assert_eq!(size.pixels_at(144.0, 36.0), (1224, 396));
    }

    #[test]
    fn test_empty_sizes() {
        assert!(PageSize::new(0.0, 10.0).is_empty());
        assert!(PageSize::new(f64::NAN, 10.0).is_empty());
        assert!(!PageSize::letter().is_empty());
        assert!(TargetSize::new(10, 0).is_empty());
        assert_eq!(TargetSize::default(), TargetSize::new(120, 160));
    }

    #[test]
    fn test_synthetic_render() {
        let doc = SyntheticDocument::new(3, PageSize::new(100.0, 200.0));
        assert_eq!(doc.num_pages(), 3);

        let image = doc.render_page_to_image(1, 36.0, 36.0, None).unwrap();
        assert_eq!(image.dimensions(), (50, 100));
        assert_eq!(image.get_pixel(0, 0)[3], 255);
    }

    #[test]
    fn test_synthetic_pages_differ() {
        let doc = SyntheticDocument::letter(2);
        let a = doc.render_page_to_image(0, 10.0, 10.0, None).unwrap();
        let b = doc.render_page_to_image(1, 10.0, 10.0, None).unwrap();
        assert_ne!(a.get_pixel(0, 0), b.get_pixel(0, 0));
    }

    #[test]
    fn test_synthetic_crop() {
        let doc = SyntheticDocument::new(1, PageSize::new(72.0, 72.0));
        let full = doc.render_page_to_image(0, 100.0, 100.0, None).unwrap();
        let crop = CropRect {
            x: 36.0,
            y: 36.0,
            width: 72.0,
            height: 72.0,
        };
        let part = doc.render_page_to_image(0, 100.0, 100.0, Some(crop)).unwrap();

        assert_eq!(part.dimensions(), (50, 50));
        assert_eq!(part.get_pixel(0, 0), full.get_pixel(50, 50));
    }

    #[test]
    fn test_synthetic_unknown_page() {
        let doc = SyntheticDocument::letter(1);
        assert!(doc.page_size(1).is_none());
        assert!(doc.render_page_to_image(1, 72.0, 72.0, None).is_err());
    }
}
