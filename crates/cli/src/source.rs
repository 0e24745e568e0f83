//! Folder of page images as a document
//!
//! Every PNG or JPEG in a directory is one page, in file name order. A
//! pixel counts as one point, so an image rasterizes at its native size at
//! 72 DPI.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use readium_render::source::POINTS_PER_INCH;
use readium_render::{Bitmap, CropRect, PageSize, PageSource, SourceError};

const PAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Debug)]
pub struct ImageFolderSource {
    pages: Vec<(PathBuf, PageSize)>,
}

impl ImageFolderSource {
    /// Index the page images in `dir`. Only the image headers are read.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            anyhow::bail!("image directory does not exist: {}", dir.display());
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && is_page_image(path))
            .collect();
        paths.sort();

        let pages = paths
            .into_iter()
            .map(|path| {
                let (width, height) = image::image_dimensions(&path)
                    .with_context(|| format!("failed to read image {}", path.display()))?;
                Ok((path, PageSize::new(f64::from(width), f64::from(height))))
            })
            .collect::<Result<Vec<_>>>()?;

        if pages.is_empty() {
            anyhow::bail!("no page images found in {}", dir.display());
        }
        Ok(Self { pages })
    }

    pub fn path(&self, page: usize) -> Option<&Path> {
        self.pages.get(page).map(|(path, _)| path.as_path())
    }
}

fn is_page_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl PageSource for ImageFolderSource {
    fn num_pages(&self) -> usize {
        self.pages.len()
    }

    fn page_size(&self, page: usize) -> Option<PageSize> {
        self.pages.get(page).map(|(_, size)| *size)
    }

    fn render_page_to_image(
        &self,
        page: usize,
        dpi_x: f64,
        dpi_y: f64,
        crop: Option<CropRect>,
    ) -> Result<Bitmap, SourceError> {
        let (path, size) = self
            .pages
            .get(page)
            .ok_or_else(|| SourceError::new(format!("no page {page}")))?;

        let mut raster: Bitmap = image::open(path)
            .map_err(|err| SourceError::new(format!("{}: {err}", path.display())))?
            .to_rgba8();

        if let Some(rect) = crop {
            let x = rect.x.max(0.0) as u32;
            let y = rect.y.max(0.0) as u32;
            let width = (rect.width.max(0.0) as u32).min(raster.width().saturating_sub(x));
            let height = (rect.height.max(0.0) as u32).min(raster.height().saturating_sub(y));
            raster = imageops::crop_imm(&raster, x, y, width, height).to_image();
        }

        let (mut width, mut height) = size.pixels_at(dpi_x, dpi_y);
        if crop.is_some() {
            width = (f64::from(raster.width()) * dpi_x / POINTS_PER_INCH).round() as u32;
            height = (f64::from(raster.height()) * dpi_y / POINTS_PER_INCH).round() as u32;
        }
        if width == 0 || height == 0 || raster.dimensions() == (width, height) {
            return Ok(raster);
        }
        Ok(imageops::resize(&raster, width, height, FilterType::Triangle))
    }
}
