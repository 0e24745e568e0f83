//! Readium Render Library
//!
//! Turns document pages into thumbnail bitmaps: the [`PageSource`]
//! capability documents implement, DPI selection for thumbnail and viewer
//! profiles, and a render backend with an optional GPU path that falls
//! back to CPU rasterization.

pub mod backend;
pub mod dpi;
pub mod error;
pub mod source;

pub use backend::{
    BackendPreference, GpuRasterizer, RenderBackend, RenderRequest, ScalingMode,
    SMALL_THUMBNAIL_WIDTH,
};
pub use dpi::{DpiCalculator, RenderQuality, ViewerDpiProfile};
pub use error::{RenderError, RenderResult};
pub use readium_cache::Bitmap;
pub use source::{CropRect, PageSize, PageSource, SourceError, SyntheticDocument, TargetSize};
