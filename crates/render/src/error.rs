//! Render errors

use crate::source::SourceError;

/// Result type for render operations
pub type RenderResult<T> = Result<T, RenderError>;

/// Everything that can stop a page from turning into a bitmap.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("no document loaded")]
    NoDocument,

    #[error("page {page} is out of range (document has {page_count} pages)")]
    InvalidPage { page: usize, page_count: usize },

    #[error("target size {width}x{height} is empty")]
    ZeroTargetSize { width: u32, height: u32 },

    #[error("page {page} rendered to an empty image")]
    EmptyRaster { page: usize },

    #[error("page {page} failed to render: {source}")]
    Source {
        page: usize,
        #[source]
        source: SourceError,
    },

    #[error("GPU rasterizer failed: {0}")]
    Gpu(String),

    #[error("renderer panicked: {0}")]
    Panicked(String),
}

impl RenderError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RenderError::NoDocument | RenderError::InvalidPage { .. } | RenderError::ZeroTargetSize { .. }
        )
    }
}
