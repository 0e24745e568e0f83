//! Synchronous request rejections

/// Why a thumbnail request was refused before reaching the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("No document loaded")]
    NoDocument,

    #[error("Invalid page number {page} (document has {page_count} pages)")]
    InvalidPage { page: usize, page_count: usize },

    #[error("Thumbnail size {width}x{height} is empty")]
    ZeroTargetSize { width: u32, height: u32 },
}

/// Result type for generator requests
pub type RequestResult<T> = Result<T, RequestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(RequestError::NoDocument.to_string(), "No document loaded");
        assert_eq!(
            RequestError::InvalidPage { page: 9, page_count: 3 }.to_string(),
            "Invalid page number 9 (document has 3 pages)"
        );
        assert_eq!(
            RequestError::ZeroTargetSize { width: 0, height: 160 }.to_string(),
            "Thumbnail size 0x160 is empty"
        );
    }
}
