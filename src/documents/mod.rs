//! Where page images come from.
//!
//! The job pipeline only knows documents by [`DocumentId`]. A
//! [`DocumentSource`] turns an ID into a page count and, one page at a time,
//! into encoded page images.

use std::fmt;

use crate::{data_url::data_url, error::OcrError, jobs::DocumentId, prelude::*};

pub mod fs;
mod pdf;
mod multipage_tiff;

/// Image types we can pass to OCR backends as-is.
pub const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg"];

/// TIFF MIME type, handled separately due to multipage complexity.
pub const TIFF_MIME_TYPE: &str = "image/tiff";

/// PDF MIME type. PDFs are rasterized one page at a time.
pub const PDF_MIME_TYPE: &str = "application/pdf";

/// One encoded page, ready to hand to an OCR backend.
#[derive(Clone)]
pub struct PageImage {
    /// The MIME type of our data. One of [`SUPPORTED_IMAGE_TYPES`].
    pub mime_type: String,
    /// The encoded image.
    pub data: Vec<u8>,
}

impl PageImage {
    /// Create a new page image.
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Convert to a `data:` URL.
    pub fn to_data_url(&self) -> String {
        data_url(&self.mime_type, &self.data)
    }
}

// Page images can be several megabytes, so don't dump the bytes into logs.
impl fmt::Debug for PageImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A source of documents, addressed by [`DocumentId`].
///
/// Implementations return [`OcrError::NotFound`] for unknown documents and
/// out-of-range pages, and [`OcrError::Document`] for anything else.
#[async_trait]
pub trait DocumentSource: Send + Sync + 'static {
    /// How many pages does this document have?
    async fn page_count(&self, document_id: &DocumentId) -> Result<usize, OcrError>;

    /// Fetch one page, counting from zero.
    async fn page_image(
        &self,
        document_id: &DocumentId,
        page_idx: usize,
    ) -> Result<PageImage, OcrError>;
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}
