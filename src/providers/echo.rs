//! A provider which describes each page instead of reading it.

use std::io::Cursor;

use image::ImageReader;

use crate::{
    documents::PageImage,
    error::{ProviderError, ProviderErrorKind},
    jobs::{PageMetadata, PageResult},
    prelude::*,
};

use super::OcrProvider;

/// Returns `Page N: WxH mime/type` for each page, without any network calls.
#[derive(Debug, Default)]
pub struct EchoProvider;

#[async_trait]
impl OcrProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    #[instrument(level = "debug", skip_all, fields(provider = "echo", page = page_idx))]
    async fn process_image(
        &self,
        image: &PageImage,
        page_idx: usize,
    ) -> Result<PageResult, ProviderError> {
        let (width, height) = image_dimensions(self.name(), image)?;
        Ok(PageResult {
            text: format!(
                "Page {}: {}x{} {}\n",
                page_idx + 1,
                width,
                height,
                image.mime_type
            ),
            ocr_limit_hit: false,
            metadata: PageMetadata {
                provider: self.name().to_owned(),
                ..PageMetadata::default()
            },
        })
    }
}

/// Decode just enough of an image to learn its size. Anything we can't decode
/// is rejected.
pub(crate) fn image_dimensions(
    provider: &str,
    image: &PageImage,
) -> Result<(u32, u32), ProviderError> {
    let reject = |err: &dyn std::fmt::Display| {
        ProviderError::new(
            provider,
            ProviderErrorKind::Rejected,
            format!("could not decode {} image: {err}", image.mime_type),
        )
    };
    ImageReader::new(Cursor::new(&image.data))
        .with_guessed_format()
        .map_err(|err| reject(&err))?
        .into_dimensions()
        .map_err(|err| reject(&err))
}

#[cfg(test)]
mod tests {
    use crate::testing::png_page;

    use super::*;

    #[tokio::test]
    async fn describes_pages() {
        let result = EchoProvider.process_image(&png_page(4, 3), 1).await.unwrap();
        assert_eq!(result.text, "Page 2: 4x3 image/png\n");
        assert!(!result.ocr_limit_hit);
        assert_eq!(result.metadata.provider, "echo");
    }

    #[tokio::test]
    async fn rejects_garbage() {
        let image = PageImage::new("image/png", b"not a png".to_vec());
        let err = EchoProvider.process_image(&image, 0).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Rejected);
    }
}
