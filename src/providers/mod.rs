//! OCR providers: backends that turn one page image into text.
//!
//! Every backend implements [`OcrProvider`]. The worker pool and the re-OCR
//! path only ever see `Arc<dyn OcrProvider>`, so adding a backend means
//! adding a struct here and a case in [`create_provider`].

use std::sync::Arc;

use crate::{
    config::ProviderConfig,
    documents::PageImage,
    error::{OcrError, ProviderError},
    jobs::PageResult,
    prelude::*,
};

pub mod echo;
pub mod textract;
pub mod vision;

/// A backend which can OCR a single page.
///
/// Implementations must be safe to call concurrently, must not retry
/// internally, and must have no side effects besides the backend call.
#[async_trait]
pub trait OcrProvider: Send + Sync + 'static {
    /// A short name for this provider, e.g. `openai` or `textract`.
    fn name(&self) -> &str;

    /// The model we use, if this provider has models.
    fn model(&self) -> Option<&str> {
        None
    }

    /// Can this provider tell us that a page was truncated by an output
    /// token limit?
    fn tracks_generation_limit(&self) -> bool {
        false
    }

    /// OCR one page. `page_idx` is zero-based.
    async fn process_image(
        &self,
        image: &PageImage,
        page_idx: usize,
    ) -> Result<PageResult, ProviderError>;
}

/// Build the provider described by `config`.
///
/// `workers` is the size of the worker pool, which some providers use to pick
/// a default rate limit.
#[instrument(level = "debug", skip_all)]
pub async fn create_provider(
    config: &ProviderConfig,
    workers: usize,
) -> Result<Arc<dyn OcrProvider>, OcrError> {
    let provider: Arc<dyn OcrProvider> = match config {
        ProviderConfig::Echo => Arc::new(echo::EchoProvider),
        ProviderConfig::Textract(config) => {
            Arc::new(textract::TextractProvider::new(config, workers).await?)
        }
        ProviderConfig::Vision(config) => Arc::new(vision::VisionProvider::new(config)?),
    };
    info!(
        provider = provider.name(),
        model = provider.model().unwrap_or("-"),
        tracks_generation_limit = provider.tracks_generation_limit(),
        "Created OCR provider"
    );
    Ok(provider)
}
