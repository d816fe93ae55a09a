//! OCR using vision-capable LLMs.
//!
//! We send each page as a single user message with two parts: the page image
//! and the OCR prompt. The vendor-specific work (how the image is encoded,
//! which sampling options exist, how errors look) lives in one
//! [`VisionBackend`] per vendor.

use leaky_bucket::RateLimiter;
use serde_json::Map;
use tiktoken_rs::CoreBPE;

use crate::{
    config::{GenerationOptions, VendorConfig, VisionConfig, VisionVendor},
    documents::PageImage,
    error::{OcrError, ProviderError},
    jobs::{PageMetadata, PageResult},
    prelude::*,
};

use super::{OcrProvider, echo::image_dimensions};

mod gemini;
mod ollama;
mod openai;

/// What a backend gave us for one page.
#[derive(Debug, Default)]
pub(crate) struct Generation {
    /// The text of the first choice.
    pub text: String,
    /// Output tokens, if the backend reported them.
    pub completion_tokens: Option<u64>,
    /// Anything else worth recording.
    pub generation_info: Map<String, Value>,
}

/// One vendor's vision API.
#[async_trait]
pub(crate) trait VisionBackend: Send + Sync + 'static {
    /// Send one page and the prompt, and return the generated text.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        image: &PageImage,
        options: &GenerationOptions,
    ) -> Result<Generation, ProviderError>;
}

/// Which generation options does a vendor accept?
fn supported_options(vendor: VisionVendor, requested: GenerationOptions) -> GenerationOptions {
    let mut options = requested;
    if options.top_k.is_some() && vendor != VisionVendor::Ollama {
        warn!(
            vendor = vendor.name(),
            "--top-k is not supported by this vendor and will be ignored"
        );
        options.top_k = None;
    }
    options
}

/// Pick a tokenizer for `model`. Models `tiktoken` doesn't know (most local
/// and Gemini models) get `cl100k_base`, so counts for them are approximate.
fn tokenizer_for_model(model: &str) -> Result<CoreBPE, OcrError> {
    tiktoken_rs::get_bpe_from_model(model)
        .or_else(|_| {
            debug!(model, "No tokenizer for model, falling back to cl100k_base");
            tiktoken_rs::cl100k_base()
        })
        .map_err(|err| OcrError::Configuration(format!("could not load tokenizer: {err:#}")))
}

/// Count the tokens in `text`.
fn count_tokens(tokenizer: &CoreBPE, text: &str) -> u64 {
    let tokens = tokenizer.encode_with_special_tokens(text).len();
    u64::try_from(tokens).unwrap_or(u64::MAX)
}

/// Did this generation probably stop because it hit `max_tokens`?
fn generation_limit_hit(
    tokenizer: &CoreBPE,
    max_tokens: Option<u32>,
    generation: &Generation,
) -> bool {
    let Some(max_tokens) = max_tokens else {
        return false;
    };
    let tokens = generation
        .completion_tokens
        .unwrap_or_else(|| count_tokens(tokenizer, &generation.text));
    tokens >= u64::from(max_tokens)
}

/// An [`OcrProvider`] backed by a vision LLM.
pub struct VisionProvider {
    vendor: VisionVendor,
    backend: Box<dyn VisionBackend>,
    model: String,
    prompt: String,
    options: GenerationOptions,
    /// Counts output tokens when the backend doesn't report them.
    tokenizer: CoreBPE,
    rate_limiter: Option<RateLimiter>,
}

impl VisionProvider {
    /// Create a new vision provider.
    pub fn new(config: &VisionConfig) -> Result<Self, OcrError> {
        let backend: Box<dyn VisionBackend> = match &config.vendor {
            VendorConfig::OpenAi { api_key, api_base } => Box::new(
                openai::OpenAiBackend::new(api_key.as_ref(), api_base.as_deref()),
            ),
            VendorConfig::Ollama { host } => Box::new(ollama::OllamaBackend::new(host)?),
            VendorConfig::Gemini => Box::new(gemini::GeminiBackend::new()),
        };
        Self::with_backend(backend, config)
    }

    fn with_backend(
        backend: Box<dyn VisionBackend>,
        config: &VisionConfig,
    ) -> Result<Self, OcrError> {
        let vendor = config.vendor.vendor();
        let options = supported_options(vendor, config.generation);
        let tokenizer = tokenizer_for_model(&config.model)?;
        debug!(prompt = %config.prompt, "OCR prompt");
        Ok(Self {
            vendor,
            backend,
            model: config.model.clone(),
            prompt: config.prompt.clone(),
            options,
            tokenizer,
            rate_limiter: config.rate_limit.as_ref().map(|limit| limit.to_rate_limiter()),
        })
    }
}

#[async_trait]
impl OcrProvider for VisionProvider {
    fn name(&self) -> &str {
        self.vendor.name()
    }

    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    fn tracks_generation_limit(&self) -> bool {
        self.options.max_tokens.is_some()
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(provider = self.vendor.name(), model = %self.model, page = page_idx)
    )]
    async fn process_image(
        &self,
        image: &PageImage,
        page_idx: usize,
    ) -> Result<PageResult, ProviderError> {
        let (width, height) = image_dimensions(self.name(), image)?;
        debug!(page_idx, width, height, mime_type = %image.mime_type, "Image dimensions");

        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let generation = self
            .backend
            .generate(&self.model, &self.prompt, image, &self.options)
            .await?;

        let ocr_limit_hit =
            generation_limit_hit(&self.tokenizer, self.options.max_tokens, &generation);
        if ocr_limit_hit {
            warn!("Page hit the output token limit, so its text may be truncated");
        }
        info!(
            content_length = generation.text.len(),
            completion_tokens = generation.completion_tokens,
            "Processed page"
        );
        Ok(PageResult {
            text: generation.text,
            ocr_limit_hit,
            metadata: PageMetadata {
                provider: self.name().to_owned(),
                model: Some(self.model.clone()),
                generation_info: generation.generation_info,
            },
        })
    }
}
