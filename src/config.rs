//! Startup configuration.
//!
//! Options come from the command line and the environment, and are checked
//! once by [`ProviderConfig::from_opts`] and [`PoolOpts::to_pool_config`]. The
//! resulting structs are immutable and are passed into constructors. The
//! Gemini client is the one exception: it reads `GEMINI_API_KEY` on its own,
//! so we only check that it is set.

use std::{fmt, str::FromStr, time::Duration};

use clap::{Args, ValueEnum};

use crate::{
    error::OcrError,
    jobs::pool::WorkerPoolConfig,
    prelude::*,
    prompt::{DEFAULT_LANGUAGE, DEFAULT_OCR_PROMPT, render_ocr_prompt},
    rate_limit::RateLimit,
    retry::RetryPolicy,
};

/// The environment variable holding the Gemini API key.
pub const GEMINI_API_KEY_VAR: &str = "GEMINI_API_KEY";

/// The default Ollama server.
pub const DEFAULT_OLLAMA_HOST: &str = "http://127.0.0.1:11434";

/// Which OCR backend to use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum ProviderKind {
    /// A vision-capable LLM. See `--vision-vendor`.
    #[default]
    Llm,
    /// AWS Textract, using the standard AWS credential chain.
    Textract,
    /// Describe each page without calling any backend. Useful for testing.
    Echo,
}

/// Which vendor API to use for vision-LLM OCR.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum VisionVendor {
    /// OpenAI-compatible chat completions. Also works with LiteLLM and other
    /// gateways via `OPENAI_API_BASE`.
    #[default]
    #[clap(name = "openai")]
    OpenAi,
    /// A local or remote Ollama server.
    Ollama,
    /// Google Gemini.
    Gemini,
}

impl VisionVendor {
    /// Our name for this vendor, as used in page metadata.
    pub fn name(self) -> &'static str {
        match self {
            VisionVendor::OpenAi => "openai",
            VisionVendor::Ollama => "ollama",
            VisionVendor::Gemini => "gemini",
        }
    }
}

/// How to format Textract output.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum TextractFormat {
    /// Plain text, one layout block per paragraph.
    #[default]
    Text,
    /// Markdown, with titles and section headers as headings.
    Markdown,
}

/// An API key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// The key itself.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

impl FromStr for ApiKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow!("API key is empty"));
        }
        Ok(Self(s.to_owned()))
    }
}

/// Options controlling which OCR backend we use and how.
#[derive(Args, Clone, Debug)]
pub struct ProviderOpts {
    /// The OCR backend to use.
    #[clap(long, value_enum, default_value_t = ProviderKind::default())]
    pub provider: ProviderKind,

    /// The vendor API to use with `--provider llm`.
    #[clap(long, value_enum, default_value_t = VisionVendor::default())]
    pub vision_vendor: VisionVendor,

    /// The vision model to use. Required with `--provider llm`.
    #[clap(short = 'm', long)]
    pub model: Option<String>,

    /// An upper limit on the number of output tokens per page. Pages which hit
    /// this limit are flagged with `ocr_limit_hit`, because their text is
    /// probably truncated.
    #[clap(long)]
    pub max_tokens_per_page: Option<u32>,

    /// The sampling temperature. Defaults to the model's default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// Only sample from the top K tokens. Only supported by Ollama.
    #[clap(long)]
    pub top_k: Option<u32>,

    /// The language to transcribe into.
    #[clap(long, default_value = DEFAULT_LANGUAGE)]
    pub language: String,

    /// A Handlebars template to use instead of the built-in OCR prompt.
    /// `{{language}}` is replaced with `--language`.
    #[clap(long)]
    pub prompt: Option<PathBuf>,

    /// Maximum number of backend calls, written as `10/s`, `100/m` or
    /// `1000/h`. Shared by all workers.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// Output format for `--provider textract`.
    #[clap(long, value_enum, default_value_t = TextractFormat::default())]
    pub textract_format: TextractFormat,

    /// OpenAI API key.
    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<ApiKey>,

    /// Base URL for an OpenAI-compatible API, such as a LiteLLM proxy.
    #[clap(long, env = "OPENAI_API_BASE")]
    pub openai_api_base: Option<String>,

    /// The Ollama server to use.
    #[clap(long, env = "OLLAMA_HOST", default_value = DEFAULT_OLLAMA_HOST)]
    pub ollama_host: String,
}

/// Sampling options for vision models. Unset options are never sent.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GenerationOptions {
    /// Maximum output tokens per page.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Top-K sampling.
    pub top_k: Option<u32>,
}

/// Vendor-specific connection settings.
#[derive(Clone, Debug)]
pub enum VendorConfig {
    OpenAi {
        api_key: Option<ApiKey>,
        api_base: Option<String>,
    },
    Ollama {
        host: String,
    },
    /// The Gemini client reads `GEMINI_API_KEY` itself.
    Gemini,
}

impl VendorConfig {
    /// Which vendor is this?
    pub fn vendor(&self) -> VisionVendor {
        match self {
            VendorConfig::OpenAi { .. } => VisionVendor::OpenAi,
            VendorConfig::Ollama { .. } => VisionVendor::Ollama,
            VendorConfig::Gemini => VisionVendor::Gemini,
        }
    }
}

/// Settings for the vision-LLM provider.
#[derive(Clone, Debug)]
pub struct VisionConfig {
    pub vendor: VendorConfig,
    pub model: String,
    /// The fully rendered OCR prompt.
    pub prompt: String,
    pub generation: GenerationOptions,
    pub rate_limit: Option<RateLimit>,
}

/// Settings for the Textract provider.
#[derive(Clone, Debug)]
pub struct TextractConfig {
    pub format: TextractFormat,
    pub rate_limit: Option<RateLimit>,
}

/// Everything needed to construct an OCR provider.
#[derive(Clone, Debug)]
pub enum ProviderConfig {
    Vision(VisionConfig),
    Textract(TextractConfig),
    Echo,
}

impl ProviderConfig {
    /// Check our options and build a provider configuration.
    pub fn from_opts(opts: &ProviderOpts) -> Result<Self, OcrError> {
        match opts.provider {
            ProviderKind::Echo => Ok(ProviderConfig::Echo),
            ProviderKind::Textract => Ok(ProviderConfig::Textract(TextractConfig {
                format: opts.textract_format,
                rate_limit: opts.rate_limit.clone(),
            })),
            ProviderKind::Llm => Ok(ProviderConfig::Vision(VisionConfig::from_opts(opts)?)),
        }
    }
}

impl VisionConfig {
    fn from_opts(opts: &ProviderOpts) -> Result<Self, OcrError> {
        let model = opts
            .model
            .clone()
            .filter(|model| !model.trim().is_empty())
            .ok_or_else(|| {
                OcrError::Configuration("--model is required with --provider llm".to_owned())
            })?;

        let vendor = match opts.vision_vendor {
            VisionVendor::OpenAi => {
                if opts.openai_api_key.is_none() && opts.openai_api_base.is_none() {
                    return Err(OcrError::Configuration(
                        "OPENAI_API_KEY must be set unless OPENAI_API_BASE points at a gateway"
                            .to_owned(),
                    ));
                }
                VendorConfig::OpenAi {
                    api_key: opts.openai_api_key.clone(),
                    api_base: opts.openai_api_base.clone(),
                }
            }
            VisionVendor::Ollama => VendorConfig::Ollama {
                host: opts.ollama_host.trim_end_matches('/').to_owned(),
            },
            VisionVendor::Gemini => {
                let has_key = std::env::var(GEMINI_API_KEY_VAR)
                    .is_ok_and(|key| !key.trim().is_empty());
                if !has_key {
                    return Err(OcrError::Configuration(format!(
                        "{GEMINI_API_KEY_VAR} must be set for --vision-vendor gemini"
                    )));
                }
                VendorConfig::Gemini
            }
        };

        if let Some(temperature) = opts.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(OcrError::Configuration(format!(
                    "--temperature must be between 0.0 and 2.0, got {temperature}"
                )));
            }
        }
        if opts.max_tokens_per_page == Some(0) {
            return Err(OcrError::Configuration(
                "--max-tokens-per-page must be at least 1".to_owned(),
            ));
        }

        let template = match &opts.prompt {
            Some(path) => std::fs::read_to_string(path).map_err(|err| {
                OcrError::Configuration(format!(
                    "could not read prompt template {:?}: {err}",
                    path.display()
                ))
            })?,
            None => DEFAULT_OCR_PROMPT.to_owned(),
        };
        let prompt = render_ocr_prompt(&template, &opts.language)
            .map_err(|err| OcrError::Configuration(format!("{err:#}")))?;

        Ok(Self {
            vendor,
            model,
            prompt,
            generation: GenerationOptions {
                max_tokens: opts.max_tokens_per_page,
                temperature: opts.temperature,
                top_k: opts.top_k,
            },
            rate_limit: opts.rate_limit.clone(),
        })
    }
}

/// Options controlling the worker pool.
#[derive(Args, Clone, Debug)]
pub struct PoolOpts {
    /// How many documents to OCR at once.
    #[clap(short = 'j', long = "workers", default_value = "1")]
    pub workers: usize,

    /// How long to wait for a single page, in seconds.
    #[clap(long, default_value = "300")]
    pub page_timeout: u64,

    /// How many times to retry a page after a transient backend error.
    #[clap(long, default_value = "0")]
    pub max_page_retries: u8,

    /// Only OCR the first N pages of each document.
    #[clap(long)]
    pub max_pages: Option<usize>,

    /// Resolution for rasterizing PDF pages.
    #[clap(long, default_value = "300")]
    pub rasterize_dpi: u32,
}

impl PoolOpts {
    /// Check our options and build a pool configuration.
    pub fn to_pool_config(&self) -> Result<WorkerPoolConfig, OcrError> {
        if self.workers == 0 {
            return Err(OcrError::Configuration(
                "--workers must be at least 1".to_owned(),
            ));
        }
        if self.page_timeout == 0 {
            return Err(OcrError::Configuration(
                "--page-timeout must be at least 1 second".to_owned(),
            ));
        }
        if self.max_pages == Some(0) {
            return Err(OcrError::Configuration(
                "--max-pages must be at least 1".to_owned(),
            ));
        }
        Ok(WorkerPoolConfig {
            workers: self.workers,
            page_timeout: Duration::from_secs(self.page_timeout),
            retry: RetryPolicy::with_re_attempts(self.max_page_retries),
            max_pages: self.max_pages,
        })
    }
}
