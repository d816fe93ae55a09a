//! Ollama's native chat API, which takes images as raw Base64 payloads.

use reqwest::Url;
use serde_json::Map;

use crate::{
    config::GenerationOptions,
    data_url::base64_encode,
    documents::PageImage,
    error::{OcrError, ProviderError, ProviderErrorKind},
    prelude::*,
};

use super::{Generation, VisionBackend};

const NAME: &str = "ollama";

/// A `/api/chat` request.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "ModelOptions::is_empty")]
    options: ModelOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
    images: Vec<String>,
}

/// Sampling options. Only the ones we were given are sent.
#[derive(Debug, Default, Serialize)]
struct ModelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
}

impl ModelOptions {
    fn is_empty(&self) -> bool {
        self.num_predict.is_none() && self.temperature.is_none() && self.top_k.is_none()
    }
}

impl From<&GenerationOptions> for ModelOptions {
    fn from(options: &GenerationOptions) -> Self {
        Self {
            num_predict: options.max_tokens,
            temperature: options.temperature,
            top_k: options.top_k,
        }
    }
}

/// A non-streaming `/api/chat` response.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// An error body, as returned with non-2xx statuses.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Talks to an Ollama server.
pub(super) struct OllamaBackend {
    client: reqwest::Client,
    chat_url: Url,
}

impl OllamaBackend {
    pub(super) fn new(host: &str) -> Result<Self, OcrError> {
        let chat_url = Url::parse(host)
            .and_then(|base| base.join("/api/chat"))
            .map_err(|err| {
                OcrError::Configuration(format!("invalid Ollama host {host:?}: {err}"))
            })?;
        Ok(Self {
            client: reqwest::Client::new(),
            chat_url,
        })
    }
}

#[async_trait]
impl VisionBackend for OllamaBackend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        image: &PageImage,
        options: &GenerationOptions,
    ) -> Result<Generation, ProviderError> {
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
                images: vec![base64_encode(&image.data)],
            }],
            stream: false,
            options: ModelOptions::from(options),
        };
        trace!(options = ?request.options, "Ollama request options");

        let response = self
            .client
            .post(self.chat_url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|err| ProviderError::from_reqwest(NAME, &err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ProviderError::from_reqwest(NAME, &err))?;
        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|err| err.error)
                .unwrap_or(body);
            return Err(ProviderError::from_status(NAME, status, message));
        }
        let response = serde_json::from_str::<ChatResponse>(&body).map_err(|err| {
            ProviderError::new(
                NAME,
                ProviderErrorKind::Malformed,
                format!("could not parse chat response: {err}"),
            )
        })?;
        generation_from_response(response)
    }
}

fn generation_from_response(response: ChatResponse) -> Result<Generation, ProviderError> {
    let message = response.message.ok_or_else(|| {
        ProviderError::new(NAME, ProviderErrorKind::Malformed, "response has no message")
    })?;

    let mut generation_info = Map::new();
    let fields = [
        ("prompt_eval_count", response.prompt_eval_count),
        ("eval_count", response.eval_count),
        ("total_duration", response.total_duration),
        ("eval_duration", response.eval_duration),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            generation_info.insert(key.to_owned(), Value::from(value));
        }
    }
    if let Some(done_reason) = response.done_reason {
        generation_info.insert("done_reason".to_owned(), Value::from(done_reason));
    }

    Ok(Generation {
        text: message.content,
        completion_tokens: response.eval_count,
        generation_info,
    })
}
