//! Google Gemini, via the [`genai`] crate. Images go inline as base64 parts.

use std::sync::Arc;

use genai::{
    Client,
    chat::{
        ChatMessage, ChatOptions, ChatRequest, ChatResponse, ChatRole, ContentPart,
        ImageSource, MessageContent,
    },
    webc,
};
use serde_json::Map;

use crate::{
    config::GenerationOptions,
    data_url::base64_encode,
    documents::PageImage,
    error::{ProviderError, ProviderErrorKind},
    prelude::*,
};

use super::{Generation, VisionBackend};

const NAME: &str = "gemini";

/// Talks to Gemini. The client picks up `GEMINI_API_KEY` from the
/// environment.
pub(super) struct GeminiBackend {
    client: Client,
}

impl GeminiBackend {
    pub(super) fn new() -> Self {
        Self {
            client: Client::default(),
        }
    }
}

#[async_trait]
impl VisionBackend for GeminiBackend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        image: &PageImage,
        options: &GenerationOptions,
    ) -> Result<Generation, ProviderError> {
        let req = ChatRequest {
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: MessageContent::Parts(vec![
                    ContentPart::Image {
                        content_type: image.mime_type.clone(),
                        source: ImageSource::Base64(Arc::from(base64_encode(&image.data))),
                    },
                    ContentPart::Text(prompt.to_owned()),
                ]),
                options: None,
            }],
            ..ChatRequest::default()
        };
        let opts = ChatOptions {
            temperature: options.temperature.map(f64::from),
            max_tokens: options.max_tokens,
            ..ChatOptions::default()
        };

        let chat_res = self
            .client
            .exec_chat(model, req, Some(&opts))
            .await
            .map_err(classify_genai_error)?;
        generation_from_response(chat_res)
    }
}

fn generation_from_response(chat_res: ChatResponse) -> Result<Generation, ProviderError> {
    let text = chat_res
        .content
        .as_ref()
        .and_then(|content| content.text_as_str())
        .ok_or_else(|| {
            ProviderError::new(
                NAME,
                ProviderErrorKind::Malformed,
                "response has no text candidate (possibly blocked by a safety filter)",
            )
        })?
        .to_owned();

    let mut generation_info = Map::new();
    if let Some(prompt_tokens) = chat_res.usage.prompt_tokens {
        generation_info.insert("prompt_tokens".to_owned(), Value::from(prompt_tokens));
    }
    let completion_tokens = chat_res.usage.completion_tokens.map(|tokens| {
        generation_info.insert("completion_tokens".to_owned(), Value::from(tokens));
        u64::try_from(tokens).unwrap_or_default()
    });

    Ok(Generation {
        text,
        completion_tokens,
        generation_info,
    })
}

/// Sort a [`genai::Error`] into one of our error kinds.
fn classify_genai_error(error: genai::Error) -> ProviderError {
    let kind = match &error {
        genai::Error::WebAdapterCall { webc_error, .. }
        | genai::Error::WebModelCall { webc_error, .. } => match webc_error {
            webc::Error::ResponseFailedStatus { status, .. } => {
                return ProviderError::from_status(NAME, *status, error.to_string());
            }
            webc::Error::Reqwest(err) => return ProviderError::from_reqwest(NAME, err),
            _ => ProviderErrorKind::Malformed,
        },
        genai::Error::NoChatResponse { .. } => ProviderErrorKind::Malformed,
        _ => ProviderErrorKind::Rejected,
    };
    ProviderError::new(NAME, kind, error.to_string())
}
