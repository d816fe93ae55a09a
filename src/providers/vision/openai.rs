//! OpenAI-compatible chat completions. Also used for LiteLLM and other
//! gateways.

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse, FinishReason,
        ImageDetail, ImageUrlArgs,
    },
};
use serde_json::Map;

use crate::{
    config::{ApiKey, GenerationOptions},
    documents::PageImage,
    error::{ProviderError, ProviderErrorKind},
    prelude::*,
};

use super::{Generation, VisionBackend};

const NAME: &str = "openai";

/// Talks to `/v1/chat/completions`. Images are sent as `data:` URLs.
pub(super) struct OpenAiBackend {
    client: Client<OpenAIConfig>,
}

impl OpenAiBackend {
    pub(super) fn new(api_key: Option<&ApiKey>, api_base: Option<&str>) -> Self {
        let mut client_config = OpenAIConfig::new();
        if let Some(api_key) = api_key {
            client_config = client_config.with_api_key(api_key.expose());
        }
        if let Some(api_base) = api_base {
            client_config = client_config.with_api_base(api_base);
        }
        Self {
            client: Client::with_config(client_config),
        }
    }
}

#[async_trait]
impl VisionBackend for OpenAiBackend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        image: &PageImage,
        options: &GenerationOptions,
    ) -> Result<Generation, ProviderError> {
        let image_part = ChatCompletionRequestMessageContentPartImageArgs::default()
            .image_url(
                ImageUrlArgs::default()
                    .url(image.to_data_url())
                    .detail(ImageDetail::High)
                    .build()
                    .map_err(classify_openai_error)?,
            )
            .build()
            .map_err(classify_openai_error)?;
        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(vec![
                ChatCompletionRequestUserMessageContentPart::ImageUrl(image_part),
                ChatCompletionRequestUserMessageContentPart::Text(
                    ChatCompletionRequestMessageContentPartText {
                        text: prompt.to_owned(),
                    },
                ),
            ]))
            .build()
            .map_err(classify_openai_error)?;

        let mut req = CreateChatCompletionRequestArgs::default();
        req.model(model.to_owned())
            .messages(vec![message.into()])
            .store(false);
        if let Some(max_tokens) = options.max_tokens {
            req.max_completion_tokens(max_tokens);
        }
        if let Some(temperature) = options.temperature {
            req.temperature(temperature);
        }
        let req = req.build().map_err(classify_openai_error)?;

        let chat_result: Value = self
            .client
            .chat()
            .create_byot(req)
            .await
            .map_err(classify_openai_error)?;
        trace!(%chat_result, "OpenAI response");
        let response = serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
            .map_err(|err| {
                ProviderError::new(
                    NAME,
                    ProviderErrorKind::Malformed,
                    format!("could not parse chat completion: {err}"),
                )
            })?;
        generation_from_response(response)
    }
}

/// Pull the text and usage out of a chat completion.
fn generation_from_response(
    response: CreateChatCompletionResponse,
) -> Result<Generation, ProviderError> {
    let malformed = |message: String| ProviderError::new(NAME, ProviderErrorKind::Malformed, message);

    let Some(choice) = response.choices.into_iter().next() else {
        return Err(malformed("no choices in response".to_owned()));
    };
    if let Some(refusal) = choice.message.refusal {
        return Err(malformed(format!("model refused: {refusal}")));
    }
    if choice.finish_reason == Some(FinishReason::ContentFilter) {
        return Err(malformed(
            "content filter triggered (may also be a RECITATION error for Gemini models)"
                .to_owned(),
        ));
    }
    let text = choice
        .message
        .content
        .ok_or_else(|| malformed("first choice has no content".to_owned()))?;

    let mut generation_info = Map::new();
    generation_info.insert("response_model".to_owned(), Value::from(response.model));
    if let Some(finish_reason) = choice.finish_reason {
        generation_info.insert(
            "finish_reason".to_owned(),
            serde_json::to_value(finish_reason).unwrap_or(Value::Null),
        );
    }
    let completion_tokens = response.usage.map(|usage| {
        generation_info.insert(
            "prompt_tokens".to_owned(),
            Value::from(usage.prompt_tokens),
        );
        generation_info.insert(
            "completion_tokens".to_owned(),
            Value::from(usage.completion_tokens),
        );
        u64::from(usage.completion_tokens)
    });

    Ok(Generation {
        text,
        completion_tokens,
        generation_info,
    })
}

/// Sort an [`OpenAIError`] into one of our error kinds.
fn classify_openai_error(error: OpenAIError) -> ProviderError {
    match &error {
        OpenAIError::Reqwest(err) => ProviderError::from_reqwest(NAME, err),
        OpenAIError::ApiError(api_error) => {
            let kind = classify_api_error(
                api_error.r#type.as_deref().unwrap_or_default(),
                &api_error.message,
            );
            ProviderError::new(NAME, kind, api_error.message.clone())
        }
        OpenAIError::JSONDeserialize(err) => {
            ProviderError::new(NAME, ProviderErrorKind::Malformed, err.to_string())
        }
        OpenAIError::InvalidArgument(message) => {
            ProviderError::new(NAME, ProviderErrorKind::Rejected, message.clone())
        }
        _ => ProviderError::new(NAME, ProviderErrorKind::Unreachable, error.to_string()),
    }
}

/// API errors don't carry their HTTP status, so go by type and message.
fn classify_api_error(error_type: &str, message: &str) -> ProviderErrorKind {
    let message = message.to_lowercase();
    if error_type == "authentication_error"
        || message.contains("api key")
        || message.contains("unauthorized")
    {
        ProviderErrorKind::Authentication
    } else if error_type == "server_error"
        || error_type == "rate_limit_error"
        || message.contains("rate limit")
        || message.contains("overloaded")
    {
        ProviderErrorKind::Unreachable
    } else {
        ProviderErrorKind::Rejected
    }
}
