//! OCR using AWS Textract's layout analysis.

use std::{
    collections::{HashMap, HashSet},
    error::Error as StdError,
};

use aws_config::BehaviorVersion;
use aws_credential_types::provider::{ProvideCredentials as _, error::CredentialsError};
use aws_sdk_textract::{
    error::{DisplayErrorContext, SdkError},
    operation::analyze_document::{AnalyzeDocumentError, AnalyzeDocumentOutput},
    primitives::Blob,
    types::{Block, BlockType, Document, FeatureType, RelationshipType},
};
use leaky_bucket::RateLimiter;
use serde_json::Map;

use crate::{
    config::{TextractConfig, TextractFormat},
    documents::PageImage,
    error::{OcrError, ProviderError, ProviderErrorKind},
    jobs::{PageMetadata, PageResult},
    prelude::*,
    rate_limit::{RateLimit, RateLimitPeriod},
};

use super::{OcrProvider, echo::image_dimensions};

const NAME: &str = "textract";

/// OCR provider wrapping the AWS Textract API.
pub struct TextractProvider {
    /// AWS Textract client.
    client: aws_sdk_textract::Client,

    /// A rate limiter to avoid hitting API limits.
    rate_limiter: RateLimiter,

    /// How to format the text we extract.
    format: TextractFormat,
}

impl TextractProvider {
    /// Create a new Textract provider using the standard AWS configuration.
    ///
    /// Fails if no region is configured or no credentials can be loaded, so
    /// that we find out before any page is sent.
    pub async fn new(config: &TextractConfig, workers: usize) -> Result<Self, OcrError> {
        let sdk_config = aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await;
        let Some(region) = sdk_config.region() else {
            return Err(OcrError::Configuration(
                "no AWS region configured for Textract (set AWS_REGION or a profile region)"
                    .to_owned(),
            ));
        };
        let Some(credentials_provider) = sdk_config.credentials_provider() else {
            return Err(OcrError::Configuration(
                "no AWS credentials provider configured for Textract".to_owned(),
            ));
        };
        credentials_provider
            .provide_credentials()
            .await
            .map_err(|err| {
                OcrError::Configuration(format!(
                    "could not load AWS credentials for Textract: {}",
                    DisplayErrorContext(&err)
                ))
            })?;
        debug!(%region, "Loaded AWS configuration");

        let client = aws_sdk_textract::Client::new(&sdk_config);

        // Without an explicit rate limit, allow one call per worker per second.
        let rate_limit = config
            .rate_limit
            .clone()
            .unwrap_or_else(|| RateLimit::new(workers.max(1), RateLimitPeriod::Second));
        Ok(Self {
            client,
            rate_limiter: rate_limit.to_rate_limiter(),
            format: config.format,
        })
    }
}

#[async_trait]
impl OcrProvider for TextractProvider {
    fn name(&self) -> &str {
        NAME
    }

    #[instrument(level = "debug", skip_all, fields(provider = NAME, page = page_idx))]
    async fn process_image(
        &self,
        image: &PageImage,
        page_idx: usize,
    ) -> Result<PageResult, ProviderError> {
        let (width, height) = image_dimensions(NAME, image)?;
        debug!(page_idx, width, height, "Image dimensions");

        self.rate_limiter.acquire_one().await;

        let document = Document::builder()
            .bytes(Blob::new(image.data.clone()))
            .build();
        let output = self
            .client
            .analyze_document()
            .document(document)
            .set_feature_types(Some(vec![FeatureType::Layout]))
            .send()
            .await
            .map_err(classify_sdk_error)?;
        trace!("Document response: {output:#?}");

        let text = extract_text(&output, self.format)?;
        debug!(%text, "Extracted text");

        let mut generation_info = Map::new();
        generation_info.insert(
            "block_count".to_owned(),
            Value::from(output.blocks().len()),
        );
        if let Some(pages) = output.document_metadata().and_then(|m| m.pages()) {
            generation_info.insert("pages".to_owned(), Value::from(pages));
        }
        Ok(PageResult {
            text,
            ocr_limit_hit: false,
            metadata: PageMetadata {
                provider: NAME.to_owned(),
                model: None,
                generation_info,
            },
        })
    }
}

/// Turn layout analysis into text.
fn extract_text(
    output: &AnalyzeDocumentOutput,
    format: TextractFormat,
) -> Result<String, ProviderError> {
    let mut blocks_by_id = HashMap::new();
    for block in output.blocks() {
        if let Some(block_id) = block.id() {
            blocks_by_id.insert(block_id, block);
        }
    }
    let mut state = OutputState::new(format, blocks_by_id);
    state
        .write_layout_blocks(output.blocks())
        .map_err(|err| ProviderError::new(NAME, ProviderErrorKind::Malformed, format!("{err:#}")))?;
    Ok(state.output)
}

/// Sort an SDK error into one of our error kinds.
fn classify_sdk_error(error: SdkError<AnalyzeDocumentError>) -> ProviderError {
    let message = DisplayErrorContext(&error).to_string();
    let kind = match &error {
        SdkError::ServiceError(service_error) => match service_error.err() {
            AnalyzeDocumentError::ThrottlingException(_)
            | AnalyzeDocumentError::ProvisionedThroughputExceededException(_)
            | AnalyzeDocumentError::InternalServerError(_) => ProviderErrorKind::Unreachable,
            AnalyzeDocumentError::AccessDeniedException(_) => ProviderErrorKind::Authentication,
            _ => ProviderErrorKind::Rejected,
        },
        SdkError::ResponseError(_) => ProviderErrorKind::Malformed,
        SdkError::DispatchFailure(_) if caused_by_credentials(&error) => {
            ProviderErrorKind::Authentication
        }
        _ => ProviderErrorKind::Unreachable,
    };
    ProviderError::new(NAME, kind, message)
}

/// Did `error` happen because we couldn't load AWS credentials?
fn caused_by_credentials(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if err.is::<CredentialsError>() {
            return true;
        }
        current = err.source();
    }
    false
}

/// Our output state.
///
/// Layout blocks refer to their lines and words by ID, and the same child can
/// be reachable more than once. This walks the tree and makes sure each block
/// is printed exactly once.
#[derive(Debug)]
struct OutputState<'a> {
    /// The output string we're building.
    output: String,

    /// How to decorate layout blocks.
    format: TextractFormat,

    /// Blocks by ID. Used to look up child blocks and recurse over them.
    blocks_by_id: HashMap<&'a str, &'a Block>,

    /// The set of already printed blocks, to prevent printing blocks twice.
    printed_block_ids: HashSet<&'a str>,
}

impl<'a> OutputState<'a> {
    fn new(format: TextractFormat, blocks_by_id: HashMap<&'a str, &'a Block>) -> Self {
        Self {
            output: String::new(),
            format,
            blocks_by_id,
            printed_block_ids: HashSet::new(),
        }
    }

    /// Write every `LAYOUT_*` block, in the order Textract returned them.
    fn write_layout_blocks(&mut self, blocks: &'a [Block]) -> Result<()> {
        for block in blocks {
            let Some(block_type) = block.block_type() else {
                continue;
            };
            if !block_type.as_str().starts_with("LAYOUT_") {
                continue;
            }

            let bytes_written = self.output.len();
            self.block_start(block_type);
            let prefix_len = self.output.len();
            self.write_block(block, false)?;
            if self.output.len() == prefix_len {
                // Nothing printed, so drop any heading marker too.
                self.output.truncate(bytes_written);
            } else {
                self.output.push('\n');
            }
        }
        Ok(())
    }

    /// Write a block recursively.
    fn write_block(&mut self, block: &'a Block, printed_parent: bool) -> Result<()> {
        if let Some(id) = block.id()
            && !self.printed_block_ids.insert(id)
        {
            return Ok(());
        }

        let mut printed_self = false;
        if !printed_parent {
            if let Some(text) = block.text() {
                self.output.push_str(text);
                match block.block_type() {
                    Some(BlockType::Line) => self.output.push('\n'),
                    Some(BlockType::Word) => self.output.push(' '),
                    _ => {}
                }
                printed_self = true;
            }
        }

        for relationship in block.relationships() {
            if relationship.r#type() == Some(&RelationshipType::Child) {
                for id in relationship.ids() {
                    let child_block = self
                        .blocks_by_id
                        .get(&id[..])
                        .ok_or_else(|| anyhow!("Textract child block {} not found", id))?;
                    self.write_block(child_block, printed_self)?;
                }
            }
        }
        Ok(())
    }

    /// Start a layout block. In Markdown, titles and headers become headings.
    fn block_start(&mut self, block_type: &BlockType) {
        if self.format != TextractFormat::Markdown {
            return;
        }
        match block_type {
            BlockType::LayoutTitle => self.output.push_str("# "),
            BlockType::LayoutSectionHeader => self.output.push_str("## "),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_textract::types::Relationship;

    use super::*;

    fn block(id: &str, block_type: BlockType, text: Option<&str>, children: &[&str]) -> Block {
        let mut builder = Block::builder().id(id).block_type(block_type);
        if let Some(text) = text {
            builder = builder.text(text);
        }
        if !children.is_empty() {
            let mut relationship = Relationship::builder().r#type(RelationshipType::Child);
            for child in children {
                relationship = relationship.ids(*child);
            }
            builder = builder.relationships(relationship.build());
        }
        builder.build()
    }

    fn sample_output() -> AnalyzeDocumentOutput {
        AnalyzeDocumentOutput::builder()
            .blocks(block("page", BlockType::Page, None, &["title", "text"]))
            .blocks(block("title", BlockType::LayoutTitle, None, &["l1"]))
            .blocks(block("l1", BlockType::Line, Some("Lease Agreement"), &["w1"]))
            .blocks(block("w1", BlockType::Word, Some("Lease"), &[]))
            .blocks(block("text", BlockType::LayoutText, None, &["l2", "l1"]))
            .blocks(block("l2", BlockType::Line, Some("The tenant agrees."), &[]))
            .blocks(block("empty", BlockType::LayoutFigure, None, &[]))
            .build()
    }

    #[test]
    fn text_format_prints_each_line_once() {
        let text = extract_text(&sample_output(), TextractFormat::Text).unwrap();
        assert_eq!(text, "Lease Agreement\n\nThe tenant agrees.\n\n");
    }

    #[test]
    fn markdown_format_marks_titles() {
        let text = extract_text(&sample_output(), TextractFormat::Markdown).unwrap();
        assert!(text.starts_with("# Lease Agreement\n"));
        assert!(!text.contains("## "));
    }

    #[test]
    fn dangling_children_are_malformed() {
        let output = AnalyzeDocumentOutput::builder()
            .blocks(block("text", BlockType::LayoutText, None, &["missing"]))
            .build();
        let err = extract_text(&output, TextractFormat::Text).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Malformed);
    }

    #[test]
    fn missing_credentials_are_authentication_failures() {
        let not_loaded = anyhow::Error::new(CredentialsError::not_loaded(
            "no credentials found in chain",
        ))
        .context("dispatch failure");
        assert!(caused_by_credentials(&*not_loaded));

        let timeout = anyhow!("connection timed out").context("dispatch failure");
        assert!(!caused_by_credentials(&*timeout));
    }

    #[tokio::test]
    #[ignore = "Requires AWS credentials with Textract access"]
    async fn live_textract_call() {
        let config = TextractConfig {
            format: TextractFormat::Text,
            rate_limit: None,
        };
        let provider = TextractProvider::new(&config, 1).await.unwrap();
        let result = provider
            .process_image(&crate::testing::png_page(64, 64), 0)
            .await
            .unwrap();
        assert_eq!(result.metadata.provider, "textract");
    }
}
