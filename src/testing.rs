//! Fakes for unit tests: a provider that follows a script, and documents held
//! in memory.

use std::{
    collections::{HashMap, VecDeque},
    io::Cursor,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use image::{ImageFormat, RgbImage};

use crate::{
    documents::{DocumentSource, PageImage},
    error::{OcrError, ProviderError, ProviderErrorKind},
    jobs::{DocumentId, PageMetadata, PageResult},
    prelude::*,
    providers::OcrProvider,
};

/// Encode a blank PNG of the given size.
pub fn png_page(width: u32, height: u32) -> PageImage {
    let mut data = Vec::new();
    RgbImage::new(width, height)
        .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
        .expect("could not encode test PNG");
    PageImage::new("image/png", data)
}

/// What a [`ScriptedProvider`] does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return this text.
    Text(&'static str),
    /// Return this text, flagged as truncated.
    LimitHit(&'static str),
    /// Fail with this kind of error.
    Fail(ProviderErrorKind),
    /// Sleep, then return this text.
    Delay(Duration, &'static str),
    /// Panic.
    Panic,
}

/// A provider which works through a list of [`Step`]s, one per call. Once the
/// script runs out, it returns the raw page bytes as text.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// How many times have we been called?
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn result(text: impl Into<String>, ocr_limit_hit: bool) -> PageResult {
        PageResult {
            text: text.into(),
            ocr_limit_hit,
            metadata: PageMetadata {
                provider: "scripted".to_owned(),
                ..PageMetadata::default()
            },
        }
    }
}

#[async_trait]
impl OcrProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn tracks_generation_limit(&self) -> bool {
        true
    }

    async fn process_image(
        &self,
        image: &PageImage,
        _page_idx: usize,
    ) -> Result<PageResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Text(text)) => Ok(Self::result(text, false)),
            Some(Step::LimitHit(text)) => Ok(Self::result(text, true)),
            Some(Step::Fail(kind)) => Err(ProviderError::new("scripted", kind, "scripted failure")),
            Some(Step::Delay(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(Self::result(text, false))
            }
            Some(Step::Panic) => panic!("scripted panic"),
            None => Ok(Self::result(
                String::from_utf8_lossy(&image.data).into_owned(),
                false,
            )),
        }
    }
}

/// Documents held in memory. Page images are whatever bytes the test wants.
#[derive(Debug, Default)]
pub struct MemoryDocumentSource {
    documents: HashMap<DocumentId, Vec<PageImage>>,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document whose pages are the given strings.
    pub fn with_text_pages(mut self, document_id: &str, pages: &[&str]) -> Self {
        let pages = pages
            .iter()
            .map(|page| PageImage::new("image/png", page.as_bytes().to_vec()))
            .collect();
        self.documents.insert(DocumentId::new(document_id), pages);
        self
    }
}

#[async_trait]
impl DocumentSource for MemoryDocumentSource {
    async fn page_count(&self, document_id: &DocumentId) -> Result<usize, OcrError> {
        self.documents
            .get(document_id)
            .map(Vec::len)
            .ok_or_else(|| OcrError::document_not_found(document_id))
    }

    async fn page_image(
        &self,
        document_id: &DocumentId,
        page_idx: usize,
    ) -> Result<PageImage, OcrError> {
        let pages = self
            .documents
            .get(document_id)
            .ok_or_else(|| OcrError::document_not_found(document_id))?;
        pages
            .get(page_idx)
            .cloned()
            .ok_or_else(|| OcrError::page_not_found(document_id, page_idx))
    }
}
