//! OCR jobs: the record of one document's trip through an OCR backend.
//!
//! A [`Job`] starts out `pending`, is picked up by exactly one worker in the
//! [`pool::WorkerPool`], and ends either `completed` or `failed`. While it
//! runs, each page's [`PageResult`] is committed to the [`store::JobStore`] as
//! soon as it is available, so a client polling the job sees progress page
//! by page.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde_json::Map;
use uuid::Uuid;

use crate::prelude::*;

pub mod page;
pub mod pool;
pub mod store;

/// A unique job identifier, assigned at submission.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh, random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// A reference to a document known to a [`crate::documents::DocumentSource`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Create a new document ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a job is in its lifecycle.
///
/// Transitions only go `pending -> in_progress -> completed | failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, waiting for a worker.
    Pending,
    /// A worker is processing pages.
    InProgress,
    /// Every page was processed and the combined text is available.
    Completed,
    /// A page failed. Pages before it are still available.
    Failed,
}

impl JobStatus {
    /// Will this status ever change again?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Backend-specific information about how a page was produced.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PageMetadata {
    /// The provider that produced the text, e.g. `openai` or `textract`.
    pub provider: String,

    /// The model used, if the provider has a notion of models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Whatever else the backend told us: token counts, finish reasons,
    /// durations, block counts. There is no fixed schema.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub generation_info: Map<String, Value>,
}

/// The OCR output for one page.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PageResult {
    /// The recognized text. May be empty for a blank page.
    pub text: String,

    /// Was generation cut off by the configured output token limit? Always
    /// false for backends that don't limit output length.
    pub ocr_limit_hit: bool,

    /// How this page was produced.
    pub metadata: PageMetadata,
}

/// A job, as held by the [`store::JobStore`].
///
/// The number of pages done is always `page_results.len()`.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub document_id: DocumentId,
    pub status: JobStatus,
    pub page_results: Vec<PageResult>,
    pub combined_text: Option<String>,
    pub error: Option<String>,
    pub total_pages: Option<usize>,
    pub pages_limited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new `pending` job.
    pub fn new(document_id: DocumentId) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            document_id,
            status: JobStatus::Pending,
            page_results: Vec::new(),
            combined_text: None,
            error: None,
            total_pages: None,
            pages_limited: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// How many pages have been committed?
    pub fn pages_done(&self) -> usize {
        self.page_results.len()
    }

    /// Concatenate page texts in page order, with no separator.
    pub fn concatenated_text(&self) -> String {
        self.page_results.iter().map(|p| p.text.as_str()).collect()
    }

    /// Build a point-in-time report for a polling client.
    pub fn status_report(&self) -> JobStatusReport {
        JobStatusReport {
            job_id: self.id,
            document_id: self.document_id.clone(),
            status: self.status,
            pages_done: self.pages_done(),
            total_pages: self.total_pages,
            pages_limited: self.pages_limited,
            pages: self.page_results.clone(),
            text: self.combined_text.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Build a short summary for job listings.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id,
            document_id: self.document_id.clone(),
            status: self.status,
            pages_done: self.pages_done(),
            total_pages: self.total_pages,
            created_at: self.created_at,
        }
    }
}

/// The answer to "how is my job doing?"
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct JobStatusReport {
    /// The job's ID.
    pub job_id: JobId,

    /// The document being processed.
    pub document_id: DocumentId,

    /// Current lifecycle state.
    pub status: JobStatus,

    /// Number of pages processed so far. Always equal to `pages.len()`.
    pub pages_done: usize,

    /// Number of pages the job will process, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,

    /// True if the document had more pages than the configured page limit.
    #[serde(default)]
    pub pages_limited: bool,

    /// Per-page results, in page order.
    pub pages: Vec<PageResult>,

    /// The combined text of all pages. Only present once `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Why the job failed. Only present once `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the job was submitted.
    pub created_at: DateTime<Utc>,

    /// When the job last changed.
    pub updated_at: DateTime<Utc>,
}

/// One line of a job listing.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct JobSummary {
    pub job_id: JobId,
    pub document_id: DocumentId,
    pub status: JobStatus,
    pub pages_done: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,
    pub created_at: DateTime<Utc>,
}
