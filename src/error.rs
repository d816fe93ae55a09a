//! Typed errors for the OCR job pipeline.
//!
//! [`ProviderError`] describes one failed call to an OCR backend. It is
//! classified by [`ProviderErrorKind`] so that the worker pool can decide
//! whether a retry might help, and so that callers can tell a bad
//! credential apart from a bad page image.
//!
//! [`OcrError`] is what the public job operations return. Provider errors
//! raised while a job runs in the background are not returned to anyone;
//! they are recorded on the job itself as its failure message.

use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

use crate::{
    jobs::{DocumentId, JobId, JobStatus},
    retry::IsKnownTransient,
};

/// What went wrong when talking to an OCR backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The backend could not be reached, or reported that it was overloaded.
    Unreachable,
    /// The backend rejected our credentials.
    Authentication,
    /// The backend refused the input, or the image could not be decoded.
    Rejected,
    /// The backend answered, but the answer was empty or unusable.
    Malformed,
    /// The call did not finish before its deadline.
    Cancelled,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderErrorKind::Unreachable => "backend unreachable",
            ProviderErrorKind::Authentication => "authentication failed",
            ProviderErrorKind::Rejected => "input rejected",
            ProviderErrorKind::Malformed => "malformed response",
            ProviderErrorKind::Cancelled => "deadline exceeded",
        };
        f.write_str(name)
    }
}

/// A failed call to an OCR backend.
#[derive(Clone, Debug, Error)]
#[error("{provider}: {kind}: {message}")]
pub struct ProviderError {
    /// The provider that failed, e.g. `openai` or `textract`.
    pub provider: String,
    /// Classification of the failure.
    pub kind: ProviderErrorKind,
    /// Human-readable detail from the backend.
    pub message: String,
}

impl ProviderError {
    /// Create a new provider error.
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    /// Classify an HTTP error status returned by a backend.
    pub fn from_status(
        provider: impl Into<String>,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        let kind = if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ProviderErrorKind::Authentication
        } else if status.is_known_transient() || status.is_server_error() {
            ProviderErrorKind::Unreachable
        } else {
            ProviderErrorKind::Rejected
        };
        Self::new(provider, kind, message)
    }

    /// Classify a transport-level HTTP error.
    pub fn from_reqwest(provider: impl Into<String>, error: &reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::from_status(provider, status, error.to_string()),
            None if error.is_decode() => {
                Self::new(provider, ProviderErrorKind::Malformed, error.to_string())
            }
            None => Self::new(provider, ProviderErrorKind::Unreachable, error.to_string()),
        }
    }
}

impl IsKnownTransient for ProviderError {
    fn is_known_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Unreachable | ProviderErrorKind::Cancelled
        )
    }
}

/// Errors returned by the public job operations.
#[derive(Debug, Error)]
pub enum OcrError {
    /// An OCR backend call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A job, document or page does not exist.
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// A page index is beyond the pages recorded for a job.
    #[error("page {page_idx} of job {job_id} has not been processed (pages done: {pages_done})")]
    InvalidPageIndex {
        job_id: JobId,
        page_idx: usize,
        pages_done: usize,
    },

    /// Startup configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another re-OCR of this page is already running.
    #[error("page {page_idx} of job {job_id} is already being re-processed")]
    PageBusy { job_id: JobId, page_idx: usize },

    /// The worker pool has been shut down.
    #[error("the worker pool is shut down and no longer accepts jobs")]
    PoolClosed,

    /// A job was asked to make a state transition it cannot make.
    #[error("job {job_id} cannot go from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The document source failed for a reason other than a missing page.
    #[error("document {document_id}: {error:#}")]
    Document {
        document_id: DocumentId,
        error: anyhow::Error,
    },
}

impl OcrError {
    /// A job id that does not exist.
    pub fn job_not_found(job_id: JobId) -> Self {
        OcrError::NotFound {
            what: "job",
            id: job_id.to_string(),
        }
    }

    /// A document that does not exist.
    pub fn document_not_found(document_id: &DocumentId) -> Self {
        OcrError::NotFound {
            what: "document",
            id: document_id.to_string(),
        }
    }

    /// A page that does not exist within an existing document.
    pub fn page_not_found(document_id: &DocumentId, page_idx: usize) -> Self {
        OcrError::NotFound {
            what: "page",
            id: format!("{document_id}#{page_idx}"),
        }
    }
}
