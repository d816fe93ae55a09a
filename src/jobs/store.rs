//! In-memory registry of job state.
//!
//! Every method takes the lock, copies or mutates state, and releases the
//! lock before returning. Nothing here is `async`, so the lock can never be
//! held across an OCR call.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;

use crate::{error::OcrError, prelude::*};

use super::{DocumentId, Job, JobId, JobStatus, JobStatusReport, JobSummary, PageResult};

/// State protected by our lock.
#[derive(Debug, Default)]
struct StoreState {
    /// All jobs, by ID.
    jobs: HashMap<JobId, Job>,

    /// Job IDs in submission order.
    order: Vec<JobId>,

    /// Pages which currently have a re-OCR running.
    reocr_claims: HashSet<(JobId, usize)>,
}

impl StoreState {
    fn job(&self, job_id: JobId) -> Result<&Job, OcrError> {
        self.jobs
            .get(&job_id)
            .ok_or_else(|| OcrError::job_not_found(job_id))
    }

    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, OcrError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| OcrError::job_not_found(job_id))
    }

    /// Look up a job which must be `in_progress` in order to move to `to`.
    fn running_job_mut(&mut self, job_id: JobId, to: JobStatus) -> Result<&mut Job, OcrError> {
        let job = self.job_mut(job_id)?;
        if job.status != JobStatus::InProgress {
            return Err(OcrError::InvalidTransition {
                job_id,
                from: job.status,
                to,
            });
        }
        Ok(job)
    }
}

/// Concurrency-safe registry of all jobs submitted to this process.
#[derive(Debug, Default)]
pub struct JobStore {
    state: Mutex<StoreState>,
}

impl JobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take our lock. Updates never panic partway through, so a poisoned lock
    /// still guards consistent state.
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new `pending` job.
    pub fn create(
        &self,
        document_id: DocumentId,
        total_pages: Option<usize>,
        pages_limited: bool,
    ) -> JobId {
        let mut job = Job::new(document_id);
        job.total_pages = total_pages;
        job.pages_limited = pages_limited;
        let job_id = job.id;
        let mut state = self.lock();
        state.order.push(job_id);
        state.jobs.insert(job_id, job);
        job_id
    }

    /// Move a job from `pending` to `in_progress`.
    ///
    /// Returns `false` if the job had already been started, which happens when
    /// a start signal is delivered twice.
    pub fn try_start(&self, job_id: JobId) -> Result<bool, OcrError> {
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        job.status = JobStatus::InProgress;
        job.updated_at = Utc::now();
        Ok(true)
    }

    /// Record how many pages a running job will process.
    pub fn set_total_pages(
        &self,
        job_id: JobId,
        total_pages: usize,
        pages_limited: bool,
    ) -> Result<(), OcrError> {
        let mut state = self.lock();
        let job = state.running_job_mut(job_id, JobStatus::InProgress)?;
        job.total_pages = Some(total_pages);
        job.pages_limited = pages_limited;
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Append the next page's result to a running job.
    pub fn commit_page(
        &self,
        job_id: JobId,
        page_idx: usize,
        result: PageResult,
    ) -> Result<(), OcrError> {
        let mut state = self.lock();
        let job = state.running_job_mut(job_id, JobStatus::InProgress)?;
        if page_idx != job.pages_done() {
            return Err(OcrError::InvalidPageIndex {
                job_id,
                page_idx,
                pages_done: job.pages_done(),
            });
        }
        job.page_results.push(result);
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Mark a running job as `completed`, publishing its combined text.
    pub fn complete(&self, job_id: JobId) -> Result<(), OcrError> {
        let mut state = self.lock();
        let job = state.running_job_mut(job_id, JobStatus::Completed)?;
        job.combined_text = Some(job.concatenated_text());
        job.status = JobStatus::Completed;
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Mark a running job as `failed`. Pages already committed are kept.
    pub fn fail(&self, job_id: JobId, message: impl Into<String>) -> Result<(), OcrError> {
        let mut state = self.lock();
        let job = state.running_job_mut(job_id, JobStatus::Failed)?;
        job.error = Some(message.into());
        job.status = JobStatus::Failed;
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Overwrite one page's result in place. Nothing else about the job
    /// changes, including `combined_text`.
    pub fn replace_page(
        &self,
        job_id: JobId,
        page_idx: usize,
        result: PageResult,
    ) -> Result<(), OcrError> {
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        let pages_done = job.pages_done();
        let slot = job
            .page_results
            .get_mut(page_idx)
            .ok_or(OcrError::InvalidPageIndex {
                job_id,
                page_idx,
                pages_done,
            })?;
        *slot = result;
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Get a copy of a job.
    pub fn get(&self, job_id: JobId) -> Result<Job, OcrError> {
        self.lock().job(job_id).cloned()
    }

    /// Get a point-in-time status report for a job.
    pub fn status_report(&self, job_id: JobId) -> Result<JobStatusReport, OcrError> {
        Ok(self.lock().job(job_id)?.status_report())
    }

    /// Summaries of all jobs, in submission order.
    pub fn list(&self) -> Vec<JobSummary> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(Job::summary)
            .collect()
    }

    /// Reserve a recorded page for re-OCR.
    ///
    /// Fails with [`OcrError::InvalidPageIndex`] if the page has not been
    /// processed yet, or [`OcrError::PageBusy`] if another re-OCR of the same
    /// page is running. The reservation is released when the returned
    /// [`PageClaim`] is dropped.
    pub fn claim_page(&self, job_id: JobId, page_idx: usize) -> Result<PageClaim<'_>, OcrError> {
        let mut state = self.lock();
        let pages_done = state.job(job_id)?.pages_done();
        if page_idx >= pages_done {
            return Err(OcrError::InvalidPageIndex {
                job_id,
                page_idx,
                pages_done,
            });
        }
        if !state.reocr_claims.insert((job_id, page_idx)) {
            return Err(OcrError::PageBusy { job_id, page_idx });
        }
        Ok(PageClaim {
            store: self,
            job_id,
            page_idx,
        })
    }
}

/// An exclusive reservation on one page of one job, for re-OCR.
#[derive(Debug)]
pub struct PageClaim<'a> {
    store: &'a JobStore,
    job_id: JobId,
    page_idx: usize,
}

impl Drop for PageClaim<'_> {
    fn drop(&mut self) {
        self.store
            .lock()
            .reocr_claims
            .remove(&(self.job_id, self.page_idx));
    }
}

#[cfg(test)]
mod tests {
    use crate::jobs::PageMetadata;

    use super::*;

    fn page(text: &str) -> PageResult {
        PageResult {
            text: text.to_owned(),
            ocr_limit_hit: false,
            metadata: PageMetadata {
                provider: "test".to_owned(),
                ..PageMetadata::default()
            },
        }
    }

    fn running_job(store: &JobStore) -> JobId {
        let job_id = store.create(DocumentId::new("doc"), Some(3), false);
        assert!(store.try_start(job_id).unwrap());
        job_id
    }

    #[test]
    fn new_jobs_are_pending() {
        let store = JobStore::new();
        let job_id = store.create(DocumentId::new("doc"), None, false);
        let report = store.status_report(job_id).unwrap();
        assert_eq!(report.status, JobStatus::Pending);
        assert_eq!(report.pages_done, 0);
    }

    #[test]
    fn second_start_is_ignored() {
        let store = JobStore::new();
        let job_id = running_job(&store);
        assert!(!store.try_start(job_id).unwrap());
        assert_eq!(store.get(job_id).unwrap().status, JobStatus::InProgress);
    }

    #[test]
    fn completion_concatenates_pages_in_order() {
        let store = JobStore::new();
        let job_id = running_job(&store);
        for (idx, text) in ["A", "B", "C"].into_iter().enumerate() {
            store.commit_page(job_id, idx, page(text)).unwrap();
        }
        store.complete(job_id).unwrap();
        let report = store.status_report(job_id).unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.text.as_deref(), Some("ABC"));
        assert_eq!(report.error, None);
    }

    #[test]
    fn pages_must_be_committed_in_order() {
        let store = JobStore::new();
        let job_id = running_job(&store);
        let err = store.commit_page(job_id, 1, page("B")).unwrap_err();
        assert!(matches!(err, OcrError::InvalidPageIndex { pages_done: 0, .. }));
    }

    #[test]
    fn terminal_states_never_change() {
        let store = JobStore::new();
        let job_id = running_job(&store);
        store.fail(job_id, "page 0: boom").unwrap();
        assert!(matches!(
            store.complete(job_id),
            Err(OcrError::InvalidTransition {
                from: JobStatus::Failed,
                ..
            })
        ));
        assert!(store.commit_page(job_id, 0, page("A")).is_err());
        assert!(!store.try_start(job_id).unwrap());
        let job = store.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.combined_text, None);
    }

    #[test]
    fn pending_jobs_cannot_complete() {
        let store = JobStore::new();
        let job_id = store.create(DocumentId::new("doc"), None, false);
        assert!(store.complete(job_id).is_err());
        assert!(store.fail(job_id, "nope").is_err());
    }

    #[test]
    fn replace_page_only_touches_one_page() {
        let store = JobStore::new();
        let job_id = running_job(&store);
        store.commit_page(job_id, 0, page("A")).unwrap();
        store.commit_page(job_id, 1, page("B")).unwrap();
        store.complete(job_id).unwrap();

        store.replace_page(job_id, 1, page("b")).unwrap();
        let job = store.get(job_id).unwrap();
        assert_eq!(job.page_results[0].text, "A");
        assert_eq!(job.page_results[1].text, "b");
        assert_eq!(job.combined_text.as_deref(), Some("AB"));
    }

    #[test]
    fn page_claims_are_exclusive_and_released_on_drop() {
        let store = JobStore::new();
        let job_id = running_job(&store);
        store.commit_page(job_id, 0, page("A")).unwrap();

        let claim = store.claim_page(job_id, 0).unwrap();
        assert!(matches!(
            store.claim_page(job_id, 0),
            Err(OcrError::PageBusy { page_idx: 0, .. })
        ));
        drop(claim);
        assert!(store.claim_page(job_id, 0).is_ok());
    }

    #[test]
    fn claims_beyond_pages_done_are_rejected() {
        let store = JobStore::new();
        let job_id = running_job(&store);
        store.commit_page(job_id, 0, page("A")).unwrap();
        assert!(matches!(
            store.claim_page(job_id, 1),
            Err(OcrError::InvalidPageIndex {
                page_idx: 1,
                pages_done: 1,
                ..
            })
        ));
    }

    #[test]
    fn unknown_jobs_are_not_found() {
        let store = JobStore::new();
        let job_id = JobId::new();
        assert!(matches!(
            store.status_report(job_id),
            Err(OcrError::NotFound { what: "job", .. })
        ));
    }

    #[test]
    fn list_is_in_submission_order() {
        let store = JobStore::new();
        let first = store.create(DocumentId::new("a"), None, false);
        let second = store.create(DocumentId::new("b"), None, false);
        let ids = store.list().into_iter().map(|s| s.job_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![first, second]);
    }
}
