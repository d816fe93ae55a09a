//! The operations an outer layer (here, the CLI) uses: submit a document,
//! poll a job, list jobs, and re-OCR a single page.

use std::sync::Arc;

use crate::{
    async_utils::JoinWorker,
    documents::DocumentSource,
    error::OcrError,
    jobs::{
        DocumentId, JobId, JobStatusReport, JobSummary, PageResult,
        page::process_page,
        pool::{WorkerPool, WorkerPoolConfig},
        store::JobStore,
    },
    prelude::*,
    providers::OcrProvider,
};

/// An OCR job service: a job store, a worker pool feeding it, and the provider
/// and document source they share.
pub struct OcrService {
    store: Arc<JobStore>,
    pool: WorkerPool,
    provider: Arc<dyn OcrProvider>,
    source: Arc<dyn DocumentSource>,
    config: WorkerPoolConfig,
}

impl OcrService {
    /// Start a service. Await the returned [`JoinWorker`] after calling
    /// [`OcrService::shutdown`].
    pub fn new(
        config: WorkerPoolConfig,
        provider: Arc<dyn OcrProvider>,
        source: Arc<dyn DocumentSource>,
    ) -> (Self, JoinWorker) {
        let store = Arc::new(JobStore::new());
        let (pool, join) = WorkerPool::new(
            config.clone(),
            store.clone(),
            provider.clone(),
            source.clone(),
        );
        let service = Self {
            store,
            pool,
            provider,
            source,
            config,
        };
        (service, join)
    }

    /// Submit a document for OCR. The job starts `pending`, and a worker picks
    /// it up in the background.
    #[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
    pub async fn submit_job(&self, document_id: DocumentId) -> Result<JobId, OcrError> {
        if self.pool.is_closed() {
            return Err(OcrError::PoolClosed);
        }
        let page_count = self.source.page_count(&document_id).await?;
        let (total_pages, pages_limited) = self.config.limit_pages(page_count);
        let job_id = self
            .store
            .create(document_id, Some(total_pages), pages_limited);
        self.pool.enqueue(job_id)?;
        info!(%job_id, total_pages, "Submitted job");
        Ok(job_id)
    }

    /// Where is this job up to?
    pub fn job_status(&self, job_id: JobId) -> Result<JobStatusReport, OcrError> {
        self.store.status_report(job_id)
    }

    /// All jobs, in submission order.
    pub fn list_jobs(&self) -> Vec<JobSummary> {
        self.store.list()
    }

    /// OCR one already-processed page again, and replace its result.
    ///
    /// Runs in the caller's task, with the same deadline and retry policy as
    /// the workers. On error, the stored result is left alone. This works on
    /// jobs in any state, as long as the page has been recorded.
    #[instrument(level = "debug", skip_all, fields(job_id = %job_id, page = page_idx))]
    pub async fn reocr_page(&self, job_id: JobId, page_idx: usize) -> Result<PageResult, OcrError> {
        let _claim = self.store.claim_page(job_id, page_idx)?;
        let document_id = self.store.get(job_id)?.document_id;
        let image = self.source.page_image(&document_id, page_idx).await?;
        let result = process_page(
            self.provider.as_ref(),
            &image,
            page_idx,
            self.config.page_timeout,
            self.config.retry,
        )
        .await?;
        self.store.replace_page(job_id, page_idx, result.clone())?;
        info!("Re-processed page");
        Ok(result)
    }

    /// Stop accepting jobs, and let the workers wind down.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
