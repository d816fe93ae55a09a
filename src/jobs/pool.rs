//! The worker pool: background executors which take jobs from `pending` to
//! `completed` or `failed`.
//!
//! Start signals go into an unbounded channel. A single background task reads
//! them and runs up to `workers` jobs at once. Pages within a job are always
//! processed one at a time, in order, and each result is committed to the
//! [`JobStore`] before the next page starts.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt as _, StreamExt as _, channel::mpsc};

use crate::{
    async_utils::JoinWorker,
    documents::DocumentSource,
    error::OcrError,
    prelude::*,
    providers::OcrProvider,
    retry::RetryPolicy,
};

use super::{JobId, page::process_page, store::JobStore};

/// How the pool runs jobs.
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// How many jobs may run at once. Zero is treated as one.
    pub workers: usize,
    /// Deadline for each provider call.
    pub page_timeout: Duration,
    /// What to do about transient provider errors.
    pub retry: RetryPolicy,
    /// Stop after this many pages of each document.
    pub max_pages: Option<usize>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            page_timeout: Duration::from_secs(300),
            retry: RetryPolicy::none(),
            max_pages: None,
        }
    }
}

impl WorkerPoolConfig {
    /// Apply `max_pages` to a document's page count. Returns the number of
    /// pages to process, and whether any were left out.
    pub fn limit_pages(&self, page_count: usize) -> (usize, bool) {
        match self.max_pages {
            Some(max_pages) if page_count > max_pages => (max_pages, true),
            _ => (page_count, false),
        }
    }
}

/// How a job's run ended, if it didn't fail.
enum RunEnd {
    /// Every page was committed.
    Finished,
    /// The pool shut down between pages.
    Interrupted,
}

/// State shared by the pool handle and its workers.
struct Workers {
    config: WorkerPoolConfig,
    store: Arc<JobStore>,
    provider: Arc<dyn OcrProvider>,
    source: Arc<dyn DocumentSource>,
    shutting_down: AtomicBool,
}

impl Workers {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Handle one start signal. Never panics and never returns an error:
    /// anything that goes wrong is recorded on the job.
    #[instrument(level = "debug", skip_all, fields(job_id = %job_id))]
    async fn run_job(&self, job_id: JobId) {
        if self.is_shutting_down() {
            debug!("Pool is shutting down, leaving job pending");
            return;
        }
        match self.store.try_start(job_id) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Ignoring duplicate start signal");
                return;
            }
            Err(err) => {
                error!(%err, "Could not start job");
                return;
            }
        }
        info!("Starting job");

        let outcome = AssertUnwindSafe(self.process_pages(job_id))
            .catch_unwind()
            .await;
        let recorded = match outcome {
            Ok(Ok(RunEnd::Finished)) => self.store.complete(job_id).map(|()| {
                info!("Job completed");
            }),
            Ok(Ok(RunEnd::Interrupted)) => {
                info!("Shutdown interrupted job, leaving it in progress");
                Ok(())
            }
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                warn!(error = %message, "Job failed");
                self.store.fail(job_id, message)
            }
            Err(panic) => {
                let message = format!("worker panicked: {}", panic_message(&*panic));
                error!(error = %message, "Job failed");
                self.store.fail(job_id, message)
            }
        };
        if let Err(err) = recorded {
            error!(%err, "Could not record job outcome");
        }
    }

    /// Count pages, then OCR and commit them in order.
    async fn process_pages(&self, job_id: JobId) -> Result<RunEnd> {
        let document_id = self.store.get(job_id)?.document_id;
        let page_count = self
            .source
            .page_count(&document_id)
            .await
            .context("could not count pages")?;
        let (total_pages, pages_limited) = self.config.limit_pages(page_count);
        if pages_limited {
            warn!(
                page_count,
                max_pages = total_pages,
                "Document has too many pages, only processing the first ones"
            );
        }
        self.store
            .set_total_pages(job_id, total_pages, pages_limited)?;

        for page_idx in 0..total_pages {
            if self.is_shutting_down() {
                return Ok(RunEnd::Interrupted);
            }
            let image = self
                .source
                .page_image(&document_id, page_idx)
                .await
                .with_context(|| format!("page {page_idx}"))?;
            let result = process_page(
                self.provider.as_ref(),
                &image,
                page_idx,
                self.config.page_timeout,
                self.config.retry,
            )
            .await
            .with_context(|| format!("page {page_idx}"))?;
            if result.ocr_limit_hit {
                warn!(page = page_idx, "Page hit the generation limit");
            }
            self.store.commit_page(job_id, page_idx, result)?;
            debug!(page = page_idx, "Committed page");
        }
        Ok(RunEnd::Finished)
    }
}

/// Get a readable message out of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// A handle for submitting jobs to the background workers.
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<JobId>,
    workers: Arc<Workers>,
}

impl WorkerPool {
    /// Start the workers. The returned [`JoinWorker`] finishes once the pool
    /// has been shut down and every running job has stopped.
    pub fn new(
        config: WorkerPoolConfig,
        store: Arc<JobStore>,
        provider: Arc<dyn OcrProvider>,
        source: Arc<dyn DocumentSource>,
    ) -> (Self, JoinWorker) {
        let concurrency = config.workers.max(1);
        let (sender, receiver) = mpsc::unbounded::<JobId>();
        let workers = Arc::new(Workers {
            config,
            store,
            provider,
            source,
            shutting_down: AtomicBool::new(false),
        });

        let task_workers = workers.clone();
        let handle = tokio::spawn(async move {
            receiver
                .for_each_concurrent(concurrency, |job_id| {
                    let workers = task_workers.clone();
                    async move { workers.run_job(job_id).await }
                })
                .await;
            debug!("Worker pool stopped");
            Ok::<_, anyhow::Error>(())
        });
        (Self { sender, workers }, JoinWorker::from_handle(handle))
    }

    /// Has [`WorkerPool::shutdown`] been called?
    pub fn is_closed(&self) -> bool {
        self.workers.is_shutting_down()
    }

    /// Ask a worker to start a job.
    pub fn enqueue(&self, job_id: JobId) -> Result<(), OcrError> {
        if self.is_closed() {
            return Err(OcrError::PoolClosed);
        }
        self.sender
            .unbounded_send(job_id)
            .map_err(|_| OcrError::PoolClosed)
    }

    /// Stop accepting jobs. Page calls already in flight finish and are
    /// committed, but no new jobs or pages are started. Jobs still queued stay
    /// `pending`, and interrupted jobs stay `in_progress`.
    pub fn shutdown(&self) {
        if !self.workers.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutting down worker pool");
        }
        self.sender.close_channel();
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        error::ProviderErrorKind,
        jobs::{DocumentId, JobStatus},
        testing::{MemoryDocumentSource, ScriptedProvider, Step},
    };

    use super::*;

    struct Harness {
        store: Arc<JobStore>,
        pool: WorkerPool,
        join: JoinWorker,
    }

    fn start(
        config: WorkerPoolConfig,
        provider: ScriptedProvider,
        source: MemoryDocumentSource,
    ) -> Harness {
        let store = Arc::new(JobStore::new());
        let (pool, join) =
            WorkerPool::new(config, store.clone(), Arc::new(provider), Arc::new(source));
        Harness { store, pool, join }
    }

    impl Harness {
        fn submit(&self, document_id: &str) -> JobId {
            let job_id = self.store.create(DocumentId::new(document_id), None, false);
            self.pool.enqueue(job_id).unwrap();
            job_id
        }

        async fn wait_for(&self, job_id: JobId, status: JobStatus) {
            for _ in 0..500 {
                if self.store.get(job_id).unwrap().status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("job {job_id} never reached {status}");
        }

        async fn finish(self) -> Arc<JobStore> {
            self.pool.shutdown();
            self.join.join().await.unwrap();
            self.store
        }
    }

    #[tokio::test]
    async fn completes_jobs_in_page_order() {
        let harness = start(
            WorkerPoolConfig::default(),
            ScriptedProvider::new([Step::Text("A"), Step::LimitHit("B"), Step::Text("C")]),
            MemoryDocumentSource::new().with_text_pages("doc", &["1", "2", "3"]),
        );
        let job_id = harness.submit("doc");
        harness.wait_for(job_id, JobStatus::Completed).await;

        let job = harness.store.get(job_id).unwrap();
        assert_eq!(job.pages_done(), 3);
        assert_eq!(job.total_pages, Some(3));
        assert_eq!(job.combined_text.as_deref(), Some("ABC"));
        assert!(job.page_results[1].ocr_limit_hit);
        assert!(!job.page_results[0].ocr_limit_hit);
        assert!(job.error.is_none());
        harness.finish().await;
    }

    #[tokio::test]
    async fn a_failed_page_fails_the_job_and_keeps_earlier_pages() {
        let harness = start(
            WorkerPoolConfig::default(),
            ScriptedProvider::new([
                Step::Text("A"),
                Step::Fail(ProviderErrorKind::Rejected),
                Step::Text("C"),
            ]),
            MemoryDocumentSource::new().with_text_pages("doc", &["1", "2", "3"]),
        );
        let job_id = harness.submit("doc");
        harness.wait_for(job_id, JobStatus::Failed).await;

        let job = harness.store.get(job_id).unwrap();
        assert_eq!(job.pages_done(), 1);
        assert_eq!(job.page_results[0].text, "A");
        let error = job.error.unwrap();
        assert!(error.contains("page 1"), "{error}");
        assert!(error.contains("input rejected"), "{error}");
        assert!(job.combined_text.is_none());
        harness.finish().await;
    }

    #[tokio::test]
    async fn missing_documents_fail_the_job() {
        let harness = start(
            WorkerPoolConfig::default(),
            ScriptedProvider::default(),
            MemoryDocumentSource::new(),
        );
        let job_id = harness.submit("gone");
        harness.wait_for(job_id, JobStatus::Failed).await;
        let job = harness.store.get(job_id).unwrap();
        assert!(job.error.unwrap().contains("not found"));
        harness.finish().await;
    }

    #[tokio::test]
    async fn page_limits_are_applied() {
        let config = WorkerPoolConfig {
            max_pages: Some(2),
            ..WorkerPoolConfig::default()
        };
        let harness = start(
            config,
            ScriptedProvider::default(),
            MemoryDocumentSource::new().with_text_pages("doc", &["a", "b", "c"]),
        );
        let job_id = harness.submit("doc");
        harness.wait_for(job_id, JobStatus::Completed).await;
        let job = harness.store.get(job_id).unwrap();
        assert_eq!(job.combined_text.as_deref(), Some("ab"));
        assert_eq!(job.total_pages, Some(2));
        assert!(job.pages_limited);
        harness.finish().await;
    }

    #[tokio::test]
    async fn concurrent_jobs_do_not_mix_pages() {
        let config = WorkerPoolConfig {
            workers: 3,
            ..WorkerPoolConfig::default()
        };
        let harness = start(
            config,
            ScriptedProvider::default(),
            MemoryDocumentSource::new()
                .with_text_pages("one", &["1a", "1b", "1c"])
                .with_text_pages("two", &["2a", "2b"])
                .with_text_pages("three", &["3a"]),
        );
        let ids = ["one", "two", "three"].map(|doc| harness.submit(doc));
        for job_id in ids {
            harness.wait_for(job_id, JobStatus::Completed).await;
        }
        let text = |job_id| harness.store.get(job_id).unwrap().combined_text.unwrap();
        assert_eq!(text(ids[0]), "1a1b1c");
        assert_eq!(text(ids[1]), "2a2b");
        assert_eq!(text(ids[2]), "3a");
        harness.finish().await;
    }

    #[tokio::test]
    async fn duplicate_start_signals_run_the_job_once() {
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(JobStore::new());
        let config = WorkerPoolConfig {
            workers: 2,
            ..WorkerPoolConfig::default()
        };
        let (pool, join) = WorkerPool::new(
            config,
            store.clone(),
            provider.clone(),
            Arc::new(MemoryDocumentSource::new().with_text_pages("doc", &["x", "y"])),
        );
        let job_id = store.create(DocumentId::new("doc"), None, false);
        pool.enqueue(job_id).unwrap();
        pool.enqueue(job_id).unwrap();

        for _ in 0..500 {
            if store.get(job_id).unwrap().status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown();
        join.join().await.unwrap();

        let job = store.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.combined_text.as_deref(), Some("xy"));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn panics_only_fail_their_own_job() {
        let harness = start(
            WorkerPoolConfig::default(),
            ScriptedProvider::new([Step::Panic]),
            MemoryDocumentSource::new()
                .with_text_pages("bad", &["p"])
                .with_text_pages("good", &["fine"]),
        );
        let bad = harness.submit("bad");
        let good = harness.submit("good");
        harness.wait_for(bad, JobStatus::Failed).await;
        harness.wait_for(good, JobStatus::Completed).await;

        let error = harness.store.get(bad).unwrap().error.unwrap();
        assert!(error.contains("worker panicked"), "{error}");
        assert!(error.contains("scripted panic"), "{error}");
        assert_eq!(
            harness.store.get(good).unwrap().combined_text.as_deref(),
            Some("fine")
        );
        harness.finish().await;
    }

    #[tokio::test]
    async fn shutdown_leaves_queued_and_interrupted_jobs_alone() {
        let harness = start(
            WorkerPoolConfig::default(),
            ScriptedProvider::new([Step::Delay(Duration::from_millis(200), "slow")]),
            MemoryDocumentSource::new()
                .with_text_pages("first", &["1", "2"])
                .with_text_pages("second", &["3"]),
        );
        let first = harness.submit("first");
        let second = harness.submit("second");
        harness.wait_for(first, JobStatus::InProgress).await;

        harness.pool.shutdown();
        assert!(matches!(
            harness.pool.enqueue(second),
            Err(OcrError::PoolClosed)
        ));
        let store = harness.finish().await;

        // The in-flight page was committed, but the next one never started.
        let first = store.get(first).unwrap();
        assert_eq!(first.status, JobStatus::InProgress);
        assert_eq!(first.pages_done(), 1);
        assert_eq!(first.page_results[0].text, "slow");

        let second = store.get(second).unwrap();
        assert_eq!(second.status, JobStatus::Pending);
        assert_eq!(second.pages_done(), 0);
    }

    #[tokio::test]
    async fn timeouts_fail_the_job_as_cancelled() {
        let config = WorkerPoolConfig {
            page_timeout: Duration::from_millis(20),
            ..WorkerPoolConfig::default()
        };
        let harness = start(
            config,
            ScriptedProvider::new([Step::Delay(Duration::from_secs(60), "late")]),
            MemoryDocumentSource::new().with_text_pages("doc", &["1"]),
        );
        let job_id = harness.submit("doc");
        harness.wait_for(job_id, JobStatus::Failed).await;
        let job = harness.store.get(job_id).unwrap();
        assert_eq!(job.pages_done(), 0);
        assert!(job.error.unwrap().contains("deadline exceeded"));
        harness.finish().await;
    }

    #[test]
    fn panic_messages_are_extracted() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }
}
