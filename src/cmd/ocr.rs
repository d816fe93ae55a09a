//! The `ocr` subcommand.

use std::{sync::Arc, time::Duration};

use clap::Args;
use futures::{StreamExt as _, stream};

use crate::{
    async_utils::io::write_output,
    config::{PoolOpts, ProviderConfig, ProviderOpts},
    documents::fs::FsDocumentSource,
    jobs::{DocumentId, JobId, JobStatusReport},
    prelude::*,
    providers::create_provider,
    service::OcrService,
    ui::{ProgressConfig, Ui},
};

use super::JobOutcomeCounters;

/// Options for the `ocr` subcommand.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Documents to OCR. Each may be an image, a multipage TIFF, a PDF, or a
    /// directory of page images.
    #[clap(value_name = "DOCUMENT", required = true)]
    pub documents: Vec<String>,

    /// Resolve documents relative to this directory.
    #[clap(long, default_value = ".")]
    pub root: PathBuf,

    /// Output location, one JSON job report per line. Defaults to stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// How often to check on running jobs, in milliseconds.
    #[clap(long, default_value = "250")]
    pub poll_interval_ms: u64,

    /// Once jobs finish, OCR this zero-based page of each job again. May be
    /// repeated.
    #[clap(long = "reocr-page", value_name = "PAGE")]
    pub reocr_pages: Vec<usize>,

    /// What portion of documents should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,

    #[clap(flatten)]
    pub provider: ProviderOpts,

    #[clap(flatten)]
    pub pool: PoolOpts,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    if opts.poll_interval_ms == 0 {
        return Err(anyhow!("--poll-interval-ms must be at least 1"));
    }

    let provider_config = ProviderConfig::from_opts(&opts.provider)?;
    let pool_config = opts.pool.to_pool_config()?;
    let provider = create_provider(&provider_config, pool_config.workers).await?;
    let source = Arc::new(FsDocumentSource::new(&opts.root, opts.pool.rasterize_dpi));
    let (service, worker) = OcrService::new(pool_config, provider, source);

    let mut counters = JobOutcomeCounters::default();
    let mut job_ids = Vec::with_capacity(opts.documents.len());
    for document in &opts.documents {
        match service.submit_job(DocumentId::new(document.as_str())).await {
            Ok(job_id) => job_ids.push(job_id),
            Err(err) => {
                error!(document_id = %document, "Could not submit document: {err:#}");
                counters.record_rejected();
            }
        }
    }

    let poll_interval = Duration::from_millis(opts.poll_interval_ms);
    wait_for_jobs(&ui, &service, &job_ids, poll_interval).await;

    for &page_idx in &opts.reocr_pages {
        reocr_finished_jobs(&service, &job_ids, page_idx).await?;
    }

    let reports = job_ids
        .iter()
        .map(|&job_id| service.job_status(job_id))
        .collect::<Result<Vec<_>, _>>()?;
    for report in &reports {
        counters.record_report(report);
    }
    let output = stream::iter(reports.into_iter().map(|report| {
        serde_json::to_value(report).context("could not serialize job report")
    }))
    .boxed();
    write_output(opts.output_path.as_deref(), output).await?;

    service.shutdown();
    worker.join().await?;
    counters.finish(&ui, opts.allowed_failure_rate)
}

/// Poll our jobs until none of them are pending or in progress, showing pages
/// done on a progress bar.
async fn wait_for_jobs(
    ui: &Ui,
    service: &OcrService,
    job_ids: &[JobId],
    poll_interval: Duration,
) {
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing pages",
            done_msg: "OCRed pages",
        },
        0,
    );
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        interval.tick().await;
        let ours = service
            .list_jobs()
            .into_iter()
            .filter(|summary| job_ids.contains(&summary.job_id))
            .collect::<Vec<_>>();
        let total_pages = ours
            .iter()
            .map(|summary| summary.total_pages.unwrap_or(summary.pages_done))
            .sum::<usize>();
        let pages_done = ours.iter().map(|summary| summary.pages_done).sum::<usize>();
        pb.set_length(total_pages as u64);
        pb.set_position(pages_done as u64);
        if ours.iter().all(|summary| summary.status.is_terminal()) {
            break;
        }
    }
    pb.finish_using_style();
}

/// Re-OCR one page of every job that got that far.
#[instrument(level = "debug", skip_all, fields(page = page_idx))]
async fn reocr_finished_jobs(
    service: &OcrService,
    job_ids: &[JobId],
    page_idx: usize,
) -> Result<()> {
    for &job_id in job_ids {
        let JobStatusReport { pages_done, .. } = service.job_status(job_id)?;
        if page_idx >= pages_done {
            warn!(%job_id, pages_done, "Job has no page {page_idx} to re-OCR");
            continue;
        }
        if let Err(err) = service.reocr_page(job_id, page_idx).await {
            warn!(%job_id, "Could not re-OCR page {page_idx}: {err:#}");
        }
    }
    Ok(())
}
