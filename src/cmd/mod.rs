//! Command-line entry points.

use crate::{
    jobs::{JobStatus, JobStatusReport},
    prelude::*,
    ui::Ui,
};

pub mod ocr;
pub mod schema;

/// Tallies of how a batch of jobs turned out.
#[derive(Clone, Debug, Default)]
pub struct JobOutcomeCounters {
    /// Every document we tried to OCR, including ones we couldn't submit.
    pub total_document_count: usize,
    /// Documents which could not be submitted, or whose job failed.
    pub failure_count: usize,
    /// Pages whose text was cut off by the generation limit.
    pub limited_page_count: usize,
}

impl JobOutcomeCounters {
    /// Count a document which never became a job.
    pub fn record_rejected(&mut self) {
        self.total_document_count += 1;
        self.failure_count += 1;
    }

    /// Count a finished job.
    pub fn record_report(&mut self, report: &JobStatusReport) {
        self.total_document_count += 1;
        if report.status == JobStatus::Failed {
            self.failure_count += 1;
        }
        self.limited_page_count += report
            .pages
            .iter()
            .filter(|page| page.ocr_limit_hit)
            .count();
    }

    /// Tell the user how things went, and fail if too many documents failed.
    pub fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        if self.total_document_count == 0 {
            return Ok(());
        }
        let failure_rate = self.failure_count as f32 / self.total_document_count as f32;
        if failure_rate > allowed_failure_rate {
            return Err(anyhow!(
                "{}/{} ({:.2}%) of documents were failures, but only {:.2}% were allowed",
                self.failure_count,
                self.total_document_count,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ));
        }
        if self.limited_page_count > 0 {
            ui.display_message(
                "✂️",
                &format!(
                    "{} pages stopped at the generation limit",
                    self.limited_page_count
                ),
            );
        }
        if self.failure_count > 0 {
            ui.display_message(
                "❌",
                &format!("{} documents could not be processed", self.failure_count),
            );
        }
        Ok(())
    }
}
