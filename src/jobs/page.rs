//! Running one page through a provider: the deadline and retry rules shared by
//! the worker pool and re-OCR.

use std::time::Duration;

use keen_retry::{ExponentialJitter, ResolvedResult};
use tokio::time;

use crate::{
    documents::PageImage,
    error::{ProviderError, ProviderErrorKind},
    prelude::*,
    providers::OcrProvider,
    retry::{RetryPolicy, classify_result},
};

use super::PageResult;

/// Make one provider call, bounded by `timeout`.
async fn attempt_page(
    provider: &dyn OcrProvider,
    image: &PageImage,
    page_idx: usize,
    timeout: Duration,
) -> Result<PageResult, ProviderError> {
    match time::timeout(timeout, provider.process_image(image, page_idx)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(ProviderError::new(
            provider.name(),
            ProviderErrorKind::Cancelled,
            format!("no response within {}s", timeout.as_secs_f64()),
        )),
    }
}

/// OCR one page, retrying known-transient failures according to `retry`.
///
/// Nothing is stored here. The caller commits the result, or records the
/// error.
#[instrument(level = "debug", skip_all, fields(provider = provider.name(), page = page_idx))]
pub async fn process_page(
    provider: &dyn OcrProvider,
    image: &PageImage,
    page_idx: usize,
    timeout: Duration,
    retry: RetryPolicy,
) -> Result<PageResult, ProviderError> {
    let first_attempt = attempt_page(provider, image, page_idx, timeout).await;
    if retry.re_attempts == 0 {
        return first_attempt;
    }

    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: retry.backoff_min_millis..=retry.backoff_max_millis,
        re_attempts: retry.re_attempts,
        jitter_ratio: 0.2,
    };
    let result = classify_result(first_attempt)
        .retry_with_async(|_| async {
            classify_result(attempt_page(provider, image, page_idx, timeout).await)
        })
        .with_exponential_jitter(|| jitter)
        .await
        .inspect_recovered(|_, _, retry_errors_list| {
            warn!(
                "page succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        })
        .inspect_given_up(|_, retry_errors_list, fatal_error| {
            error!(
                "page FAILED after exhausting all {} retry attempts with error {fatal_error:?}. Previous transient failures: [{}]",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        });

    match result {
        ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
            Ok(output)
        }
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::GivenUp { fatal_error, .. }
        | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
    }
}
