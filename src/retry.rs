//! Support utilities for [`keen_retry`]'s retry API.

use keen_retry::RetryResult;
use reqwest::StatusCode;

use crate::prelude::*;

/// How we retry a page whose OCR call failed with a transient error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How many extra attempts to make after the first one fails. Zero means
    /// the first failure is final.
    pub re_attempts: u8,

    /// The range of backoff delays, in milliseconds.
    pub backoff_min_millis: u32,
    pub backoff_max_millis: u32,
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self::with_re_attempts(0)
    }

    /// Retry up to `re_attempts` times with our standard backoff.
    pub fn with_re_attempts(re_attempts: u8) -> Self {
        Self {
            re_attempts,
            backoff_min_millis: 1_000,
            backoff_max_millis: 30_000,
        }
    }
}

/// Classify a `Result` for [`keen_retry`], using [`IsKnownTransient`] to
/// decide whether an error is worth retrying.
pub(crate) fn classify_result<T, E>(result: Result<T, E>) -> RetryResult<(), (), T, E>
where
    E: IsKnownTransient + std::fmt::Debug,
{
    match result {
        Ok(output) => RetryResult::Ok {
            reported_input: (),
            output,
        },
        Err(error) if error.is_known_transient() => {
            debug!("Potentially transient error: {:?}", error);
            RetryResult::Transient { input: (), error }
        }
        Err(error) => RetryResult::Fatal { input: (), error },
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they've been observed
/// in the wild, investigated and determined to be transient. This prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}
