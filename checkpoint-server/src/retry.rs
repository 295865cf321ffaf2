//! Retry-with-timeout combinator shared by all destinations.

use log::{debug, warn};
use std::future::Future;
use tokio::time::{sleep, timeout};

use checkpoint_core::RetryPolicy;

use crate::error::CheckpointError;

/// Run `operation` until it succeeds or `policy.max_attempts` are used up.
///
/// Every attempt is bounded by `policy.attempt_timeout`; attempts after the
/// first are delayed by the policy backoff. `operation` receives the 1-based
/// attempt number. On exhaustion the last error is reported as
/// [`CheckpointError::UploadFailed`].
pub async fn retry_with_timeout<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, CheckpointError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CheckpointError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = CheckpointError::Timeout;

    for attempt in 1..=max_attempts {
        let delay = policy.backoff(attempt);
        if !delay.is_zero() {
            debug!("{}: retrying in {:?}", label, delay);
            sleep(delay).await;
        }

        match timeout(policy.attempt_timeout, operation(attempt)).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!("{}: succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Ok(Err(e)) => {
                warn!("{}: attempt {}/{} failed: {}", label, attempt, max_attempts, e);
                last_error = e;
            }
            Err(_) => {
                warn!(
                    "{}: attempt {}/{} timed out after {:?}",
                    label, attempt, max_attempts, policy.attempt_timeout
                );
                last_error = CheckpointError::Timeout;
            }
        }
    }

    Err(CheckpointError::UploadFailed {
        destination: label.to_string(),
        attempts: max_attempts,
        reason: last_error.to_string(),
    })
}
