//! Retry policy shared by every upload destination.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// First backoff delay between two attempts
const BASE_BACKOFF_MS: u64 = 1000;
/// Upper bound for the backoff delay
const MAX_BACKOFF_MS: u64 = 30_000;

/// How often and how long a destination may try one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts in total, at least one
    pub max_attempts: u32,
    /// Ceiling for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Build from the `numberOfRetries` / `uploadTimeoutS` settings of a
    /// destination. Zero retries still means one attempt.
    pub fn from_settings(number_of_retries: u32, upload_timeout_s: u64) -> Self {
        RetryPolicy {
            max_attempts: number_of_retries.max(1),
            attempt_timeout: Duration::from_secs(upload_timeout_s.max(1)),
        }
    }

    /// Delay before attempt number `attempt` (1-based; the first attempt is
    /// not delayed).
    ///
    /// Uses exponential backoff: 0, 1s, 2s, 4s, 8s, max 30s
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let delay = BASE_BACKOFF_MS * (1u64 << (attempt - 2).min(5));
        Duration::from_millis(delay.min(MAX_BACKOFF_MS))
    }
}
