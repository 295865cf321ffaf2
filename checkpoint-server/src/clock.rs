//! Wall clock that follows the tokio timer.
//!
//! The scheduler works in milliseconds since the Unix epoch. Deriving those
//! from `tokio::time::Instant` instead of `SystemTime` keeps session timing
//! consistent with the timers, including when time is paused in tests.

use chrono::{DateTime, TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base_instant: Instant,
    base_unix_ms: u64,
}

impl Clock {
    pub fn new() -> Self {
        let base_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Clock {
            base_instant: Instant::now(),
            base_unix_ms,
        }
    }

    /// Milliseconds since the Unix epoch
    pub fn now_ms(&self) -> u64 {
        self.base_unix_ms + self.base_instant.elapsed().as_millis() as u64
    }

    pub fn now(&self) -> DateTime<Utc> {
        to_datetime(self.now_ms())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn to_datetime(unix_ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(unix_ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = Clock::new();
        let t0 = clock.now_ms();
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(clock.now_ms() - t0, 7000);
    }

    #[test]
    fn test_to_datetime() {
        let dt = to_datetime(1_700_000_000_000);
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }
}
