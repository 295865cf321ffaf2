//! Recording session state machine.
//!
//! Decides, per scanned code, whether a recording session starts, stops or is
//! left alone. This is a pure state machine with no I/O and no timers: the
//! caller passes the current time in milliseconds and is responsible for
//! arming the timers described by the returned decisions.
//!
//! # Rules
//!
//! Evaluated in order for every incoming code:
//!
//! 1. A code equal to the last processed code within
//!    [`ACCIDENTAL_READ_WINDOW_MS`] of the session start is a reader
//!    double-fire and is ignored.
//! 2. While recording, the stop code (or any code if no stop code is
//!    configured) finalizes the session.
//! 3. While idle, the start code (or any code different from the last one if
//!    no start code is configured) starts a session.
//! 4. Anything else leaves the state unchanged.
//!
//! Every session carries an epoch. Timers report back with the epoch they were
//! armed for, so a late timer can never touch a newer session.
//!
//! ```text
//!            start code               stop code / hard timeout
//!   ┌──────┐ ───────────► ┌───────────┐ ──────────────────► ┌──────┐
//!   │ Idle │              │ Recording │                     │ Idle │ (post-roll pending)
//!   └──────┘ ◄─────────── └───────────┘                     └──────┘
//!                     post-roll complete clears the session metadata
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Window in which a repeat of the last code is treated as an accidental read
pub const ACCIDENTAL_READ_WINDOW_MS: u64 = 3000;

/// Recording rules, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub start_code: Option<String>,
    pub stop_code: Option<String>,
    /// Maximum session length before it is stopped automatically
    pub timeout_sec: u64,
    /// Seconds of video before the start trigger to include
    pub prebuffer_sec: u64,
    /// Seconds of video after the stop trigger to include
    pub postbuffer_sec: u64,
    /// Camera channels to retrieve video from
    pub source_list: Vec<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            start_code: None,
            stop_code: None,
            timeout_sec: 60,
            prebuffer_sec: 5,
            postbuffer_sec: 5,
            source_list: vec![1],
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_sec == 0 {
            return Err(ConfigError::InvalidTiming {
                field: "timeoutSec",
                reason: "must be at least one second".to_string(),
            });
        }
        if let (Some(start), Some(stop)) = (self.start_code(), self.stop_code()) {
            if start == stop {
                return Err(ConfigError::AmbiguousControlCode(start.to_string()));
            }
        }
        Ok(())
    }

    /// Configured start code, treating an empty string as absent
    pub fn start_code(&self) -> Option<&str> {
        self.start_code.as_deref().filter(|s| !s.is_empty())
    }

    /// Configured stop code, treating an empty string as absent
    pub fn stop_code(&self) -> Option<&str> {
        self.stop_code.as_deref().filter(|s| !s.is_empty())
    }

    pub fn hard_timeout_ms(&self) -> u64 {
        (self.timeout_sec + self.postbuffer_sec) * 1000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Recording,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Recording => write!(f, "Recording"),
        }
    }
}

/// The single recording session of the station.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordingSession {
    pub active: bool,
    pub started_at_ms: u64,
    pub trigger_code: String,
    pub last_code: Option<String>,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    StopCode,
    Timeout,
}

impl std::fmt::Display for FinalizeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalizeReason::StopCode => write!(f, "stop code"),
            FinalizeReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// A finalized session, waiting for its post-roll before video retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalize {
    pub epoch: u64,
    pub reason: FinalizeReason,
    pub trigger_code: String,
    pub started_at_ms: u64,
    pub stopped_at_ms: u64,
    pub post_roll_ms: u64,
    pub prebuffer_ms: u64,
    pub sources: Vec<u32>,
}

impl Finalize {
    /// Video interval to retrieve once the post-roll has elapsed at `now_ms`
    pub fn window(&self, now_ms: u64) -> (u64, u64) {
        (self.started_at_ms.saturating_sub(self.prebuffer_ms), now_ms)
    }
}

/// Outcome of feeding one code into the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanDecision {
    /// Accidental repeat of the last code
    Ignored,
    /// A session started; arm a hard timeout of `timeout_ms` for `epoch`
    Started { epoch: u64, timeout_ms: u64 },
    /// The active session was finalized
    Stopped(Finalize),
    NoChange,
}

#[derive(Debug, Clone)]
pub struct RecordingScheduler {
    config: SchedulerConfig,
    session: RecordingSession,
}

impl RecordingScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(RecordingScheduler {
            config,
            session: RecordingSession::default(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn session(&self) -> &RecordingSession {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        if self.session.active {
            SessionState::Recording
        } else {
            SessionState::Idle
        }
    }

    /// Whether `code` should be shown on the overlay and treated as a
    /// regular scan. Control codes and accidental reads are not shown.
    ///
    /// Does not mutate any state; call it before [`Self::on_barcode_scan`].
    pub fn should_show_barcode(&self, code: &str, now_ms: u64) -> bool {
        !self.is_control_code(code) && !self.is_accidental_read(code, now_ms)
    }

    pub fn is_control_code(&self, code: &str) -> bool {
        self.config.start_code() == Some(code) || self.config.stop_code() == Some(code)
    }

    fn is_accidental_read(&self, code: &str, now_ms: u64) -> bool {
        self.session.last_code.as_deref() == Some(code)
            && now_ms.saturating_sub(self.session.started_at_ms) < ACCIDENTAL_READ_WINDOW_MS
    }

    fn is_stop_code(&self, code: &str) -> bool {
        match self.config.stop_code() {
            Some(stop) => stop == code,
            None => true,
        }
    }

    fn is_start_code(&self, code: &str) -> bool {
        match self.config.start_code() {
            Some(start) => start == code,
            None => self.session.last_code.as_deref() != Some(code),
        }
    }

    pub fn on_barcode_scan(&mut self, code: &str, now_ms: u64) -> ScanDecision {
        if self.is_accidental_read(code, now_ms) {
            return ScanDecision::Ignored;
        }

        if self.session.active {
            if self.is_stop_code(code) {
                self.session.last_code = Some(code.to_string());
                return ScanDecision::Stopped(self.finalize(FinalizeReason::StopCode, now_ms));
            }
            return ScanDecision::NoChange;
        }

        if self.is_start_code(code) {
            self.session.epoch += 1;
            self.session.active = true;
            self.session.started_at_ms = now_ms;
            self.session.trigger_code = code.to_string();
            self.session.last_code = Some(code.to_string());
            return ScanDecision::Started {
                epoch: self.session.epoch,
                timeout_ms: self.config.hard_timeout_ms(),
            };
        }

        ScanDecision::NoChange
    }

    /// Hard timeout for `epoch` fired. Returns `None` if that session is no
    /// longer the active one.
    pub fn on_timeout(&mut self, epoch: u64, now_ms: u64) -> Option<Finalize> {
        if !self.session.active || self.session.epoch != epoch {
            return None;
        }
        Some(self.finalize(FinalizeReason::Timeout, now_ms))
    }

    /// Post-roll for `epoch` completed. Clears the session metadata unless a
    /// newer session has started in the meantime.
    pub fn on_post_roll_complete(&mut self, epoch: u64) -> bool {
        if self.session.active || self.session.epoch != epoch {
            return false;
        }
        self.session = RecordingSession {
            epoch: self.session.epoch,
            ..RecordingSession::default()
        };
        true
    }

    fn finalize(&mut self, reason: FinalizeReason, now_ms: u64) -> Finalize {
        self.session.active = false;
        Finalize {
            epoch: self.session.epoch,
            reason,
            trigger_code: self.session.trigger_code.clone(),
            started_at_ms: self.session.started_at_ms,
            stopped_at_ms: now_ms,
            post_roll_ms: self.config.postbuffer_sec * 1000,
            prebuffer_ms: self.config.prebuffer_sec * 1000,
            sources: self.config.source_list.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toggling() -> RecordingScheduler {
        RecordingScheduler::new(SchedulerConfig {
            timeout_sec: 30,
            prebuffer_sec: 5,
            postbuffer_sec: 2,
            source_list: vec![1],
            ..Default::default()
        })
        .unwrap()
    }

    fn with_codes() -> RecordingScheduler {
        RecordingScheduler::new(SchedulerConfig {
            start_code: Some("START1".to_string()),
            stop_code: Some("STOP1".to_string()),
            timeout_sec: 30,
            prebuffer_sec: 5,
            postbuffer_sec: 2,
            source_list: vec![1, 2],
        })
        .unwrap()
    }

    #[test]
    fn test_should_show_is_pure() {
        let mut scheduler = toggling();
        scheduler.on_barcode_scan("X", 1000);
        let before = scheduler.session().clone();

        let first = scheduler.should_show_barcode("X", 1500);
        let second = scheduler.should_show_barcode("X", 1500);
        assert_eq!(first, second);
        assert!(!first);
        assert_eq!(scheduler.session(), &before);

        assert!(scheduler.should_show_barcode("Y", 1500));
        assert_eq!(scheduler.session(), &before);
    }

    #[test]
    fn test_control_codes_are_not_shown() {
        let scheduler = with_codes();
        assert!(!scheduler.should_show_barcode("START1", 0));
        assert!(!scheduler.should_show_barcode("STOP1", 0));
        assert!(scheduler.should_show_barcode("PARCEL-7", 0));
    }

    #[test]
    fn test_accidental_read_suppression() {
        let mut scheduler = toggling();
        assert!(matches!(
            scheduler.on_barcode_scan("X", 10_000),
            ScanDecision::Started { .. }
        ));

        assert_eq!(scheduler.on_barcode_scan("X", 11_000), ScanDecision::Ignored);
        assert_eq!(scheduler.state(), SessionState::Recording);

        assert!(matches!(
            scheduler.on_barcode_scan("X", 14_000),
            ScanDecision::Stopped(_)
        ));
        assert_eq!(scheduler.state(), SessionState::Idle);
    }

    #[test]
    fn test_toggle_same_code_starts_then_stops() {
        let mut scheduler = toggling();
        let started = scheduler.on_barcode_scan("A", 0);
        assert_eq!(
            started,
            ScanDecision::Started {
                epoch: 1,
                timeout_ms: 32_000
            }
        );
        match scheduler.on_barcode_scan("A", 5_000) {
            ScanDecision::Stopped(f) => {
                assert_eq!(f.reason, FinalizeReason::StopCode);
                assert_eq!(f.trigger_code, "A");
                assert_eq!(f.epoch, 1);
            }
            other => panic!("expected stop, got {:?}", other),
        }
    }

    #[test]
    fn test_toggle_distinct_code_stops_session() {
        let mut scheduler = toggling();
        scheduler.on_barcode_scan("A", 0);
        match scheduler.on_barcode_scan("B", 1_000) {
            ScanDecision::Stopped(f) => assert_eq!(f.trigger_code, "A"),
            other => panic!("expected stop, got {:?}", other),
        }
        assert_eq!(scheduler.session().last_code.as_deref(), Some("B"));
    }

    #[test]
    fn test_toggle_does_not_restart_with_last_code_until_cleared() {
        let mut scheduler = toggling();
        scheduler.on_barcode_scan("A", 0);
        scheduler.on_barcode_scan("B", 4_000);

        // Post-roll still pending: the code that just stopped does not restart
        assert_eq!(scheduler.on_barcode_scan("B", 9_000), ScanDecision::NoChange);

        assert!(scheduler.on_post_roll_complete(1));
        assert!(matches!(
            scheduler.on_barcode_scan("B", 10_000),
            ScanDecision::Started { epoch: 2, .. }
        ));
    }

    #[test]
    fn test_start_stop_codes() {
        let mut scheduler = with_codes();
        assert_eq!(scheduler.on_barcode_scan("OTHER", 0), ScanDecision::NoChange);
        assert!(matches!(
            scheduler.on_barcode_scan("START1", 0),
            ScanDecision::Started { .. }
        ));
        assert_eq!(scheduler.on_barcode_scan("OTHER", 1_000), ScanDecision::NoChange);
        assert_eq!(
            scheduler.on_barcode_scan("START1", 5_000),
            ScanDecision::NoChange
        );
        match scheduler.on_barcode_scan("STOP1", 10_000) {
            ScanDecision::Stopped(f) => {
                assert_eq!(f.sources, vec![1, 2]);
                assert_eq!(f.post_roll_ms, 2_000);
                assert_eq!(f.window(12_000), (0, 12_000));
            }
            other => panic!("expected stop, got {:?}", other),
        }
        assert_eq!(scheduler.on_barcode_scan("STOP1", 20_000), ScanDecision::NoChange);
    }

    #[test]
    fn test_prebuffer_window() {
        let mut scheduler = with_codes();
        scheduler.on_barcode_scan("START1", 60_000);
        let ScanDecision::Stopped(f) = scheduler.on_barcode_scan("STOP1", 70_000) else {
            panic!("expected stop");
        };
        assert_eq!(f.window(72_000), (55_000, 72_000));
    }

    #[test]
    fn test_only_start_code_any_code_stops() {
        let mut scheduler = RecordingScheduler::new(SchedulerConfig {
            start_code: Some("GO".to_string()),
            timeout_sec: 10,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(scheduler.on_barcode_scan("X", 0), ScanDecision::NoChange);
        assert!(matches!(
            scheduler.on_barcode_scan("GO", 0),
            ScanDecision::Started { .. }
        ));
        assert!(matches!(
            scheduler.on_barcode_scan("X", 100),
            ScanDecision::Stopped(_)
        ));
    }

    #[test]
    fn test_timeout_finalizes_once() {
        let mut scheduler = with_codes();
        let ScanDecision::Started { epoch, timeout_ms } = scheduler.on_barcode_scan("START1", 0)
        else {
            panic!("expected start");
        };
        let f = scheduler.on_timeout(epoch, timeout_ms).unwrap();
        assert_eq!(f.reason, FinalizeReason::Timeout);
        assert!(scheduler.on_timeout(epoch, timeout_ms + 1).is_none());
    }

    #[test]
    fn test_stale_timeout_after_manual_stop() {
        let mut scheduler = with_codes();
        let ScanDecision::Started { epoch, .. } = scheduler.on_barcode_scan("START1", 0) else {
            panic!("expected start");
        };
        scheduler.on_barcode_scan("STOP1", 5_000);
        // The timer raced the manual stop and fires afterwards
        assert!(scheduler.on_timeout(epoch, 32_000).is_none());

        // Nor may it stop a newer session
        scheduler.on_barcode_scan("START1", 40_000);
        assert!(scheduler.on_timeout(epoch, 41_000).is_none());
        assert_eq!(scheduler.state(), SessionState::Recording);
    }

    #[test]
    fn test_stale_post_roll_keeps_new_session() {
        let mut scheduler = with_codes();
        scheduler.on_barcode_scan("START1", 0);
        scheduler.on_barcode_scan("STOP1", 5_000);
        scheduler.on_barcode_scan("START1", 9_000);

        assert!(!scheduler.on_post_roll_complete(1));
        assert_eq!(scheduler.session().trigger_code, "START1");
        assert_eq!(scheduler.session().epoch, 2);
        assert!(scheduler.session().active);
    }

    #[test]
    fn test_invalid_config() {
        assert!(RecordingScheduler::new(SchedulerConfig::default()).is_ok());
        let zero = SchedulerConfig {
            timeout_sec: 0,
            ..Default::default()
        };
        assert!(RecordingScheduler::new(zero).is_err());
        let same = SchedulerConfig {
            start_code: Some("X".to_string()),
            stop_code: Some("X".to_string()),
            timeout_sec: 5,
            ..Default::default()
        };
        assert_eq!(
            same.validate(),
            Err(ConfigError::AmbiguousControlCode("X".to_string()))
        );
    }

    #[test]
    fn test_empty_codes_are_absent() {
        let config = SchedulerConfig {
            start_code: Some(String::new()),
            stop_code: Some(String::new()),
            timeout_sec: 5,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        let scheduler = RecordingScheduler::new(config).unwrap();
        assert!(!scheduler.is_control_code(""));
    }
}
