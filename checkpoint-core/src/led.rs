//! LED flash patterns.
//!
//! The indicator has two binary outputs: green for success and red for
//! failure. This module only describes *what* to drive; timing and
//! cancellation are done by the platform layer.

use serde::{Deserialize, Serialize};

/// Pause between two flashes of the same request
pub const REPEAT_GAP_MS: u64 = 100;

/// Startup self-test: both outputs flash this many times
pub const STARTUP_REPEAT: u32 = 3;
/// On and off time of each startup flash
pub const STARTUP_CADENCE_MS: u64 = 300;

/// Flash length for the acknowledgement of a single reading
pub const READING_FLASH_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedKind {
    Success,
    Failure,
}

impl LedKind {
    /// Success and failure are mutually exclusive on the indicator
    pub fn opposite(self) -> LedKind {
        match self {
            LedKind::Success => LedKind::Failure,
            LedKind::Failure => LedKind::Success,
        }
    }
}

impl std::fmt::Display for LedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedKind::Success => write!(f, "success"),
            LedKind::Failure => write!(f, "failure"),
        }
    }
}

/// Hold the output at `active` for `hold_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashStep {
    pub active: bool,
    pub hold_ms: u64,
}

impl FlashStep {
    pub fn on(hold_ms: u64) -> Self {
        FlashStep {
            active: true,
            hold_ms,
        }
    }

    pub fn off(hold_ms: u64) -> Self {
        FlashStep {
            active: false,
            hold_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedRequest {
    pub kind: LedKind,
    pub repeat_count: u32,
    pub flash_duration_ms: u64,
}

impl LedRequest {
    pub fn new(kind: LedKind, flash_duration_ms: u64, repeat_count: u32) -> Self {
        LedRequest {
            kind,
            repeat_count,
            flash_duration_ms,
        }
    }

    /// Steps of this request. Always ends with the output low.
    pub fn steps(&self) -> Vec<FlashStep> {
        flash_steps(self.repeat_count, self.flash_duration_ms, REPEAT_GAP_MS)
    }
}

/// Steps of the startup self-test, applied to both outputs together
pub fn startup_steps() -> Vec<FlashStep> {
    flash_steps(STARTUP_REPEAT, STARTUP_CADENCE_MS, STARTUP_CADENCE_MS)
}

fn flash_steps(repeat: u32, on_ms: u64, gap_ms: u64) -> Vec<FlashStep> {
    let mut steps = Vec::with_capacity(repeat as usize * 2);
    for i in 0..repeat {
        steps.push(FlashStep::on(on_ms));
        if i + 1 < repeat {
            steps.push(FlashStep::off(gap_ms));
        }
    }
    steps.push(FlashStep::off(0));
    steps
}
