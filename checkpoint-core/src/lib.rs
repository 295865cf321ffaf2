//! # Checkpoint Core
//!
//! Platform-independent logic for an unattended barcode checkpoint: a reader
//! attached to a network camera triggers overlays, bounded recordings,
//! uploads and LED feedback.
//!
//! This crate contains pure state machines with **zero I/O dependencies**.
//! Time is passed in by the caller, so every rule can be tested without a
//! runtime or real clock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  checkpoint-core (platform-independent, no tokio/async)     │
//! │  ├── reader/     (key events -> validated readings)         │
//! │  ├── scheduler/  (recording start/stop/timeout decisions)   │
//! │  ├── led/        (flash patterns)                           │
//! │  ├── retry/      (per-destination retry policy)             │
//! │  ├── ftp/        (FTP control replies and commands)         │
//! │  └── outcome/    (upload outcomes -> feedback result)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  checkpoint-server      │
//!                 │  (actors, timers, HTTP) │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Example: Recording Decisions
//!
//! ```rust
//! use checkpoint_core::{RecordingScheduler, ScanDecision, SchedulerConfig};
//!
//! let mut scheduler = RecordingScheduler::new(SchedulerConfig {
//!     start_code: Some("START1".into()),
//!     stop_code: Some("STOP1".into()),
//!     timeout_sec: 30,
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! assert!(!scheduler.should_show_barcode("START1", 0));
//! assert!(matches!(
//!     scheduler.on_barcode_scan("START1", 0),
//!     ScanDecision::Started { .. }
//! ));
//! assert!(matches!(
//!     scheduler.on_barcode_scan("STOP1", 10_000),
//!     ScanDecision::Stopped(_)
//! ));
//! ```

pub mod error;
pub mod ftp;
pub mod led;
pub mod outcome;
pub mod reader;
pub mod retry;
pub mod scheduler;

// Re-export commonly used types
pub use error::ConfigError;
pub use led::{FlashStep, LedKind, LedRequest};
pub use reader::{BarcodeDecoder, KeyEvent, Reading, ReaderEvent};
pub use retry::RetryPolicy;
pub use scheduler::{
    Finalize, FinalizeReason, RecordingScheduler, RecordingSession, ScanDecision, SchedulerConfig,
    SessionState,
};
