//! # Checkpoint Server
//!
//! Unattended barcode checkpoint controller for Axis network cameras.
//!
//! A barcode reader in keyboard-wedge mode is attached to the station. Every
//! scanned code can be shown as a camera overlay, start or stop a bounded
//! video recording, be uploaded as snapshots or video to several storage
//! destinations, be announced to event management systems, and is answered
//! with a green or red LED flash.
//!
//! ## Architecture
//!
//! The decisions live in [`checkpoint_core`], which has no I/O. This crate
//! runs them as [`tokio`] subsystems under `tokio-graceful-shutdown`:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        checkpoint-server                         │
//! │  ┌──────────┐ readings ┌──────────────┐  scan   ┌──────────────┐ │
//! │  │ Reader   │ ───────► │ Orchestrator │ ──────► │ Recording    │ │
//! │  │ (stdin/  │          │              │ ◄────── │ (scheduler,  │ │
//! │  │  device) │          └──┬────┬───┬──┘ outcome │  timers)     │ │
//! │  └──────────┘             │    │   │            └──────┬───────┘ │
//! │                  flash    │    │   │ images            │ video   │
//! │  ┌──────────┐ ◄───────────┘    │   ▼                   ▼         │
//! │  │ Led      │         notify   │  ┌───────────────────────────┐  │
//! │  │ (actor)  │                  ▼  │     UploadDispatcher      │  │
//! │  └──────────┘       EventNotifier │ (retry, timeout, busy)    │  │
//! │                                   └───────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`keyboard::KeyboardReader`] - key events to readings
//! - [`orchestrator::Orchestrator`] - per-scan sequencing and LED outcome
//! - [`recording::RecordingController`] - recording sessions and post-roll
//! - [`dispatcher::UploadDispatcher`] - concurrent uploads with retries
//! - [`notifier::EventNotifier`] - best-effort event fan-out
//! - [`led::LedDriver`] - flash sequences and their cancellation
//! - [`device::vapix`] - camera, overlay and I/O port over VAPIX
//!
//! ## Command-Line Interface
//!
//! See [`Cli`]. Key options:
//!
//! - `-c, --config` - configuration file (default: per-user config dir)
//! - `-i, --input` - key event source, `-` for stdin
//! - `--check-config` - validate the configuration and exit
//! - `-v` - Increase verbosity (use multiple times)

extern crate tokio;

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

pub mod clock;
pub mod config;
pub mod destination;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod keyboard;
pub mod led;
pub mod notifier;
pub mod orchestrator;
pub mod recording;
pub mod retry;

#[cfg(test)]
pub mod testing;

use config::Config;
use device::{CameraDevice, VapixCamera, VapixOverlay, Widget};
use dispatcher::UploadDispatcher;
use error::CheckpointError;
use keyboard::KeyboardReader;
use led::{LedDriver, LedIndicator};
use notifier::EventNotifier;
use orchestrator::{Collaborators, Orchestrator};
use recording::RecordingController;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Readings waiting for the orchestrator
const READING_QUEUE: usize = 64;

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Key event source, overrides the configuration; `-` reads stdin
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Load and validate the configuration, print a summary and exit
    #[arg(long, default_value_t = false)]
    pub check_config: bool,

    /// Skip the LED self-test at startup
    #[arg(long, default_value_t = false)]
    pub no_startup_led: bool,
}

/// All components of one station, built and ready to run
pub struct Station {
    reader: KeyboardReader,
    recording: RecordingController,
    orchestrator: Orchestrator,
    led: LedIndicator,
    led_driver: Option<LedDriver>,
    startup_led: bool,
}

impl Station {
    pub fn new(args: &Cli, mut config: Config) -> Result<Self, CheckpointError> {
        if let Some(input) = &args.input {
            config.reader.input = Some(input.clone());
        }

        let camera = Arc::new(VapixCamera::new(&config.camera)?);
        let widget: Option<Arc<dyn Widget>> = if config.widget.enabled {
            Some(Arc::new(VapixOverlay::new(&config.camera, &config.widget)?))
        } else {
            None
        };
        let dispatcher = Arc::new(UploadDispatcher::from_config(&config.destinations)?);
        let notifier = EventNotifier::from_config(&config.notifiers)?;

        let (led, led_driver) = if config.led.enabled {
            let (led, driver) = LedDriver::new(&config.led, camera.clone());
            (led, Some(driver))
        } else {
            info!("LED feedback disabled");
            (LedIndicator::disabled(), None)
        };

        let (readings_tx, readings_rx) = mpsc::channel(READING_QUEUE);
        let reader = KeyboardReader::new(&config.reader, readings_tx)?;

        let camera: Arc<dyn CameraDevice> = camera;
        let (finalized_tx, finalized_rx) = mpsc::unbounded_channel();
        let (recording_handle, recording) = RecordingController::new(
            config.recording.clone(),
            camera.clone(),
            dispatcher.clone(),
            finalized_tx,
        )?;

        let orchestrator = Orchestrator::new(
            &config,
            Collaborators {
                camera,
                widget,
                notifier,
                dispatcher,
            },
            led.clone(),
            recording_handle,
            readings_rx,
            finalized_rx,
        );

        Ok(Station {
            reader,
            recording,
            orchestrator,
            led,
            led_driver,
            startup_led: !args.no_startup_led,
        })
    }

    /// Start every component as a subsystem of `subsystem`
    pub fn start(self, subsystem: &SubsystemHandle) {
        if let Some(driver) = self.led_driver {
            subsystem.start(SubsystemBuilder::new("Led", |subsys| driver.run(subsys)));
        }
        if self.startup_led {
            self.led.indicate_on_startup();
        }

        let recording = self.recording;
        subsystem.start(SubsystemBuilder::new("Recording", |subsys| {
            recording.run(subsys)
        }));
        let orchestrator = self.orchestrator;
        subsystem.start(SubsystemBuilder::new("Orchestrator", |subsys| {
            orchestrator.run(subsys)
        }));
        let reader = self.reader;
        subsystem.start(SubsystemBuilder::new("Reader", |subsys| reader.run(subsys)));

        info!("Checkpoint {} started", VERSION);
    }
}
