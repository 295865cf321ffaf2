//! Per-scan orchestration.
//!
//! The orchestrator consumes readings in arrival order. For each valid
//! reading it acknowledges the scan on the LED, asks the recording actor
//! whether the code is shown and feeds it to the scheduler, then hands the
//! rest of the work to a spawned pipeline so the next scan is never held up:
//!
//! ```text
//!  reading ──► ack flash ──► should_show ──► scan ──┐
//!                                                   ▼  (spawned)
//!            widget ──► notify ──► ┬─ image capture + dispatch ─┬──► LED outcome
//!                                  └─ video outcome (oneshot) ──┘
//! ```
//!
//! The LED outcome of a scan always follows the uploads it depends on.
//! Sessions that end by hard timeout report their video outcome on a
//! separate channel, which is mapped to the LED here as well.

use futures::future::join_all;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_graceful_shutdown::SubsystemHandle;

use checkpoint_core::{outcome, ReaderEvent};

use crate::clock::Clock;
use crate::config::{Config, ImageConfig, OutputType};
use crate::destination::upload_name;
use crate::device::{CameraDevice, Widget};
use crate::dispatcher::{ImagePayload, UploadDispatcher};
use crate::error::CheckpointError;
use crate::led::LedIndicator;
use crate::notifier::EventNotifier;
use crate::recording::{FinalizedVideo, RecordingHandle};

/// External capabilities the pipeline drives
pub struct Collaborators {
    pub camera: Arc<dyn CameraDevice>,
    pub widget: Option<Arc<dyn Widget>>,
    pub notifier: EventNotifier,
    pub dispatcher: Arc<UploadDispatcher>,
}

pub struct Orchestrator {
    readings: mpsc::Receiver<ReaderEvent>,
    finalized: mpsc::UnboundedReceiver<FinalizedVideo>,
    recording: RecordingHandle,
    recording_enabled: bool,
    reading_flash_ms: u64,
    pipeline: Arc<Pipeline>,
}

struct Pipeline {
    camera: Arc<dyn CameraDevice>,
    widget: Option<Arc<dyn Widget>>,
    notifier: EventNotifier,
    dispatcher: Arc<UploadDispatcher>,
    led: LedIndicator,
    images: ImageConfig,
    visibility: Duration,
    flash_duration_ms: u64,
    repeat_count: u32,
    clock: Clock,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        collaborators: Collaborators,
        led: LedIndicator,
        recording: RecordingHandle,
        readings: mpsc::Receiver<ReaderEvent>,
        finalized: mpsc::UnboundedReceiver<FinalizedVideo>,
    ) -> Self {
        let recording_enabled = collaborators.dispatcher.has_enabled(OutputType::Video)
            && !config.recording.source_list.is_empty();
        let widget = collaborators.widget.filter(|_| config.widget.enabled);
        let pipeline = Pipeline {
            camera: collaborators.camera,
            widget,
            notifier: collaborators.notifier,
            dispatcher: collaborators.dispatcher,
            led,
            images: config.images.clone(),
            visibility: Duration::from_secs(config.widget.visibility_sec),
            flash_duration_ms: config.led.flash_duration_ms,
            repeat_count: config.led.repeat_count.max(1),
            clock: Clock::new(),
        };
        Orchestrator {
            readings,
            finalized,
            recording,
            recording_enabled,
            reading_flash_ms: config.led.reading_flash_ms,
            pipeline: Arc::new(pipeline),
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), CheckpointError> {
        info!(
            "Orchestrator: recording {}, image upload {}",
            if self.recording_enabled { "enabled" } else { "disabled" },
            if self.pipeline.dispatcher.has_enabled(OutputType::Image) {
                "enabled"
            } else {
                "disabled"
            }
        );
        self.serve(subsys.on_shutdown_requested()).await;
        Ok(())
    }

    pub async fn serve(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Orchestrator: shutdown requested");
                    break;
                }
                reading = self.readings.recv() => match reading {
                    Some(event) => self.on_reading(event).await,
                    None => {
                        info!("Orchestrator: reader closed");
                        shutdown.await;
                        break;
                    }
                },
                Some(video) = self.finalized.recv() => {
                    info!(
                        "Orchestrator: session {} started by '{}' ended by {}",
                        video.epoch, video.trigger_code, video.reason
                    );
                    self.pipeline.indicate(video.outcome);
                }
            }
        }
    }

    async fn on_reading(&self, event: ReaderEvent) {
        let reading = match event {
            ReaderEvent::Valid(reading) => reading,
            ReaderEvent::Invalid(reading) => {
                warn!("Orchestrator: rejected '{}'", reading.code);
                self.pipeline.led.indicate_failure(self.reading_flash_ms, 1);
                return;
            }
        };
        let code = reading.code;
        self.pipeline.led.indicate_success(self.reading_flash_ms, 1);

        // Must be evaluated before the scan can change the session
        let should_show = self.recording.should_show_barcode(&code).await;
        let video = if self.recording_enabled {
            self.recording
                .on_barcode_scan(&code)
                .await
                .and_then(|reply| reply.video)
        } else {
            None
        };
        debug!("Orchestrator: '{}' shown: {}", code, should_show);

        let pipeline = self.pipeline.clone();
        tokio::spawn(async move { pipeline.process(code, should_show, video).await });
    }
}

impl Pipeline {
    async fn process(
        &self,
        code: String,
        should_show: bool,
        video: Option<oneshot::Receiver<Option<bool>>>,
    ) {
        if should_show {
            if let Some(widget) = &self.widget {
                if let Err(e) = widget.display(&code, self.visibility).await {
                    warn!("Orchestrator: cannot display '{}': {}", code, e);
                }
            }
        }

        self.notifier.notify(&code).await;

        let images = async {
            if should_show && self.dispatcher.has_enabled(OutputType::Image) {
                self.upload_images(&code).await
            } else {
                None
            }
        };
        let video = async {
            match video {
                Some(rx) => rx.await.unwrap_or_else(|_| {
                    warn!("Orchestrator: video outcome of '{}' lost", code);
                    Some(false)
                }),
                None => None,
            }
        };
        let (images, video) = tokio::join!(images, video);

        let overall = outcome::combine(images, video);
        debug!(
            "Orchestrator: '{}' images {:?} video {:?} -> {:?}",
            code, images, video, overall
        );
        self.indicate(overall);
    }

    /// Capture one image per source and upload the ones that succeeded.
    ///
    /// `None` when every destination was busy and nothing was uploaded.
    async fn upload_images(&self, code: &str) -> Option<bool> {
        let at = self.clock.now();
        let resolution = self.images.resolution.as_deref();
        let captures = join_all(self.images.source_list.iter().map(|&source| async move {
            (source, self.camera.get_image(source, resolution).await)
        }))
        .await;

        let mut payloads = Vec::new();
        for (source, capture) in captures {
            match capture {
                Ok(data) => payloads.push(ImagePayload {
                    source,
                    name: upload_name(code, at, source, OutputType::Image),
                    data,
                }),
                Err(e) => warn!("Orchestrator: no image from source {}: {}", source, e),
            }
        }
        if payloads.is_empty() {
            warn!("Orchestrator: no image captured for '{}'", code);
            return Some(false);
        }

        self.dispatcher.dispatch_images(&payloads).await.aggregate()
    }

    fn indicate(&self, outcome: Option<bool>) {
        match outcome {
            Some(true) => self
                .led
                .indicate_success(self.flash_duration_ms, self.repeat_count),
            Some(false) => self
                .led
                .indicate_failure(self.flash_duration_ms, self.repeat_count),
            None => {}
        }
    }
}
