//! Recording actor.
//!
//! Owns the [`RecordingScheduler`] and everything with a timer attached to
//! it. All access goes through a [`RecordingHandle`], so the session is only
//! ever touched from this task.
//!
//! ```text
//!  Orchestrator ──ShouldShow/Scan──► RecordingController ──spawn──► post-roll task
//!       ▲                              ▲      │                         │
//!       │                 TimeoutFired │      │ arm hard timeout        │ retrieve video
//!       │                              └──────┘                         │ dispatch
//!       └──── video outcome (oneshot, or FinalizedVideo on timeout) ◄───┘
//! ```
//!
//! Timer tasks report back with the epoch they were armed for. A stop code
//! aborts the hard-timeout task; if it already fired, the epoch check in the
//! scheduler drops the late message.

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_graceful_shutdown::SubsystemHandle;

use checkpoint_core::{
    Finalize, FinalizeReason, RecordingScheduler, ScanDecision, SchedulerConfig, SessionState,
};

use crate::clock::{to_datetime, Clock};
use crate::config::OutputType;
use crate::destination::upload_name;
use crate::device::{ByteStream, CameraDevice};
use crate::dispatcher::{Reopen, UploadDispatcher, VideoPayload};
use crate::error::CheckpointError;

const COMMAND_QUEUE: usize = 32;

/// Video outcome of a session that ended without a scan to answer
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedVideo {
    pub epoch: u64,
    pub reason: FinalizeReason,
    pub trigger_code: String,
    pub outcome: Option<bool>,
}

#[derive(Debug)]
pub struct ScanReply {
    pub decision: ScanDecision,
    /// Resolves with the video outcome once a stopped session is uploaded
    pub video: Option<oneshot::Receiver<Option<bool>>>,
}

#[derive(Debug)]
enum RecordingCommand {
    ShouldShow {
        code: String,
        reply: oneshot::Sender<bool>,
    },
    Scan {
        code: String,
        reply: oneshot::Sender<ScanReply>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
    TimeoutFired {
        epoch: u64,
    },
    PostRollComplete {
        epoch: u64,
    },
}

#[derive(Clone, Debug)]
pub struct RecordingHandle {
    tx: mpsc::Sender<RecordingCommand>,
}

impl RecordingHandle {
    /// Pure check, never changes the session. Shows the code if the actor
    /// is gone.
    pub async fn should_show_barcode(&self, code: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = RecordingCommand::ShouldShow {
            code: code.to_string(),
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    pub async fn on_barcode_scan(&self, code: &str) -> Option<ScanReply> {
        let (reply, rx) = oneshot::channel();
        let command = RecordingCommand::Scan {
            code: code.to_string(),
            reply,
        };
        self.tx.send(command).await.ok()?;
        rx.await.ok()
    }

    pub async fn state(&self) -> Option<SessionState> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RecordingCommand::State { reply }).await.ok()?;
        rx.await.ok()
    }
}

pub struct RecordingController {
    scheduler: RecordingScheduler,
    clock: Clock,
    camera: Arc<dyn CameraDevice>,
    dispatcher: Arc<UploadDispatcher>,
    rx: mpsc::Receiver<RecordingCommand>,
    tx: mpsc::Sender<RecordingCommand>,
    finalized_tx: mpsc::UnboundedSender<FinalizedVideo>,
    hard_timeout: Option<JoinHandle<()>>,
}

impl RecordingController {
    pub fn new(
        config: SchedulerConfig,
        camera: Arc<dyn CameraDevice>,
        dispatcher: Arc<UploadDispatcher>,
        finalized_tx: mpsc::UnboundedSender<FinalizedVideo>,
    ) -> Result<(RecordingHandle, RecordingController), CheckpointError> {
        let scheduler = RecordingScheduler::new(config)?;
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let controller = RecordingController {
            scheduler,
            clock: Clock::new(),
            camera,
            dispatcher,
            rx,
            tx: tx.clone(),
            finalized_tx,
            hard_timeout: None,
        };
        Ok((RecordingHandle { tx }, controller))
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), CheckpointError> {
        let config = self.scheduler.config();
        info!(
            "Recording: start {:?} stop {:?} timeout {}s sources {:?}",
            config.start_code(),
            config.stop_code(),
            config.timeout_sec,
            config.source_list
        );
        self.serve(subsys.on_shutdown_requested()).await;
        Ok(())
    }

    pub async fn serve(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Recording: shutdown requested");
                    break;
                }
                Some(command) = self.rx.recv() => self.handle(command),
            }
        }
        if let Some(timer) = self.hard_timeout.take() {
            timer.abort();
        }
        if self.scheduler.state() == SessionState::Recording {
            warn!(
                "Recording: session {} still active at shutdown, video is not uploaded",
                self.scheduler.session().epoch
            );
        }
    }

    fn handle(&mut self, command: RecordingCommand) {
        let now = self.clock.now_ms();
        match command {
            RecordingCommand::ShouldShow { code, reply } => {
                let _ = reply.send(self.scheduler.should_show_barcode(&code, now));
            }
            RecordingCommand::State { reply } => {
                let _ = reply.send(self.scheduler.state());
            }
            RecordingCommand::Scan { code, reply } => {
                let decision = self.scheduler.on_barcode_scan(&code, now);
                let video = match &decision {
                    ScanDecision::Ignored => {
                        debug!("Recording: ignoring accidental repeat of '{}'", code);
                        None
                    }
                    ScanDecision::NoChange => None,
                    ScanDecision::Started { epoch, timeout_ms } => {
                        info!("Recording: session {} started by '{}'", epoch, code);
                        self.arm_hard_timeout(*epoch, *timeout_ms);
                        None
                    }
                    ScanDecision::Stopped(finalize) => {
                        info!(
                            "Recording: session {} stopped by '{}' after {} ms",
                            finalize.epoch,
                            code,
                            finalize.stopped_at_ms - finalize.started_at_ms
                        );
                        if let Some(timer) = self.hard_timeout.take() {
                            timer.abort();
                        }
                        let (video_tx, video_rx) = oneshot::channel();
                        self.post_roll(finalize.clone(), Some(video_tx));
                        Some(video_rx)
                    }
                };
                let _ = reply.send(ScanReply { decision, video });
            }
            RecordingCommand::TimeoutFired { epoch } => {
                match self.scheduler.on_timeout(epoch, now) {
                    Some(finalize) => {
                        info!("Recording: {}", CheckpointError::SessionTimeout(epoch));
                        self.hard_timeout = None;
                        self.post_roll(finalize, None);
                    }
                    None => debug!("Recording: stale timeout for session {}", epoch),
                }
            }
            RecordingCommand::PostRollComplete { epoch } => {
                if self.scheduler.on_post_roll_complete(epoch) {
                    debug!("Recording: session {} cleared", epoch);
                }
            }
        }
    }

    fn arm_hard_timeout(&mut self, epoch: u64, timeout_ms: u64) {
        if let Some(timer) = self.hard_timeout.take() {
            timer.abort();
        }
        let tx = self.tx.clone();
        self.hard_timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let _ = tx.send(RecordingCommand::TimeoutFired { epoch }).await;
        }));
    }

    fn post_roll(&self, finalize: Finalize, reply: Option<oneshot::Sender<Option<bool>>>) {
        let post_roll = PostRoll {
            finalize,
            clock: self.clock,
            camera: self.camera.clone(),
            dispatcher: self.dispatcher.clone(),
        };
        let tx = self.tx.clone();
        let finalized_tx = self.finalized_tx.clone();
        tokio::spawn(async move {
            let epoch = post_roll.finalize.epoch;
            let reason = post_roll.finalize.reason;
            let trigger_code = post_roll.finalize.trigger_code.clone();

            tokio::time::sleep(Duration::from_millis(post_roll.finalize.post_roll_ms)).await;
            let (videos, retrieval_failed) = post_roll.retrieve().await;
            let _ = tx.send(RecordingCommand::PostRollComplete { epoch }).await;

            let outcome = post_roll.upload(videos, retrieval_failed).await;
            match reply {
                Some(reply) => {
                    if reply.send(outcome).is_err() {
                        debug!("Recording: nobody waits for session {} outcome", epoch);
                    }
                }
                None => {
                    let video = FinalizedVideo {
                        epoch,
                        reason,
                        trigger_code,
                        outcome,
                    };
                    if finalized_tx.send(video).is_err() {
                        error!("Recording: cannot report outcome of session {}", epoch);
                    }
                }
            }
        });
    }
}

/// Video retrieval and upload of one finalized session
struct PostRoll {
    finalize: Finalize,
    clock: Clock,
    camera: Arc<dyn CameraDevice>,
    dispatcher: Arc<UploadDispatcher>,
}

impl PostRoll {
    /// Open the recording of every source. Sources without an active
    /// recording are skipped; the flag reports any other failure.
    async fn retrieve(&self) -> (Vec<VideoPayload>, bool) {
        let (start_ms, end_ms) = self.finalize.window(self.clock.now_ms());
        let (start, end) = (to_datetime(start_ms), to_datetime(end_ms));
        let started = to_datetime(self.finalize.started_at_ms);

        let mut videos = Vec::new();
        let mut failed = false;
        for &source in &self.finalize.sources {
            match self.camera.get_recording_stream(source, start, end).await {
                Ok(stream) => {
                    let camera = self.camera.clone();
                    let reopen: Reopen = Arc::new(
                        move || -> BoxFuture<'static, Result<ByteStream, CheckpointError>> {
                            let camera = camera.clone();
                            Box::pin(async move {
                                camera.get_recording_stream(source, start, end).await
                            })
                        },
                    );
                    videos.push(VideoPayload {
                        source,
                        name: upload_name(
                            &self.finalize.trigger_code,
                            started,
                            source,
                            OutputType::Video,
                        ),
                        stream,
                        reopen,
                    });
                }
                Err(e) if e.is_not_found() => {
                    info!("Recording: source {} skipped: {}", source, e);
                }
                Err(e) => {
                    warn!("Recording: cannot retrieve video of source {}: {}", source, e);
                    failed = true;
                }
            }
        }
        (videos, failed)
    }

    async fn upload(&self, videos: Vec<VideoPayload>, retrieval_failed: bool) -> Option<bool> {
        let epoch = self.finalize.epoch;
        if videos.is_empty() {
            if retrieval_failed {
                return Some(false);
            }
            info!("Recording: session {} has no recorded source, nothing to upload", epoch);
            return None;
        }
        let report = self.dispatcher.dispatch_video(videos).await;
        let outcome = report.aggregate().map(|ok| ok && !retrieval_failed);
        info!("Recording: session {} video outcome {:?}", epoch, outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DestinationEntry;
    use crate::testing::{MockCamera, MockDestination};
    use checkpoint_core::RetryPolicy;
    use tokio::time::{sleep, Instant};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        handle: RecordingHandle,
        finalized: mpsc::UnboundedReceiver<FinalizedVideo>,
        camera: Arc<MockCamera>,
        destination: Arc<MockDestination>,
        shutdown: CancellationToken,
    }

    fn config(start: Option<&str>, stop: Option<&str>, timeout: u64, post: u64) -> SchedulerConfig {
        SchedulerConfig {
            start_code: start.map(str::to_string),
            stop_code: stop.map(str::to_string),
            timeout_sec: timeout,
            prebuffer_sec: 5,
            postbuffer_sec: post,
            source_list: vec![1],
        }
    }

    fn start(config: SchedulerConfig, camera: MockCamera) -> Fixture {
        let camera = Arc::new(camera);
        let destination = Arc::new(MockDestination::new("ftp"));
        let dispatcher = Arc::new(UploadDispatcher::new(vec![DestinationEntry::new(
            destination.clone(),
            OutputType::Video,
            RetryPolicy::default(),
        )]));
        let (finalized_tx, finalized) = mpsc::unbounded_channel();
        let (handle, controller) =
            RecordingController::new(config, camera.clone(), dispatcher, finalized_tx).unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(controller.serve(shutdown.clone().cancelled_owned()));
        Fixture {
            handle,
            finalized,
            camera,
            destination,
            shutdown,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_timeout_finalizes_once() {
        let camera = MockCamera::new().with_recording(1, &[b"mkv"]);
        let mut f = start(config(Some("START1"), Some("STOP1"), 5, 2), camera);
        let t0 = Instant::now();

        let reply = f.handle.on_barcode_scan("START1").await.unwrap();
        assert_eq!(
            reply.decision,
            ScanDecision::Started {
                epoch: 1,
                timeout_ms: 7000
            }
        );

        sleep(Duration::from_millis(6999)).await;
        assert_eq!(f.handle.state().await, Some(SessionState::Recording));
        sleep(Duration::from_millis(2)).await;
        assert_eq!(f.handle.state().await, Some(SessionState::Idle));

        let finalized = f.finalized.recv().await.unwrap();
        assert_eq!(finalized.epoch, 1);
        assert_eq!(finalized.reason, FinalizeReason::Timeout);
        assert_eq!(finalized.trigger_code, "START1");
        assert_eq!(finalized.outcome, Some(true));

        // Post-roll of 2s after the timeout at 7s
        let requests = f.camera.recording_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].at - t0, Duration::from_secs(9));
        assert_eq!((requests[0].end - requests[0].start).num_seconds(), 14);

        sleep(Duration::from_secs(60)).await;
        assert!(f.finalized.try_recv().is_err());
        assert_eq!(f.camera.recording_requests().len(), 1);
        f.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_timeout_cancels_timer() {
        let camera = MockCamera::new().with_recording(1, &[b"mkv"]);
        let mut f = start(config(Some("START1"), Some("STOP1"), 5, 2), camera);

        f.handle.on_barcode_scan("START1").await.unwrap();
        sleep(Duration::from_millis(6500)).await;
        let reply = f.handle.on_barcode_scan("STOP1").await.unwrap();
        assert!(matches!(reply.decision, ScanDecision::Stopped(_)));
        assert_eq!(reply.video.unwrap().await.unwrap(), Some(true));

        sleep(Duration::from_secs(30)).await;
        assert!(f.finalized.try_recv().is_err());
        assert_eq!(f.camera.recording_requests().len(), 1);
        assert_eq!(f.destination.uploads().len(), 1);
        f.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_code_flow() {
        let camera = MockCamera::new().with_recording(1, &[b"part1", b"part2"]);
        let f = start(config(Some("START1"), Some("STOP1"), 30, 5), camera);
        let t0 = Instant::now();

        assert!(!f.handle.should_show_barcode("START1").await);
        f.handle.on_barcode_scan("START1").await.unwrap();
        assert!(f.handle.should_show_barcode("123456").await);

        sleep(Duration::from_secs(10)).await;
        let reply = f.handle.on_barcode_scan("STOP1").await.unwrap();
        let Some(video) = reply.video else {
            panic!("stop must return a video outcome");
        };
        assert_eq!(video.await.unwrap(), Some(true));

        let requests = f.camera.recording_requests();
        assert_eq!(requests[0].at - t0, Duration::from_secs(15));
        // 5s pre-buffer, 10s session, 5s post-buffer
        assert_eq!((requests[0].end - requests[0].start).num_seconds(), 20);

        let uploads = f.destination.uploads();
        assert_eq!(uploads[0].data, b"part1part2");
        assert!(uploads[0].name.starts_with("START1_"));
        assert!(uploads[0].name.ends_with("_src1.mkv"));
        assert_eq!(f.handle.state().await, Some(SessionState::Idle));
        f.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_without_control_codes() {
        let camera = MockCamera::new().with_recording(1, &[b"v"]);
        let f = start(config(None, None, 60, 1), camera);

        // Same code starts, then stops after the accidental-read window
        let reply = f.handle.on_barcode_scan("A").await.unwrap();
        assert!(matches!(reply.decision, ScanDecision::Started { .. }));
        sleep(Duration::from_secs(1)).await;
        let reply = f.handle.on_barcode_scan("A").await.unwrap();
        assert_eq!(reply.decision, ScanDecision::Ignored);
        sleep(Duration::from_secs(3)).await;
        let reply = f.handle.on_barcode_scan("A").await.unwrap();
        assert!(matches!(reply.decision, ScanDecision::Stopped(_)));
        assert_eq!(reply.video.unwrap().await.unwrap(), Some(true));

        // A different code stops the next session
        let reply = f.handle.on_barcode_scan("B").await.unwrap();
        assert!(matches!(reply.decision, ScanDecision::Started { .. }));
        sleep(Duration::from_secs(1)).await;
        let reply = f.handle.on_barcode_scan("C").await.unwrap();
        match reply.decision {
            ScanDecision::Stopped(finalize) => assert_eq!(finalize.trigger_code, "B"),
            other => panic!("expected stop, got {:?}", other),
        }
        f.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_sources_are_skipped() {
        let camera = MockCamera::new().with_recording(2, &[b"two"]);
        let mut cfg = config(Some("S"), Some("E"), 30, 1);
        cfg.source_list = vec![1, 2, 3];
        let f = start(cfg, camera);

        f.handle.on_barcode_scan("S").await.unwrap();
        sleep(Duration::from_secs(5)).await;
        let reply = f.handle.on_barcode_scan("E").await.unwrap();

        assert_eq!(reply.video.unwrap().await.unwrap(), Some(true));
        assert_eq!(f.camera.recording_requests().len(), 3);
        let uploads = f.destination.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].name.ends_with("_src2.mkv"));
        f.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_recording_is_nothing_to_upload() {
        let f = start(config(Some("S"), Some("E"), 30, 1), MockCamera::new());

        f.handle.on_barcode_scan("S").await.unwrap();
        sleep(Duration::from_secs(5)).await;
        let reply = f.handle.on_barcode_scan("E").await.unwrap();

        assert_eq!(reply.video.unwrap().await.unwrap(), None);
        assert!(f.destination.uploads().is_empty());
        f.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_camera_fails_video() {
        let f = start(
            config(Some("S"), Some("E"), 30, 1),
            MockCamera::new().unavailable(),
        );

        f.handle.on_barcode_scan("S").await.unwrap();
        sleep(Duration::from_secs(5)).await;
        let reply = f.handle.on_barcode_scan("E").await.unwrap();

        assert_eq!(reply.video.unwrap().await.unwrap(), Some(false));
        f.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_show_is_pure() {
        let f = start(config(Some("START1"), Some("STOP1"), 30, 1), MockCamera::new());

        for _ in 0..2 {
            assert!(f.handle.should_show_barcode("X").await);
            assert!(!f.handle.should_show_barcode("STOP1").await);
        }
        assert_eq!(f.handle.state().await, Some(SessionState::Idle));
        f.shutdown.cancel();
    }
}
