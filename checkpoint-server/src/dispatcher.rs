//! Upload fan-out.
//!
//! The dispatcher owns the homogeneous list of configured destinations. A
//! dispatch call uploads one payload class (images or video) to every
//! enabled destination of that class concurrently, each under its own
//! [`RetryPolicy`], and reports one outcome per destination.
//!
//! ```text
//!                       ┌──► branch ──► retry_with_timeout ──► dest A
//!  camera stream ─ pump ┼──► branch ──► retry_with_timeout ──► dest B
//!                       └──► branch ──► retry_with_timeout ──► dest C
//! ```
//!
//! Video is teed: every destination reads its own bounded branch of the
//! source stream. The source is read at the pace of the fastest branch; a
//! branch that falls [`TEE_WINDOW`] chunks behind is cut off with an error,
//! so a slow consumer neither stalls the others nor buffers the export.
//! Retries after the first attempt re-open the recording from the camera.
//!
//! Destinations flagged `exclusive` accept one batch at a time. A dispatch
//! that finds one of them still uploading skips it and reports it as
//! [`DestinationOutcome::Busy`].

use bytes::Bytes;
use futures::future::{join_all, select_all, BoxFuture};
use futures::{stream, StreamExt};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use checkpoint_core::RetryPolicy;

use crate::config::{DestinationConfig, OutputType};
use crate::destination::{build_destination, StorageDestination, UploadBody};
use crate::device::ByteStream;
use crate::error::CheckpointError;
use crate::retry::retry_with_timeout;

/// Re-opens a video stream for a retry
pub type Reopen =
    Arc<dyn Fn() -> BoxFuture<'static, Result<ByteStream, CheckpointError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub source: u32,
    pub name: String,
    pub data: Bytes,
}

pub struct VideoPayload {
    pub source: u32,
    pub name: String,
    pub stream: ByteStream,
    pub reopen: Reopen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationOutcome {
    Succeeded,
    Failed,
    /// Skipped, a previous batch was still uploading
    Busy,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<(String, DestinationOutcome)>,
}

impl DispatchReport {
    /// AND over every destination that took part. `None` if none did.
    pub fn aggregate(&self) -> Option<bool> {
        let mut participating = self
            .outcomes
            .iter()
            .filter(|(_, o)| *o != DestinationOutcome::Busy)
            .peekable();
        participating.peek()?;
        Some(participating.all(|(_, o)| *o == DestinationOutcome::Succeeded))
    }

    pub fn outcome(&self, id: &str) -> Option<DestinationOutcome> {
        self.outcomes
            .iter()
            .find(|(d, _)| d == id)
            .map(|(_, o)| *o)
    }
}

/// One configured destination and its dispatch state
pub struct DestinationEntry {
    destination: Arc<dyn StorageDestination>,
    enabled: bool,
    output: OutputType,
    policy: RetryPolicy,
    exclusive: bool,
    busy: AtomicBool,
}

impl DestinationEntry {
    pub fn new(
        destination: Arc<dyn StorageDestination>,
        output: OutputType,
        policy: RetryPolicy,
    ) -> Self {
        DestinationEntry {
            destination,
            enabled: true,
            output,
            policy,
            exclusive: false,
            busy: AtomicBool::new(false),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn id(&self) -> &str {
        self.destination.id()
    }

    fn accepts(&self, output: OutputType) -> bool {
        self.enabled && self.output == output
    }

    /// Claim the destination for one batch. Non-exclusive destinations are
    /// always available.
    fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        if !self.exclusive {
            return Some(BusyGuard { flag: None });
        }
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard {
                flag: Some(&self.busy),
            })
    }
}

struct BusyGuard<'a> {
    flag: Option<&'a AtomicBool>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if let Some(flag) = self.flag {
            flag.store(false, Ordering::Release);
        }
    }
}

pub struct UploadDispatcher {
    entries: Vec<DestinationEntry>,
}

impl UploadDispatcher {
    pub fn new(entries: Vec<DestinationEntry>) -> Self {
        UploadDispatcher { entries }
    }

    pub fn from_config(configs: &[DestinationConfig]) -> Result<Self, CheckpointError> {
        let entries = configs
            .iter()
            .map(|c| {
                Ok(DestinationEntry::new(build_destination(c)?, c.output, c.retry_policy())
                    .enabled(c.enabled)
                    .exclusive(c.is_exclusive()))
            })
            .collect::<Result<Vec<_>, CheckpointError>>()?;
        Ok(UploadDispatcher::new(entries))
    }

    pub fn has_enabled(&self, output: OutputType) -> bool {
        self.entries.iter().any(|e| e.accepts(output))
    }

    /// Upload every image to every enabled image destination.
    pub async fn dispatch_images(&self, images: &[ImagePayload]) -> DispatchReport {
        let uploads = self
            .entries
            .iter()
            .filter(|e| e.accepts(OutputType::Image))
            .map(|entry| async move {
                let Some(_guard) = entry.try_acquire() else {
                    let busy = CheckpointError::Busy(entry.id().to_string());
                    warn!("{}, skipping {} image(s)", busy, images.len());
                    return (entry.id().to_string(), DestinationOutcome::Busy);
                };
                let results = join_all(images.iter().map(|image| {
                    let destination = entry.destination.clone();
                    retry_with_timeout(entry.id(), &entry.policy, move |_| {
                        let destination = destination.clone();
                        let name = image.name.clone();
                        let body = UploadBody::Bytes(image.data.clone());
                        async move { destination.upload(&name, body).await }
                    })
                }))
                .await;
                let names = images.iter().map(|i| i.name.as_str());
                (entry.id().to_string(), settle(entry.id(), names, results))
            });

        DispatchReport {
            outcomes: join_all(uploads).await,
        }
    }

    /// Upload every video stream to every enabled video destination.
    pub async fn dispatch_video(&self, videos: Vec<VideoPayload>) -> DispatchReport {
        let mut outcomes = Vec::new();
        let mut claimed = Vec::new();
        for entry in self.entries.iter().filter(|e| e.accepts(OutputType::Video)) {
            match entry.try_acquire() {
                Some(guard) => claimed.push((entry, guard)),
                None => {
                    let busy = CheckpointError::Busy(entry.id().to_string());
                    warn!("{}, skipping {} video(s)", busy, videos.len());
                    outcomes.push((entry.id().to_string(), DestinationOutcome::Busy));
                }
            }
        }
        if claimed.is_empty() {
            return DispatchReport { outcomes };
        }

        // branches[d][v] is the branch of video v for claimed destination d
        let mut branches: Vec<Vec<Option<ByteStream>>> =
            (0..claimed.len()).map(|_| Vec::new()).collect();
        let mut sources = Vec::new();
        for video in videos {
            for (d, branch) in tee(video.stream, claimed.len()).into_iter().enumerate() {
                branches[d].push(Some(branch));
            }
            sources.push((video.source, video.name, video.reopen));
        }

        let sources = &sources;
        let uploads = claimed
            .iter()
            .zip(branches)
            .map(|((entry, _guard), branches)| async move {
                let results = join_all(sources.iter().zip(branches).map(
                    |((source, name, reopen), branch)| {
                        upload_video(entry, *source, name, reopen.clone(), branch)
                    },
                ))
                .await;
                let names = sources.iter().map(|(_, name, _)| name.as_str());
                (entry.id().to_string(), settle(entry.id(), names, results))
            });
        outcomes.extend(join_all(uploads).await);

        DispatchReport { outcomes }
    }
}

async fn upload_video(
    entry: &DestinationEntry,
    source: u32,
    name: &str,
    reopen: Reopen,
    branch: Option<ByteStream>,
) -> Result<(), CheckpointError> {
    let mut first = branch;
    retry_with_timeout(entry.id(), &entry.policy, |attempt| {
        let destination = entry.destination.clone();
        let name = name.to_string();
        let reopen = reopen.clone();
        let stream = first.take();
        async move {
            let stream = match stream {
                Some(stream) => stream,
                None => {
                    debug!("Re-opening source {} for attempt {}", source, attempt);
                    reopen().await?
                }
            };
            destination.upload(&name, UploadBody::Stream(stream)).await
        }
    })
    .await
}

fn settle<'a>(
    id: &str,
    names: impl Iterator<Item = &'a str>,
    results: Vec<Result<(), CheckpointError>>,
) -> DestinationOutcome {
    let mut outcome = DestinationOutcome::Succeeded;
    for (name, result) in names.zip(results) {
        match result {
            Ok(()) => info!("{}: uploaded {}", id, name),
            Err(e) => {
                warn!("{}: giving up on {}: {}", id, name, e);
                outcome = DestinationOutcome::Failed;
            }
        }
    }
    outcome
}

/// Chunks a video branch may lag behind the fastest branch
pub const TEE_WINDOW: usize = 64;

type Chunk = Result<Bytes, std::io::Error>;

struct Branch {
    tx: mpsc::Sender<Chunk>,
    lagged: Arc<AtomicBool>,
}

/// Split `stream` into `count` independent branches.
///
/// A pump task forwards every chunk to every branch that is still open; a
/// source error is forwarded to all branches and ends the pump.
fn tee(stream: ByteStream, count: usize) -> Vec<ByteStream> {
    if count == 1 {
        return vec![stream];
    }
    let mut branches = Vec::with_capacity(count);
    let mut outputs = Vec::with_capacity(count);
    for _ in 0..count {
        let (tx, rx) = mpsc::channel(TEE_WINDOW);
        let lagged = Arc::new(AtomicBool::new(false));
        outputs.push(branch_stream(rx, lagged.clone()));
        branches.push(Branch { tx, lagged });
    }
    tokio::spawn(pump(stream, branches));
    outputs
}

/// Receiving side of a branch; ends with an error if it was cut off
fn branch_stream(rx: mpsc::Receiver<Chunk>, lagged: Arc<AtomicBool>) -> ByteStream {
    stream::unfold((rx, lagged), |(mut rx, lagged)| async move {
        match rx.recv().await {
            Some(item) => Some((item, (rx, lagged))),
            None if lagged.swap(false, Ordering::SeqCst) => {
                let error = std::io::Error::other("fell behind the other destinations");
                Some((Err(error), (rx, lagged)))
            }
            None => None,
        }
    })
    .boxed()
}

async fn pump(mut stream: ByteStream, mut branches: Vec<Branch>) {
    while let Some(item) = stream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                for branch in &branches {
                    let error = std::io::Error::new(e.kind(), e.to_string());
                    if branch.tx.try_send(Err(error)).is_err() {
                        branch.lagged.store(true, Ordering::SeqCst);
                    }
                }
                return;
            }
        };

        // Wait for room in the fastest branch
        let fastest = loop {
            if branches.is_empty() {
                return;
            }
            let reserved = {
                let reserves = branches.iter().map(|b| Box::pin(b.tx.reserve()));
                match select_all(reserves).await {
                    (Ok(permit), index, _) => {
                        permit.send(Ok(chunk.clone()));
                        Ok(index)
                    }
                    (Err(_), index, _) => Err(index),
                }
            };
            match reserved {
                Ok(index) => break index,
                Err(index) => {
                    branches.swap_remove(index);
                }
            }
        };

        // Every other branch takes the chunk now or is cut off
        branches = branches
            .into_iter()
            .enumerate()
            .filter_map(|(index, branch)| {
                if index == fastest {
                    return Some(branch);
                }
                match branch.tx.try_send(Ok(chunk.clone())) {
                    Ok(()) => Some(branch),
                    Err(TrySendError::Full(_)) => {
                        warn!("Video branch fell {} chunks behind, cutting it off", TEE_WINDOW);
                        branch.lagged.store(true, Ordering::SeqCst);
                        None
                    }
                    Err(TrySendError::Closed(_)) => None,
                }
            })
            .collect();
    }
}
