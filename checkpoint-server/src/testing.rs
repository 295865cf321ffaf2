//! In-memory devices, destinations and targets for tests.
//!
//! Every mock records what it was asked to do together with the
//! `tokio::time::Instant` of the call, so tests running on paused time can
//! assert on ordering and timing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::destination::{StorageDestination, UploadBody};
use crate::device::{ByteStream, CameraDevice, IoPort, Widget};
use crate::error::CheckpointError;
use crate::notifier::EventTarget;

#[derive(Debug, Clone)]
pub struct RecordingRequest {
    pub source: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub at: Instant,
}

#[derive(Default)]
pub struct MockCamera {
    recordings: HashMap<u32, Vec<Bytes>>,
    failing_images: HashSet<u32>,
    unavailable: bool,
    pub image_requests: Mutex<Vec<(u32, Instant)>>,
    pub recording_requests: Mutex<Vec<RecordingRequest>>,
}

impl MockCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source `source` has an ongoing recording that exports as `chunks`
    pub fn with_recording(mut self, source: u32, chunks: &[&'static [u8]]) -> Self {
        self.recordings.insert(
            source,
            chunks.iter().map(|c| Bytes::from_static(*c)).collect(),
        );
        self
    }

    pub fn with_failing_image(mut self, source: u32) -> Self {
        self.failing_images.insert(source);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn recording_requests(&self) -> Vec<RecordingRequest> {
        self.recording_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CameraDevice for MockCamera {
    async fn get_image(
        &self,
        source: u32,
        _resolution: Option<&str>,
    ) -> Result<Bytes, CheckpointError> {
        self.image_requests
            .lock()
            .unwrap()
            .push((source, Instant::now()));
        if self.unavailable || self.failing_images.contains(&source) {
            return Err(CheckpointError::DeviceUnavailable("mock camera".to_string()));
        }
        Ok(Bytes::from(format!("jpeg-{}", source)))
    }

    async fn get_recording_stream(
        &self,
        source: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ByteStream, CheckpointError> {
        self.recording_requests
            .lock()
            .unwrap()
            .push(RecordingRequest {
                source,
                start,
                end,
                at: Instant::now(),
            });
        if self.unavailable {
            return Err(CheckpointError::DeviceUnavailable("mock camera".to_string()));
        }
        match self.recordings.get(&source) {
            Some(chunks) => {
                let chunks = chunks.clone().into_iter().map(Ok::<Bytes, std::io::Error>);
                Ok(stream::iter(chunks).boxed())
            }
            None => Err(CheckpointError::NotFound(format!("source {}", source))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub data: Vec<u8>,
    pub at: Instant,
}

/// Destination that fails its first `failures` attempts
pub struct MockDestination {
    id: String,
    failures: u32,
    delay: Duration,
    attempts: AtomicU32,
    pub uploads: Mutex<Vec<Upload>>,
}

impl MockDestination {
    pub fn new(id: &str) -> Self {
        MockDestination {
            id: id.to_string(),
            failures: 0,
            delay: Duration::ZERO,
            attempts: AtomicU32::new(0),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(id: &str) -> Self {
        Self::new(id).with_failures(u32::MAX)
    }

    pub fn with_failures(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    /// Every upload takes `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageDestination for MockDestination {
    fn id(&self) -> &str {
        &self.id
    }

    async fn upload(&self, name: &str, body: UploadBody) -> Result<(), CheckpointError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let data = match body {
            UploadBody::Bytes(b) => b.to_vec(),
            UploadBody::Stream(mut s) => {
                let mut data = Vec::new();
                while let Some(chunk) = s.next().await {
                    data.extend_from_slice(&chunk?);
                }
                data
            }
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if attempt <= self.failures {
            return Err(CheckpointError::HttpStatus {
                status: 503,
                url: format!("mock://{}/{}", self.id, name),
            });
        }
        self.uploads.lock().unwrap().push(Upload {
            name: name.to_string(),
            data,
            at: Instant::now(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MockIoPort {
    failing: bool,
    delay: Duration,
    pub transitions: Mutex<Vec<(u32, bool, Instant)>>,
}

impl MockIoPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        MockIoPort {
            failing: true,
            ..Default::default()
        }
    }

    /// Every port change takes `delay` to return
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn transitions(&self) -> Vec<(u32, bool, Instant)> {
        self.transitions.lock().unwrap().clone()
    }

    /// Transitions of a single port
    pub fn port(&self, port: u32) -> Vec<(bool, Instant)> {
        self.transitions()
            .into_iter()
            .filter(|(p, _, _)| *p == port)
            .map(|(_, active, at)| (active, at))
            .collect()
    }
}

#[async_trait]
impl IoPort for MockIoPort {
    async fn set_state(&self, port: u32, active: bool) -> Result<(), CheckpointError> {
        self.transitions
            .lock()
            .unwrap()
            .push((port, active, Instant::now()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing {
            return Err(CheckpointError::DeviceUnavailable("mock port".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockWidget {
    pub shown: Mutex<Vec<(String, Duration)>>,
}

impl MockWidget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> Vec<String> {
        self.shown
            .lock()
            .unwrap()
            .iter()
            .map(|(code, _)| code.clone())
            .collect()
    }
}

#[async_trait]
impl Widget for MockWidget {
    async fn display(&self, code: &str, visibility: Duration) -> Result<(), CheckpointError> {
        self.shown
            .lock()
            .unwrap()
            .push((code.to_string(), visibility));
        Ok(())
    }
}

pub struct MockTarget {
    id: String,
    failing: bool,
    delay: Duration,
    pub sent: Mutex<Vec<(String, Instant)>>,
}

impl MockTarget {
    pub fn new(id: &str) -> Self {
        MockTarget {
            id: id.to_string(),
            failing: false,
            delay: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(id: &str) -> Self {
        MockTarget {
            failing: true,
            ..Self::new(id)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(code, _)| code.clone())
            .collect()
    }
}

#[async_trait]
impl EventTarget for MockTarget {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, code: &str) -> Result<(), CheckpointError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing {
            return Err(CheckpointError::HttpStatus {
                status: 500,
                url: format!("mock://{}", self.id),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((code.to_string(), Instant::now()));
        Ok(())
    }
}
