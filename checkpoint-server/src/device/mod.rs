//! Device capabilities the checkpoint drives.
//!
//! The orchestration code only sees these traits. [`vapix`] implements them
//! against the camera's HTTP API; tests use the mocks in `crate::testing`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::CheckpointError;

pub mod vapix;

pub use vapix::{VapixCamera, VapixOverlay};

/// A chunked byte stream, as returned by recording export
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Single JPEG snapshot from `source`
    async fn get_image(
        &self,
        source: u32,
        resolution: Option<&str>,
    ) -> Result<Bytes, CheckpointError>;

    /// Export of the ongoing recording on `source` between `start` and `end`.
    ///
    /// Returns [`CheckpointError::NotFound`] if the source has no active
    /// recording.
    async fn get_recording_stream(
        &self,
        source: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ByteStream, CheckpointError>;
}

/// On-screen overlay of the scanned code
#[async_trait]
pub trait Widget: Send + Sync {
    /// Show `code`, and remove it again after `visibility`
    async fn display(&self, code: &str, visibility: Duration) -> Result<(), CheckpointError>;
}

/// Binary output port, used for the LEDs
#[async_trait]
pub trait IoPort: Send + Sync {
    async fn set_state(&self, port: u32, active: bool) -> Result<(), CheckpointError>;
}
