use thiserror::Error;

use checkpoint_core::ConfigError;

/// Errors raised at the component boundaries of the checkpoint.
///
/// None of these cross into the orchestrator: every component converts them
/// into a logged boolean outcome. Only a configuration failure at startup is
/// fatal.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Code '{0}' does not match the validation pattern")]
    DecodeRejected(String),
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Upload to '{destination}' failed after {attempts} attempt(s): {reason}")]
    UploadFailed {
        destination: String,
        attempts: u32,
        reason: String,
    },
    #[error("Notification to '{target}' failed: {reason}")]
    NotifyFailed { target: String, reason: String },
    #[error("Recording session {0} reached its timeout")]
    SessionTimeout(u64),
    #[error("Destination '{0}' is busy with a previous batch")]
    Busy(String),
    #[error("Timeout")]
    Timeout,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("FTP {command} answered {code} {text}")]
    FtpReply {
        command: String,
        code: u16,
        text: String,
    },
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O operation failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Cannot parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Shutdown")]
    Shutdown,
}

impl CheckpointError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CheckpointError::NotFound(_))
    }
}
