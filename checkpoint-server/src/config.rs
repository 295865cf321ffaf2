//! Station configuration.
//!
//! The configuration is a single JSON document, loaded once at startup and
//! handed to the components. Storage destinations and notifier targets are
//! tagged-variant lists, so adding a backend means adding a variant instead
//! of another set of optional fields.
//!
//! ```json
//! {
//!   "camera": { "host": "192.168.0.90", "username": "root", "password": "pass" },
//!   "reader": { "validationPattern": "^[0-9]{6}$" },
//!   "recording": { "startCode": "START1", "stopCode": "STOP1", "timeoutSec": 30,
//!                  "prebufferSec": 5, "postbufferSec": 5, "sourceList": [1] },
//!   "destinations": [
//!     { "id": "nas", "type": "directory", "path": "/mnt/nas", "output": "video" },
//!     { "id": "dav", "type": "http", "url": "https://dav.example/upload", "output": "image",
//!       "numberOfRetries": 3, "uploadTimeoutS": 30 }
//!   ],
//!   "notifiers": [ { "id": "acs", "type": "acs", "url": "https://acs:55756", "source": "Gate 1" } ]
//! }
//! ```

use directories::ProjectDirs;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use checkpoint_core::led::READING_FLASH_MS;
use checkpoint_core::{BarcodeDecoder, RetryPolicy, SchedulerConfig};

use crate::error::CheckpointError;

const CONFIG_FILE: &str = "checkpoint.json";

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "checkpoint", "checkpoint")
}

/// Default location of the configuration file, the working directory if
/// there is no home directory
pub fn default_config_path() -> PathBuf {
    get_project_dirs()
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub camera: CameraConfig,
    pub reader: ReaderConfig,
    pub recording: SchedulerConfig,
    pub images: ImageConfig,
    pub widget: WidgetConfig,
    pub led: LedConfig,
    pub destinations: Vec<DestinationConfig>,
    pub notifiers: Vec<NotifierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CameraConfig {
    pub host: String,
    /// "http" or "https"
    pub scheme: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connection_timeout_s: u64,
    /// Ceiling for snapshot and overlay requests
    pub request_timeout_s: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            host: "127.0.0.1".to_string(),
            scheme: "http".to_string(),
            username: None,
            password: None,
            connection_timeout_s: 5,
            request_timeout_s: 10,
        }
    }
}

impl CameraConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReaderConfig {
    /// Regular expression every code must match; empty accepts all
    pub validation_pattern: String,
    pub terminator_key: String,
    /// Key event source; `None` or "-" reads stdin
    pub input: Option<PathBuf>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            validation_pattern: String::new(),
            terminator_key: checkpoint_core::reader::TERMINATOR_KEY.to_string(),
            input: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageConfig {
    pub source_list: Vec<u32>,
    /// VAPIX resolution, e.g. "1920x1080"; camera default if absent
    pub resolution: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            source_list: vec![1],
            resolution: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WidgetConfig {
    pub enabled: bool,
    pub visibility_sec: u64,
    pub camera: u32,
    pub position: String,
    pub font_size: u32,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        WidgetConfig {
            enabled: true,
            visibility_sec: 5,
            camera: 1,
            position: "topLeft".to_string(),
            font_size: 48,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedConfig {
    pub enabled: bool,
    pub success_port: u32,
    pub failure_port: u32,
    /// Flash length for upload outcomes
    pub flash_duration_ms: u64,
    pub repeat_count: u32,
    /// Flash length for the acknowledgement of a reading
    pub reading_flash_ms: u64,
}

impl Default for LedConfig {
    fn default() -> Self {
        LedConfig {
            enabled: false,
            success_port: 1,
            failure_port: 2,
            flash_duration_ms: 500,
            repeat_count: 2,
            reading_flash_ms: READING_FLASH_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Image,
    Video,
}

impl std::fmt::Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputType::Image => write!(f, "image"),
            OutputType::Video => write!(f, "video"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retries() -> u32 {
    3
}

fn default_upload_timeout() -> u64 {
    30
}

fn default_connection_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub output: OutputType,
    #[serde(flatten)]
    pub kind: DestinationKind,
    #[serde(default = "default_retries")]
    pub number_of_retries: u32,
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_s: u64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_s: u64,
    /// Backend allows a single logical session at a time; FTP by default
    #[serde(default)]
    pub exclusive: Option<bool>,
}

impl DestinationConfig {
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
            .unwrap_or(matches!(self.kind, DestinationKind::Ftp { .. }))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(self.number_of_retries, self.upload_timeout_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DestinationKind {
    /// PUT to `url`/`name`
    Http {
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    /// Passive-mode FTP `STOR` into `directory`
    Ftp {
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        #[serde(default = "default_ftp_user")]
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        directory: Option<String>,
    },
    /// Write into a local or mounted directory
    Directory { path: PathBuf },
}

fn default_ftp_port() -> u16 {
    21
}

fn default_ftp_user() -> String {
    "anonymous".to_string()
}

fn default_notify_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_notify_timeout")]
    pub timeout_s: u64,
    #[serde(flatten)]
    pub kind: NotifierKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NotifierKind {
    /// Axis Camera Station external data
    #[serde(rename_all = "camelCase")]
    Acs {
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        source: String,
    },
    /// Genetec Security Center bookmark through the Web SDK
    #[serde(rename_all = "camelCase")]
    Genetec {
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        camera_guid: String,
    },
    /// Generic JSON POST
    Webhook {
        url: String,
        #[serde(default)]
        token: Option<String>,
    },
}

impl Config {
    /// Load and validate the configuration. Failure here is fatal.
    pub fn load(path: &Path) -> Result<Config, CheckpointError> {
        info!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        for line in config.summary() {
            debug!("Configuration: {}", line);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CheckpointError> {
        BarcodeDecoder::with_terminator(
            &self.reader.validation_pattern,
            &self.reader.terminator_key,
        )?;
        self.recording.validate()?;

        let mut ids = HashSet::new();
        for d in &self.destinations {
            if !ids.insert(d.id.as_str()) {
                return Err(CheckpointError::InvalidConfig(format!(
                    "duplicate destination id '{}'",
                    d.id
                )));
            }
            let missing = match &d.kind {
                DestinationKind::Http { url, .. } => url.is_empty().then_some("url"),
                DestinationKind::Ftp { host, .. } => host.is_empty().then_some("host"),
                DestinationKind::Directory { .. } => None,
            };
            if let Some(field) = missing {
                return Err(CheckpointError::InvalidConfig(format!(
                    "destination '{}' has no {}",
                    d.id, field
                )));
            }
        }

        let mut ids = HashSet::new();
        for n in &self.notifiers {
            if !ids.insert(n.id.as_str()) {
                return Err(CheckpointError::InvalidConfig(format!(
                    "duplicate notifier id '{}'",
                    n.id
                )));
            }
        }

        if self.led.enabled && self.led.success_port == self.led.failure_port {
            return Err(CheckpointError::InvalidConfig(
                "LED success and failure port must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn has_enabled_destination(&self, output: OutputType) -> bool {
        self.destinations
            .iter()
            .any(|d| d.enabled && d.output == output)
    }

    /// Recording is only worth running when some destination takes video
    pub fn recording_enabled(&self) -> bool {
        self.has_enabled_destination(OutputType::Video) && !self.recording.source_list.is_empty()
    }

    /// One line per component, for `--check-config`
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![
            format!("camera: {}", self.camera.base_url()),
            format!(
                "reader: pattern '{}'",
                if self.reader.validation_pattern.is_empty() {
                    "<any>"
                } else {
                    &self.reader.validation_pattern
                }
            ),
        ];
        if self.recording_enabled() {
            lines.push(format!(
                "recording: start {:?} stop {:?} timeout {}s pre {}s post {}s sources {:?}",
                self.recording.start_code(),
                self.recording.stop_code(),
                self.recording.timeout_sec,
                self.recording.prebuffer_sec,
                self.recording.postbuffer_sec,
                self.recording.source_list
            ));
        } else {
            lines.push("recording: disabled".to_string());
        }
        for d in &self.destinations {
            lines.push(format!(
                "destination {}: {} {} retries {} timeout {}s{}",
                d.id,
                if d.enabled { "enabled" } else { "disabled" },
                d.output,
                d.number_of_retries,
                d.upload_timeout_s,
                if d.is_exclusive() { " exclusive" } else { "" }
            ));
        }
        for n in &self.notifiers {
            lines.push(format!(
                "notifier {}: {}",
                n.id,
                if n.enabled { "enabled" } else { "disabled" }
            ));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"{
        "camera": { "host": "10.0.0.5", "username": "root", "password": "secret" },
        "reader": { "validationPattern": "^[0-9]{6}$" },
        "recording": { "startCode": "START1", "stopCode": "STOP1", "timeoutSec": 30,
                       "prebufferSec": 5, "postbufferSec": 2, "sourceList": [1, 2] },
        "led": { "enabled": true, "successPort": 1, "failurePort": 2 },
        "destinations": [
            { "id": "ftp", "type": "ftp", "host": "ftp.site", "username": "cam", "password": "ftp-secret",
              "directory": "/incoming", "output": "video" },
            { "id": "nas", "type": "directory", "path": "/mnt/nas", "output": "image",
              "numberOfRetries": 5, "uploadTimeoutS": 12 },
            { "id": "off", "type": "directory", "path": "/tmp", "output": "image", "enabled": false }
        ],
        "notifiers": [
            { "id": "acs", "type": "acs", "url": "https://acs:55756", "source": "Gate 1" },
            { "id": "gsc", "type": "genetec", "url": "http://gsc/WebSdk", "cameraGuid": "abc" },
            { "id": "hook", "type": "webhook", "url": "http://hook", "enabled": false }
        ]
    }"#;

    fn write_config(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample() {
        let file = write_config(SAMPLE);
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.camera.base_url(), "http://10.0.0.5");
        assert_eq!(config.recording.source_list, vec![1, 2]);
        assert_eq!(config.destinations.len(), 3);
        assert!(config.destinations[0].is_exclusive());
        assert_eq!(config.destinations[0].number_of_retries, 3);
        assert_eq!(config.destinations[1].retry_policy().max_attempts, 5);
        assert!(matches!(
            config.destinations[1].kind,
            DestinationKind::Directory { .. }
        ));
        assert!(!config.destinations[2].enabled);
        assert!(matches!(
            &config.notifiers[1].kind,
            NotifierKind::Genetec { camera_guid, .. } if camera_guid == "abc"
        ));
        assert!(config.recording_enabled());
        assert!(config.has_enabled_destination(OutputType::Image));
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert!(!config.recording_enabled());
        assert!(config.widget.enabled);
        assert_eq!(config.recording.timeout_sec, 60);
        assert_eq!(config.reader.terminator_key, "enter");
    }

    #[test]
    fn test_ftp_destination() {
        let file = write_config(
            r#"{ "destinations": [
                { "id": "a", "type": "ftp", "host": "ftp.site", "output": "video" },
                { "id": "b", "type": "ftp", "host": "ftp.site", "port": 2121, "output": "image",
                  "exclusive": false },
                { "id": "c", "type": "http", "url": "http://gw", "output": "image" }
            ] }"#,
        );
        let config = Config::load(file.path()).unwrap();

        match &config.destinations[0].kind {
            DestinationKind::Ftp {
                port,
                username,
                password,
                directory,
                ..
            } => {
                assert_eq!(*port, 21);
                assert_eq!(username, "anonymous");
                assert!(password.is_none());
                assert!(directory.is_none());
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(config.destinations[0].is_exclusive());
        assert!(!config.destinations[1].is_exclusive());
        assert!(!config.destinations[2].is_exclusive());

        let file = write_config(
            r#"{ "destinations": [ { "id": "a", "type": "ftp", "host": "", "output": "video" } ] }"#,
        );
        assert!(matches!(
            Config::load(file.path()),
            Err(CheckpointError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_pattern_is_fatal() {
        let file = write_config(r#"{ "reader": { "validationPattern": "([0-9" } }"#);
        assert!(matches!(
            Config::load(file.path()),
            Err(CheckpointError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_destination() {
        let file = write_config(
            r#"{ "destinations": [
                { "id": "a", "type": "directory", "path": "/a", "output": "image" },
                { "id": "a", "type": "directory", "path": "/b", "output": "video" }
            ] }"#,
        );
        assert!(matches!(
            Config::load(file.path()),
            Err(CheckpointError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/checkpoint.json")),
            Err(CheckpointError::Io(_))
        ));
    }

    #[test]
    fn test_summary() {
        let file = write_config(SAMPLE);
        let config = Config::load(file.path()).unwrap();
        let summary = config.summary();
        assert!(summary.iter().any(|l| l.contains("exclusive")));
        assert!(summary.iter().any(|l| l.starts_with("recording: start")));
        // Camera and destination passwords stay out of the log
        assert!(summary.iter().all(|l| !l.contains("secret")));
    }
}
