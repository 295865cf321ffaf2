//! VAPIX adapters for Axis network cameras.
//!
//! | Capability | Endpoint |
//! |------------|----------|
//! | snapshot | `GET /axis-cgi/jpg/image.cgi` |
//! | recording lookup | `GET /axis-cgi/record/list.cgi` |
//! | recording export | `GET /axis-cgi/record/export/exportrecording.cgi` |
//! | text overlay | `POST /axis-cgi/dynamicoverlay/dynamicoverlay.cgi` |
//! | output port | `GET /axis-cgi/io/port.cgi` |

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use log::{debug, trace, warn};
use regex::Regex;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::json;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use super::{ByteStream, CameraDevice, IoPort, Widget};
use crate::config::{CameraConfig, WidgetConfig};
use crate::error::CheckpointError;

/// Shared HTTP plumbing for one camera
#[derive(Clone)]
struct VapixClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    request_timeout: Duration,
}

impl VapixClient {
    fn new(config: &CameraConfig) -> Result<Self, CheckpointError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connection_timeout_s.max(1)))
            .build()?;
        Ok(VapixClient {
            client,
            base_url: config.base_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_s.max(1)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, CheckpointError> {
        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                CheckpointError::DeviceUnavailable(format!("{}: {}", self.base_url, e))
            } else {
                CheckpointError::Http(e)
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(CheckpointError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }
}

fn vapix_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct VapixCamera {
    http: VapixClient,
}

impl VapixCamera {
    pub fn new(config: &CameraConfig) -> Result<Self, CheckpointError> {
        Ok(VapixCamera {
            http: VapixClient::new(config)?,
        })
    }

    async fn find_active_recording(&self, source: u32) -> Result<RecordingRef, CheckpointError> {
        let response = self
            .http
            .send(
                self.http
                    .get("/axis-cgi/record/list.cgi")
                    .query(&[("recordingid", "all")])
                    .timeout(self.http.request_timeout),
            )
            .await?;
        let body = response.text().await?;
        trace!("record/list.cgi: {}", body);

        active_recording(&body, source).ok_or_else(|| {
            CheckpointError::NotFound(format!("no active recording on source {}", source))
        })
    }
}

#[async_trait]
impl CameraDevice for VapixCamera {
    async fn get_image(
        &self,
        source: u32,
        resolution: Option<&str>,
    ) -> Result<Bytes, CheckpointError> {
        let mut query = vec![("camera", source.to_string())];
        if let Some(resolution) = resolution {
            query.push(("resolution", resolution.to_string()));
        }
        let response = self
            .http
            .send(
                self.http
                    .get("/axis-cgi/jpg/image.cgi")
                    .query(&query)
                    .timeout(self.http.request_timeout),
            )
            .await?;
        let image = response.bytes().await?;
        debug!("Camera: {} byte snapshot from source {}", image.len(), source);
        Ok(image)
    }

    async fn get_recording_stream(
        &self,
        source: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ByteStream, CheckpointError> {
        let recording = self.find_active_recording(source).await?;
        debug!(
            "Camera: exporting recording {} on {} for source {} from {} to {}",
            recording.id, recording.disk, source, start, end
        );

        // No overall timeout here: the caller bounds the upload consuming it
        let response = self
            .http
            .send(self.http.get("/axis-cgi/record/export/exportrecording.cgi").query(&[
                ("schemaversion", "1"),
                ("recordingid", recording.id.as_str()),
                ("diskid", recording.disk.as_str()),
                ("exportformat", "matroska"),
                ("starttime", vapix_time(&start).as_str()),
                ("stoptime", vapix_time(&end).as_str()),
            ]))
            .await?;

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl IoPort for VapixCamera {
    async fn set_state(&self, port: u32, active: bool) -> Result<(), CheckpointError> {
        // VAPIX output syntax: "<port>:/" drives the port active, "<port>:\" inactive
        let action = format!("{}:{}", port, if active { '/' } else { '\\' });
        self.http
            .send(
                self.http
                    .get("/axis-cgi/io/port.cgi")
                    .query(&[("action", action.as_str())])
                    .timeout(self.http.request_timeout),
            )
            .await?;
        trace!("Camera: port {} -> {}", port, active);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct RecordingRef {
    id: String,
    disk: String,
}

fn recording_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<recording\s([^>]*)>").expect("static regex"))
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("static regex"))
}

/// First recording on `source` that has not stopped yet
fn active_recording(xml: &str, source: u32) -> Option<RecordingRef> {
    let source = source.to_string();
    recording_regex().captures_iter(xml).find_map(|tag| {
        let attributes: HashMap<&str, &str> = attribute_regex()
            .captures_iter(tag.get(1)?.as_str())
            .filter_map(|a| Some((a.get(1)?.as_str(), a.get(2)?.as_str())))
            .collect();

        let ongoing = attributes.get("stoptime").map_or(true, |s| s.is_empty());
        if attributes.get("source") == Some(&source.as_str()) && ongoing {
            Some(RecordingRef {
                id: attributes.get("recordingid")?.to_string(),
                disk: attributes.get("diskid")?.to_string(),
            })
        } else {
            None
        }
    })
}

/// Dynamic text overlay
pub struct VapixOverlay {
    http: VapixClient,
    config: WidgetConfig,
}

impl VapixOverlay {
    pub fn new(camera: &CameraConfig, config: &WidgetConfig) -> Result<Self, CheckpointError> {
        Ok(VapixOverlay {
            http: VapixClient::new(camera)?,
            config: config.clone(),
        })
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CheckpointError> {
        let body = json!({ "apiVersion": "1.0", "method": method, "params": params });
        let response = self
            .http
            .send(
                self.http
                    .post("/axis-cgi/dynamicoverlay/dynamicoverlay.cgi")
                    .json(&body)
                    .timeout(self.http.request_timeout),
            )
            .await?;
        let reply: serde_json::Value = response.json().await?;
        if let Some(error) = reply.get("error") {
            return Err(CheckpointError::DeviceUnavailable(format!(
                "overlay {} failed: {}",
                method, error
            )));
        }
        Ok(reply)
    }
}

#[async_trait]
impl Widget for VapixOverlay {
    async fn display(&self, code: &str, visibility: Duration) -> Result<(), CheckpointError> {
        let reply = self
            .call(
                "addText",
                json!({
                    "camera": self.config.camera,
                    "text": code,
                    "position": self.config.position,
                    "fontSize": self.config.font_size,
                }),
            )
            .await?;
        let identity = reply
            .pointer("/data/identity")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                CheckpointError::DeviceUnavailable("overlay reply without identity".to_string())
            })?;
        debug!("Widget: showing '{}' as overlay {}", code, identity);

        let overlay = VapixOverlay {
            http: self.http.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(async move {
            tokio::time::sleep(visibility).await;
            if let Err(e) = overlay.call("remove", json!({ "identity": identity })).await {
                warn!("Widget: cannot remove overlay {}: {}", identity, e);
            }
        });
        Ok(())
    }
}
