//! Best-effort event notification.
//!
//! Every enabled target gets the scanned code concurrently. Failures are
//! logged and otherwise ignored: notifications never influence the upload
//! outcome or the LED.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::config::{NotifierConfig, NotifierKind};
use crate::error::CheckpointError;

#[async_trait]
pub trait EventTarget: Send + Sync {
    fn id(&self) -> &str;

    async fn send(&self, code: &str) -> Result<(), CheckpointError>;
}

fn check(response: reqwest::Response) -> Result<(), CheckpointError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(CheckpointError::HttpStatus {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}

fn authorize(
    request: RequestBuilder,
    username: &Option<String>,
    password: &Option<String>,
) -> RequestBuilder {
    match username {
        Some(user) => request.basic_auth(user, password.as_ref()),
        None => request,
    }
}

/// Axis Camera Station external data
pub struct AcsTarget {
    id: String,
    url: String,
    username: Option<String>,
    password: Option<String>,
    source: String,
    client: Client,
}

#[async_trait]
impl EventTarget for AcsTarget {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, code: &str) -> Result<(), CheckpointError> {
        let body = json!({
            "addExternalDataRequest": {
                "occurrenceTime": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                "source": self.source,
                "externalDataType": "CheckpointScan",
                "data": { "code": code }
            }
        });
        let request = self
            .client
            .post(format!("{}/Acs/Api/ExternalDataFacade/AddExternalData", self.url))
            .json(&body);
        check(authorize(request, &self.username, &self.password).send().await?)
    }
}

/// Genetec Security Center camera bookmark
pub struct GenetecTarget {
    id: String,
    url: String,
    username: Option<String>,
    password: Option<String>,
    camera_guid: String,
    client: Client,
}

#[async_trait]
impl EventTarget for GenetecTarget {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, code: &str) -> Result<(), CheckpointError> {
        let action = format!("AddCameraBookmark({},{})", self.camera_guid, code);
        let request = self
            .client
            .post(format!("{}/action", self.url))
            .query(&[("q", action)]);
        check(authorize(request, &self.username, &self.password).send().await?)
    }
}

/// Generic JSON POST of `{code, timestamp}`
pub struct WebhookTarget {
    id: String,
    url: String,
    token: Option<String>,
    client: Client,
}

#[async_trait]
impl EventTarget for WebhookTarget {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, code: &str) -> Result<(), CheckpointError> {
        let body = json!({
            "code": code,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        check(request.send().await?)
    }
}

pub fn build_target(config: &NotifierConfig) -> Result<Arc<dyn EventTarget>, CheckpointError> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(config.timeout_s.max(1)))
        .build()?;
    let id = config.id.clone();
    let target: Arc<dyn EventTarget> = match &config.kind {
        NotifierKind::Acs {
            url,
            username,
            password,
            source,
        } => Arc::new(AcsTarget {
            id,
            url: url.trim_end_matches('/').to_string(),
            username: username.clone(),
            password: password.clone(),
            source: source.clone(),
            client,
        }),
        NotifierKind::Genetec {
            url,
            username,
            password,
            camera_guid,
        } => Arc::new(GenetecTarget {
            id,
            url: url.trim_end_matches('/').to_string(),
            username: username.clone(),
            password: password.clone(),
            camera_guid: camera_guid.clone(),
            client,
        }),
        NotifierKind::Webhook { url, token } => Arc::new(WebhookTarget {
            id,
            url: url.clone(),
            token: token.clone(),
            client,
        }),
    };
    Ok(target)
}

pub struct EventNotifier {
    targets: Vec<(Arc<dyn EventTarget>, Duration)>,
}

impl EventNotifier {
    pub fn new(targets: Vec<(Arc<dyn EventTarget>, Duration)>) -> Self {
        EventNotifier { targets }
    }

    /// Disabled targets are left out
    pub fn from_config(configs: &[NotifierConfig]) -> Result<Self, CheckpointError> {
        let mut targets = Vec::new();
        for config in configs.iter().filter(|c| c.enabled) {
            targets.push((
                build_target(config)?,
                Duration::from_secs(config.timeout_s.max(1)),
            ));
        }
        info!("Notifier: {} target(s) enabled", targets.len());
        Ok(EventNotifier::new(targets))
    }

    /// Send `code` to every target. Returns once all targets settled.
    pub async fn notify(&self, code: &str) {
        let sends = self.targets.iter().map(|(target, limit)| async move {
            let result = match timeout(*limit, target.send(code)).await {
                Ok(result) => result,
                Err(_) => Err(CheckpointError::Timeout),
            };
            match result {
                Ok(()) => debug!("{}: notified '{}'", target.id(), code),
                Err(e) => {
                    let e = CheckpointError::NotifyFailed {
                        target: target.id().to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{}", e);
                }
            }
        });
        join_all(sends).await;
    }
}
