//! Telling the outside world that the server was stopped.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const WEBHOOK_SECRET_HEADER: &str = "X-Webhook-Secret";
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    VmStopped { instance: String },
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> Result<(), NotifyError>;
}

/// POSTs events as JSON to a webhook URL.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: Option<String>,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(http: reqwest::Client, url: Option<String>, secret: Option<String>) -> Self {
        Self { http, url, secret }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        let Some(url) = &self.url else {
            warn!("notification_webhook_url isn't set, not sending {event:?}");
            return Ok(());
        };

        let mut request = self.http.post(url).timeout(NOTIFY_TIMEOUT).json(event);
        if let Some(secret) = &self.secret {
            request = request.header(WEBHOOK_SECRET_HEADER, secret);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        debug!("sent {event:?} to {url}");
        Ok(())
    }
}
