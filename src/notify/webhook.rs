//! Webhook delivery
//!
//! Payloads are POSTed as JSON. The response status is classified for
//! logging only; nothing is retried.

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Invalid webhook URL '{0}'")]
    InvalidUrl(String),

    #[error("Webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// How the receiving end answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Rate limited or server error; a later attempt might succeed
    Transient(u16),
    /// Rejected; retrying the same payload would not help
    Permanent(u16),
}

impl DeliveryOutcome {
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            200 | 204 => Self::Delivered,
            429 | 500..=599 => Self::Transient(status),
            other => Self::Permanent(other),
        }
    }
}

/// Destination for rendered payloads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, payload: Value) -> Result<DeliveryOutcome, DeliveryError>;
}

/// Webhook sink posting to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpWebhook {
    url: Url,
    client: reqwest::Client,
}

impl HttpWebhook {
    /// # Errors
    /// Returns `DeliveryError::InvalidUrl` unless `url` is an http or https URL.
    pub fn new(url: &str) -> Result<Self, DeliveryError> {
        let parsed = validate_url(url)?;
        Ok(Self {
            url: parsed,
            client: reqwest::Client::new(),
        })
    }
}

/// Parse a webhook URL, accepting only http and https
///
/// # Errors
/// Returns `DeliveryError::InvalidUrl` for anything else.
pub fn validate_url(url: &str) -> Result<Url, DeliveryError> {
    let parsed = Url::parse(url.trim()).map_err(|_| DeliveryError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(DeliveryError::InvalidUrl(url.to_string())),
    }
}

#[async_trait]
impl WebhookSink for HttpWebhook {
    async fn deliver(&self, payload: Value) -> Result<DeliveryOutcome, DeliveryError> {
        let response = self.client.post(self.url.clone()).json(&payload).send().await?;
        Ok(DeliveryOutcome::from_status(response.status().as_u16()))
    }
}
