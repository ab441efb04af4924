//! Upstream channel status
//!
//! The watchdog asks a status service whether a channel is live before
//! deciding to pause a pipeline. Any failure degrades to "unknown", which
//! never pauses.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::UpstreamConfig;

/// Live status of a channel as reported upstream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub is_live: bool,
    #[serde(default)]
    pub viewer_count: Option<u64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Upstream status provider not configured")]
    NotConfigured,

    #[error("Upstream request failed: {0}")]
    Request(String),

    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid upstream response: {0}")]
    Decode(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusProvider: Send + Sync {
    async fn channel_status(&self, channel: &str) -> Result<ChannelStatus, StatusError>;
}

/// Used when no status URL is configured
pub struct DisabledStatusProvider;

#[async_trait]
impl StatusProvider for DisabledStatusProvider {
    async fn channel_status(&self, _channel: &str) -> Result<ChannelStatus, StatusError> {
        Err(StatusError::NotConfigured)
    }
}

/// Queries `GET {status_url}/{channel}`
pub struct HttpStatusProvider {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    client_id: Option<String>,
    timeout: Duration,
}

impl HttpStatusProvider {
    pub fn new(base_url: &str, config: &UpstreamConfig) -> Result<Self, StatusError> {
        let timeout = config.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("streamward/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StatusError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            client_id: config.client_id.clone(),
            timeout,
        })
    }

    fn url_for(&self, channel: &str) -> String {
        format!("{}/{}", self.base_url, channel)
    }
}

#[async_trait]
impl StatusProvider for HttpStatusProvider {
    async fn channel_status(&self, channel: &str) -> Result<ChannelStatus, StatusError> {
        let mut request = self.client.get(self.url_for(channel));
        if let Some(ref token) = self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(ref client_id) = self.client_id {
            request = request.header("Client-Id", client_id);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StatusError::Timeout(self.timeout)
            } else {
                StatusError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StatusError::Request(format!("HTTP {status}")));
        }

        response
            .json::<ChannelStatus>()
            .await
            .map_err(|e| StatusError::Decode(e.to_string()))
    }
}

/// Build the provider for the configured upstream
pub fn from_config(config: &UpstreamConfig) -> Box<dyn StatusProvider> {
    match config.status_url.as_deref() {
        Some(url) => match HttpStatusProvider::new(url, config) {
            Ok(provider) => {
                tracing::info!(url, "Upstream status provider enabled");
                Box::new(provider)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Upstream status provider unavailable");
                Box::new(DisabledStatusProvider)
            }
        },
        None => {
            tracing::info!("No upstream status URL configured, liveness signal disabled");
            Box::new(DisabledStatusProvider)
        }
    }
}
