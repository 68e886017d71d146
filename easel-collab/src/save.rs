//! HTTP save collaborator.
//!
//! One idempotent call persists a batch of elements for a room. The batch
//! is sent verbatim or compact depending on its size (see
//! [`PayloadCodec::prepare`]). Failures are surfaced to the caller and never
//! retried here.

use async_trait::async_trait;
use easel_core::Element;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::codec::{CodecConfig, ElementBatch, PayloadCodec};
use crate::protocol::unix_millis;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("save rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("save transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("no save endpoint configured")]
    NotConfigured,
}

/// Body of a save call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub room_id: String,
    pub elements: ElementBatch,
    /// Client time of the save (ms since epoch)
    pub timestamp: u64,
    /// Caller-maintained document version
    pub version: u64,
}

impl SaveRequest {
    pub fn new(room_id: impl Into<String>, elements: Vec<Element>, version: u64, codec: &CodecConfig) -> Self {
        Self {
            room_id: room_id.into(),
            elements: PayloadCodec::prepare(elements, codec),
            timestamp: unix_millis(),
            version,
        }
    }
}

/// Where save batches go.
#[async_trait]
pub trait SaveEndpoint: Send + Sync {
    async fn save(&self, request: &SaveRequest) -> Result<(), SaveError>;
}

/// HTTP endpoint configuration.
#[derive(Debug, Clone)]
pub struct SaveConfig {
    /// Full URL of the save route
    pub endpoint: String,
    /// Request timeout. Default: 10s.
    pub timeout: Duration,
}

impl SaveConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// POSTs the request as JSON.
pub struct HttpSaveEndpoint {
    http: reqwest::Client,
    config: SaveConfig,
}

impl HttpSaveEndpoint {
    pub fn new(config: SaveConfig) -> Result<Self, SaveError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl SaveEndpoint for HttpSaveEndpoint {
    async fn save(&self, request: &SaveRequest) -> Result<(), SaveError> {
        let response = self
            .http
            .post(&self.config.endpoint)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            log::warn!("Save for room {} rejected: {status}", request.room_id);
            return Err(SaveError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        log::debug!(
            "Saved {} elements for room {} (v{}, {})",
            request.elements.len(),
            request.room_id,
            request.version,
            if request.elements.is_compact() { "compact" } else { "verbatim" }
        );
        Ok(())
    }
}
