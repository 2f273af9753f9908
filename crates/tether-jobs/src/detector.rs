//! HTTP-backed connection detector.
//!
//! The detection algorithm itself runs out of process. Each chunk is POSTed
//! as JSON to `DETECTOR_URL`:
//!
//! ```json
//! {"chunk_id": "...", "document_id": "...", "sequence_number": 3, "content": "..."}
//! ```
//!
//! and the service answers with `{"connections": [DetectedConnection, ...]}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use tether_core::{defaults, ChunkContent, ConnectionDetector, DetectedConnection, Error, Result};

/// Configuration for [`HttpDetector`].
#[derive(Debug, Clone)]
pub struct HttpDetectorConfig {
    pub url: String,
    pub timeout: Duration,
    /// Sent as a bearer token when set.
    pub api_key: Option<String>,
}

impl HttpDetectorConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(defaults::DETECTOR_TIMEOUT_SECS),
            api_key: None,
        }
    }

    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DETECTOR_URL` | unset | Detector endpoint; `None` when unset or empty |
    /// | `DETECTOR_TIMEOUT_SECS` | `60` | HTTP request timeout |
    /// | `DETECTOR_API_KEY` | unset | Optional bearer token |
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("DETECTOR_URL").ok().filter(|u| !u.is_empty())?;
        let timeout = std::env::var("DETECTOR_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::DETECTOR_TIMEOUT_SECS);

        Some(Self {
            url,
            timeout: Duration::from_secs(timeout),
            api_key: std::env::var("DETECTOR_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    chunk_id: Uuid,
    document_id: Uuid,
    sequence_number: i32,
    content: &'a str,
}

#[derive(Deserialize)]
struct DetectResponse {
    connections: Vec<DetectedConnection>,
}

/// Detector that delegates to an HTTP service.
pub struct HttpDetector {
    client: Client,
    config: HttpDetectorConfig,
}

impl HttpDetector {
    pub fn new(config: HttpDetectorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "jobs",
            component = "detector",
            url = %config.url,
            timeout_secs = config.timeout.as_secs(),
            "Initializing HTTP detector"
        );
        Ok(Self { client, config })
    }

    /// `Ok(None)` when `DETECTOR_URL` is not configured.
    pub fn from_env() -> Result<Option<Self>> {
        HttpDetectorConfig::from_env().map(Self::new).transpose()
    }

    pub fn config(&self) -> &HttpDetectorConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionDetector for HttpDetector {
    fn name(&self) -> &str {
        "http"
    }

    async fn detect(&self, chunk: &ChunkContent) -> Result<Vec<DetectedConnection>> {
        let mut req = self.client.post(&self.config.url).json(&DetectRequest {
            chunk_id: chunk.id,
            document_id: chunk.document_id,
            sequence_number: chunk.sequence_number,
            content: &chunk.content,
        });
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::Detector(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Detector(format!(
                "detector returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let body: DetectResponse = response
            .json()
            .await
            .map_err(|e| Error::Detector(format!("malformed detector response: {}", e)))?;

        debug!(
            subsystem = "jobs",
            component = "detector",
            chunk_id = %chunk.id,
            connection_count = body.connections.len(),
            "Detector responded"
        );
        Ok(body.connections)
    }
}
