//! HTTP transport for the managed backend
//!
//! Posts JSON to the ingestion and draft endpoints. Any non-2xx status is an
//! error; the caller decides what a failure means for breaker state.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use super::{DraftRequest, DraftResponse, DraftTransport, EventTransport};
use crate::config::IngestConfig;
use crate::envelope::EventEnvelope;
use crate::error::{Error, Result};

/// HTTP client for the event and draft endpoints
pub struct HttpTransport {
    config: IngestConfig,
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a new transport from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: IngestConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("ingest.base_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let key_value = HeaderValue::from_str(api_key)
                .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?;
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?;
            headers.insert("apikey", key_value);
            headers.insert(AUTHORIZATION, auth_value);
        }

        // Callers race every call against the same limit with `with_timeout`;
        // the client-level timeout stops the connection itself.
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
            base_url,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = self.endpoint(path);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn send_event(&self, envelope: &EventEnvelope) -> Result<()> {
        self.post(&self.config.events_path, envelope).await?;
        Ok(())
    }
}

#[async_trait]
impl DraftTransport for HttpTransport {
    async fn upsert_draft(&self, request: &DraftRequest) -> Result<DraftResponse> {
        let response = self.post(&self.config.drafts_path, request).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response: {}", e)))?;
        if bytes.is_empty() {
            return Ok(DraftResponse::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}
