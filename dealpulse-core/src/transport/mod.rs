//! Remote write path
//!
//! Two endpoints are involved:
//! - the event ingestion endpoint, one [`EventEnvelope`] per call
//! - the draft create-or-update endpoint used by autosave
//!
//! Every call is raced against a hard timeout with [`with_timeout`]; a
//! timeout is reported as [`Error::Timeout`] and counts as a failure like any
//! other transport error.

mod http;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::envelope::{EventData, EventEnvelope};
use crate::error::{Error, Result};

pub use http::HttpTransport;

/// Ingestion endpoint for tracked events
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn send_event(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// Draft create-or-update endpoint for autosave
#[async_trait]
pub trait DraftTransport: Send + Sync {
    async fn upsert_draft(&self, request: &DraftRequest) -> Result<DraftResponse>;
}

/// Body of a draft write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRequest {
    pub token: String,
    pub data: EventData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_initial_creation: Option<bool>,
}

/// Reply of the draft endpoint
///
/// `unique_token` may differ from the token that was sent; the returned value
/// becomes the session's token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftResponse {
    #[serde(default)]
    pub unique_token: Option<String>,
}

/// Race a remote call against a timer; whichever settles first wins
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(limit)),
    }
}

/// Run a remote call on its own task under the hard timeout
///
/// A panic inside the call is reported as a transport failure so the caller
/// can still settle breaker bookkeeping.
pub(crate) async fn dispatch<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(with_timeout(limit, call)).await {
        Ok(result) => result,
        Err(e) => Err(Error::Transport(format!("remote call aborted: {}", e))),
    }
}

/// Transport used when remote writes are not configured
///
/// Accepts everything without doing I/O, so the pipeline behaves as if the
/// backend were healthy.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTransport;

#[async_trait]
impl EventTransport for DisabledTransport {
    async fn send_event(&self, envelope: &EventEnvelope) -> Result<()> {
        tracing::trace!(event_type = %envelope.event_type, "ingest disabled, dropping event");
        Ok(())
    }
}

#[async_trait]
impl DraftTransport for DisabledTransport {
    async fn upsert_draft(&self, request: &DraftRequest) -> Result<DraftResponse> {
        tracing::trace!(token = %request.token, "ingest disabled, dropping draft write");
        Ok(DraftResponse::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wins_race() {
        let result: Result<()> = with_timeout(Duration::from_secs(3), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_wins_race() {
        let result = with_timeout(Duration::from_secs(3), async {
            tokio::time::sleep(Duration::from_millis(2999)).await;
            Ok(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    async fn explode() -> Result<()> {
        panic!("transport bug")
    }

    #[tokio::test]
    async fn test_dispatch_contains_panics() {
        let result = dispatch(Duration::from_secs(3), explode()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn test_draft_wire_format() {
        let mut data = EventData::new();
        data.insert("company_name".to_string(), json!("Acme"));
        let request = DraftRequest {
            token: "tok".to_string(),
            data,
            is_initial_creation: Some(true),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["isInitialCreation"], true);
        assert_eq!(value["data"]["company_name"], "Acme");

        let request = DraftRequest {
            is_initial_creation: None,
            ..request
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("isInitialCreation").is_none());

        let response: DraftResponse =
            serde_json::from_value(json!({"uniqueToken": "server-tok"})).unwrap();
        assert_eq!(response.unique_token.as_deref(), Some("server-tok"));
        let response: DraftResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(response.unique_token, None);
    }
}
