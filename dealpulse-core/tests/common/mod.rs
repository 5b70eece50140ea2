//! Shared fixtures for the pipeline integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dealpulse_core::transport::{DraftRequest, DraftResponse};
use dealpulse_core::{
    DraftTransport, Error, ErrorObserver, EventEnvelope, EventTransport, FailureSource,
    IdentityStore, KeyValueStore, ManualClock, MemoryStore, Result,
};

/// How the fake backend answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Healthy,
    Failing,
    /// Never answers
    Hanging,
    Panicking,
}

/// Records every call and answers according to its [`Mode`]
pub struct FakeBackend {
    mode: Mutex<Mode>,
    server_token: Mutex<Option<String>>,
    events: Mutex<Vec<EventEnvelope>>,
    drafts: Mutex<Vec<DraftRequest>>,
    calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            server_token: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            drafts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(Mode::Healthy)
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Token returned as `uniqueToken` by draft writes
    pub fn issue_token(&self, token: &str) {
        *self.server_token.lock().unwrap() = Some(token.to_string());
    }

    /// Attempted calls, including failed ones
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Events that were accepted
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    /// Draft writes that were accepted
    pub fn drafts(&self) -> Vec<DraftRequest> {
        self.drafts.lock().unwrap().clone()
    }

    async fn answer(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Healthy => Ok(()),
            Mode::Failing => Err(Error::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            }),
            Mode::Hanging => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Mode::Panicking => panic!("backend exploded"),
        }
    }
}

#[async_trait]
impl EventTransport for FakeBackend {
    async fn send_event(&self, envelope: &EventEnvelope) -> Result<()> {
        self.answer().await?;
        self.events.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

#[async_trait]
impl DraftTransport for FakeBackend {
    async fn upsert_draft(&self, request: &DraftRequest) -> Result<DraftResponse> {
        self.answer().await?;
        self.drafts.lock().unwrap().push(request.clone());
        Ok(DraftResponse {
            unique_token: self.server_token.lock().unwrap().clone(),
        })
    }
}

/// Observer that keeps every absorbed failure
#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<(FailureSource, String)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sources(&self) -> Vec<FailureSource> {
        self.seen.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }
}

impl ErrorObserver for RecordingObserver {
    fn observe(&self, source: FailureSource, error: &Error) {
        self.seen.lock().unwrap().push((source, error.to_string()));
    }
}

/// Identity backed by in-memory stores
pub fn identity(
    persistent: Arc<dyn KeyValueStore>,
    clock: Arc<ManualClock>,
    referrer: Option<&str>,
) -> Arc<IdentityStore> {
    dealpulse_core::logging::init_test();
    Arc::new(
        IdentityStore::new(persistent, Arc::new(MemoryStore::new()), clock)
            .with_referrer(referrer.map(str::to_string)),
    )
}
