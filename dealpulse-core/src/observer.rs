//! Sink for swallowed failures
//!
//! Public entry points never return errors. Every error they absorb is
//! reported exactly once to an [`ErrorObserver`] so hosts can attach metrics
//! or alerting without touching the no-throw contract.

use std::fmt;

use crate::error::Error;

/// Where a swallowed failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureSource {
    /// Event ingestion call
    EventTransport,
    /// First-field draft creation
    DraftCreate,
    /// Debounced, immediate or step draft update
    DraftUpdate,
    /// Terminal draft write
    DraftFinalize,
    /// Best-effort write issued when the page is hidden
    ExitFlush,
    /// Local persistence of the session token
    SessionStorage,
    /// Background task could not be started or panicked
    Runtime,
}

impl FailureSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureSource::EventTransport => "event_transport",
            FailureSource::DraftCreate => "draft_create",
            FailureSource::DraftUpdate => "draft_update",
            FailureSource::DraftFinalize => "draft_finalize",
            FailureSource::ExitFlush => "exit_flush",
            FailureSource::SessionStorage => "session_storage",
            FailureSource::Runtime => "runtime",
        }
    }
}

impl fmt::Display for FailureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives every error absorbed by the pipeline
pub trait ErrorObserver: Send + Sync {
    fn observe(&self, source: FailureSource, error: &Error);
}

/// Default observer: structured `warn` logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ErrorObserver for TracingObserver {
    fn observe(&self, source: FailureSource, error: &Error) {
        tracing::warn!(source = %source, error = %error, "swallowed pipeline failure");
    }
}
