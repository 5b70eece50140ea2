//! # dealpulse-core
//!
//! Core library for dealpulse, a fire-and-forget visitor tracking and form
//! autosave client for lead-generation sites.
//!
//! This library provides:
//! - Visitor, session and company-domain identity with degraded fallbacks
//! - A circuit breaker that gates every remote write
//! - Event envelopes with UTM attribution and engagement weights
//! - Debounced autosave of multi-step forms into remote drafts
//! - Key-value storage backends (memory and SQLite)
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Public entry points never block and never fail. Each call:
//! - **Gates:** consults the [`TrackingGate`] synchronously and returns when refused
//! - **Launches:** hands the remote call to a background task under a hard timeout
//! - **Settles:** moves breaker state and reports errors to an [`ErrorObserver`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dealpulse_core::{Config, EventEmitter, HttpTransport, IdentityStore, MemoryStore, SqliteStore, SystemClock};
//!
//! # async fn run() -> dealpulse_core::Result<()> {
//! let config = Config::load()?;
//! let storage = Arc::new(SqliteStore::open(&config.storage.resolved_path())?);
//! let identity = Arc::new(
//!     IdentityStore::new(storage, Arc::new(MemoryStore::new()), Arc::new(SystemClock))
//!         .with_config(&config.identity),
//! );
//! let transport = Arc::new(HttpTransport::new(config.ingest.clone())?);
//!
//! let emitter = EventEmitter::builder(identity, transport).config(&config).build();
//! emitter.track_page_view("/pricing");
//! # Ok(())
//! # }
//! ```

pub use autosave::{AutosaveManager, AutosaveSession, FieldRules, SessionPhase};
pub use breaker::{BreakerPhase, BreakerState, CircuitBreaker, TrackingGate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use emitter::EventEmitter;
pub use envelope::{EventData, EventEnvelope, UtmParams};
pub use error::{Error, Result};
pub use identity::{IdentityStore, VisitorIdentity};
pub use lifecycle::{ListenerId, PageLifecycle, PageSignal};
pub use observer::{ErrorObserver, FailureSource, TracingObserver};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, UnavailableStore};
pub use transport::{DisabledTransport, DraftTransport, EventTransport, HttpTransport};

pub mod autosave;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod observer;
pub mod storage;
pub mod transport;

mod tasks;
