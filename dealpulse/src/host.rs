//! Wiring of the pipeline components for one run of the binary
//!
//! The binary plays the role of a single page: one identity store, one
//! lifecycle hub and one emitter shared by everything it does.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dealpulse_core::{
    AutosaveManager, Config, DisabledTransport, DraftTransport, Error, ErrorObserver,
    EventEmitter, EventTransport, FailureSource, HttpTransport, IdentityStore, KeyValueStore,
    MemoryStore, PageLifecycle, SqliteStore, SystemClock, UnavailableStore,
};

pub struct Host {
    pub config: Config,
    pub storage: Arc<dyn KeyValueStore>,
    pub identity: Arc<IdentityStore>,
    pub lifecycle: Arc<PageLifecycle>,
    pub emitter: EventEmitter,
    drafts: Arc<dyn DraftTransport>,
    observer: Arc<dyn ErrorObserver>,
}

impl Host {
    /// Build the shared components; must run inside the tokio runtime
    pub fn new(config: Config, referrer: Option<String>) -> Result<Self> {
        let storage = open_storage(&config);
        let identity = Arc::new(
            IdentityStore::new(
                storage.clone(),
                Arc::new(MemoryStore::new()),
                Arc::new(SystemClock),
            )
            .with_config(&config.identity)
            .with_referrer(referrer),
        );

        let (events, drafts): (Arc<dyn EventTransport>, Arc<dyn DraftTransport>) =
            if config.ingest.is_ready() {
                let http = Arc::new(
                    HttpTransport::new(config.ingest.clone())
                        .context("failed to create HTTP transport")?,
                );
                (http.clone() as Arc<dyn EventTransport>, http as Arc<dyn DraftTransport>)
            } else {
                tracing::info!("ingest disabled, remote writes are dropped locally");
                (
                    Arc::new(DisabledTransport) as Arc<dyn EventTransport>,
                    Arc::new(DisabledTransport) as Arc<dyn DraftTransport>,
                )
            };

        let observer: Arc<dyn ErrorObserver> = Arc::new(ConsoleObserver);
        let emitter = EventEmitter::builder(identity.clone(), events)
            .config(&config)
            .observer(observer.clone())
            .build();

        Ok(Self {
            config,
            storage,
            identity,
            lifecycle: Arc::new(PageLifecycle::new()),
            emitter,
            drafts,
            observer,
        })
    }

    /// Autosave manager for the form on `page_path`
    pub fn autosave(&self, page_path: &str) -> AutosaveManager {
        AutosaveManager::builder(self.identity.clone(), self.storage.clone(), self.drafts.clone())
            .config(&self.config)
            .observer(self.observer.clone())
            .emitter(self.emitter.clone())
            .lifecycle(self.lifecycle.clone())
            .page_path(page_path)
            .build()
    }

    /// How long to wait for in-flight writes before exiting
    pub fn settle_limit(&self) -> Duration {
        self.config.ingest.timeout() + Duration::from_secs(1)
    }
}

/// SQLite store, or a store that refuses everything when it cannot be opened
fn open_storage(config: &Config) -> Arc<dyn KeyValueStore> {
    let path = config.storage.resolved_path();
    match SqliteStore::open(&path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "persistent storage unavailable");
            Arc::new(UnavailableStore)
        }
    }
}

/// Logs like the default observer and also tells the user
struct ConsoleObserver;

impl ErrorObserver for ConsoleObserver {
    fn observe(&self, source: FailureSource, error: &Error) {
        tracing::warn!(source = %source, error = %error, "swallowed pipeline failure");
        eprintln!("warning: {} failed: {}", source, error);
    }
}
