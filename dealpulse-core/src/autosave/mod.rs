//! Autosave session manager
//!
//! Keeps a long multi-step form saved as a remote draft without ever
//! blocking or failing the form.
//!
//! ## Session lifecycle
//!
//! ```text
//! Uninitialized --initialize_token--> Pending --first meaningful field--> Active
//!                        \--fresh persisted token-----------------------> Active
//! Active --finalize_valuation--> Finalized
//! Active --page hidden--> Abandoned --page visible / next update--> Active
//! any --clear_autosave--> Uninitialized
//! ```
//!
//! ## Write paths
//!
//! - [`AutosaveManager::update_valuation`]: coalesced through a single
//!   debounce timer (300ms by default)
//! - [`AutosaveManager::update_valuation_immediate`]: written right away;
//!   fields listed as immediate in [`FieldRules`] take this path even when
//!   passed to `update_valuation`
//! - [`AutosaveManager::update_step`]: wizard position side channel
//! - [`AutosaveManager::flush_pending_updates`] and the page-hidden hook:
//!   cancel the timer and write the pending payload now
//!
//! Every write is gated by the manager's own [`TrackingGate`], carries the
//! elapsed engagement time, and runs on a background task under the hard
//! timeout. Failures only move breaker state and reach the [`ErrorObserver`].

mod debounce;
pub mod fields;
pub mod session;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::breaker::{BreakerState, TrackingGate};
use crate::clock::{Clock, SystemClock};
use crate::config::{BreakerConfig, Config};
use crate::emitter::EventEmitter;
use crate::envelope::EventData;
use crate::identity::IdentityStore;
use crate::lifecycle::{ListenerId, PageLifecycle, PageSignal};
use crate::observer::{ErrorObserver, FailureSource, TracingObserver};
use crate::storage::KeyValueStore;
use crate::tasks::BackgroundTasks;
use crate::transport::{dispatch, DraftRequest, DraftTransport};

use debounce::Debouncer;
pub use fields::{FieldRules, WritePath};
pub use session::{PersistedSession, Restored, SESSION_KEY};

/// Payload key carrying elapsed engagement seconds
pub const TIME_SPENT_KEY: &str = "time_spent_seconds";
/// Payload key carrying the wizard step
pub const CURRENT_STEP_KEY: &str = "current_step";
/// Payload key carrying the terminal status marker
pub const STATUS_KEY: &str = "status";

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Uninitialized,
    /// Initialized, no draft yet
    Pending,
    Active,
    Finalized,
    /// Page was hidden with the draft unfinished
    Abandoned,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::Pending => "pending",
            SessionPhase::Active => "active",
            SessionPhase::Finalized => "finalized",
            SessionPhase::Abandoned => "abandoned",
        }
    }

    /// Whether field updates are still written
    fn accepts_updates(&self) -> bool {
        matches!(self, SessionPhase::Active | SessionPhase::Abandoned)
    }
}

/// Snapshot of the autosave session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AutosaveSession {
    pub phase: SessionPhase,
    pub token: Option<String>,
    pub last_saved: Option<DateTime<Utc>>,
    pub is_saving: bool,
    pub current_step: u32,
    pub time_spent_seconds: i64,
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SessionState {
    phase: SessionPhase,
    token: Option<String>,
    /// When the persisted token was issued; the TTL runs from here
    issued_at: Option<DateTime<Utc>>,
    last_saved: Option<DateTime<Utc>>,
    saves_in_flight: usize,
    current_step: u32,
    time_spent_seconds: i64,
    start_time: Option<DateTime<Utc>>,
    exit_listener: Option<ListenerId>,
}

impl SessionState {
    /// Elapsed seconds since the start time, else the accumulated counter
    fn elapsed_seconds(&mut self, now: DateTime<Utc>) -> i64 {
        if let Some(start) = self.start_time {
            self.time_spent_seconds = (now - start).num_seconds().max(0);
        }
        self.time_spent_seconds
    }

    fn snapshot(&self) -> AutosaveSession {
        AutosaveSession {
            phase: self.phase,
            token: self.token.clone(),
            last_saved: self.last_saved,
            is_saving: self.saves_in_flight > 0,
            current_step: self.current_step,
            time_spent_seconds: self.time_spent_seconds,
            start_time: self.start_time,
        }
    }
}

/// Builder for [`AutosaveManager`]
pub struct AutosaveBuilder {
    identity: Arc<IdentityStore>,
    storage: Arc<dyn KeyValueStore>,
    transport: Arc<dyn DraftTransport>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ErrorObserver>,
    breaker: BreakerConfig,
    rules: FieldRules,
    debounce: Duration,
    ttl: chrono::Duration,
    timeout: Duration,
    emitter: Option<EventEmitter>,
    lifecycle: Option<Arc<PageLifecycle>>,
    page_path: String,
}

impl AutosaveBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn field_rules(mut self, rules: FieldRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Emitter that receives the completion event
    pub fn emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Lifecycle whose hidden signal flushes the session
    pub fn lifecycle(mut self, lifecycle: Arc<PageLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Page path reported with the completion event
    pub fn page_path(mut self, page_path: impl Into<String>) -> Self {
        self.page_path = page_path.into();
        self
    }

    /// Apply breaker, autosave and timeout settings from configuration
    pub fn config(self, config: &Config) -> Self {
        self.breaker(config.breaker.clone())
            .debounce(config.autosave.debounce())
            .ttl(config.autosave.token_ttl())
            .timeout(config.ingest.timeout())
            .field_rules(FieldRules::with_immediate_fields(
                config.autosave.immediate_fields.iter().cloned(),
            ))
    }

    /// Build the manager; call inside a tokio runtime
    pub fn build(self) -> AutosaveManager {
        let gate = TrackingGate::new(self.breaker, self.identity, self.clock.clone())
            .with_probe_timeout(self.timeout);
        AutosaveManager {
            inner: Arc::new(Inner {
                tasks: BackgroundTasks::new(self.observer.clone()),
                storage: self.storage,
                transport: self.transport,
                gate,
                emitter: self.emitter,
                lifecycle: self.lifecycle,
                clock: self.clock,
                observer: self.observer,
                rules: self.rules,
                debounce: self.debounce,
                ttl: self.ttl,
                timeout: self.timeout,
                page_path: self.page_path,
                state: Mutex::new(SessionState::default()),
                debouncer: Debouncer::default(),
            }),
        }
    }
}

/// Owner of one form's autosave session; cheap to clone
#[derive(Clone)]
pub struct AutosaveManager {
    inner: Arc<Inner>,
}

struct Inner {
    storage: Arc<dyn KeyValueStore>,
    transport: Arc<dyn DraftTransport>,
    gate: TrackingGate,
    emitter: Option<EventEmitter>,
    lifecycle: Option<Arc<PageLifecycle>>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ErrorObserver>,
    rules: FieldRules,
    debounce: Duration,
    ttl: chrono::Duration,
    timeout: Duration,
    page_path: String,
    state: Mutex<SessionState>,
    debouncer: Debouncer,
    tasks: BackgroundTasks,
}

impl AutosaveManager {
    /// Start building a manager
    ///
    /// `storage` holds the session record and should be the same persistent
    /// store the identity store probes.
    pub fn builder(
        identity: Arc<IdentityStore>,
        storage: Arc<dyn KeyValueStore>,
        transport: Arc<dyn DraftTransport>,
    ) -> AutosaveBuilder {
        AutosaveBuilder {
            identity,
            storage,
            transport,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
            breaker: BreakerConfig::default(),
            rules: FieldRules::default(),
            debounce: Duration::from_millis(300),
            ttl: chrono::Duration::hours(48),
            timeout: Duration::from_secs(3),
            emitter: None,
            lifecycle: None,
            page_path: "/valuation".to_string(),
        }
    }

    /// Restore a persisted session if it is younger than the TTL
    ///
    /// Returns the resumed token. Expired records are purged and the session
    /// stays pending.
    pub fn initialize_token(&self) -> Option<String> {
        self.inner.initialize_token()
    }

    /// Create the remote draft on the first meaningful field value
    ///
    /// Runs at most once per lifecycle: with a token already present it only
    /// returns that token. Values shorter than two characters, non-positive
    /// numbers and other trivial values are rejected with `None`.
    pub fn create_initial_valuation_on_first_field(
        &self,
        field: &str,
        value: Value,
        all_so_far: &EventData,
    ) -> Option<String> {
        self.inner.create_on_first_field(field, value, all_so_far)
    }

    /// Merge a partial update into the debounced write
    pub fn update_valuation(&self, partial: EventData, field: &str) {
        self.inner.update_valuation(partial, field);
    }

    /// Write a partial update now, bypassing the debounce window
    pub fn update_valuation_immediate(&self, partial: EventData, field: &str) {
        self.inner.update_immediate(partial, field);
    }

    /// Record the wizard position
    pub fn update_step(&self, step: u32) {
        self.inner.update_step(step);
    }

    /// Send the terminal payload; on success the session stops accepting updates
    pub fn finalize_valuation(&self, final_data: EventData) {
        self.inner.finalize(final_data);
    }

    /// Cancel the pending timer and write its payload now
    pub fn flush_pending_updates(&self) {
        self.inner.flush_pending();
    }

    /// Forget the session locally and return to `Uninitialized`
    pub fn clear_autosave(&self) {
        self.inner.clear();
    }

    pub fn session(&self) -> AutosaveSession {
        self.inner.state().snapshot()
    }

    pub fn token(&self) -> Option<String> {
        self.inner.state().token.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state().phase
    }

    pub fn has_pending_update(&self) -> bool {
        self.inner.debouncer.is_pending()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.inner.gate.state()
    }

    /// Wait for in-flight writes (not the debounce timer), up to `limit`
    pub async fn settle(&self, limit: Duration) -> bool {
        self.inner.tasks.settle(limit).await
    }
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn initialize_token(self: &Arc<Self>) -> Option<String> {
        let now = self.clock.now();
        let mut state = self.state();
        if state.token.is_some() {
            return state.token.clone();
        }

        match session::load(self.storage.as_ref(), now, self.ttl) {
            Ok(Restored::Fresh(saved)) => {
                // Rebase so elapsed time continues from the previous visit
                state.start_time = Some(now - chrono::Duration::seconds(saved.time_spent_seconds));
                state.time_spent_seconds = saved.time_spent_seconds;
                state.issued_at = saved.saved_at();
                state.token = Some(saved.token.clone());
                state.phase = SessionPhase::Active;
                drop(state);

                tracing::info!(token = %saved.token, "resumed autosave session");
                self.arm_exit_hook();
                Some(saved.token)
            }
            Ok(_) => {
                state.phase = SessionPhase::Pending;
                None
            }
            Err(e) => {
                state.phase = SessionPhase::Pending;
                drop(state);
                self.observer.observe(FailureSource::SessionStorage, &e);
                None
            }
        }
    }

    fn create_on_first_field(
        self: &Arc<Self>,
        field: &str,
        value: Value,
        all_so_far: &EventData,
    ) -> Option<String> {
        if !fields::is_meaningful_value(&value) {
            return None;
        }

        if let Some(token) = self.state().token.clone() {
            return Some(token);
        }
        // Both checks may call the observer, which can read the session
        if !self.tasks.has_runtime() || !self.gate.admit() {
            tracing::debug!(field, "draft creation gated off");
            return None;
        }

        let mut state = self.state();
        if let Some(token) = &state.token {
            return Some(token.clone());
        }
        let now = self.clock.now();
        let token = uuid::Uuid::new_v4().to_string();
        state.token = Some(token.clone());
        state.issued_at = Some(now);
        state.start_time = Some(now);
        state.time_spent_seconds = 0;
        state.phase = SessionPhase::Active;
        state.saves_in_flight += 1;

        let mut snapshot = fields::populated_fields(all_so_far);
        snapshot.insert(field.to_string(), value);
        let mut snapshot = self.rules.normalize_all(snapshot);
        snapshot.insert(TIME_SPENT_KEY.to_string(), json!(0));
        snapshot.insert(CURRENT_STEP_KEY.to_string(), json!(state.current_step));
        drop(state);

        self.persist(&token, now, 0);
        self.arm_exit_hook();
        tracing::info!(token = %token, field, "created autosave session");

        let inner = self.clone();
        let request = DraftRequest {
            token: token.clone(),
            data: snapshot,
            is_initial_creation: Some(true),
        };
        self.tasks.spawn(async move {
            inner.write(request, FailureSource::DraftCreate).await;
        });
        Some(token)
    }

    /// Whether updates are accepted; a returning user resumes an abandoned session
    fn resume_for_update(&self) -> bool {
        let mut state = self.state();
        if state.phase == SessionPhase::Abandoned {
            state.phase = SessionPhase::Active;
        }
        state.phase.accepts_updates()
    }

    fn update_valuation(self: &Arc<Self>, partial: EventData, field: &str) {
        if !self.resume_for_update() {
            tracing::debug!(field, "ignoring update outside an active session");
            return;
        }

        let partial = self.rules.normalize_all(partial);
        if self.rules.is_immediate(field) {
            self.write_immediate(partial);
            return;
        }

        let generation = self.debouncer.push(partial, field);
        let weak: Weak<Inner> = Arc::downgrade(self);
        let quiet = self.debounce;
        let timer = self.tasks.spawn_untracked(async move {
            tokio::time::sleep(quiet).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(generation);
            }
        });
        if let Some(timer) = timer {
            self.debouncer.set_timer(generation, timer);
        }
    }

    fn update_immediate(self: &Arc<Self>, partial: EventData, field: &str) {
        if !self.resume_for_update() {
            tracing::debug!(field, "ignoring update outside an active session");
            return;
        }
        let partial = self.rules.normalize_all(partial);
        self.write_immediate(partial);
    }

    fn write_immediate(self: &Arc<Self>, partial: EventData) {
        // The pending payload must not later overwrite these fresher values
        self.debouncer.strip(partial.keys());
        self.launch_write(partial, FailureSource::DraftUpdate);
    }

    /// Debounce timer expiry
    fn fire(self: &Arc<Self>, generation: u64) {
        let Some(pending) = self.debouncer.take_if(generation) else {
            return;
        };
        if !self.launch_write(pending.payload, FailureSource::DraftUpdate) {
            tracing::debug!(field = %pending.field, "coalesced update dropped");
        }
    }

    fn update_step(self: &Arc<Self>, step: u32) {
        self.state().current_step = step;
        if self.resume_for_update() {
            let mut data = EventData::new();
            data.insert(CURRENT_STEP_KEY.to_string(), json!(step));
            self.launch_write(data, FailureSource::DraftUpdate);
        }
    }

    fn flush_pending(self: &Arc<Self>) {
        if let Some(pending) = self.debouncer.take() {
            if self.state().phase == SessionPhase::Finalized {
                return;
            }
            self.launch_write(pending.payload, FailureSource::DraftUpdate);
        }
    }

    fn finalize(self: &Arc<Self>, final_data: EventData) {
        if !self.state().phase.accepts_updates() {
            tracing::debug!("finalize ignored outside an active session");
            return;
        }

        // Pending edits stay queued unless the terminal write is admitted
        let Some(request) = self.prepare_write(|| {
            let mut data = self
                .debouncer
                .take()
                .map(|pending| pending.payload)
                .unwrap_or_default();
            data.extend(self.rules.normalize_all(final_data.clone()));
            data.insert(STATUS_KEY.to_string(), json!("completed"));
            data.insert(
                "completed_at".to_string(),
                json!(self.clock.now().to_rfc3339()),
            );
            data
        }) else {
            tracing::debug!("finalize gated off, pending edits kept");
            return;
        };
        let inner = self.clone();
        self.tasks.spawn(async move {
            let token = request.token.clone();
            if !inner.clone().write(request, FailureSource::DraftFinalize).await {
                return;
            }

            let listener = {
                let mut state = inner.state();
                if state.token.as_deref() != Some(token.as_str()) {
                    return;
                }
                state.phase = SessionPhase::Finalized;
                state.exit_listener.take()
            };
            if let (Some(id), Some(lifecycle)) = (listener, &inner.lifecycle) {
                lifecycle.unsubscribe(id);
            }
            tracing::info!(token = %token, "valuation finalized");

            if let Some(emitter) = &inner.emitter {
                let mut summary = final_data;
                summary.insert("token".to_string(), json!(token));
                emitter.track_valuation_completed(&inner.page_path, summary);
            }
        });
    }

    fn clear(self: &Arc<Self>) {
        self.debouncer.cancel();
        if let Err(e) = session::clear(self.storage.as_ref()) {
            self.observer.observe(FailureSource::SessionStorage, &e);
        }

        let listener = {
            let mut state = self.state();
            let listener = state.exit_listener.take();
            *state = SessionState::default();
            listener
        };
        if let (Some(id), Some(lifecycle)) = (listener, &self.lifecycle) {
            lifecycle.unsubscribe(id);
        }
        tracing::debug!("autosave session cleared");
    }

    /// Page is being hidden: one last write with the abandoned marker
    fn flush_on_exit(self: &Arc<Self>) {
        let pending = self.debouncer.take();

        let (token, time_spent, issued_at) = {
            let mut state = self.state();
            if !state.phase.accepts_updates() {
                return;
            }
            let Some(token) = state.token.clone() else {
                return;
            };
            state.phase = SessionPhase::Abandoned;
            let now = self.clock.now();
            (token, state.elapsed_seconds(now), state.issued_at.unwrap_or(now))
        };

        // Keep the accumulated time for the next visit
        self.persist(&token, issued_at, time_spent);

        let mut data = pending.map(|p| p.payload).unwrap_or_default();
        data.insert(STATUS_KEY.to_string(), json!("abandoned"));
        self.launch_write(data, FailureSource::ExitFlush);
    }

    fn on_page_visible(&self) {
        let mut state = self.state();
        if state.phase == SessionPhase::Abandoned {
            state.phase = SessionPhase::Active;
        }
    }

    /// Subscribe the exit flush once per active session
    fn arm_exit_hook(self: &Arc<Self>) {
        let Some(lifecycle) = &self.lifecycle else {
            return;
        };
        let mut state = self.state();
        if state.exit_listener.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        state.exit_listener = Some(lifecycle.subscribe(move |signal| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match signal {
                PageSignal::Hidden => inner.flush_on_exit(),
                PageSignal::Visible => inner.on_page_visible(),
            }
        }));
    }

    /// Gate a write, then build its payload with token and elapsed time
    ///
    /// `None` without a session token or when the gate refuses; `payload` is
    /// only evaluated once the write is admitted.
    fn prepare_write(&self, payload: impl FnOnce() -> EventData) -> Option<DraftRequest> {
        let token = self.state().token.clone()?;
        if !self.tasks.has_runtime() || !self.gate.admit() {
            tracing::trace!("draft write gated off");
            return None;
        }

        let mut data = payload();
        let mut state = self.state();
        let elapsed = state.elapsed_seconds(self.clock.now());
        data.insert(TIME_SPENT_KEY.to_string(), json!(elapsed));
        state.saves_in_flight += 1;
        Some(DraftRequest {
            token,
            data,
            is_initial_creation: None,
        })
    }

    /// Gate and launch a write; false when nothing was sent
    fn launch_write(self: &Arc<Self>, data: EventData, source: FailureSource) -> bool {
        let Some(request) = self.prepare_write(|| data) else {
            return false;
        };
        let inner = self.clone();
        self.tasks.spawn(async move {
            inner.write(request, source).await;
        })
    }

    /// Send one draft write and settle its bookkeeping; true on success
    async fn write(self: Arc<Self>, request: DraftRequest, source: FailureSource) -> bool {
        let transport = self.transport.clone();
        let sent_token = request.token.clone();
        let result = dispatch(self.timeout, async move {
            transport.upsert_draft(&request).await
        })
        .await;

        let now = self.clock.now();
        let ok = match result {
            Ok(response) => {
                self.gate.record_success();
                let adopted = response
                    .unique_token
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| sent_token.clone());
                self.adopt_token(&sent_token, adopted, now, source);
                true
            }
            Err(e) => {
                self.gate.record_failure();
                self.observer.observe(source, &e);
                false
            }
        };

        let mut state = self.state();
        state.saves_in_flight = state.saves_in_flight.saturating_sub(1);
        if ok {
            state.last_saved = Some(now);
        }
        ok
    }

    /// Make the server's token the session token if the session is unchanged
    fn adopt_token(&self, sent: &str, adopted: String, now: DateTime<Utc>, source: FailureSource) {
        let (issued_at, time_spent) = {
            let mut state = self.state();
            if state.token.as_deref() != Some(sent) {
                return;
            }
            let changed = adopted != sent;
            if !changed && source != FailureSource::DraftCreate {
                return;
            }
            if changed {
                tracing::info!(provisional = %sent, token = %adopted, "adopting server token");
                state.token = Some(adopted.clone());
            }
            state.issued_at = Some(now);
            (now, state.time_spent_seconds)
        };
        self.persist(&adopted, issued_at, time_spent);
    }

    fn persist(&self, token: &str, issued_at: DateTime<Utc>, time_spent_seconds: i64) {
        let record = PersistedSession::new(token.to_string(), issued_at, time_spent_seconds);
        if let Err(e) = session::save(self.storage.as_ref(), &record) {
            self.observer.observe(FailureSource::SessionStorage, &e);
        }
    }
}
