//! Event emitter
//!
//! The façade UI code calls to record page views, engagement time and
//! interactions. Every method returns immediately and never fails:
//!
//! 1. the [`TrackingGate`] is consulted synchronously; a refusal is a silent no-op
//! 2. the [`EventEnvelope`] is built from identity, referrer and UTM attribution
//! 3. the send runs on a background task under the hard timeout
//! 4. the outcome only moves breaker state; errors go to the [`ErrorObserver`]

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use url::Url;

use crate::breaker::{BreakerState, TrackingGate};
use crate::clock::{Clock, SystemClock};
use crate::config::{BreakerConfig, Config};
use crate::envelope::{EventData, EventEnvelope, NewEvent, UtmParams};
use crate::identity::IdentityStore;
use crate::lifecycle::{ListenerId, PageLifecycle, PageSignal};
use crate::observer::{ErrorObserver, FailureSource, TracingObserver};
use crate::tasks::BackgroundTasks;
use crate::transport::{dispatch, EventTransport};

/// Minimum time on page before a duration event is worth sending
pub const TIME_ON_PAGE_FLOOR_SECS: i64 = 30;
/// Ceiling of the time-on-page weight
pub const TIME_ON_PAGE_MAX_POINTS: u32 = 15;

pub const PAGE_VIEW_POINTS: u32 = 1;
pub const CTA_CLICK_POINTS: u32 = 5;
pub const CALCULATOR_STARTED_POINTS: u32 = 10;
pub const REPORT_DOWNLOAD_POINTS: u32 = 20;
pub const VALUATION_COMPLETED_POINTS: u32 = 50;

/// Builder for [`EventEmitter`]
pub struct EmitterBuilder {
    identity: Arc<IdentityStore>,
    transport: Arc<dyn EventTransport>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ErrorObserver>,
    breaker: BreakerConfig,
    timeout: Duration,
}

impl EmitterBuilder {
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

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Apply breaker and timeout settings from configuration
    pub fn config(self, config: &Config) -> Self {
        self.breaker(config.breaker.clone())
            .timeout(config.ingest.timeout())
    }

    /// Build the emitter; call inside a tokio runtime so later calls from
    /// other threads can still launch writes
    pub fn build(self) -> EventEmitter {
        let gate = TrackingGate::new(self.breaker, self.identity.clone(), self.clock.clone())
            .with_probe_timeout(self.timeout);
        EventEmitter {
            inner: Arc::new(EmitterInner {
                tasks: BackgroundTasks::new(self.observer.clone()),
                gate,
                identity: self.identity,
                transport: self.transport,
                clock: self.clock,
                observer: self.observer,
                timeout: self.timeout,
                location: Mutex::new(None),
                page_timer: Mutex::new(None),
            }),
        }
    }
}

/// Handle to the tracking pipeline; cheap to clone
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

struct EmitterInner {
    gate: TrackingGate,
    identity: Arc<IdentityStore>,
    transport: Arc<dyn EventTransport>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn ErrorObserver>,
    timeout: Duration,
    tasks: BackgroundTasks,
    /// Current page URL, source of UTM attribution
    location: Mutex<Option<Url>>,
    page_timer: Mutex<Option<PageTimer>>,
}

#[derive(Debug, Clone)]
struct PageTimer {
    page_path: String,
    started_at: DateTime<Utc>,
}

impl EventEmitter {
    pub fn builder(
        identity: Arc<IdentityStore>,
        transport: Arc<dyn EventTransport>,
    ) -> EmitterBuilder {
        EmitterBuilder {
            identity,
            transport,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
            breaker: BreakerConfig::default(),
            timeout: Duration::from_secs(3),
        }
    }

    /// Record the page URL that UTM parameters are read from
    pub fn set_location(&self, url: &str) {
        let parsed = match Url::parse(url) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::debug!(url, error = %e, "ignoring unparseable page URL");
                None
            }
        };
        *lock(&self.inner.location) = parsed;
    }

    /// Emit one event; fire-and-forget
    pub fn track_event(
        &self,
        event_type: &str,
        page_path: &str,
        event_data: EventData,
        points_awarded: u32,
    ) {
        let inner = &self.inner;
        if !inner.tasks.has_runtime() {
            return;
        }
        if !inner.gate.admit() {
            tracing::trace!(event_type, "tracking gated off");
            return;
        }

        let envelope = inner.envelope(NewEvent {
            event_type: event_type.to_string(),
            page_path: page_path.to_string(),
            event_data,
            points_awarded,
        });

        let delivery = self.inner.clone();
        inner.tasks.spawn(async move { delivery.deliver(envelope).await });
    }

    pub fn track_page_view(&self, page_path: &str) {
        let mut data = EventData::new();
        if let Some(url) = lock(&self.inner.location).as_ref() {
            data.insert("url".to_string(), json!(url.as_str()));
        }
        self.track_event("page_view", page_path, data, PAGE_VIEW_POINTS);
    }

    pub fn track_cta_click(&self, label: &str, page_path: &str) {
        let mut data = EventData::new();
        data.insert("label".to_string(), json!(label));
        self.track_event("cta_click", page_path, data, CTA_CLICK_POINTS);
    }

    pub fn track_calculator_started(&self, page_path: &str) {
        self.track_event(
            "valuation_started",
            page_path,
            EventData::new(),
            CALCULATOR_STARTED_POINTS,
        );
    }

    pub fn track_report_download(&self, page_path: &str, report: &str) {
        let mut data = EventData::new();
        data.insert("report".to_string(), json!(report));
        self.track_event("report_download", page_path, data, REPORT_DOWNLOAD_POINTS);
    }

    /// Completion side effect of a finalized valuation
    pub fn track_valuation_completed(&self, page_path: &str, summary: EventData) {
        self.track_event(
            "valuation_completed",
            page_path,
            summary,
            VALUATION_COMPLETED_POINTS,
        );
    }

    /// Start measuring time on `page_path`, replacing any running measurement
    pub fn start_time_on_page(&self, page_path: &str) {
        *lock(&self.inner.page_timer) = Some(PageTimer {
            page_path: page_path.to_string(),
            started_at: self.inner.clock.now(),
        });
    }

    /// Stop the running measurement and emit it if it crossed the floor
    ///
    /// Returns the elapsed seconds that were emitted.
    pub fn finish_time_on_page(&self) -> Option<i64> {
        self.inner.finish_time_on_page()
    }

    /// Measure time on `page_path` across lifecycle signals
    ///
    /// Hidden emits the measurement, visible starts a new one.
    pub fn attach_time_on_page(&self, lifecycle: &PageLifecycle, page_path: &str) -> ListenerId {
        self.start_time_on_page(page_path);
        let weak: Weak<EmitterInner> = Arc::downgrade(&self.inner);
        let path = page_path.to_string();
        lifecycle.subscribe(move |signal| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let emitter = EventEmitter { inner };
            match signal {
                PageSignal::Hidden => {
                    emitter.finish_time_on_page();
                }
                PageSignal::Visible => emitter.start_time_on_page(&path),
            }
        })
    }

    /// Snapshot of breaker counters
    pub fn breaker_state(&self) -> BreakerState {
        self.inner.gate.state()
    }

    /// Read-only view of the gate; writes are admitted separately
    pub fn should_allow_tracking(&self) -> bool {
        self.inner.gate.should_allow_tracking()
    }

    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.inner.identity
    }

    /// Wait for in-flight sends, up to `limit`
    pub async fn settle(&self, limit: Duration) -> bool {
        self.inner.tasks.settle(limit).await
    }

    pub fn in_flight(&self) -> usize {
        self.inner.tasks.in_flight()
    }
}

impl EmitterInner {
    fn envelope(&self, event: NewEvent) -> EventEnvelope {
        let utm = lock(&self.location)
            .as_ref()
            .map(UtmParams::from_url)
            .unwrap_or_default();
        EventEnvelope::build(
            event,
            self.identity.identity(),
            self.identity.referrer().map(str::to_string),
            utm,
            self.clock.now(),
        )
    }

    async fn deliver(self: Arc<Self>, envelope: EventEnvelope) {
        let transport = self.transport.clone();
        let event_type = envelope.event_type.clone();
        let result = dispatch(self.timeout, async move {
            transport.send_event(&envelope).await
        })
        .await;

        match result {
            Ok(()) => {
                self.gate.record_success();
                tracing::debug!(event_type = %event_type, "event delivered");
            }
            Err(e) => {
                self.gate.record_failure();
                self.observer.observe(FailureSource::EventTransport, &e);
            }
        }
    }

    fn finish_time_on_page(self: &Arc<Self>) -> Option<i64> {
        let timer = lock(&self.page_timer).take()?;
        let elapsed = (self.clock.now() - timer.started_at).num_seconds();
        if elapsed < TIME_ON_PAGE_FLOOR_SECS {
            return None;
        }

        let mut data = EventData::new();
        data.insert("seconds".to_string(), json!(elapsed));
        EventEmitter {
            inner: self.clone(),
        }
        .track_event(
            "time_on_page",
            &timer.page_path,
            data,
            time_on_page_points(elapsed),
        );
        Some(elapsed)
    }
}

/// `min(15, 3 * ceil(minutes))`, zero below the floor
pub fn time_on_page_points(elapsed_secs: i64) -> u32 {
    if elapsed_secs < TIME_ON_PAGE_FLOOR_SECS {
        return 0;
    }
    let minutes = (elapsed_secs + 59) / 60;
    u32::try_from(minutes.saturating_mul(3))
        .unwrap_or(u32::MAX)
        .min(TIME_ON_PAGE_MAX_POINTS)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
