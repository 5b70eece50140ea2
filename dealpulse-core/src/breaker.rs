//! Circuit breaker and tracking gate
//!
//! The breaker is an owned state object mutated only through
//! [`CircuitBreaker::record_failure`] and [`CircuitBreaker::record_success`].
//! Open windows close lazily when a write is admitted; no background timer
//! is involved. [`TrackingGate::should_allow_tracking`] only reads the state.
//!
//! ```text
//! Closed(n) --n >= trip--> Open(until) --window elapsed--> probe --success--> Closed(0)
//!     \                                                      \--failure--> Open(longer)
//!      \--n >= disable_threshold (from any state)--> Disabled (terminal)
//! ```

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::identity::IdentityStore;

/// Snapshot of the breaker counters
///
/// `is_disabled` implies `is_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BreakerState {
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub is_open: bool,
    pub is_disabled: bool,
}

/// Coarse phase, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed { failure_count: u32 },
    Open { until: DateTime<Utc> },
    Disabled,
}

/// Consecutive-failure breaker with exponential backoff and a disable latch
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    /// When the single retry after an open window was admitted, until it reports
    probe_started: Option<DateTime<Utc>>,
    /// Hard timeout of one remote write; bounds how long a retry may hold its slot
    probe_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::default(),
            probe_started: None,
            probe_timeout: Duration::seconds(3),
        }
    }

    /// Timeout of the writes this breaker guards
    pub fn with_probe_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.set_probe_timeout(timeout);
        self
    }

    fn set_probe_timeout(&mut self, timeout: std::time::Duration) {
        self.probe_timeout = Duration::from_std(timeout).unwrap_or(self.probe_timeout);
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn phase(&self) -> BreakerPhase {
        if self.state.is_disabled {
            BreakerPhase::Disabled
        } else if let (true, Some(last)) = (self.state.is_open, self.state.last_failure_time) {
            BreakerPhase::Open {
                until: last + self.backoff(),
            }
        } else {
            BreakerPhase::Closed {
                failure_count: self.state.failure_count,
            }
        }
    }

    /// `min(max_backoff, base_backoff * 2^failure_count)`
    pub fn backoff(&self) -> Duration {
        let factor = 1u64
            .checked_shl(self.state.failure_count)
            .unwrap_or(u64::MAX);
        let ms = self
            .config
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.config.max_backoff_ms);
        Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }

    /// Whether a write would be admitted at `now`; never claims the retry slot
    pub fn would_allow(&self, now: DateTime<Utc>) -> bool {
        if self.state.is_disabled {
            return false;
        }
        if self.state.is_open {
            return match self.state.last_failure_time {
                Some(last) => now - last >= self.backoff(),
                None => false,
            };
        }
        match self.probe_started {
            Some(started) => self.probe_expired(started, now),
            None => true,
        }
    }

    /// Admit one remote write at `now`
    ///
    /// The first write after an open window takes the single retry slot.
    /// The slot is released by its outcome, or once a full timeout plus
    /// backoff has passed without one (the write was lost).
    pub(crate) fn allow(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.is_disabled {
            return false;
        }

        if self.state.is_open {
            let last = match self.state.last_failure_time {
                Some(last) => last,
                None => return false,
            };
            if now - last < self.backoff() {
                return false;
            }
            self.state.is_open = false;
            self.probe_started = Some(now);
            tracing::debug!(
                failure_count = self.state.failure_count,
                "breaker window elapsed, admitting one retry"
            );
            return true;
        }

        if let Some(started) = self.probe_started {
            if !self.probe_expired(started, now) {
                return false;
            }
            tracing::debug!(
                failure_count = self.state.failure_count,
                "retry never reported back, releasing its slot"
            );
            self.probe_started = None;
        }
        true
    }

    fn probe_expired(&self, started: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - started >= self.probe_timeout + self.backoff()
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        if self.state.is_disabled {
            return;
        }

        self.probe_started = None;
        self.state.failure_count = self.state.failure_count.saturating_add(1);
        self.state.last_failure_time = Some(now);

        if self.state.failure_count >= self.config.disable_threshold {
            self.state.is_open = true;
            self.state.is_disabled = true;
            tracing::warn!(
                failure_count = self.state.failure_count,
                "remote writes disabled for this process after repeated failures"
            );
        } else if self.state.failure_count >= self.config.trip_threshold {
            self.state.is_open = true;
            tracing::debug!(
                failure_count = self.state.failure_count,
                backoff_ms = self.backoff().num_milliseconds(),
                "breaker open"
            );
        }
    }

    /// Reset to `Closed(0)`; a disabled breaker stays disabled
    pub fn record_success(&mut self) {
        if self.state.is_disabled {
            return;
        }
        self.state = BreakerState::default();
        self.probe_started = None;
    }
}

/// Single gate consulted before every remote write
///
/// Refuses while persistent storage is unavailable (privacy settings) even
/// with a healthy breaker.
pub struct TrackingGate {
    breaker: Mutex<CircuitBreaker>,
    identity: Arc<IdentityStore>,
    clock: Arc<dyn Clock>,
}

impl TrackingGate {
    pub fn new(config: BreakerConfig, identity: Arc<IdentityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            breaker: Mutex::new(CircuitBreaker::new(config)),
            identity,
            clock,
        }
    }

    /// Timeout of the writes behind this gate
    pub fn with_probe_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.breaker
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .set_probe_timeout(timeout);
        self
    }

    /// Whether tracking is currently allowed; a pure query
    pub fn should_allow_tracking(&self) -> bool {
        if !self.identity.storage_available() {
            tracing::trace!("tracking gated off: storage unavailable");
            return false;
        }
        let now = self.clock.now();
        self.breaker().would_allow(now)
    }

    /// Claim admission for one remote write about to be sent
    pub(crate) fn admit(&self) -> bool {
        if !self.identity.storage_available() {
            tracing::trace!("tracking gated off: storage unavailable");
            return false;
        }
        let now = self.clock.now();
        self.breaker().allow(now)
    }

    pub fn record_success(&self) {
        self.breaker().record_success();
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        self.breaker().record_failure(now);
    }

    pub fn state(&self) -> BreakerState {
        self.breaker().state()
    }

    pub fn phase(&self) -> BreakerPhase {
        self.breaker().phase()
    }

    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.identity
    }

    fn breaker(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        // Transitions are single assignments; a poisoned lock still holds a valid state
        self.breaker.lock().unwrap_or_else(|e| e.into_inner())
    }
}
