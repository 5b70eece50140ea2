//! Persisted autosave session record
//!
//! The draft token is stored with the time it was issued so a returning
//! visitor resumes the same draft until the TTL runs out.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::KeyValueStore;

/// Persistent key of the autosave session
pub const SESSION_KEY: &str = "dealpulse.valuation_session";

/// Stored form of a resumable session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub token: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub time_spent_seconds: i64,
}

impl PersistedSession {
    pub fn new(token: String, saved_at: DateTime<Utc>, time_spent_seconds: i64) -> Self {
        Self {
            token,
            timestamp: saved_at.timestamp_millis(),
            time_spent_seconds,
        }
    }

    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    /// Fresh while `now - saved_at < ttl`; unreadable timestamps are stale
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.saved_at()
            .map(|saved| now - saved < ttl)
            .unwrap_or(false)
    }
}

/// Outcome of reading the persisted record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restored {
    Fresh(PersistedSession),
    /// Expired or corrupt; already purged
    Stale,
    Missing,
}

/// Read the record, purging it when it is expired or unreadable
pub fn load(store: &dyn KeyValueStore, now: DateTime<Utc>, ttl: Duration) -> Result<Restored> {
    let Some(raw) = store.get(SESSION_KEY)? else {
        return Ok(Restored::Missing);
    };

    match serde_json::from_str::<PersistedSession>(&raw) {
        Ok(session) if !session.token.is_empty() && session.is_fresh(now, ttl) => {
            Ok(Restored::Fresh(session))
        }
        Ok(session) => {
            tracing::debug!(token = %session.token, "discarding expired autosave session");
            store.remove(SESSION_KEY)?;
            Ok(Restored::Stale)
        }
        Err(e) => {
            tracing::debug!(error = %e, "discarding unreadable autosave session");
            store.remove(SESSION_KEY)?;
            Ok(Restored::Stale)
        }
    }
}

pub fn save(store: &dyn KeyValueStore, session: &PersistedSession) -> Result<()> {
    let raw = serde_json::to_string(session)?;
    store.set(SESSION_KEY, &raw)
}

pub fn clear(store: &dyn KeyValueStore) -> Result<()> {
    store.remove(SESSION_KEY)
}
