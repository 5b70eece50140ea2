//! Debounce coalescer
//!
//! Holds at most one pending update. Every push merges into the pending
//! payload (last write wins per key) and supersedes the running timer; the
//! generation counter lets a timer that lost the race recognise it is stale.

use std::sync::Mutex;

use tokio::task::JoinHandle;

use crate::envelope::EventData;

/// Latest merged payload waiting for its quiet period to end
#[derive(Debug)]
pub struct PendingUpdate {
    pub payload: EventData,
    /// Field whose change scheduled the latest timer
    pub field: String,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct DebounceState {
    generation: u64,
    pending: Option<PendingUpdate>,
}

#[derive(Debug, Default)]
pub(crate) struct Debouncer {
    state: Mutex<DebounceState>,
}

impl Debouncer {
    fn state(&self) -> std::sync::MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Merge `partial` into the pending payload and cancel the running timer
    ///
    /// Returns the generation the replacement timer must be armed with.
    pub(crate) fn push(&self, partial: EventData, field: &str) -> u64 {
        let mut state = self.state();
        state.generation += 1;
        let generation = state.generation;

        let mut payload = match state.pending.take() {
            Some(mut previous) => {
                if let Some(timer) = previous.timer.take() {
                    timer.abort();
                }
                previous.payload
            }
            None => EventData::new(),
        };
        payload.extend(partial);

        state.pending = Some(PendingUpdate {
            payload,
            field: field.to_string(),
            generation,
            timer: None,
        });
        generation
    }

    /// Attach the timer for `generation`; a superseded timer is aborted
    pub(crate) fn set_timer(&self, generation: u64, timer: JoinHandle<()>) {
        let mut state = self.state();
        match state.pending.as_mut() {
            Some(pending) if pending.generation == generation => pending.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Take the pending update if `generation` is still the latest
    pub(crate) fn take_if(&self, generation: u64) -> Option<PendingUpdate> {
        let mut state = self.state();
        match state.pending.as_ref() {
            Some(pending) if pending.generation == generation => {
                let mut pending = state.pending.take()?;
                // Called from the timer itself; dropping the handle detaches it
                pending.timer = None;
                Some(pending)
            }
            _ => None,
        }
    }

    /// Cancel the timer and take the pending update
    pub(crate) fn take(&self) -> Option<PendingUpdate> {
        let mut pending = self.state().pending.take()?;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        Some(pending)
    }

    /// Drop the pending update without writing it
    pub(crate) fn cancel(&self) -> bool {
        self.take().is_some()
    }

    /// Remove keys that were just written through another path
    pub(crate) fn strip<'a>(&self, keys: impl IntoIterator<Item = &'a String>) {
        let mut state = self.state();
        if let Some(pending) = state.pending.as_mut() {
            for key in keys {
                pending.payload.remove(key);
            }
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state().pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partial(pairs: &[(&str, serde_json::Value)]) -> EventData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_push_merges_last_write_wins() {
        let debouncer = Debouncer::default();
        debouncer.push(partial(&[("company_name", json!("Ac"))]), "company_name");
        debouncer.push(partial(&[("company_name", json!("Acme"))]), "company_name");
        let latest = debouncer.push(partial(&[("revenue", json!(1_200_000))]), "revenue");

        let pending = debouncer.take_if(latest).unwrap();
        assert_eq!(pending.field, "revenue");
        assert_eq!(pending.payload["company_name"], json!("Acme"));
        assert_eq!(pending.payload["revenue"], json!(1_200_000));
        assert!(!debouncer.is_pending());
    }

    #[test]
    fn test_stale_generation_cannot_take() {
        let debouncer = Debouncer::default();
        let first = debouncer.push(partial(&[("a", json!(1))]), "a");
        let second = debouncer.push(partial(&[("b", json!(2))]), "b");

        assert!(debouncer.take_if(first).is_none());
        assert!(debouncer.is_pending());
        assert!(debouncer.take_if(second).is_some());
    }

    #[test]
    fn test_strip_and_cancel() {
        let debouncer = Debouncer::default();
        debouncer.push(
            partial(&[("email", json!("old@acme.com")), ("industry", json!("SaaS"))]),
            "industry",
        );
        debouncer.strip([&"email".to_string()]);

        let pending = debouncer.take().unwrap();
        assert!(!pending.payload.contains_key("email"));
        assert_eq!(pending.payload["industry"], json!("SaaS"));

        assert!(!debouncer.cancel());
    }

    #[tokio::test]
    async fn test_superseded_timer_is_aborted() {
        let debouncer = Debouncer::default();
        let first = debouncer.push(partial(&[("a", json!(1))]), "a");
        let timer = tokio::spawn(std::future::pending::<()>());
        debouncer.set_timer(first, timer);

        debouncer.push(partial(&[("b", json!(2))]), "b");
        let late = tokio::spawn(std::future::pending::<()>());
        let late_abort = late.abort_handle();
        debouncer.set_timer(first, late);

        for _ in 0..10 {
            if late_abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(late_abort.is_finished());
    }
}
