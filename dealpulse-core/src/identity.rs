//! Local identity store
//!
//! Derives and persists the pseudo-identifiers attached to every tracked
//! event. Persistent storage is probed before each use; when the probe fails
//! every identifier is generated fresh, never stored, and prefixed with
//! [`DEGRADED_PREFIX`] so degraded traffic is recognisable downstream.

use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::config::IdentityConfig;
use crate::storage::{self, KeyValueStore};

/// Persistent key for the durable visitor id
pub const VISITOR_ID_KEY: &str = "dealpulse.visitor_id";
/// Session-scoped key for the session id
pub const SESSION_ID_KEY: &str = "dealpulse.session_id";
/// Persistent key for the detected company domain
pub const COMPANY_DOMAIN_KEY: &str = "dealpulse.company_domain";
/// Prefix of identifiers minted while storage is unavailable
pub const DEGRADED_PREFIX: &str = "temp_";

/// Search engines, social networks and webmail hosts that never identify a company
const NON_CORPORATE_DOMAINS: &[&str] = &[
    "google.",
    "bing.com",
    "yahoo.",
    "duckduckgo.com",
    "baidu.com",
    "yandex.",
    "ecosia.org",
    "facebook.com",
    "fb.com",
    "instagram.com",
    "twitter.com",
    "x.com",
    "t.co",
    "linkedin.com",
    "lnkd.in",
    "youtube.com",
    "reddit.com",
    "pinterest.com",
    "tiktok.com",
    "gmail.com",
    "outlook.com",
    "live.com",
];

/// Identity attached to tracked events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisitorIdentity {
    pub visitor_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_domain: Option<String>,
}

/// Derives visitor, session and company-domain identifiers
pub struct IdentityStore {
    persistent: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    referrer: Option<String>,
    site_host: Option<String>,
    blocked_domains: Vec<String>,
}

impl IdentityStore {
    pub fn new(
        persistent: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            persistent,
            session,
            clock,
            referrer: None,
            site_host: None,
            blocked_domains: Vec::new(),
        }
    }

    /// Apply identity configuration
    pub fn with_config(mut self, config: &IdentityConfig) -> Self {
        self.site_host = config.site_host.as_ref().map(|h| normalize_host(h));
        self.blocked_domains = config
            .blocked_referrer_domains
            .iter()
            .map(|d| normalize_host(d))
            .collect();
        self
    }

    /// Referrer of the current page, as reported by the host
    pub fn with_referrer(mut self, referrer: Option<String>) -> Self {
        self.referrer = referrer.filter(|r| !r.trim().is_empty());
        self
    }

    pub fn referrer(&self) -> Option<&str> {
        self.referrer.as_deref()
    }

    /// Whether persistent storage currently accepts writes
    pub fn storage_available(&self) -> bool {
        storage::probe(self.persistent.as_ref())
    }

    /// Durable visitor id, or a fresh degraded id when storage is unavailable
    pub fn get_or_create_visitor_id(&self) -> String {
        if !self.storage_available() {
            return self.degraded_id("visitor");
        }
        self.read_or_create(self.persistent.as_ref(), VISITOR_ID_KEY, "visitor")
    }

    /// Session-scoped id, or a fresh degraded id when either store is unavailable
    pub fn get_or_create_session_id(&self) -> String {
        if !self.storage_available() || !storage::probe(self.session.as_ref()) {
            return self.degraded_id("session");
        }
        self.read_or_create(self.session.as_ref(), SESSION_ID_KEY, "session")
    }

    /// Company domain from cache or referrer
    ///
    /// Only a referrer outside the non-corporate list is adopted, and it is
    /// cached so later pages without a referrer keep the attribution.
    pub fn detect_company_domain(&self) -> Option<String> {
        let available = self.storage_available();

        if available {
            match self.persistent.get(COMPANY_DOMAIN_KEY) {
                Ok(Some(domain)) if !domain.is_empty() => return Some(domain),
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "failed to read cached company domain"),
            }
        }

        let host = referrer_host(self.referrer.as_deref()?)?;
        if !self.is_corporate(&host) {
            return None;
        }

        if available {
            if let Err(e) = self.persistent.set(COMPANY_DOMAIN_KEY, &host) {
                tracing::debug!(error = %e, "failed to cache company domain");
            }
        }
        Some(host)
    }

    /// Full identity for one event
    pub fn identity(&self) -> VisitorIdentity {
        VisitorIdentity {
            visitor_id: self.get_or_create_visitor_id(),
            session_id: self.get_or_create_session_id(),
            company_domain: self.detect_company_domain(),
        }
    }

    fn read_or_create(&self, store: &dyn KeyValueStore, key: &str, kind: &str) -> String {
        match store.get(key) {
            Ok(Some(id)) if !id.is_empty() => return id,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(key, error = %e, "identity read failed");
                return self.degraded_id(kind);
            }
        }

        let id = self.new_id(kind);
        if let Err(e) = store.set(key, &id) {
            tracing::debug!(key, error = %e, "identity write failed");
            return self.degraded_id(kind);
        }
        id
    }

    /// `<kind>_<unix millis>_<random suffix>`
    fn new_id(&self, kind: &str) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}_{}_{}",
            kind,
            self.clock.now().timestamp_millis(),
            &suffix[..9]
        )
    }

    fn degraded_id(&self, kind: &str) -> String {
        format!("{}{}", DEGRADED_PREFIX, self.new_id(kind))
    }

    fn is_corporate(&self, host: &str) -> bool {
        if self.site_host.as_deref() == Some(host) {
            return false;
        }
        let blocked = |pattern: &str| {
            if pattern.ends_with('.') {
                host.starts_with(pattern) || host.contains(&format!(".{}", pattern))
            } else {
                host == pattern || host.ends_with(&format!(".{}", pattern))
            }
        };
        !NON_CORPORATE_DOMAINS.iter().any(|p| blocked(p))
            && !self.blocked_domains.iter().any(|p| blocked(p))
    }
}

/// Lowercased host of a referrer URL without a leading `www.`
fn referrer_host(referrer: &str) -> Option<String> {
    let url = url::Url::parse(referrer).ok()?;
    let host = url.host_str()?;
    let host = normalize_host(host);
    if host.is_empty() || !host.contains('.') {
        return None;
    }
    Some(host)
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}
