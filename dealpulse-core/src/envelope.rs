//! Event envelope sent to the ingestion endpoint
//!
//! One envelope per emitted event. Envelopes are built once, never mutated,
//! and never stored locally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::identity::VisitorIdentity;

/// Arbitrary per-event payload
pub type EventData = serde_json::Map<String, serde_json::Value>;

/// Campaign attribution parsed from the page URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmParams {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
}

impl UtmParams {
    /// Read `utm_source`, `utm_medium` and `utm_campaign` from a query string
    pub fn from_url(url: &Url) -> Self {
        let mut params = UtmParams::default();
        for (key, value) in url.query_pairs() {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "utm_source" => &mut params.source,
                "utm_medium" => &mut params.medium,
                "utm_campaign" => &mut params.campaign,
                _ => continue,
            };
            // First occurrence wins
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }
        params
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.medium.is_none() && self.campaign.is_none()
    }
}

/// Immutable description of one tracked event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub visitor_id: String,
    pub session_id: String,
    pub event_type: String,
    pub page_path: String,
    pub event_data: EventData,
    /// Lead-scoring weight of the event
    pub points_awarded: u32,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
}

/// Inputs of [`EventEnvelope::build`] that come from the caller
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub page_path: String,
    pub event_data: EventData,
    pub points_awarded: u32,
}

impl EventEnvelope {
    pub fn build(
        event: NewEvent,
        identity: VisitorIdentity,
        referrer: Option<String>,
        utm: UtmParams,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        EventEnvelope {
            visitor_id: identity.visitor_id,
            session_id: identity.session_id,
            event_type: event.event_type,
            page_path: event.page_path,
            event_data: event.event_data,
            points_awarded: event.points_awarded,
            occurred_at,
            company_domain: identity.company_domain,
            referrer,
            utm_source: utm.source,
            utm_medium: utm.medium,
            utm_campaign: utm.campaign,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_utm_params_from_url() {
        let url = Url::parse(
            "https://advisors.example/valuation?utm_source=linkedin&utm_medium=paid&utm_campaign=q3%20owners&ref=x",
        )
        .unwrap();
        let utm = UtmParams::from_url(&url);
        assert_eq!(utm.source.as_deref(), Some("linkedin"));
        assert_eq!(utm.medium.as_deref(), Some("paid"));
        assert_eq!(utm.campaign.as_deref(), Some("q3 owners"));
    }

    #[test]
    fn test_utm_params_ignore_blank_and_duplicates() {
        let url =
            Url::parse("https://advisors.example/?utm_source=&utm_medium=email&utm_medium=ads")
                .unwrap();
        let utm = UtmParams::from_url(&url);
        assert_eq!(utm.source, None);
        assert_eq!(utm.medium.as_deref(), Some("email"));
        assert!(UtmParams::from_url(&Url::parse("https://advisors.example/").unwrap()).is_empty());
    }

    #[test]
    fn test_envelope_serialization_skips_missing_attribution() {
        let mut data = EventData::new();
        data.insert("label".to_string(), json!("Book a call"));

        let envelope = EventEnvelope::build(
            NewEvent {
                event_type: "cta_click".to_string(),
                page_path: "/sell-your-business".to_string(),
                event_data: data,
                points_awarded: 5,
            },
            VisitorIdentity {
                visitor_id: "visitor_1".to_string(),
                session_id: "session_1".to_string(),
                company_domain: None,
            },
            None,
            UtmParams {
                source: Some("newsletter".to_string()),
                ..Default::default()
            },
            Utc::now(),
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["event_type"], "cta_click");
        assert_eq!(value["event_data"]["label"], "Book a call");
        assert_eq!(value["points_awarded"], 5);
        assert_eq!(value["utm_source"], "newsletter");
        assert!(value.get("company_domain").is_none());
        assert!(value.get("utm_medium").is_none());
    }
}
