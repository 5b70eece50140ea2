//! Field rule table for autosave
//!
//! Decides which write path a field takes and how its value is normalized
//! before it is merged into a payload.

use std::collections::HashMap;

use serde_json::Value;

use crate::envelope::EventData;

/// How a field reaches the draft endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    /// Coalesced through the debounce window
    Debounced,
    /// Written on its own right away
    Immediate,
}

type Normalizer = fn(&Value) -> Value;

#[derive(Clone)]
struct FieldRule {
    path: WritePath,
    normalizer: Option<Normalizer>,
}

/// Per-field write path and normalization rules
#[derive(Clone)]
pub struct FieldRules {
    rules: HashMap<String, FieldRule>,
}

impl FieldRules {
    /// Empty table: every field is debounced and kept as-is
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Default table with the given immediate fields plus phone normalization
    pub fn with_immediate_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rules = Self::empty();
        for field in ["phone", "phone_number", "contact_phone"] {
            rules = rules.normalize(field, normalize_phone);
        }
        for field in fields {
            rules = rules.immediate(field);
        }
        rules
    }

    /// Route `field` through the immediate path
    pub fn immediate(mut self, field: impl Into<String>) -> Self {
        self.rules
            .entry(field.into())
            .or_insert(FieldRule {
                path: WritePath::Debounced,
                normalizer: None,
            })
            .path = WritePath::Immediate;
        self
    }

    /// Normalize `field` with `normalizer` before merging
    pub fn normalize(mut self, field: impl Into<String>, normalizer: Normalizer) -> Self {
        self.rules
            .entry(field.into())
            .or_insert(FieldRule {
                path: WritePath::Debounced,
                normalizer: None,
            })
            .normalizer = Some(normalizer);
        self
    }

    pub fn write_path(&self, field: &str) -> WritePath {
        self.rules
            .get(field)
            .map(|r| r.path)
            .unwrap_or(WritePath::Debounced)
    }

    pub fn is_immediate(&self, field: &str) -> bool {
        self.write_path(field) == WritePath::Immediate
    }

    /// Apply normalizers to every known field in `data`
    pub fn normalize_all(&self, mut data: EventData) -> EventData {
        for (key, value) in data.iter_mut() {
            if let Some(normalizer) = self.rules.get(key).and_then(|r| r.normalizer) {
                *value = normalizer(value);
            }
        }
        data
    }
}

impl Default for FieldRules {
    fn default() -> Self {
        Self::with_immediate_fields(["email", "contact_email"])
    }
}

/// Canonical `+<digits>` phone format
///
/// Ten-digit numbers are assumed to be North American and get `+1`.
/// Non-string values and strings without digits are left untouched.
pub fn normalize_phone(value: &Value) -> Value {
    let Value::String(raw) = value else {
        return value.clone();
    };
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return value.clone();
    }
    let normalized = match digits.len() {
        10 => format!("+1{}", digits),
        11 if digits.starts_with('1') => format!("+{}", digits),
        _ if raw.trim_start().starts_with('+') => format!("+{}", digits),
        _ => digits,
    };
    Value::String(normalized)
}

/// Whether a value is substantial enough to start a draft
///
/// Strings need at least two non-blank characters, numbers must be positive.
pub fn is_meaningful_value(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim().chars().count() >= 2,
        Value::Number(n) => n.as_f64().map(|v| v > 0.0).unwrap_or(false),
        _ => false,
    }
}

/// Fields that carry a value (no nulls, empty strings or empty collections)
pub fn populated_fields(data: &EventData) -> EventData {
    data.iter()
        .filter(|(_, value)| match value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            _ => true,
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_rules() {
        let rules = FieldRules::default();
        assert!(rules.is_immediate("email"));
        assert!(rules.is_immediate("contact_email"));
        assert_eq!(rules.write_path("phone"), WritePath::Debounced);
        assert_eq!(rules.write_path("company_name"), WritePath::Debounced);
    }

    #[test]
    fn test_normalize_phone_formats() {
        assert_eq!(normalize_phone(&json!("(415) 555-0134")), json!("+14155550134"));
        assert_eq!(normalize_phone(&json!("1-415-555-0134")), json!("+14155550134"));
        assert_eq!(normalize_phone(&json!("+44 20 7946 0958")), json!("+442079460958"));
        assert_eq!(normalize_phone(&json!("555-0134")), json!("5550134"));
        assert_eq!(normalize_phone(&json!("n/a")), json!("n/a"));
        assert_eq!(normalize_phone(&json!(42)), json!(42));
    }

    #[test]
    fn test_normalize_all_only_touches_known_fields() {
        let rules = FieldRules::default();
        let mut data = EventData::new();
        data.insert("phone".to_string(), json!("415.555.0134"));
        data.insert("revenue".to_string(), json!("415.555.0134"));

        let data = rules.normalize_all(data);
        assert_eq!(data["phone"], json!("+14155550134"));
        assert_eq!(data["revenue"], json!("415.555.0134"));
    }

    #[test]
    fn test_meaningful_values() {
        assert!(is_meaningful_value(&json!("Ac")));
        assert!(!is_meaningful_value(&json!(" A ")));
        assert!(is_meaningful_value(&json!(1)));
        assert!(is_meaningful_value(&json!(0.5)));
        assert!(!is_meaningful_value(&json!(0)));
        assert!(!is_meaningful_value(&json!(-3)));
        assert!(!is_meaningful_value(&json!(null)));
        assert!(!is_meaningful_value(&json!(true)));
    }

    #[test]
    fn test_populated_fields() {
        let mut data = EventData::new();
        data.insert("company_name".to_string(), json!("Acme"));
        data.insert("industry".to_string(), json!(""));
        data.insert("revenue".to_string(), json!(null));
        data.insert("employees".to_string(), json!(0));
        data.insert("tags".to_string(), json!([]));

        let populated = populated_fields(&data);
        assert_eq!(populated.len(), 2);
        assert!(populated.contains_key("company_name"));
        assert!(populated.contains_key("employees"));
    }
}
