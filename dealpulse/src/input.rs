//! Parsing of `field=value` input and `--data` pairs

use anyhow::{bail, Context, Result};
use dealpulse_core::EventData;
use serde_json::{json, Value};

/// One line of autosave input
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Field { name: String, value: Value },
    Step(u32),
    Flush,
    Finalize,
    Clear,
    Blank,
}

pub fn parse_line(line: &str) -> Result<Line> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(Line::Blank);
    }

    if let Some(command) = line.strip_prefix(':') {
        let mut parts = command.split_whitespace();
        return match (parts.next(), parts.next()) {
            (Some("step"), Some(step)) => step
                .parse()
                .map(Line::Step)
                .with_context(|| format!("invalid step number: {}", step)),
            (Some("flush"), None) => Ok(Line::Flush),
            (Some("finalize"), None) => Ok(Line::Finalize),
            (Some("clear"), None) => Ok(Line::Clear),
            _ => bail!("unknown command: :{}", command),
        };
    }

    let (name, value) = split_pair(line)?;
    Ok(Line::Field {
        name: name.to_string(),
        value: parse_value(value),
    })
}

/// Integers and decimals become numbers, everything else a string
pub fn parse_value(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return json!(n);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => json!(f),
        _ => json!(raw),
    }
}

/// Collect `KEY=VALUE` arguments into event data
pub fn parse_pairs(pairs: &[String]) -> Result<EventData> {
    let mut data = EventData::new();
    for pair in pairs {
        let (key, value) = split_pair(pair)?;
        data.insert(key.to_string(), parse_value(value));
    }
    Ok(data)
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => bail!("expected KEY=VALUE, got '{}'", pair),
    }
}
