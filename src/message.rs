//! Inbound payload parsing and outbound payload construction
//!
//! Devices publish either a JSON object with the cumulative gauge reading
//! nested under `aws.rain`, a flat `{"rain": <mm>}` object, or a bare numeric
//! payload. Payloads the aggregator itself republished carry an `_agg` marker
//! and are dropped before they can feed back into the pipeline.

use crate::metrics::DerivedMetrics;
use crate::time;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};

/// Version stamped into the `_agg` loop-prevention marker.
const MARKER_VERSION: u64 = 1;

#[derive(Debug)]
pub enum PayloadError {
    Empty,
    Json(serde_json::Error),
    MissingRain,
    NonNumericRain(String),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::Empty => write!(f, "empty payload"),
            PayloadError::Json(e) => write!(f, "invalid JSON: {}", e),
            PayloadError::MissingRain => write!(f, "payload has no rain value"),
            PayloadError::NonNumericRain(raw) => write!(f, "non-numeric rain value: {}", raw),
        }
    }
}

impl std::error::Error for PayloadError {}

impl From<serde_json::Error> for PayloadError {
    fn from(err: serde_json::Error) -> Self {
        PayloadError::Json(err)
    }
}

/// Successfully parsed inbound message.
#[derive(Debug)]
pub enum Inbound {
    Reading(Reading),
    /// Carried the aggregator's own `_agg` marker; must not be reprocessed.
    SelfPublished,
}

/// A cumulative gauge reading extracted from one message.
#[derive(Debug, Clone)]
pub struct Reading {
    pub cumulative: f64,
    pub timestamp: DateTime<Utc>,
    /// Original JSON object, kept for enriched republication. Bare numeric
    /// payloads have nothing to enrich.
    pub original: Option<Value>,
}

/// Parse a raw payload into a gauge reading.
///
/// `now` is the ingestion-time fallback used when `ts` is absent or
/// unparseable. `aggregator_id` is matched against the `_agg.source` marker.
pub fn parse_payload(
    raw: &[u8],
    aggregator_id: &str,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Inbound, PayloadError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return Err(PayloadError::Empty);
    }

    if !text.starts_with('{') {
        // Bare numeric payload: the whole body is the cumulative reading
        let cumulative = text
            .parse::<f64>()
            .map_err(|_| PayloadError::NonNumericRain(text.to_string()))?;
        return Ok(Inbound::Reading(Reading {
            cumulative,
            timestamp: now,
            original: None,
        }));
    }

    let data: Value = serde_json::from_str(text)?;
    if is_self_published(&data, aggregator_id) {
        return Ok(Inbound::SelfPublished);
    }

    let rain = match data.get("aws").and_then(Value::as_object) {
        Some(aws) => aws.get("rain"),
        None => data.get("rain"),
    };
    let cumulative = numeric(rain.ok_or(PayloadError::MissingRain)?)?;

    let timestamp = data
        .get("ts")
        .and_then(|ts| parse_timestamp(ts, tz))
        .unwrap_or(now);

    Ok(Inbound::Reading(Reading {
        cumulative,
        timestamp,
        original: Some(data),
    }))
}

/// Serialize the standalone derived-metrics payload.
pub fn derived_payload(metrics: &DerivedMetrics) -> Result<String, serde_json::Error> {
    serde_json::to_string(metrics)
}

/// Inject the derived metrics into the original payload's `aws` object and
/// stamp the loop-prevention marker.
///
/// Returns None when the payload has no `aws` object to enrich (bare numeric
/// and flat payloads are only published on the derived topic).
pub fn enrich_payload(
    original: &Value,
    metrics: &DerivedMetrics,
    aggregator_id: &str,
) -> Option<String> {
    let mut data = original.clone();

    let aws = data.get_mut("aws")?.as_object_mut()?;
    aws.insert("rain_today".to_string(), json!(metrics.rain_today));
    aws.insert("rain_last_hour".to_string(), json!(metrics.rain_last_hour));
    aws.insert("rain_rate_10m".to_string(), json!(metrics.rain_rate_10m));

    data.as_object_mut()?.insert(
        "_agg".to_string(),
        json!({ "source": aggregator_id, "v": MARKER_VERSION }),
    );

    serde_json::to_string(&data).ok()
}

fn is_self_published(data: &Value, aggregator_id: &str) -> bool {
    data.get("_agg")
        .and_then(|marker| marker.get("source"))
        .and_then(Value::as_str)
        == Some(aggregator_id)
}

fn numeric(value: &Value) -> Result<f64, PayloadError> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| PayloadError::NonNumericRain(value.to_string()))
}

fn parse_timestamp(value: &Value, tz: Tz) -> Option<DateTime<Utc>> {
    if let Some(secs) = value.as_f64() {
        return time::from_epoch_seconds(secs);
    }
    value.as_str().and_then(|s| time::parse_iso(s, tz))
}
