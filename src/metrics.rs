//! Derived rain metric computation
//!
//! Pure window-boundary math over a device's baseline and sample buffer:
//! rain since local midnight, rain over the trailing hour, and an hourly
//! rate extrapolated from the trailing ten minutes.

use crate::baseline::Baseline;
use crate::time;
use crate::window::{SampleWindow, WINDOW_MINUTES};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// Span used for the rate extrapolation, in minutes.
pub const RATE_WINDOW_MINUTES: i64 = 10;

/// The three derived metrics, shaped as the outbound JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedMetrics {
    pub rain_today: f64,
    pub rain_last_hour: f64,
    pub rain_rate_10m: f64,
    pub updated_at: String,
}

/// Compute the derived metrics for a device as of `as_of`.
///
/// An empty window yields zeros. A device without a baseline reports zero
/// rain for the day (its latest reading stands in for the baseline).
pub fn compute(
    baseline: &Baseline,
    window: &SampleWindow,
    as_of: DateTime<Utc>,
    tz: Tz,
) -> DerivedMetrics {
    let mut rain_today = 0.0;
    let mut rain_last_hour = 0.0;
    let mut rain_rate_10m = 0.0;

    if let Some(latest) = window.latest() {
        let base = baseline.value.unwrap_or(latest.value);
        rain_today = (latest.value - base).max(0.0);

        let hour_cutoff = as_of - Duration::minutes(WINDOW_MINUTES);
        if let Some(first) = window.first_at_or_after(hour_cutoff) {
            rain_last_hour = (latest.value - first.value).max(0.0);
        }

        let rate_cutoff = as_of - Duration::minutes(RATE_WINDOW_MINUTES);
        if let Some(first) = window.first_at_or_after(rate_cutoff) {
            let elapsed_ms = (as_of - first.timestamp).num_milliseconds();
            if elapsed_ms > 0 {
                let delta = (latest.value - first.value).max(0.0);
                // Clamp the divisor so a near-instant pair of samples cannot
                // explode into an absurd hourly rate.
                let minutes = (elapsed_ms as f64 / 60_000.0).max(1.0);
                rain_rate_10m = delta / minutes * 60.0;
            }
        }
    }

    DerivedMetrics {
        rain_today: round3(rain_today),
        rain_last_hour: round3(rain_last_hour),
        rain_rate_10m: round3(rain_rate_10m),
        updated_at: time::format_rfc3339(as_of, tz),
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
