//! Rolling per-device sample buffer
//!
//! Each device keeps the cumulative readings from the trailing hour. Samples
//! are appended at the tail and evicted from the head once they fall out of
//! the window, so the buffer stays bounded regardless of message rate.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Retention span of the buffer in minutes (also the `rain_last_hour` window).
pub const WINDOW_MINUTES: i64 = 60;

/// A single cumulative gauge reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Time-bounded buffer of (timestamp, cumulative) samples for one device.
///
/// Samples are expected to arrive with ascending timestamps; late arrivals are
/// still appended at the tail and head-of-buffer queries scan in stored order.
#[derive(Debug, Clone, Default)]
pub struct SampleWindow {
    samples: VecDeque<Sample>,
}

impl SampleWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample at the tail, then drop head samples older than one
    /// window behind the appended timestamp.
    pub fn append(&mut self, timestamp: DateTime<Utc>, value: f64) {
        self.samples.push_back(Sample { timestamp, value });

        let cutoff = timestamp - Duration::minutes(WINDOW_MINUTES);
        while self
            .samples
            .front()
            .map_or(false, |sample| sample.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
    }

    /// Earliest retained sample with `timestamp >= cutoff`, if any.
    pub fn first_at_or_after(&self, cutoff: DateTime<Utc>) -> Option<Sample> {
        self.samples
            .iter()
            .find(|sample| sample.timestamp >= cutoff)
            .copied()
    }

    /// Most recently appended sample.
    pub fn latest(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
