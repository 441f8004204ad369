//! Daily accounting baseline per device
//!
//! The baseline is the cumulative reading treated as "zero" for the current
//! day. It moves only here: on the first sample ever seen for a device, on
//! the first sample after local midnight, or when the device counter runs
//! backwards (reboot or counter wrap).

use crate::time;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Baseline {
    /// Cumulative reading at the start of the current accounting day.
    pub value: Option<f64>,
    /// When the baseline was last set.
    pub set_at: Option<DateTime<Utc>>,
}

impl Baseline {
    /// Decide whether this sample starts a new accounting period, and if so
    /// take its cumulative value as the new baseline.
    ///
    /// Must be called before the sample is appended to the device's window;
    /// `last_value` is the most recently stored cumulative reading, used for
    /// counter-rollback detection. Returns true when the baseline moved.
    pub fn maybe_reset(
        &mut self,
        last_value: Option<f64>,
        cumulative: f64,
        timestamp: DateTime<Utc>,
        tz: Tz,
    ) -> bool {
        let midnight = time::local_midnight(timestamp, tz);

        // At most one rollover per calendar day: only fires while the stored
        // baseline still predates today's midnight.
        let day_rolled_over = match self.set_at {
            Some(set_at) => set_at < midnight,
            None => true,
        };
        let counter_rollback = last_value.map_or(false, |last| cumulative < last);

        if self.value.is_none() || day_rolled_over || counter_rollback {
            self.value = Some(cumulative);
            self.set_at = Some(timestamp);
            return true;
        }
        false
    }
}
