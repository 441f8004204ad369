//! State snapshot persistence
//!
//! The whole device map is written as one JSON document after every processed
//! message and read back wholesale at startup. The document shape (not the
//! storage medium) is the contract: per device, the baseline value, the
//! baseline timestamp as ISO-8601, and the sample list as (timestamp, value)
//! pairs.

use {
    crate::baseline::Baseline,
    crate::engine::DeviceState,
    crate::time,
    crate::window::SampleWindow,
    chrono_tz::Tz,
    serde::{Deserialize, Serialize},
    std::{collections::HashMap, fs, path::Path},
};

/// On-disk projection of one device's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedDeviceState {
    pub baseline_value: Option<f64>,
    pub baseline_ts_iso: Option<String>,
    pub samples: Vec<(String, f64)>,
}

/// Write the full state map to `path`, replacing any previous snapshot.
pub fn save_snapshot(
    states: &HashMap<String, DeviceState>,
    path: &str,
    tz: Tz,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot: HashMap<&String, PersistedDeviceState> = states
        .iter()
        .map(|(device_id, state)| (device_id, project(state, tz)))
        .collect();

    let json = serde_json::to_string(&snapshot)?;
    fs::write(path, json)?;

    log::debug!("Saved state for {} devices to {}", snapshot.len(), path);
    Ok(())
}

/// Load a snapshot written by [`save_snapshot`].
///
/// A missing file is a normal first run and yields an empty map; a corrupt
/// file surfaces as an error so the caller can log it and start fresh.
/// Samples with unparseable timestamps are skipped individually.
pub fn load_snapshot(
    path: &str,
    tz: Tz,
) -> Result<HashMap<String, DeviceState>, Box<dyn std::error::Error>> {
    if !Path::new(path).exists() {
        log::info!("No existing state file at {}", path);
        return Ok(HashMap::new());
    }

    let json = fs::read_to_string(path)?;
    let snapshot: HashMap<String, PersistedDeviceState> = serde_json::from_str(&json)?;

    let states = snapshot
        .into_iter()
        .map(|(device_id, persisted)| (device_id, restore(persisted, tz)))
        .collect::<HashMap<_, _>>();

    log::info!("Loaded state for {} devices from {}", states.len(), path);
    Ok(states)
}

fn project(state: &DeviceState, tz: Tz) -> PersistedDeviceState {
    PersistedDeviceState {
        baseline_value: state.baseline.value,
        baseline_ts_iso: state
            .baseline
            .set_at
            .map(|set_at| time::format_rfc3339(set_at, tz)),
        samples: state
            .window
            .iter()
            .map(|sample| (time::format_rfc3339(sample.timestamp, tz), sample.value))
            .collect(),
    }
}

fn restore(persisted: PersistedDeviceState, tz: Tz) -> DeviceState {
    let baseline = Baseline {
        value: persisted.baseline_value,
        set_at: persisted
            .baseline_ts_iso
            .as_deref()
            .and_then(|iso| time::parse_iso(iso, tz)),
    };

    let mut window = SampleWindow::new();
    for (iso, value) in persisted.samples {
        match time::parse_iso(&iso, tz) {
            Some(timestamp) => window.append(timestamp, value),
            None => log::warn!("Skipping sample with bad timestamp {:?}", iso),
        }
    }

    DeviceState { baseline, window }
}
