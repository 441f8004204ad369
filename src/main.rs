//! rainflow — rolling rain metrics from cumulative gauge readings
//!
//! Weather stations publish a cumulative rain counter over MQTT. rainflow
//! subscribes to those data topics, tracks per-device baselines and a
//! trailing sample window, and derives three rolling metrics per reading:
//!
//! - `rain_today` — rain since local midnight in the configured time zone
//! - `rain_last_hour` — rain over the trailing 60 minutes
//! - `rain_rate_10m` — hourly rate extrapolated from the trailing 10 minutes
//!
//! Derived values are republished (as a standalone metrics message and/or
//! merged back into the device's data payload) and the full per-device state
//! is checkpointed to a JSON file after every message so restarts resume
//! mid-stream.
//!
//! ## Environment variables
//!
//! - MQTT_HOST / MQTT_PORT - Broker address (default: localhost:1883)
//! - MQTT_USERNAME / MQTT_PASSWORD - Credentials (optional)
//! - MQTT_CLIENT_ID - Client id and loop-marker source (default: rainflow-aggregator)
//! - MQTT_TLS / MQTT_TLS_INSECURE - TLS switches (default: false)
//! - INPUT_TOPIC - Subscription filter (default: aws/+/data)
//! - OUTPUT_TOPIC - Derived topic template (default: aws/{deviceId}/rain/derived)
//! - PUBLISH_DERIVED - Emit standalone metrics messages (default: false)
//! - PUBLISH_ENRICHED_TO_DATA - Republish enriched data payloads (default: true)
//! - TIMEZONE - IANA zone for daily resets (default: Asia/Jakarta)
//! - DEVICE_IDS - Comma-separated allow-list (default: all devices)
//! - STATE_FILE - Snapshot path (default: state.json)
//! - RUST_LOG - Logging level (optional, default: info)


pub mod baseline;
pub mod config;
pub mod engine;
pub mod message;
pub mod metrics;
pub mod mqtt;
pub mod persistence;
pub mod time;
pub mod window;

pub use config::Config;
pub use engine::{Aggregator, DeviceState};
pub use metrics::DerivedMetrics;

use dotenv::dotenv;
use log::{info, warn};
use std::collections::HashMap;

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = Config::from_env()?;

    info!("Starting rainflow aggregator");
    info!(
        "   Broker: {}:{} (tls: {})",
        config.mqtt_host, config.mqtt_port, config.mqtt_tls
    );
    info!("   Input topic: {}", config.input_topic);
    info!("   Output topic: {}", config.output_topic);
    info!(
        "   Publish derived: {} / enriched: {}",
        config.publish_derived, config.publish_enriched
    );
    info!("   Timezone: {}", config.timezone);
    if config.device_ids.is_empty() {
        info!("   Devices: all");
    } else {
        info!("   Devices: {:?}", config.device_ids);
    }
    info!("   State file: {}", config.state_file);

    let states = match persistence::load_snapshot(&config.state_file, config.timezone) {
        Ok(states) => states,
        Err(e) => {
            warn!("Failed to load state snapshot ({}); starting fresh", e);
            HashMap::new()
        }
    };

    mqtt::run(config, states).await
}
