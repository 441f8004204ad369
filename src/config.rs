//! Aggregator configuration from environment variables
//!
//! Loaded once at startup (a `.env` file is honored via dotenv in the
//! binaries). Every setting has a sensible default except the time zone,
//! which must name a real IANA zone.

use chrono_tz::Tz;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    /// MQTT client id; also the `source` stamped into the loop-prevention
    /// marker on enriched republications.
    pub client_id: String,
    pub mqtt_tls: bool,
    pub mqtt_tls_insecure: bool,
    /// Subscription filter for device data, e.g. `aws/+/data`.
    pub input_topic: String,
    /// Derived-metrics topic template with a `{deviceId}` placeholder.
    pub output_topic: String,
    pub publish_derived: bool,
    pub publish_enriched: bool,
    pub timezone: Tz,
    /// Device allow-list; empty means all devices are accepted.
    pub device_ids: Vec<String>,
    pub state_file: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MQTT_HOST` (default: localhost)
    /// - `MQTT_PORT` (default: 1883)
    /// - `MQTT_USERNAME` / `MQTT_PASSWORD` (optional)
    /// - `MQTT_CLIENT_ID` (default: rainflow-aggregator)
    /// - `MQTT_TLS` / `MQTT_TLS_INSECURE` (default: false)
    /// - `INPUT_TOPIC` (default: aws/+/data)
    /// - `OUTPUT_TOPIC` (default: aws/{deviceId}/rain/derived)
    /// - `PUBLISH_DERIVED` (default: false)
    /// - `PUBLISH_ENRICHED_TO_DATA` (default: true)
    /// - `TIMEZONE` (default: Asia/Jakarta)
    /// - `DEVICE_IDS` (comma-separated allow-list, default: empty)
    /// - `STATE_FILE` (default: state.json)
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let tz_name = env::var("TIMEZONE").unwrap_or_else(|_| "Asia/Jakarta".to_string());
        let timezone: Tz = tz_name
            .parse()
            .map_err(|_| format!("unknown TIMEZONE {:?}", tz_name))?;

        let device_ids = env::var("DEVICE_IDS")
            .map(|s| {
                s.split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            mqtt_host: env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            mqtt_port: env::var("MQTT_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1883),
            mqtt_username: env::var("MQTT_USERNAME").ok(),
            mqtt_password: env::var("MQTT_PASSWORD").ok(),
            client_id: env::var("MQTT_CLIENT_ID")
                .unwrap_or_else(|_| "rainflow-aggregator".to_string()),
            mqtt_tls: env_flag("MQTT_TLS", false),
            mqtt_tls_insecure: env_flag("MQTT_TLS_INSECURE", false),
            input_topic: env::var("INPUT_TOPIC").unwrap_or_else(|_| "aws/+/data".to_string()),
            output_topic: env::var("OUTPUT_TOPIC")
                .unwrap_or_else(|_| "aws/{deviceId}/rain/derived".to_string()),
            publish_derived: env_flag("PUBLISH_DERIVED", false),
            publish_enriched: env_flag("PUBLISH_ENRICHED_TO_DATA", true),
            timezone,
            device_ids,
            state_file: env::var("STATE_FILE").unwrap_or_else(|_| "state.json".to_string()),
        })
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|s| s.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
