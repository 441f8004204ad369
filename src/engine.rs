//! Per-message aggregation pipeline
//!
//! `Aggregator` owns the device-id → state map and runs the full pipeline
//! for each inbound publish: filter, parse, baseline, window append, metric
//! derivation, outbound publication, and state checkpoint. Everything runs on
//! the single transport task, so no locking is needed around the state map.

use {
    crate::baseline::Baseline,
    crate::config::Config,
    crate::message::{self, Inbound},
    crate::metrics::{self, DerivedMetrics},
    crate::mqtt::{self, MetricsPublisher},
    crate::persistence,
    crate::time,
    crate::window::SampleWindow,
    chrono::{DateTime, Utc},
    std::collections::HashMap,
};

/// Windowed state for one device. Created lazily on the first message and
/// kept for the life of the process (and across restarts via the snapshot).
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub baseline: Baseline,
    pub window: SampleWindow,
}

/// The aggregation orchestrator.
pub struct Aggregator {
    config: Config,
    states: HashMap<String, DeviceState>,
}

impl Aggregator {
    #[allow(dead_code)]
    pub fn new(config: Config) -> Self {
        Self::with_states(config, HashMap::new())
    }

    /// Resume from a previously loaded state snapshot.
    pub fn with_states(config: Config, states: HashMap<String, DeviceState>) -> Self {
        Self { config, states }
    }

    #[allow(dead_code)]
    pub fn device_count(&self) -> usize {
        self.states.len()
    }

    #[allow(dead_code)]
    pub fn state(&self, device_id: &str) -> Option<&DeviceState> {
        self.states.get(device_id)
    }

    #[allow(dead_code)]
    pub fn states(&self) -> &HashMap<String, DeviceState> {
        &self.states
    }

    /// Apply one reading to a device's state and derive its metrics.
    ///
    /// Baseline evaluation happens strictly before the sample lands in the
    /// window, so rollback detection compares against the previous sample.
    pub fn ingest(
        &mut self,
        device_id: &str,
        cumulative: f64,
        timestamp: DateTime<Utc>,
    ) -> DerivedMetrics {
        let tz = self.config.timezone;
        let state = self.states.entry(device_id.to_string()).or_default();

        let last_value = state.window.latest().map(|sample| sample.value);
        if state.baseline.maybe_reset(last_value, cumulative, timestamp, tz) {
            log::info!(
                "Baseline for {} set to {} at {}",
                device_id,
                cumulative,
                time::format_rfc3339(timestamp, tz)
            );
        }

        state.window.append(timestamp, cumulative);
        metrics::compute(&state.baseline, &state.window, timestamp, tz)
    }

    /// Handle one inbound publish end to end.
    ///
    /// Never propagates an error: a bad message is logged and dropped, a
    /// failed publish or snapshot write is logged and the loop keeps going.
    pub async fn handle_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        publisher: &mut dyn MetricsPublisher,
    ) {
        let Some(device_id) = mqtt::device_id_from_topic(topic) else {
            log::debug!("Ignoring message on unrecognized topic {}", topic);
            return;
        };
        let device_id = device_id.to_string();

        if !self.config.device_ids.is_empty()
            && !self.config.device_ids.iter().any(|id| id == &device_id)
        {
            log::debug!("Ignoring message for device {} (not in allow-list)", device_id);
            return;
        }

        let now = Utc::now();
        let reading = match message::parse_payload(
            payload,
            &self.config.client_id,
            now,
            self.config.timezone,
        ) {
            Ok(Inbound::Reading(reading)) => reading,
            Ok(Inbound::SelfPublished) => {
                log::debug!("Skipping self-published message for {}", device_id);
                return;
            }
            Err(e) => {
                log::warn!("Dropping message for {}: {}", device_id, e);
                return;
            }
        };

        let derived = self.ingest(&device_id, reading.cumulative, reading.timestamp);

        if self.config.publish_derived {
            self.publish_derived(&device_id, &derived, publisher).await;
        }

        if self.config.publish_enriched {
            if let Some(original) = reading.original.as_ref() {
                self.publish_enriched(&device_id, original, &derived, publisher)
                    .await;
            }
        }

        // Checkpoint the whole map after every message so a restart resumes
        // exactly where the stream left off.
        if let Err(e) =
            persistence::save_snapshot(&self.states, &self.config.state_file, self.config.timezone)
        {
            log::warn!("Failed to write state snapshot: {}", e);
        }
    }

    async fn publish_derived(
        &self,
        device_id: &str,
        derived: &DerivedMetrics,
        publisher: &mut dyn MetricsPublisher,
    ) {
        let topic = mqtt::derived_topic(&self.config.output_topic, device_id);
        match message::derived_payload(derived) {
            Ok(payload) => match publisher.publish(&topic, payload, true).await {
                Ok(()) => log::info!("Published derived metrics for {} to {}", device_id, topic),
                Err(e) => log::warn!("Failed to publish derived metrics for {}: {}", device_id, e),
            },
            Err(e) => log::warn!("Failed to serialize metrics for {}: {}", device_id, e),
        }
    }

    async fn publish_enriched(
        &self,
        device_id: &str,
        original: &serde_json::Value,
        derived: &DerivedMetrics,
        publisher: &mut dyn MetricsPublisher,
    ) {
        let Some(enriched) = message::enrich_payload(original, derived, &self.config.client_id)
        else {
            // Flat and bare payloads have no aws object to enrich
            return;
        };
        let topic = mqtt::data_topic(device_id);
        match publisher.publish(&topic, enriched, true).await {
            Ok(()) => log::info!("Republished enriched payload to {}", topic),
            Err(e) => log::warn!("Failed to republish enriched payload for {}: {}", device_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::PublishError;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    /// Publisher that records what would have gone to the broker.
    #[derive(Default)]
    struct CapturePublisher {
        published: Vec<(String, String, bool)>,
    }

    #[async_trait]
    impl MetricsPublisher for CapturePublisher {
        async fn publish(
            &mut self,
            topic: &str,
            payload: String,
            retain: bool,
        ) -> Result<(), PublishError> {
            self.published.push((topic.to_string(), payload, retain));
            Ok(())
        }
    }

    fn test_config(state_file: &str) -> Config {
        Config {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            client_id: "rainflow-aggregator".to_string(),
            mqtt_tls: false,
            mqtt_tls_insecure: false,
            input_topic: "aws/+/data".to_string(),
            output_topic: "aws/{deviceId}/rain/derived".to_string(),
            publish_derived: true,
            publish_enriched: true,
            timezone: chrono_tz::Asia::Jakarta,
            device_ids: Vec::new(),
            state_file: state_file.to_string(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 1, 0, 0).unwrap()
    }

    #[test]
    fn test_ingest_first_sample_sets_baseline() {
        let mut agg = Aggregator::new(test_config("unused.json"));
        let derived = agg.ingest("D1", 10.0, t0());

        assert_eq!(derived.rain_today, 0.0);
        assert_eq!(agg.state("D1").unwrap().baseline.value, Some(10.0));
        assert_eq!(agg.device_count(), 1);
    }

    #[test]
    fn test_ingest_accumulates_through_the_day() {
        let mut agg = Aggregator::new(test_config("unused.json"));
        agg.ingest("D1", 10.0, t0());
        let derived = agg.ingest("D1", 11.2, t0() + Duration::minutes(5));

        assert_eq!(derived.rain_today, 1.2);
        assert_eq!(derived.rain_last_hour, 1.2);
        assert_eq!(derived.rain_rate_10m, 14.4);
    }

    #[test]
    fn test_ingest_counter_rollback_zeroes_today() {
        let mut agg = Aggregator::new(test_config("unused.json"));
        agg.ingest("D1", 10.0, t0());
        agg.ingest("D1", 11.2, t0() + Duration::minutes(5));

        let derived = agg.ingest("D1", 8.0, t0() + Duration::minutes(70));
        assert_eq!(derived.rain_today, 0.0);
        assert_eq!(agg.state("D1").unwrap().baseline.value, Some(8.0));
    }

    #[test]
    fn test_ingest_keeps_devices_isolated() {
        let mut agg = Aggregator::new(test_config("unused.json"));
        agg.ingest("D1", 10.0, t0());
        agg.ingest("D2", 100.0, t0());
        let derived = agg.ingest("D1", 10.5, t0() + Duration::minutes(5));

        assert_eq!(derived.rain_today, 0.5);
        assert_eq!(agg.device_count(), 2);
        assert_eq!(agg.state("D2").unwrap().baseline.value, Some(100.0));
    }

    #[tokio::test]
    async fn test_handle_publish_emits_both_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        let mut agg = Aggregator::new(test_config(state_file.to_str().unwrap()));
        let mut publisher = CapturePublisher::default();

        agg.handle_publish(
            "aws/D1/data",
            br#"{"id":"D1","aws":{"rain":4.2}}"#,
            &mut publisher,
        )
        .await;

        assert_eq!(publisher.published.len(), 2);

        let (derived_topic, derived_payload, retained) = &publisher.published[0];
        assert_eq!(derived_topic, "aws/D1/rain/derived");
        assert!(*retained);
        let derived: serde_json::Value = serde_json::from_str(derived_payload).unwrap();
        assert_eq!(derived["rain_today"], 0.0);

        let (data_topic, enriched_payload, _) = &publisher.published[1];
        assert_eq!(data_topic, "aws/D1/data");
        let enriched: serde_json::Value = serde_json::from_str(enriched_payload).unwrap();
        assert_eq!(enriched["_agg"]["source"], "rainflow-aggregator");
        assert_eq!(enriched["aws"]["rain"], 4.2);

        // The snapshot lands on disk as part of message handling
        assert!(state_file.exists());
    }

    #[tokio::test]
    async fn test_handle_publish_respects_output_flags() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        let mut config = test_config(state_file.to_str().unwrap());
        config.publish_derived = false;
        config.publish_enriched = false;
        let mut agg = Aggregator::new(config);
        let mut publisher = CapturePublisher::default();

        agg.handle_publish("aws/D1/data", br#"{"aws":{"rain":4.2}}"#, &mut publisher)
            .await;

        assert!(publisher.published.is_empty());
        // State still advances even with publishing disabled
        assert_eq!(agg.state("D1").unwrap().window.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_publish_filters_unknown_devices() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        let mut config = test_config(state_file.to_str().unwrap());
        config.device_ids = vec!["D1".to_string()];
        let mut agg = Aggregator::new(config);
        let mut publisher = CapturePublisher::default();

        agg.handle_publish("aws/D9/data", br#"{"aws":{"rain":4.2}}"#, &mut publisher)
            .await;

        assert_eq!(agg.device_count(), 0);
        assert!(publisher.published.is_empty());
    }

    #[tokio::test]
    async fn test_handle_publish_ignores_self_published() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        let mut agg = Aggregator::new(test_config(state_file.to_str().unwrap()));
        let mut publisher = CapturePublisher::default();

        agg.handle_publish(
            "aws/D1/data",
            br#"{"aws":{"rain":4.2},"_agg":{"source":"rainflow-aggregator","v":1}}"#,
            &mut publisher,
        )
        .await;

        assert_eq!(agg.device_count(), 0);
        assert!(publisher.published.is_empty());
    }

    #[tokio::test]
    async fn test_handle_publish_survives_malformed_payload() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        let mut agg = Aggregator::new(test_config(state_file.to_str().unwrap()));
        let mut publisher = CapturePublisher::default();

        agg.handle_publish("aws/D1/data", b"{not json", &mut publisher).await;
        agg.handle_publish("aws/D1/data", br#"{"aws":{"rain":1.0}}"#, &mut publisher)
            .await;

        // The bad message left no trace; the good one processed normally
        assert_eq!(agg.state("D1").unwrap().window.len(), 1);
    }

    #[tokio::test]
    async fn test_flat_payload_skips_enrichment() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        let mut agg = Aggregator::new(test_config(state_file.to_str().unwrap()));
        let mut publisher = CapturePublisher::default();

        agg.handle_publish("aws/D1/data", br#"{"rain":2.0}"#, &mut publisher)
            .await;

        // Only the derived message goes out; there is no aws object to enrich
        assert_eq!(publisher.published.len(), 1);
        assert_eq!(publisher.published[0].0, "aws/D1/rain/derived");
    }
}
