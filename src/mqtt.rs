//! MQTT session and publish seam
//!
//! Owns everything broker-facing: connection options, the subscribe/poll
//! loop, topic parsing and formatting, and the publisher trait the
//! orchestrator emits through. The aggregation pipeline runs inline on this
//! single event-loop task, one message at a time.

use {
    crate::config::Config,
    crate::engine::{Aggregator, DeviceState},
    async_trait::async_trait,
    rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport},
    std::collections::HashMap,
    std::time::Duration,
    tokio::time::sleep,
};

const RECONNECT_DELAY_SECS: u64 = 5;

#[derive(Debug)]
pub enum PublishError {
    Client(rumqttc::ClientError),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Client(e) => write!(f, "MQTT client error: {}", e),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<rumqttc::ClientError> for PublishError {
    fn from(err: rumqttc::ClientError) -> Self {
        PublishError::Client(err)
    }
}

/// Outbound publish seam, so the orchestrator can be exercised without a
/// broker.
#[async_trait]
pub trait MetricsPublisher: Send {
    async fn publish(
        &mut self,
        topic: &str,
        payload: String,
        retain: bool,
    ) -> Result<(), PublishError>;
}

/// Broker-backed publisher used in production.
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsPublisher for MqttPublisher {
    async fn publish(
        &mut self,
        topic: &str,
        payload: String,
        retain: bool,
    ) -> Result<(), PublishError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await?;
        Ok(())
    }
}

/// Extract the device id from a data topic: the segment following the
/// literal `aws` segment, e.g. `aws/C45120B7B3F8/data`.
pub fn device_id_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    while let Some(part) = parts.next() {
        if part == "aws" {
            return parts.next().filter(|id| !id.is_empty());
        }
    }
    None
}

/// Expand the derived-metrics topic template for a device.
pub fn derived_topic(template: &str, device_id: &str) -> String {
    template.replace("{deviceId}", device_id)
}

/// Data topic a device publishes on (and enriched payloads return to).
pub fn data_topic(device_id: &str) -> String {
    format!("aws/{}/data", device_id)
}

/// Build MQTT session options from the configuration.
pub fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(60));
    // Persistent session: the broker queues QoS 1 messages across reconnects
    options.set_clean_session(false);

    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }

    if config.mqtt_tls {
        if config.mqtt_tls_insecure {
            log::warn!("MQTT_TLS_INSECURE is set; certificate verification stays enabled");
        }
        options.set_transport(Transport::Tls(TlsConfiguration::Native));
    }

    options
}

/// Run the aggregator against the broker until the process is stopped.
///
/// Subscribes on every CONNACK so reconnects re-establish the filter, and
/// feeds each inbound publish through the orchestrator. Connection errors
/// back off and retry; they never terminate the session.
pub async fn run(
    config: Config,
    states: HashMap<String, DeviceState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = mqtt_options(&config);
    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let mut publisher = MqttPublisher::new(client.clone());
    let mut aggregator = Aggregator::with_states(config.clone(), states);

    log::info!(
        "Connecting to MQTT {}:{} ...",
        config.mqtt_host,
        config.mqtt_port
    );

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log::info!("Connected to MQTT broker");
                match client.subscribe(&config.input_topic, QoS::AtLeastOnce).await {
                    Ok(()) => log::info!("Subscribed to {}", config.input_topic),
                    Err(e) => log::error!("Failed to subscribe to {}: {}", config.input_topic, e),
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                aggregator
                    .handle_publish(&publish.topic, &publish.payload, &mut publisher)
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!(
                    "MQTT connection error: {} (retrying in {}s)",
                    e,
                    RECONNECT_DELAY_SECS
                );
                sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            }
        }
    }
}
