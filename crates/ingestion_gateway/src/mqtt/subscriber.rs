use crate::domain::{IngestionService, RawReadingInput};
use crate::mqtt::{parse_readings_topic, readings_subscription};
use chrono::{DateTime, Utc};
use common::domain::{DomainError, DomainResult};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

#[derive(Debug, Clone)]
pub struct MqttListenerConfig {
    /// `mqtt://host:port`, `tcp://host:port` or `host:port`
    pub broker_url: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for MqttListenerConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            topic_prefix: "carechain".to_string(),
            client_id: "carechain-ingestion-gateway".to_string(),
            max_retry_attempts: 5,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// JSON body of a device reading; the device id comes from the topic.
#[derive(Debug, Deserialize)]
struct DeviceReadingMessage {
    metric: String,
    value: f64,
    unit: String,
    device_timestamp: DateTime<Utc>,
    #[serde(default)]
    sequence_number: Option<u64>,
    #[serde(default)]
    quality_score: Option<f64>,
}

/// Listen for device readings on the broker and feed them to the ingestion
/// service until cancelled. Reconnects after errors; gives up after
/// `max_retry_attempts` consecutive failures.
#[instrument(
    name = "mqtt_listener",
    skip_all,
    fields(broker_url = %config.broker_url, topic_prefix = %config.topic_prefix)
)]
pub async fn run_mqtt_listener(
    config: MqttListenerConfig,
    service: Arc<IngestionService>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    info!("starting MQTT listener");

    let mut retry_count = 0;

    loop {
        if token.is_cancelled() {
            break;
        }

        match run_mqtt_connection(&config, &service, &token, &mut retry_count).await {
            Ok(()) => {
                debug!("MQTT listener stopped cleanly");
                break;
            }
            Err(e) => {
                error!(error = %e, "MQTT connection error");

                retry_count += 1;
                if retry_count >= config.max_retry_attempts {
                    error!(
                        max_retries = config.max_retry_attempts,
                        "max retry attempts reached, stopping MQTT listener"
                    );
                    return Err(anyhow::anyhow!(
                        "MQTT listener gave up after {} attempts: {}",
                        retry_count,
                        e
                    ));
                }

                warn!(
                    attempt = retry_count,
                    max_attempts = config.max_retry_attempts,
                    "retrying MQTT connection"
                );

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(config.retry_delay) => {}
                }
            }
        }
    }

    info!("MQTT listener stopped");
    Ok(())
}

async fn run_mqtt_connection(
    config: &MqttListenerConfig,
    service: &IngestionService,
    token: &CancellationToken,
    retry_count: &mut u32,
) -> DomainResult<()> {
    let (host, port) = parse_broker_url(&config.broker_url)?;

    let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    let subscription = readings_subscription(&config.topic_prefix);
    client
        .subscribe(&subscription, QoS::AtLeastOnce)
        .await
        .map_err(|e| DomainError::ProcessingError(format!("failed to subscribe: {}", e)))?;

    info!(topic = %subscription, "subscribed to MQTT topic");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("shutdown signal received");
                let _ = client.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_mqtt_message(
                            &config.topic_prefix,
                            &publish.topic,
                            &publish.payload,
                            service,
                        )
                        .await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        *retry_count = 0;
                        info!("connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(DomainError::ProcessingError(format!(
                            "MQTT event loop error: {}",
                            e
                        )));
                    }
                }
            }
        }
    }
}

/// Handle one device message under its own root span.
///
/// Bad topics and bodies are dropped here with a warning; the ingestion
/// service logs its own rejections and delivery failures.
pub(crate) async fn handle_mqtt_message(
    topic_prefix: &str,
    topic: &str,
    payload: &[u8],
    service: &IngestionService,
) {
    let span = info_span!(
        parent: Span::none(),
        "mqtt_message",
        topic = %topic,
        payload_size = payload.len(),
        device_id = tracing::field::Empty,
    );

    async {
        let device_id = match parse_readings_topic(topic_prefix, topic) {
            Ok(device_id) => device_id,
            Err(e) => {
                warn!(error = %e, "failed to parse MQTT topic, dropping message");
                return;
            }
        };
        Span::current().record("device_id", device_id.as_str());

        let message: DeviceReadingMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed reading body, dropping message");
                return;
            }
        };

        let input = RawReadingInput {
            device_id,
            metric: message.metric,
            value: message.value,
            unit: message.unit,
            device_timestamp: message.device_timestamp,
            sequence_number: message.sequence_number,
            quality_score: message.quality_score,
        };

        if let Ok(key) = service.ingest(input).await {
            debug!(idempotency_key = %key, "device reading ingested");
        }
    }
    .instrument(span)
    .await
}

/// Parse broker URL in format mqtt://host:port or tcp://host:port or host:port
fn parse_broker_url(url: &str) -> DomainResult<(&str, u16)> {
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");

    let parts: Vec<&str> = url.split(':').collect();
    match parts.as_slice() {
        [host] => Ok((*host, 1883)),
        [host, port] => {
            let port = port.parse::<u16>().map_err(|_| {
                DomainError::ValidationError(format!("invalid port in broker URL: {}", port))
            })?;
            Ok((*host, port))
        }
        _ => Err(DomainError::ValidationError(format!(
            "invalid broker URL format: {}",
            url
        ))),
    }
}
