use crate::domain::{IngestionService, NormalizerConfig, TelemetryNormalizer};
use crate::mqtt::{run_mqtt_listener, MqttListenerConfig};
use carechain_runner::AppProcess;
use common::domain::EventPublisher;
use std::sync::Arc;
use tracing::info;

pub struct IngestionGatewayConfig {
    pub normalizer: NormalizerConfig,
    /// `None` disables the MQTT device listener.
    pub mqtt: Option<MqttListenerConfig>,
}

/// Ingest stage: normalizer and bus publisher behind one service, plus the
/// device-facing listeners that feed it.
pub struct IngestionGateway {
    service: Arc<IngestionService>,
    mqtt: Option<MqttListenerConfig>,
}

impl IngestionGateway {
    pub fn new(publisher: Arc<dyn EventPublisher>, config: IngestionGatewayConfig) -> Self {
        info!(
            clock_skew_tolerance_secs = config.normalizer.clock_skew_tolerance.num_seconds(),
            max_reading_age_secs = config.normalizer.max_reading_age.num_seconds(),
            mqtt_enabled = config.mqtt.is_some(),
            "initializing ingestion gateway"
        );

        let normalizer = TelemetryNormalizer::new(config.normalizer);
        Self {
            service: Arc::new(IngestionService::new(normalizer, publisher)),
            mqtt: config.mqtt,
        }
    }

    /// Direct, in-process ingestion entry point.
    pub fn service(&self) -> Arc<IngestionService> {
        Arc::clone(&self.service)
    }

    pub fn into_runner_processes(self) -> Vec<(String, AppProcess)> {
        let mut processes: Vec<(String, AppProcess)> = Vec::new();

        if let Some(mqtt) = self.mqtt {
            let service = self.service;
            processes.push((
                "mqtt_listener".to_string(),
                Box::new(move |ctx| Box::pin(run_mqtt_listener(mqtt, service, ctx))),
            ));
        }

        processes
    }
}
