use crate::domain::TelemetryNormalizer;
use chrono::{DateTime, Utc};
use common::domain::{DomainResult, EventPublisher, IdempotencyKey, Reading};
use common::garde::validate_struct;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// A reading as a device submits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RawReadingInput {
    #[garde(length(min = 1, max = 128))]
    pub device_id: String,
    #[garde(length(min = 1, max = 64))]
    pub metric: String,
    #[garde(skip)]
    pub value: f64,
    #[garde(length(min = 1, max = 32))]
    pub unit: String,
    #[garde(skip)]
    pub device_timestamp: DateTime<Utc>,
    #[garde(skip)]
    #[serde(default)]
    pub sequence_number: Option<u64>,
    #[garde(skip)]
    #[serde(default)]
    pub quality_score: Option<f64>,
}

impl RawReadingInput {
    fn into_reading(self, received_at: DateTime<Utc>) -> Reading {
        Reading {
            device_id: self.device_id,
            metric: self.metric,
            value: self.value,
            unit: self.unit,
            device_timestamp: self.device_timestamp,
            received_at,
            sequence_number: self.sequence_number,
            quality_score: self.quality_score,
        }
    }
}

/// Front door of the ingest stage: validate, stamp, normalize, publish.
pub struct IngestionService {
    normalizer: TelemetryNormalizer,
    publisher: Arc<dyn EventPublisher>,
}

impl IngestionService {
    pub fn new(normalizer: TelemetryNormalizer, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            normalizer,
            publisher,
        }
    }

    /// Accept one reading, stamped with the current gateway clock.
    ///
    /// Returns the idempotency key of the published event. Rejections are
    /// `ValidationError` or `UnsupportedUnit`; a bus that stays unavailable
    /// through every retry yields `DeliveryFailure`.
    pub async fn ingest(&self, input: RawReadingInput) -> DomainResult<IdempotencyKey> {
        self.ingest_at(input, Utc::now()).await
    }

    #[instrument(
        skip(self, input),
        fields(device_id = %input.device_id, metric = %input.metric)
    )]
    pub async fn ingest_at(
        &self,
        input: RawReadingInput,
        received_at: DateTime<Utc>,
    ) -> DomainResult<IdempotencyKey> {
        if let Err(e) = validate_struct(&input) {
            warn!(reason = %e, "reading rejected");
            return Err(e);
        }

        let reading = input.into_reading(received_at);
        let event = match self.normalizer.normalize(&reading) {
            Ok(event) => event,
            Err(e) => {
                warn!(reason = %e, "reading rejected");
                return Err(e);
            }
        };

        if let Err(e) = self.publisher.publish(&event).await {
            error!(
                error = %e,
                idempotency_key = %event.idempotency_key,
                "failed to publish normalized event"
            );
            return Err(e);
        }

        debug!(
            idempotency_key = %event.idempotency_key,
            sequence_number = event.sequence_number,
            value = event.value,
            "reading accepted"
        );
        Ok(event.idempotency_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::domain::{DomainError, MetricKind, MockEventPublisher, NormalizedEvent};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn input() -> RawReadingInput {
        RawReadingInput {
            device_id: "monitor-12".to_string(),
            metric: "spo2".to_string(),
            value: 0.97,
            unit: "ratio".to_string(),
            device_timestamp: now() - Duration::seconds(1),
            sequence_number: Some(3),
            quality_score: None,
        }
    }

    #[tokio::test]
    async fn test_ingest_publishes_normalized_event() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|event: &NormalizedEvent| {
                event.device_id == "monitor-12"
                    && event.metric == MetricKind::Spo2
                    && (event.value - 97.0).abs() < 1e-9
                    && event.unit == "%"
                    && event.received_at == now()
            })
            .times(1)
            .returning(|_| Ok(()));

        let service = IngestionService::new(TelemetryNormalizer::default(), Arc::new(publisher));

        let key = service.ingest_at(input(), now()).await.unwrap();

        assert_eq!(
            key,
            IdempotencyKey::compute(
                "monitor-12",
                MetricKind::Spo2,
                &(now() - Duration::seconds(1)),
                Some(3)
            )
        );
    }

    #[tokio::test]
    async fn test_ingest_rejects_malformed_input_without_publishing() {
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish().times(0);
        let service = IngestionService::new(TelemetryNormalizer::default(), Arc::new(publisher));

        let mut empty_unit = input();
        empty_unit.unit = String::new();
        let result = service.ingest_at(empty_unit, now()).await;
        assert!(matches!(result, Err(DomainError::ValidationError(_))));

        let mut unknown_unit = input();
        unknown_unit.unit = "furlongs".to_string();
        let result = service.ingest_at(unknown_unit, now()).await;
        assert!(matches!(result, Err(DomainError::UnsupportedUnit { .. })));
    }

    #[tokio::test]
    async fn test_ingest_surfaces_delivery_failure() {
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish().times(1).returning(|_| {
            Err(DomainError::DeliveryFailure {
                attempts: 5,
                reason: "no responders".to_string(),
            })
        });
        let service = IngestionService::new(TelemetryNormalizer::default(), Arc::new(publisher));

        let result = service.ingest_at(input(), now()).await;

        assert!(matches!(
            result,
            Err(DomainError::DeliveryFailure { attempts: 5, .. })
        ));
    }

    #[test]
    fn test_input_deserializes_without_optional_fields() {
        let json = r#"{
            "device_id": "monitor-12",
            "metric": "heart_rate",
            "value": 71.5,
            "unit": "bpm",
            "device_timestamp": "2025-03-01T11:59:59Z"
        }"#;

        let parsed: RawReadingInput = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.sequence_number, None);
        assert_eq!(parsed.quality_score, None);
        assert_eq!(parsed.device_timestamp, now() - Duration::seconds(1));
    }
}
