use crate::domain::{DomainError, DomainResult, IdempotencyKey, MetricKind, NormalizedEvent};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

/// JSON body of a normalized event on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub schema_version: u32,
    pub device_id: String,
    pub metric: MetricKind,
    pub value: f64,
    pub unit: String,
    pub device_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub sequence_number: u64,
    pub idempotency_key: IdempotencyKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

impl From<&NormalizedEvent> for WireEvent {
    fn from(event: &NormalizedEvent) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            device_id: event.device_id.clone(),
            metric: event.metric,
            value: event.value,
            unit: event.unit.clone(),
            device_timestamp: event.device_timestamp,
            received_at: event.received_at,
            sequence_number: event.sequence_number,
            idempotency_key: event.idempotency_key.clone(),
            quality_score: event.quality_score,
        }
    }
}

impl TryFrom<WireEvent> for NormalizedEvent {
    type Error = DomainError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        if wire.schema_version != SCHEMA_VERSION {
            return Err(DomainError::ValidationError(format!(
                "unsupported schema version {}",
                wire.schema_version
            )));
        }

        Ok(NormalizedEvent {
            device_id: wire.device_id,
            metric: wire.metric,
            value: wire.value,
            unit: wire.unit,
            device_timestamp: wire.device_timestamp,
            received_at: wire.received_at,
            sequence_number: wire.sequence_number,
            idempotency_key: wire.idempotency_key,
            quality_score: wire.quality_score,
        })
    }
}

pub fn encode_event(event: &NormalizedEvent) -> DomainResult<Bytes> {
    serde_json::to_vec(&WireEvent::from(event))
        .map(Bytes::from)
        .map_err(|e| DomainError::ProcessingError(format!("failed to encode event: {}", e)))
}

pub fn decode_event(payload: &[u8]) -> DomainResult<NormalizedEvent> {
    let wire: WireEvent = serde_json::from_slice(payload)
        .map_err(|e| DomainError::ValidationError(format!("malformed event payload: {}", e)))?;
    wire.try_into()
}
