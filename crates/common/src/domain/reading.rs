use crate::domain::metric::MetricKind;
use crate::domain::vital_state::AggregateId;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// One raw measurement as reported by a device, stamped with the gateway's
/// receipt time. Nothing here has been validated yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub device_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub sequence_number: Option<u64>,
    pub quality_score: Option<f64>,
}

/// Deterministic identifier of a logical reading.
///
/// Derived only from fields the device controls, so a retransmission of the
/// same reading produces the same key no matter when the gateway received it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn compute(
        device_id: &str,
        metric: MetricKind,
        device_timestamp: &DateTime<Utc>,
        sequence_number: Option<u64>,
    ) -> Self {
        let sequence = sequence_number
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());

        let mut hasher = Sha256::new();
        hasher.update(device_id.as_bytes());
        hasher.update(b"|");
        hasher.update(metric.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(
            device_timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        hasher.update(b"|");
        hasher.update(sequence.as_bytes());

        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Wrap an already computed key, e.g. one read back from storage.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated reading in canonical units, ready for the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub device_id: String,
    pub metric: MetricKind,
    pub value: f64,
    pub unit: String,
    pub device_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    /// Ordering key within the device stream.
    pub sequence_number: u64,
    pub idempotency_key: IdempotencyKey,
    pub quality_score: Option<f64>,
}

impl NormalizedEvent {
    pub fn aggregate_id(&self) -> AggregateId {
        AggregateId::new(self.device_id.clone(), self.metric)
    }

    /// Partition key on the bus: all events of one device share an ordered stream.
    pub fn partition_key(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = IdempotencyKey::compute("dev-1", MetricKind::HeartRate, &ts(), Some(7));
        let b = IdempotencyKey::compute("dev-1", MetricKind::HeartRate, &ts(), Some(7));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_idempotency_key_depends_on_every_field() {
        let base = IdempotencyKey::compute("dev-1", MetricKind::HeartRate, &ts(), Some(7));

        assert_ne!(
            base,
            IdempotencyKey::compute("dev-2", MetricKind::HeartRate, &ts(), Some(7))
        );
        assert_ne!(
            base,
            IdempotencyKey::compute("dev-1", MetricKind::Spo2, &ts(), Some(7))
        );
        assert_ne!(
            base,
            IdempotencyKey::compute(
                "dev-1",
                MetricKind::HeartRate,
                &(ts() + chrono::Duration::nanoseconds(1)),
                Some(7)
            )
        );
        assert_ne!(
            base,
            IdempotencyKey::compute("dev-1", MetricKind::HeartRate, &ts(), Some(8))
        );
        assert_ne!(
            base,
            IdempotencyKey::compute("dev-1", MetricKind::HeartRate, &ts(), None)
        );
    }

    #[test]
    fn test_idempotency_key_serializes_as_plain_string() {
        let key = IdempotencyKey::from_raw("abc");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"abc\"");
    }
}
