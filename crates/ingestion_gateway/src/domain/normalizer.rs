use chrono::{DateTime, Duration, Utc};
use common::domain::{
    DomainError, DomainResult, IdempotencyKey, MetricKind, NormalizedEvent, Reading,
};

/// Device-numbered readings order above every timestamp-ordered one.
///
/// Timestamp fallbacks (microseconds since the epoch) stay below this floor
/// for the next hundred millennia, so a device that numbers only some of its
/// readings keeps making progress on the numbered ones; the unnumbered ones
/// arriving after them are skipped as stale.
pub const DEVICE_SEQUENCE_FLOOR: u64 = 1 << 62;

/// Time window a device timestamp must fall into, relative to receipt.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// How far ahead of the gateway clock a device clock may run.
    pub clock_skew_tolerance: Duration,
    /// Oldest reading accepted, for devices that buffer while offline.
    pub max_reading_age: Duration,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            clock_skew_tolerance: Duration::seconds(30),
            max_reading_age: Duration::hours(24),
        }
    }
}

/// Turns raw readings into canonical, keyed events. Pure; safe to share.
#[derive(Debug, Clone, Default)]
pub struct TelemetryNormalizer {
    config: NormalizerConfig,
}

impl TelemetryNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn normalize(&self, reading: &Reading) -> DomainResult<NormalizedEvent> {
        if reading.device_id.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "device_id is required".to_string(),
            ));
        }
        if reading.metric.trim().is_empty() {
            return Err(DomainError::ValidationError("metric is required".to_string()));
        }
        let metric: MetricKind = reading.metric.parse()?;

        if !reading.value.is_finite() {
            return Err(DomainError::ValidationError(format!(
                "value must be finite, got {}",
                reading.value
            )));
        }

        if let Some(quality) = reading.quality_score {
            if !(0.0..=1.0).contains(&quality) {
                return Err(DomainError::ValidationError(format!(
                    "quality_score must be within [0, 1], got {}",
                    quality
                )));
            }
        }

        self.check_timestamp(&reading.device_timestamp, &reading.received_at)?;

        let value = metric.to_canonical(reading.value, &reading.unit)?;
        let plausible = metric.plausible_range();
        if !plausible.contains(&value) {
            return Err(DomainError::ValidationError(format!(
                "{} of {} {} is outside the plausible range {}..={}",
                metric,
                value,
                metric.canonical_unit(),
                plausible.start(),
                plausible.end()
            )));
        }

        let sequence_number = match reading.sequence_number {
            Some(sequence) => device_sequence(sequence)?,
            None => timestamp_sequence(&reading.device_timestamp)?,
        };

        let idempotency_key = IdempotencyKey::compute(
            &reading.device_id,
            metric,
            &reading.device_timestamp,
            reading.sequence_number,
        );

        Ok(NormalizedEvent {
            device_id: reading.device_id.clone(),
            metric,
            value,
            unit: metric.canonical_unit().to_string(),
            device_timestamp: reading.device_timestamp,
            received_at: reading.received_at,
            sequence_number,
            idempotency_key,
            quality_score: reading.quality_score,
        })
    }

    fn check_timestamp(
        &self,
        device_timestamp: &DateTime<Utc>,
        received_at: &DateTime<Utc>,
    ) -> DomainResult<()> {
        let latest = *received_at + self.config.clock_skew_tolerance;
        if *device_timestamp > latest {
            return Err(DomainError::ValidationError(format!(
                "device timestamp {} is more than {}s ahead of receipt {}",
                device_timestamp.to_rfc3339(),
                self.config.clock_skew_tolerance.num_seconds(),
                received_at.to_rfc3339()
            )));
        }

        let earliest = *received_at - self.config.max_reading_age;
        if *device_timestamp < earliest {
            return Err(DomainError::ValidationError(format!(
                "device timestamp {} is older than {}s",
                device_timestamp.to_rfc3339(),
                self.config.max_reading_age.num_seconds()
            )));
        }

        Ok(())
    }
}

fn device_sequence(sequence: u64) -> DomainResult<u64> {
    DEVICE_SEQUENCE_FLOOR
        .checked_add(sequence)
        .filter(|ordered| *ordered <= i64::MAX as u64)
        .ok_or_else(|| {
            DomainError::ValidationError(format!(
                "sequence_number {} exceeds {}",
                sequence,
                i64::MAX as u64 - DEVICE_SEQUENCE_FLOOR
            ))
        })
}

/// Ordering sequence for readings the device did not number.
fn timestamp_sequence(device_timestamp: &DateTime<Utc>) -> DomainResult<u64> {
    u64::try_from(device_timestamp.timestamp_micros())
        .ok()
        .filter(|micros| *micros < DEVICE_SEQUENCE_FLOOR)
        .ok_or_else(|| {
            DomainError::ValidationError(format!(
                "device timestamp {} is outside the orderable range",
                device_timestamp.to_rfc3339()
            ))
        })
}
