use crate::domain::metric::MetricKind;
use crate::domain::reading::IdempotencyKey;
use crate::domain::result::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which side of the band the value left through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertDirection {
    High,
    Low,
}

impl AlertDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertDirection::High => "high",
            AlertDirection::Low => "low",
        }
    }
}

impl fmt::Display for AlertDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertDirection {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(AlertDirection::High),
            "low" => Ok(AlertDirection::Low),
            other => Err(DomainError::ValidationError(format!(
                "unknown alert direction: {}",
                other
            ))),
        }
    }
}

/// Alert raised when a device's metric leaves its configured band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub device_id: String,
    pub metric: MetricKind,
    pub direction: AlertDirection,
    pub threshold: f64,
    pub opened_at: DateTime<Utc>,
    pub opened_sequence: u64,
    pub opened_value: f64,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_sequence: Option<u64>,
    pub resolved_value: Option<f64>,
}

impl Alert {
    /// Alert ids come from the opening event's key, so reprocessing that event
    /// can never mint a second alert.
    pub fn derive_id(opening_key: &IdempotencyKey) -> String {
        let key = opening_key.as_str();
        format!("alert-{}", &key[..key.len().min(24)])
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Inclusive normal range for one metric. Either bound may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ThresholdBand {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

impl ThresholdBand {
    pub fn new(low: Option<f64>, high: Option<f64>) -> Self {
        Self { low, high }
    }

    /// Returns the breached side and bound, if `value` is out of range.
    /// Values equal to a bound are in range.
    pub fn breach(&self, value: f64) -> Option<(AlertDirection, f64)> {
        if let Some(high) = self.high {
            if value > high {
                return Some((AlertDirection::High, high));
            }
        }
        if let Some(low) = self.low {
            if value < low {
                return Some((AlertDirection::Low, low));
            }
        }
        None
    }
}

/// Per-metric threshold configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertThresholds {
    bands: BTreeMap<MetricKind, ThresholdBand>,
}

impl AlertThresholds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_band(mut self, metric: MetricKind, band: ThresholdBand) -> Self {
        self.bands.insert(metric, band);
        self
    }

    pub fn band_for(&self, metric: MetricKind) -> Option<&ThresholdBand> {
        self.bands.get(&metric)
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    /// Parse `metric=low:high` pairs separated by commas. Either bound may be
    /// left empty, e.g. `blood_glucose=:180`.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let mut thresholds = Self::new();

        for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (metric, range) = entry.split_once('=').ok_or_else(|| {
                DomainError::ValidationError(format!(
                    "threshold '{}' must look like metric=low:high",
                    entry
                ))
            })?;
            let metric: MetricKind = metric.parse()?;

            let (low, high) = range.split_once(':').ok_or_else(|| {
                DomainError::ValidationError(format!(
                    "threshold range '{}' must look like low:high",
                    range
                ))
            })?;

            let band = ThresholdBand::new(parse_bound(low)?, parse_bound(high)?);
            if let (Some(low), Some(high)) = (band.low, band.high) {
                if low > high {
                    return Err(DomainError::ValidationError(format!(
                        "threshold for {} has low {} above high {}",
                        metric, low, high
                    )));
                }
            }
            thresholds.bands.insert(metric, band);
        }

        Ok(thresholds)
    }
}

fn parse_bound(raw: &str) -> DomainResult<Option<f64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let value: f64 = raw
        .parse()
        .map_err(|_| DomainError::ValidationError(format!("invalid threshold bound: {}", raw)))?;
    if !value.is_finite() {
        return Err(DomainError::ValidationError(format!(
            "threshold bound must be finite: {}",
            raw
        )));
    }
    Ok(Some(value))
}
