use crate::domain::result::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

const MMOL_PER_L_TO_MG_PER_DL: f64 = 18.0;
const KPA_TO_MMHG: f64 = 7.50062;

/// Vital sign kinds the pipeline understands.
///
/// Each kind has one canonical unit; readings in other accepted units are
/// converted before they leave the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    HeartRate,
    BloodGlucose,
    BloodPressure,
    BodyTemperature,
    Spo2,
    RespiratoryRate,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::HeartRate,
        MetricKind::BloodGlucose,
        MetricKind::BloodPressure,
        MetricKind::BodyTemperature,
        MetricKind::Spo2,
        MetricKind::RespiratoryRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::HeartRate => "heart_rate",
            MetricKind::BloodGlucose => "blood_glucose",
            MetricKind::BloodPressure => "blood_pressure",
            MetricKind::BodyTemperature => "body_temperature",
            MetricKind::Spo2 => "spo2",
            MetricKind::RespiratoryRate => "respiratory_rate",
        }
    }

    pub fn canonical_unit(&self) -> &'static str {
        match self {
            MetricKind::HeartRate => "bpm",
            MetricKind::BloodGlucose => "mg/dL",
            MetricKind::BloodPressure => "mmHg",
            MetricKind::BodyTemperature => "°C",
            MetricKind::Spo2 => "%",
            MetricKind::RespiratoryRate => "breaths/min",
        }
    }

    /// Physiologically plausible values in canonical units. Anything outside
    /// is a broken sensor or a tampered payload, not a patient state.
    pub fn plausible_range(&self) -> RangeInclusive<f64> {
        match self {
            MetricKind::HeartRate => 20.0..=300.0,
            MetricKind::BloodGlucose => 10.0..=1000.0,
            MetricKind::BloodPressure => 20.0..=300.0,
            MetricKind::BodyTemperature => 25.0..=45.0,
            MetricKind::Spo2 => 0.0..=100.0,
            MetricKind::RespiratoryRate => 0.0..=80.0,
        }
    }

    /// Convert `value` expressed in `unit` into this metric's canonical unit.
    pub fn to_canonical(&self, value: f64, unit: &str) -> DomainResult<f64> {
        let normalized = unit.trim().to_lowercase();
        let converted = match (self, normalized.as_str()) {
            (MetricKind::HeartRate, "bpm" | "beats/min" | "/min") => Some(value),

            (MetricKind::BloodGlucose, "mg/dl") => Some(value),
            (MetricKind::BloodGlucose, "mmol/l") => Some(value * MMOL_PER_L_TO_MG_PER_DL),

            (MetricKind::BloodPressure, "mmhg") => Some(value),
            (MetricKind::BloodPressure, "kpa") => Some(value * KPA_TO_MMHG),

            (MetricKind::BodyTemperature, "°c" | "c" | "degc" | "celsius") => Some(value),
            (MetricKind::BodyTemperature, "°f" | "f" | "degf" | "fahrenheit") => {
                Some((value - 32.0) * 5.0 / 9.0)
            }
            (MetricKind::BodyTemperature, "k" | "kelvin") => Some(value - 273.15),

            (MetricKind::Spo2, "%" | "percent") => Some(value),
            (MetricKind::Spo2, "ratio" | "fraction") => Some(value * 100.0),

            (MetricKind::RespiratoryRate, "breaths/min" | "br/min" | "rpm") => Some(value),

            _ => None,
        };

        converted.ok_or_else(|| DomainError::UnsupportedUnit {
            metric: self.as_str().to_string(),
            unit: unit.to_string(),
        })
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| DomainError::ValidationError(format!("unknown metric kind: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metric_kind() {
        assert_eq!(
            "heart_rate".parse::<MetricKind>().unwrap(),
            MetricKind::HeartRate
        );
        assert_eq!(" SpO2 ".parse::<MetricKind>().unwrap(), MetricKind::Spo2);
        assert!(matches!(
            "mood".parse::<MetricKind>(),
            Err(DomainError::ValidationError(_))
        ));
    }

    #[test]
    fn test_display_matches_serde_name() {
        for kind in MetricKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_fahrenheit_to_celsius() {
        let celsius = MetricKind::BodyTemperature
            .to_canonical(98.6, "°F")
            .unwrap();
        assert!((celsius - 37.0).abs() < 1e-9);
    }

    #[test]
    fn test_glucose_mmol_to_mg() {
        let mg = MetricKind::BloodGlucose.to_canonical(5.5, "mmol/L").unwrap();
        assert!((mg - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_canonical_unit_is_identity() {
        for kind in MetricKind::ALL {
            let value = kind.to_canonical(42.0, kind.canonical_unit()).unwrap();
            assert_eq!(value, 42.0, "{} canonical unit should not convert", kind);
        }
    }

    #[test]
    fn test_unknown_unit_is_unsupported() {
        let result = MetricKind::HeartRate.to_canonical(72.0, "hz");
        assert!(matches!(
            result,
            Err(DomainError::UnsupportedUnit { ref metric, ref unit })
                if metric == "heart_rate" && unit == "hz"
        ));
    }
}
