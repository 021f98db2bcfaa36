use chrono::{DateTime, Utc};
use common::domain::{
    AggregateMutation, Alert, AlertTransition, DeviceVitalState, NormalizedEvent, ThresholdBand,
    VitalStatus,
};

/// What applying an event to the current aggregate would do.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The aggregate already holds this sequence number or a newer one.
    Stale { current_sequence: u64 },
    Apply(AggregateMutation),
}

/// Decide the next aggregate state for `event`.
///
/// Nominal moves to AlertOpen when the value leaves `band`, and back when a
/// later value is in range again. Staying out of range keeps the alert that
/// is already open. Without a band the metric is tracked but never alerts.
pub fn decide(
    current: Option<&DeviceVitalState>,
    event: &NormalizedEvent,
    band: Option<&ThresholdBand>,
    now: DateTime<Utc>,
) -> Decision {
    if let Some(current) = current {
        if event.sequence_number <= current.sequence_number {
            return Decision::Stale {
                current_sequence: current.sequence_number,
            };
        }
    }

    let open_alert_id = current.and_then(|state| state.open_alert_id.clone());
    let breach = band.and_then(|band| band.breach(event.value));

    let (status, open_alert_id, alert) = match (open_alert_id, breach) {
        (None, Some((direction, threshold))) => {
            let alert = Alert {
                alert_id: Alert::derive_id(&event.idempotency_key),
                device_id: event.device_id.clone(),
                metric: event.metric,
                direction,
                threshold,
                opened_at: event.device_timestamp,
                opened_sequence: event.sequence_number,
                opened_value: event.value,
                resolved_at: None,
                resolved_sequence: None,
                resolved_value: None,
            };
            (
                VitalStatus::AlertOpen,
                Some(alert.alert_id.clone()),
                Some(AlertTransition::Open(alert)),
            )
        }
        (Some(alert_id), None) => (
            VitalStatus::Nominal,
            None,
            Some(AlertTransition::Resolve {
                alert_id,
                resolved_at: event.device_timestamp,
                resolved_sequence: event.sequence_number,
                resolved_value: event.value,
            }),
        ),
        (Some(alert_id), Some(_)) => (VitalStatus::AlertOpen, Some(alert_id), None),
        (None, None) => (VitalStatus::Nominal, None, None),
    };

    Decision::Apply(AggregateMutation {
        expected_sequence: current.map(|state| state.sequence_number),
        idempotency_key: event.idempotency_key.clone(),
        next_state: DeviceVitalState {
            device_id: event.device_id.clone(),
            metric: event.metric,
            value: event.value,
            unit: event.unit.clone(),
            observed_at: event.device_timestamp,
            sequence_number: event.sequence_number,
            status,
            open_alert_id,
            last_idempotency_key: event.idempotency_key.clone(),
            updated_at: now,
        },
        alert,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::domain::{AlertDirection, IdempotencyKey, MetricKind};

    fn event(sequence: u64, value: f64) -> NormalizedEvent {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(sequence as i64);
        NormalizedEvent {
            device_id: "bed-2".to_string(),
            metric: MetricKind::HeartRate,
            value,
            unit: "bpm".to_string(),
            device_timestamp: ts,
            received_at: ts,
            sequence_number: sequence,
            idempotency_key: IdempotencyKey::compute("bed-2", MetricKind::HeartRate, &ts, Some(sequence)),
            quality_score: None,
        }
    }

    fn applied(decision: Decision) -> AggregateMutation {
        match decision {
            Decision::Apply(mutation) => mutation,
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    fn band() -> ThresholdBand {
        ThresholdBand::new(Some(40.0), Some(100.0))
    }

    #[test]
    fn test_first_event_inserts_nominal_state() {
        let mutation = applied(decide(None, &event(1, 80.0), Some(&band()), Utc::now()));

        assert_eq!(mutation.expected_sequence, None);
        assert_eq!(mutation.next_state.status, VitalStatus::Nominal);
        assert_eq!(mutation.next_state.sequence_number, 1);
        assert!(mutation.alert.is_none());
    }

    #[test]
    fn test_out_of_range_opens_alert() {
        let current = applied(decide(None, &event(1, 80.0), Some(&band()), Utc::now())).next_state;

        let high = event(2, 130.0);
        let mutation = applied(decide(Some(&current), &high, Some(&band()), Utc::now()));

        assert_eq!(mutation.expected_sequence, Some(1));
        assert_eq!(mutation.next_state.status, VitalStatus::AlertOpen);
        let expected_id = Alert::derive_id(&high.idempotency_key);
        assert_eq!(mutation.next_state.open_alert_id.as_deref(), Some(expected_id.as_str()));
        match mutation.alert {
            Some(AlertTransition::Open(alert)) => {
                assert_eq!(alert.alert_id, expected_id);
                assert_eq!(alert.direction, AlertDirection::High);
                assert_eq!(alert.threshold, 100.0);
                assert_eq!(alert.opened_sequence, 2);
            }
            other => panic!("expected alert open, got {:?}", other),
        }
    }

    #[test]
    fn test_repeated_breach_does_not_refire() {
        let first = applied(decide(None, &event(1, 130.0), Some(&band()), Utc::now()));
        let mutation = applied(decide(Some(&first.next_state), &event(2, 20.0), Some(&band()), Utc::now()));

        assert_eq!(mutation.next_state.status, VitalStatus::AlertOpen);
        assert_eq!(mutation.next_state.open_alert_id, first.next_state.open_alert_id);
        assert!(mutation.alert.is_none());
    }

    #[test]
    fn test_return_to_range_resolves_alert() {
        let open = applied(decide(None, &event(1, 30.0), Some(&band()), Utc::now())).next_state;
        let alert_id = open.open_alert_id.clone().unwrap();

        let mutation = applied(decide(Some(&open), &event(2, 60.0), Some(&band()), Utc::now()));

        assert_eq!(mutation.next_state.status, VitalStatus::Nominal);
        assert_eq!(mutation.next_state.open_alert_id, None);
        assert_eq!(
            mutation.alert,
            Some(AlertTransition::Resolve {
                alert_id,
                resolved_at: event(2, 60.0).device_timestamp,
                resolved_sequence: 2,
                resolved_value: 60.0,
            })
        );
    }

    #[test]
    fn test_older_or_equal_sequence_is_stale() {
        let current = applied(decide(None, &event(5, 80.0), Some(&band()), Utc::now())).next_state;

        assert_eq!(
            decide(Some(&current), &event(5, 81.0), Some(&band()), Utc::now()),
            Decision::Stale { current_sequence: 5 }
        );
        assert_eq!(
            decide(Some(&current), &event(3, 81.0), Some(&band()), Utc::now()),
            Decision::Stale { current_sequence: 5 }
        );
    }

    #[test]
    fn test_metric_without_band_never_alerts() {
        let mutation = applied(decide(None, &event(1, 250.0), None, Utc::now()));

        assert_eq!(mutation.next_state.status, VitalStatus::Nominal);
        assert!(mutation.alert.is_none());
    }
}
