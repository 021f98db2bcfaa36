use crate::domain::{
    AggregateId, AggregateMutation, Alert, AlertTransition, DeviceVitalState, DomainError,
    DomainResult, IdempotencyKey, VitalStateRepository,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct RepositoryState {
    aggregates: HashMap<AggregateId, DeviceVitalState>,
    alerts: HashMap<String, Alert>,
    applied: HashSet<IdempotencyKey>,
}

/// In-memory implementation of VitalStateRepository.
///
/// A mutation is checked completely before anything is written, which gives
/// the same all-or-nothing outcome as the Postgres transaction.
#[derive(Clone, Default)]
pub struct InMemoryVitalStateRepository {
    state: Arc<RwLock<RepositoryState>>,
}

impl InMemoryVitalStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn applied_count(&self) -> usize {
        self.state.read().await.applied.len()
    }
}

#[async_trait]
impl VitalStateRepository for InMemoryVitalStateRepository {
    async fn get_aggregate(
        &self,
        aggregate_id: &AggregateId,
    ) -> DomainResult<Option<DeviceVitalState>> {
        let state = self.state.read().await;
        Ok(state.aggregates.get(aggregate_id).cloned())
    }

    async fn is_applied(&self, idempotency_key: &IdempotencyKey) -> DomainResult<bool> {
        let state = self.state.read().await;
        Ok(state.applied.contains(idempotency_key))
    }

    async fn apply_transactionally(
        &self,
        aggregate_id: &AggregateId,
        mutation: AggregateMutation,
    ) -> DomainResult<DeviceVitalState> {
        if mutation.next_state.aggregate_id() != *aggregate_id {
            return Err(DomainError::ValidationError(format!(
                "mutation for {} applied to {}",
                mutation.next_state.aggregate_id(),
                aggregate_id
            )));
        }

        let mut state = self.state.write().await;

        if state.applied.contains(&mutation.idempotency_key) {
            return Err(DomainError::AlreadyApplied(
                mutation.idempotency_key.to_string(),
            ));
        }

        let actual = state
            .aggregates
            .get(aggregate_id)
            .map(|current| current.sequence_number);
        if actual != mutation.expected_sequence {
            return Err(DomainError::ConflictError {
                aggregate: aggregate_id.to_string(),
                expected: mutation.expected_sequence,
                actual,
            });
        }

        match &mutation.alert {
            Some(AlertTransition::Open(alert)) if state.alerts.contains_key(&alert.alert_id) => {
                return Err(DomainError::ProcessingError(format!(
                    "alert {} already exists",
                    alert.alert_id
                )));
            }
            Some(AlertTransition::Resolve { alert_id, .. }) => {
                let open = state.alerts.get(alert_id).is_some_and(Alert::is_open);
                if !open {
                    return Err(DomainError::ProcessingError(format!(
                        "no open alert {} to resolve",
                        alert_id
                    )));
                }
            }
            _ => {}
        }

        match mutation.alert {
            Some(AlertTransition::Open(alert)) => {
                state.alerts.insert(alert.alert_id.clone(), alert);
            }
            Some(AlertTransition::Resolve {
                alert_id,
                resolved_at,
                resolved_sequence,
                resolved_value,
            }) => {
                if let Some(alert) = state.alerts.get_mut(&alert_id) {
                    alert.resolved_at = Some(resolved_at);
                    alert.resolved_sequence = Some(resolved_sequence);
                    alert.resolved_value = Some(resolved_value);
                }
            }
            None => {}
        }

        state.applied.insert(mutation.idempotency_key);
        state
            .aggregates
            .insert(aggregate_id.clone(), mutation.next_state.clone());

        Ok(mutation.next_state)
    }

    async fn get_alert(&self, alert_id: &str) -> DomainResult<Option<Alert>> {
        let state = self.state.read().await;
        Ok(state.alerts.get(alert_id).cloned())
    }

    async fn list_alerts(&self, device_id: &str, open_only: bool) -> DomainResult<Vec<Alert>> {
        let state = self.state.read().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .values()
            .filter(|a| a.device_id == device_id && (!open_only || a.is_open()))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| {
            b.opened_at
                .cmp(&a.opened_at)
                .then(b.opened_sequence.cmp(&a.opened_sequence))
        });
        Ok(alerts)
    }
}
