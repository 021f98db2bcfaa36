use crate::domain::{
    AggregateId, AggregateMutation, Alert, AlertTransition, DeviceVitalState, DomainError,
    DomainResult, IdempotencyKey, VitalStateRepository,
};
use crate::postgres::PostgresClient;
use anyhow::anyhow;
use async_trait::async_trait;
use tokio_postgres::Row;
use tracing::{debug, instrument};

const STATE_COLUMNS: &str = "device_id, metric, value, unit, observed_at, sequence_number, \
     status, open_alert_id, last_idempotency_key, updated_at";

const ALERT_COLUMNS: &str = "alert_id, device_id, metric, direction, threshold, opened_at, \
     opened_sequence, opened_value, resolved_at, resolved_sequence, resolved_value";

/// Postgres-backed aggregate store.
///
/// Each applied event is one transaction: the idempotency key insert, the
/// sequence-guarded aggregate write and the alert change commit together.
#[derive(Clone)]
pub struct PostgresVitalStateRepository {
    client: PostgresClient,
}

impl PostgresVitalStateRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

fn storage_error(e: impl Into<anyhow::Error>) -> DomainError {
    DomainError::StorageError(e.into())
}

fn to_db_sequence(sequence: u64) -> DomainResult<i64> {
    i64::try_from(sequence).map_err(|_| {
        DomainError::ValidationError(format!(
            "sequence number {} exceeds storage range",
            sequence
        ))
    })
}

fn from_db_sequence(sequence: i64) -> DomainResult<u64> {
    u64::try_from(sequence)
        .map_err(|_| storage_error(anyhow!("negative sequence number {} in storage", sequence)))
}

fn state_from_row(row: &Row) -> DomainResult<DeviceVitalState> {
    let metric: String = row.try_get("metric").map_err(storage_error)?;
    let status: String = row.try_get("status").map_err(storage_error)?;
    let key: String = row.try_get("last_idempotency_key").map_err(storage_error)?;

    Ok(DeviceVitalState {
        device_id: row.try_get("device_id").map_err(storage_error)?,
        metric: metric.parse().map_err(storage_error)?,
        value: row.try_get("value").map_err(storage_error)?,
        unit: row.try_get("unit").map_err(storage_error)?,
        observed_at: row.try_get("observed_at").map_err(storage_error)?,
        sequence_number: from_db_sequence(row.try_get("sequence_number").map_err(storage_error)?)?,
        status: status.parse().map_err(storage_error)?,
        open_alert_id: row.try_get("open_alert_id").map_err(storage_error)?,
        last_idempotency_key: IdempotencyKey::from_raw(key),
        updated_at: row.try_get("updated_at").map_err(storage_error)?,
    })
}

fn alert_from_row(row: &Row) -> DomainResult<Alert> {
    let metric: String = row.try_get("metric").map_err(storage_error)?;
    let direction: String = row.try_get("direction").map_err(storage_error)?;
    let resolved_sequence: Option<i64> = row.try_get("resolved_sequence").map_err(storage_error)?;

    Ok(Alert {
        alert_id: row.try_get("alert_id").map_err(storage_error)?,
        device_id: row.try_get("device_id").map_err(storage_error)?,
        metric: metric.parse().map_err(storage_error)?,
        direction: direction.parse().map_err(storage_error)?,
        threshold: row.try_get("threshold").map_err(storage_error)?,
        opened_at: row.try_get("opened_at").map_err(storage_error)?,
        opened_sequence: from_db_sequence(row.try_get("opened_sequence").map_err(storage_error)?)?,
        opened_value: row.try_get("opened_value").map_err(storage_error)?,
        resolved_at: row.try_get("resolved_at").map_err(storage_error)?,
        resolved_sequence: resolved_sequence.map(from_db_sequence).transpose()?,
        resolved_value: row.try_get("resolved_value").map_err(storage_error)?,
    })
}

#[async_trait]
impl VitalStateRepository for PostgresVitalStateRepository {
    async fn get_aggregate(
        &self,
        aggregate_id: &AggregateId,
    ) -> DomainResult<Option<DeviceVitalState>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::StorageError)?;

        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM vital_states WHERE device_id = $1 AND metric = $2",
                    STATE_COLUMNS
                ),
                &[&aggregate_id.device_id, &aggregate_id.metric.as_str()],
            )
            .await
            .map_err(storage_error)?;

        row.as_ref().map(state_from_row).transpose()
    }

    async fn is_applied(&self, idempotency_key: &IdempotencyKey) -> DomainResult<bool> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::StorageError)?;

        let row = conn
            .query_opt(
                "SELECT 1 FROM applied_events WHERE idempotency_key = $1",
                &[&idempotency_key.as_str()],
            )
            .await
            .map_err(storage_error)?;

        Ok(row.is_some())
    }

    #[instrument(
        skip(self, mutation),
        fields(
            aggregate = %aggregate_id,
            expected_sequence = ?mutation.expected_sequence,
            next_sequence = mutation.next_state.sequence_number,
        )
    )]
    async fn apply_transactionally(
        &self,
        aggregate_id: &AggregateId,
        mutation: AggregateMutation,
    ) -> DomainResult<DeviceVitalState> {
        let next = &mutation.next_state;
        if next.aggregate_id() != *aggregate_id {
            return Err(DomainError::ValidationError(format!(
                "mutation for {} applied to {}",
                next.aggregate_id(),
                aggregate_id
            )));
        }

        let next_sequence = to_db_sequence(next.sequence_number)?;
        let expected_sequence = mutation
            .expected_sequence
            .map(to_db_sequence)
            .transpose()?;
        let metric = aggregate_id.metric.as_str();

        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::StorageError)?;

        let tx = conn.transaction().await.map_err(storage_error)?;

        let claimed = tx
            .execute(
                "INSERT INTO applied_events (idempotency_key, device_id, metric, sequence_number, applied_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (idempotency_key) DO NOTHING",
                &[
                    &mutation.idempotency_key.as_str(),
                    &aggregate_id.device_id,
                    &metric,
                    &next_sequence,
                    &next.updated_at,
                ],
            )
            .await
            .map_err(storage_error)?;

        if claimed == 0 {
            tx.rollback().await.map_err(storage_error)?;
            return Err(DomainError::AlreadyApplied(
                mutation.idempotency_key.to_string(),
            ));
        }

        let written = match expected_sequence {
            Some(expected) => tx
                .execute(
                    "UPDATE vital_states
                     SET value = $3, unit = $4, observed_at = $5, sequence_number = $6,
                         status = $7, open_alert_id = $8, last_idempotency_key = $9, updated_at = $10
                     WHERE device_id = $1 AND metric = $2 AND sequence_number = $11",
                    &[
                        &aggregate_id.device_id,
                        &metric,
                        &next.value,
                        &next.unit,
                        &next.observed_at,
                        &next_sequence,
                        &next.status.as_str(),
                        &next.open_alert_id,
                        &next.last_idempotency_key.as_str(),
                        &next.updated_at,
                        &expected,
                    ],
                )
                .await
                .map_err(storage_error)?,
            None => tx
                .execute(
                    &format!(
                        "INSERT INTO vital_states ({})
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                         ON CONFLICT (device_id, metric) DO NOTHING",
                        STATE_COLUMNS
                    ),
                    &[
                        &aggregate_id.device_id,
                        &metric,
                        &next.value,
                        &next.unit,
                        &next.observed_at,
                        &next_sequence,
                        &next.status.as_str(),
                        &next.open_alert_id,
                        &next.last_idempotency_key.as_str(),
                        &next.updated_at,
                    ],
                )
                .await
                .map_err(storage_error)?,
        };

        if written == 0 {
            let actual = tx
                .query_opt(
                    "SELECT sequence_number FROM vital_states WHERE device_id = $1 AND metric = $2",
                    &[&aggregate_id.device_id, &metric],
                )
                .await
                .map_err(storage_error)?
                .map(|row| from_db_sequence(row.get(0)))
                .transpose()?;
            tx.rollback().await.map_err(storage_error)?;

            debug!(actual_sequence = ?actual, "optimistic check failed");
            return Err(DomainError::ConflictError {
                aggregate: aggregate_id.to_string(),
                expected: mutation.expected_sequence,
                actual,
            });
        }

        match &mutation.alert {
            Some(AlertTransition::Open(alert)) => {
                tx.execute(
                    &format!(
                        "INSERT INTO vital_alerts ({})
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, NULL, NULL)",
                        ALERT_COLUMNS
                    ),
                    &[
                        &alert.alert_id,
                        &alert.device_id,
                        &alert.metric.as_str(),
                        &alert.direction.as_str(),
                        &alert.threshold,
                        &alert.opened_at,
                        &to_db_sequence(alert.opened_sequence)?,
                        &alert.opened_value,
                    ],
                )
                .await
                .map_err(storage_error)?;
            }
            Some(AlertTransition::Resolve {
                alert_id,
                resolved_at,
                resolved_sequence,
                resolved_value,
            }) => {
                let resolved = tx
                    .execute(
                        "UPDATE vital_alerts
                         SET resolved_at = $2, resolved_sequence = $3, resolved_value = $4
                         WHERE alert_id = $1 AND resolved_at IS NULL",
                        &[
                            alert_id,
                            resolved_at,
                            &to_db_sequence(*resolved_sequence)?,
                            resolved_value,
                        ],
                    )
                    .await
                    .map_err(storage_error)?;

                if resolved == 0 {
                    tx.rollback().await.map_err(storage_error)?;
                    return Err(DomainError::ProcessingError(format!(
                        "no open alert {} to resolve",
                        alert_id
                    )));
                }
            }
            None => {}
        }

        tx.commit().await.map_err(storage_error)?;

        debug!("aggregate committed");
        Ok(mutation.next_state)
    }

    async fn get_alert(&self, alert_id: &str) -> DomainResult<Option<Alert>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::StorageError)?;

        let row = conn
            .query_opt(
                &format!("SELECT {} FROM vital_alerts WHERE alert_id = $1", ALERT_COLUMNS),
                &[&alert_id],
            )
            .await
            .map_err(storage_error)?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn list_alerts(&self, device_id: &str, open_only: bool) -> DomainResult<Vec<Alert>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::StorageError)?;

        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM vital_alerts
                     WHERE device_id = $1 AND (NOT $2 OR resolved_at IS NULL)
                     ORDER BY opened_at DESC, opened_sequence DESC",
                    ALERT_COLUMNS
                ),
                &[&device_id, &open_only],
            )
            .await
            .map_err(storage_error)?;

        rows.iter().map(alert_from_row).collect()
    }
}
