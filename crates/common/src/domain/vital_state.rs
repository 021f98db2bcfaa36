use crate::domain::alert::Alert;
use crate::domain::metric::MetricKind;
use crate::domain::reading::IdempotencyKey;
use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a device vital state aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateId {
    pub device_id: String,
    pub metric: MetricKind,
}

impl AggregateId {
    pub fn new(device_id: impl Into<String>, metric: MetricKind) -> Self {
        Self {
            device_id: device_id.into(),
            metric,
        }
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.metric)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VitalStatus {
    Nominal,
    AlertOpen,
}

impl VitalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VitalStatus::Nominal => "nominal",
            VitalStatus::AlertOpen => "alert_open",
        }
    }
}

impl FromStr for VitalStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nominal" => Ok(VitalStatus::Nominal),
            "alert_open" => Ok(VitalStatus::AlertOpen),
            other => Err(DomainError::ValidationError(format!(
                "unknown vital status: {}",
                other
            ))),
        }
    }
}

/// Latest known state of one metric on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceVitalState {
    pub device_id: String,
    pub metric: MetricKind,
    pub value: f64,
    pub unit: String,
    /// Device clock timestamp of the reading that produced this state.
    pub observed_at: DateTime<Utc>,
    pub sequence_number: u64,
    pub status: VitalStatus,
    pub open_alert_id: Option<String>,
    pub last_idempotency_key: IdempotencyKey,
    pub updated_at: DateTime<Utc>,
}

impl DeviceVitalState {
    pub fn aggregate_id(&self) -> AggregateId {
        AggregateId::new(self.device_id.clone(), self.metric)
    }
}

/// Alert side effect committed together with an aggregate update.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Open(Alert),
    Resolve {
        alert_id: String,
        resolved_at: DateTime<Utc>,
        resolved_sequence: u64,
        resolved_value: f64,
    },
}

/// Everything one applied event changes, committed as a single unit.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateMutation {
    /// Sequence number the writer read; `None` when the aggregate did not exist.
    pub expected_sequence: Option<u64>,
    pub idempotency_key: IdempotencyKey,
    pub next_state: DeviceVitalState,
    pub alert: Option<AlertTransition>,
}

/// Durable store of vital state aggregates, alerts and applied idempotency keys.
///
/// Implementations must make `apply_transactionally` atomic: the idempotency
/// key insert, the compare-and-update of the aggregate and the alert change
/// either all land or none do.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait VitalStateRepository: Send + Sync {
    async fn get_aggregate(
        &self,
        aggregate_id: &AggregateId,
    ) -> DomainResult<Option<DeviceVitalState>>;

    async fn is_applied(&self, idempotency_key: &IdempotencyKey) -> DomainResult<bool>;

    /// Returns `ConflictError` when the stored sequence number differs from
    /// `mutation.expected_sequence`, and `AlreadyApplied` when the key exists.
    async fn apply_transactionally(
        &self,
        aggregate_id: &AggregateId,
        mutation: AggregateMutation,
    ) -> DomainResult<DeviceVitalState>;

    async fn get_alert(&self, alert_id: &str) -> DomainResult<Option<Alert>>;

    /// Alerts for a device, newest first.
    async fn list_alerts(&self, device_id: &str, open_only: bool) -> DomainResult<Vec<Alert>>;
}
