use crate::domain::result::DomainResult;
use crate::domain::vital_state::{AggregateId, DeviceVitalState};
use async_trait::async_trait;

/// Latest-known-state projection with bounded staleness.
///
/// The repository stays the source of truth; anything here may be evicted or
/// expire at any time.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ReadModelCache: Send + Sync {
    /// `None` on a miss or an expired entry.
    async fn get(&self, aggregate_id: &AggregateId) -> DomainResult<Option<DeviceVitalState>>;

    /// Store a snapshot unless the cached one already carries a higher
    /// sequence number.
    async fn put(&self, state: &DeviceVitalState) -> DomainResult<()>;

    async fn invalidate(&self, aggregate_id: &AggregateId) -> DomainResult<()>;
}
