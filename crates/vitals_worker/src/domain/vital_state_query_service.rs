use common::domain::{
    AggregateId, Alert, DeviceVitalState, DomainResult, ReadModelCache, VitalStateRepository,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Read side: latest state from the cache, falling back to the repository.
pub struct VitalStateQueryService {
    repository: Arc<dyn VitalStateRepository>,
    cache: Arc<dyn ReadModelCache>,
}

impl VitalStateQueryService {
    pub fn new(repository: Arc<dyn VitalStateRepository>, cache: Arc<dyn ReadModelCache>) -> Self {
        Self { repository, cache }
    }

    /// Cache hit, or a repository read that repopulates the cache.
    #[instrument(skip(self), fields(aggregate = %aggregate_id))]
    pub async fn latest_state(
        &self,
        aggregate_id: &AggregateId,
    ) -> DomainResult<Option<DeviceVitalState>> {
        match self.cache.get(aggregate_id).await {
            Ok(Some(state)) => {
                debug!(sequence_number = state.sequence_number, "cache hit");
                return Ok(Some(state));
            }
            Ok(None) => debug!("cache miss"),
            Err(e) => warn!(error = %e, "cache read failed, using repository"),
        }

        let state = self.repository.get_aggregate(aggregate_id).await?;

        if let Some(state) = &state {
            if let Err(e) = self.cache.put(state).await {
                warn!(error = %e, "cache repopulation failed");
            }
        }

        Ok(state)
    }

    pub async fn alerts(&self, device_id: &str, open_only: bool) -> DomainResult<Vec<Alert>> {
        self.repository.list_alerts(device_id, open_only).await
    }

    pub async fn alert(&self, alert_id: &str) -> DomainResult<Option<Alert>> {
        self.repository.get_alert(alert_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::domain::{
        DomainError, IdempotencyKey, MetricKind, MockReadModelCache, MockVitalStateRepository,
        VitalStatus,
    };
    use common::memory::InMemoryReadModelCache;
    use std::time::Duration;

    fn state(sequence: u64) -> DeviceVitalState {
        DeviceVitalState {
            device_id: "bed-8".to_string(),
            metric: MetricKind::BloodPressure,
            value: 118.0,
            unit: "mmHg".to_string(),
            observed_at: Utc::now(),
            sequence_number: sequence,
            status: VitalStatus::Nominal,
            open_alert_id: None,
            last_idempotency_key: IdempotencyKey::from_raw(format!("key-{}", sequence)),
            updated_at: Utc::now(),
        }
    }

    fn id() -> AggregateId {
        AggregateId::new("bed-8", MetricKind::BloodPressure)
    }

    #[tokio::test]
    async fn test_cache_hit_skips_repository() {
        let mut repository = MockVitalStateRepository::new();
        repository.expect_get_aggregate().times(0);
        let cache = InMemoryReadModelCache::new(Duration::from_secs(60));
        cache.put(&state(4)).await.unwrap();

        let service = VitalStateQueryService::new(Arc::new(repository), Arc::new(cache));

        let found = service.latest_state(&id()).await.unwrap().unwrap();
        assert_eq!(found.sequence_number, 4);
    }

    #[tokio::test]
    async fn test_miss_reads_repository_and_repopulates() {
        let mut repository = MockVitalStateRepository::new();
        repository
            .expect_get_aggregate()
            .times(1)
            .returning(|_| Ok(Some(state(7))));
        let cache = InMemoryReadModelCache::new(Duration::from_secs(60));

        let service = VitalStateQueryService::new(Arc::new(repository), Arc::new(cache.clone()));

        let found = service.latest_state(&id()).await.unwrap().unwrap();
        assert_eq!(found.sequence_number, 7);
        assert_eq!(cache.get(&id()).await.unwrap().unwrap().sequence_number, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_falls_back_to_repository() {
        let mut repository = MockVitalStateRepository::new();
        repository
            .expect_get_aggregate()
            .times(1)
            .returning(|_| Ok(Some(state(9))));
        let cache = InMemoryReadModelCache::new(Duration::from_secs(1));
        cache.put(&state(3)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let service = VitalStateQueryService::new(Arc::new(repository), Arc::new(cache));

        let found = service.latest_state(&id()).await.unwrap().unwrap();
        assert_eq!(found.sequence_number, 9);
    }

    #[tokio::test]
    async fn test_cache_errors_are_not_fatal() {
        let mut repository = MockVitalStateRepository::new();
        repository
            .expect_get_aggregate()
            .returning(|_| Ok(Some(state(2))));
        let mut cache = MockReadModelCache::new();
        cache
            .expect_get()
            .returning(|_| Err(DomainError::CacheError("timeout".to_string())));
        cache
            .expect_put()
            .returning(|_| Err(DomainError::CacheError("timeout".to_string())));

        let service = VitalStateQueryService::new(Arc::new(repository), Arc::new(cache));

        let found = service.latest_state(&id()).await.unwrap();
        assert_eq!(found.map(|s| s.sequence_number), Some(2));
    }

    #[tokio::test]
    async fn test_unknown_aggregate_is_none() {
        let mut repository = MockVitalStateRepository::new();
        repository.expect_get_aggregate().returning(|_| Ok(None));
        let mut cache = MockReadModelCache::new();
        cache.expect_get().returning(|_| Ok(None));
        cache.expect_put().times(0);

        let service = VitalStateQueryService::new(Arc::new(repository), Arc::new(cache));

        assert!(service.latest_state(&id()).await.unwrap().is_none());
    }
}
