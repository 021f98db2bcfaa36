use crate::domain::{decide, Decision};
use chrono::Utc;
use common::domain::{
    AggregateId, AlertThresholds, AlertTransition, DeviceVitalState, DomainError, DomainResult,
    NormalizedEvent, ReadModelCache, VitalStateRepository,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The idempotency key was applied before.
    Duplicate,
    /// The aggregate already holds an equal or newer sequence number.
    Stale,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Duplicate => "duplicate",
            SkipReason::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(DeviceVitalState),
    Skipped(SkipReason),
}

#[derive(Debug, Clone)]
pub struct EventProcessorConfig {
    pub thresholds: AlertThresholds,
    /// Re-read and re-decide at most this many times after a conflict.
    pub max_conflict_retries: u32,
    /// Base delay between conflict retries, multiplied by the retry number.
    pub conflict_backoff: Duration,
    /// Storage errors and timeouts are retried this many times before the
    /// error is handed back for redelivery.
    pub max_transient_retries: u32,
    /// First delay between transient retries, doubled per retry.
    pub transient_backoff: Duration,
    pub max_transient_backoff: Duration,
    /// Upper bound for each repository call.
    pub operation_timeout: Duration,
}

impl Default for EventProcessorConfig {
    fn default() -> Self {
        Self {
            thresholds: AlertThresholds::default(),
            max_conflict_retries: 3,
            conflict_backoff: Duration::from_millis(20),
            max_transient_retries: 3,
            transient_backoff: Duration::from_millis(200),
            max_transient_backoff: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// Applies normalized events to device vital state aggregates.
///
/// Each event is checked against the idempotency table and the aggregate's
/// sequence number, then committed as one optimistic transaction. The cache
/// entry is dropped before and after the commit and refreshed from the
/// committed snapshot. Storage errors and timeouts are retried in place so a
/// device's later events never overtake a failed one while it can still
/// succeed.
pub struct DomainEventProcessor {
    repository: Arc<dyn VitalStateRepository>,
    cache: Arc<dyn ReadModelCache>,
    config: EventProcessorConfig,
}

impl DomainEventProcessor {
    pub fn new(
        repository: Arc<dyn VitalStateRepository>,
        cache: Arc<dyn ReadModelCache>,
        config: EventProcessorConfig,
    ) -> Self {
        Self {
            repository,
            cache,
            config,
        }
    }

    #[instrument(
        skip(self, event),
        fields(
            device_id = %event.device_id,
            metric = %event.metric,
            sequence_number = event.sequence_number,
            idempotency_key = %event.idempotency_key,
        )
    )]
    pub async fn apply(&self, event: &NormalizedEvent) -> DomainResult<ApplyOutcome> {
        let mut retries = 0u32;
        loop {
            match self.apply_once(event).await {
                Err(e @ (DomainError::StorageError(_) | DomainError::Timeout(_)))
                    if retries < self.config.max_transient_retries =>
                {
                    retries += 1;
                    let delay = self.transient_delay(retries);
                    warn!(
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    fn transient_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.config
            .transient_backoff
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.config.max_transient_backoff)
    }

    async fn apply_once(&self, event: &NormalizedEvent) -> DomainResult<ApplyOutcome> {
        if self
            .bounded("is_applied", self.repository.is_applied(&event.idempotency_key))
            .await?
        {
            info!(reason = SkipReason::Duplicate.as_str(), "skipping event");
            return Ok(ApplyOutcome::Skipped(SkipReason::Duplicate));
        }

        let aggregate_id = event.aggregate_id();
        let band = self.config.thresholds.band_for(event.metric);
        let mut conflicts = 0u32;

        loop {
            let current = self
                .bounded("get_aggregate", self.repository.get_aggregate(&aggregate_id))
                .await?;

            let mutation = match decide(current.as_ref(), event, band, Utc::now()) {
                Decision::Stale { current_sequence } => {
                    info!(
                        reason = SkipReason::Stale.as_str(),
                        current_sequence, "skipping event"
                    );
                    return Ok(ApplyOutcome::Skipped(SkipReason::Stale));
                }
                Decision::Apply(mutation) => mutation,
            };
            let transition = mutation.alert.clone();

            self.invalidate_cache(&aggregate_id).await;

            let result = self
                .bounded(
                    "apply_transactionally",
                    self.repository.apply_transactionally(&aggregate_id, mutation),
                )
                .await;

            match result {
                Ok(state) => {
                    log_transition(transition.as_ref());
                    // A read may have cached the old snapshot while the commit ran.
                    self.invalidate_cache(&aggregate_id).await;
                    self.refresh_cache(&state).await;
                    debug!(status = state.status.as_str(), "event applied");
                    return Ok(ApplyOutcome::Applied(state));
                }
                Err(DomainError::AlreadyApplied(_)) => {
                    info!(reason = SkipReason::Duplicate.as_str(), "skipping event");
                    return Ok(ApplyOutcome::Skipped(SkipReason::Duplicate));
                }
                Err(e @ DomainError::ConflictError { .. }) => {
                    conflicts += 1;
                    if conflicts > self.config.max_conflict_retries {
                        warn!(conflicts, error = %e, "giving up after repeated conflicts");
                        return Err(e);
                    }
                    debug!(conflicts, error = %e, "concurrent update detected, re-deciding");
                    tokio::time::sleep(self.config.conflict_backoff * conflicts).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = DomainResult<T>>,
    ) -> DomainResult<T> {
        match tokio::time::timeout(self.config.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::Timeout(format!(
                "{} exceeded {}ms",
                operation,
                self.config.operation_timeout.as_millis()
            ))),
        }
    }

    async fn invalidate_cache(&self, aggregate_id: &AggregateId) {
        if let Err(e) = self.cache.invalidate(aggregate_id).await {
            warn!(error = %e, "cache invalidation failed");
        }
    }

    async fn refresh_cache(&self, state: &DeviceVitalState) {
        if let Err(e) = self.cache.put(state).await {
            warn!(error = %e, "cache refresh failed");
        }
    }
}

fn log_transition(transition: Option<&AlertTransition>) {
    match transition {
        Some(AlertTransition::Open(alert)) => info!(
            alert_id = %alert.alert_id,
            direction = alert.direction.as_str(),
            threshold = alert.threshold,
            value = alert.opened_value,
            "alert opened"
        ),
        Some(AlertTransition::Resolve {
            alert_id,
            resolved_value,
            ..
        }) => info!(alert_id = %alert_id, value = resolved_value, "alert resolved"),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use common::domain::{
        AggregateMutation, Alert, IdempotencyKey, MetricKind, MockReadModelCache,
        MockVitalStateRepository, ThresholdBand, VitalStatus,
    };
    use common::memory::{InMemoryReadModelCache, InMemoryVitalStateRepository};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn event(device: &str, sequence: u64, value: f64) -> NormalizedEvent {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
            + ChronoDuration::seconds(sequence as i64);
        NormalizedEvent {
            device_id: device.to_string(),
            metric: MetricKind::HeartRate,
            value,
            unit: "bpm".to_string(),
            device_timestamp: ts,
            received_at: ts,
            sequence_number: sequence,
            idempotency_key: IdempotencyKey::compute(device, MetricKind::HeartRate, &ts, Some(sequence)),
            quality_score: None,
        }
    }

    fn config() -> EventProcessorConfig {
        EventProcessorConfig {
            thresholds: AlertThresholds::new()
                .with_band(MetricKind::HeartRate, ThresholdBand::new(None, Some(100.0))),
            conflict_backoff: Duration::from_millis(1),
            transient_backoff: Duration::from_millis(1),
            ..EventProcessorConfig::default()
        }
    }

    struct Harness {
        repository: InMemoryVitalStateRepository,
        cache: InMemoryReadModelCache,
        processor: DomainEventProcessor,
    }

    fn harness() -> Harness {
        let repository = InMemoryVitalStateRepository::new();
        let cache = InMemoryReadModelCache::new(Duration::from_secs(60));
        let processor = DomainEventProcessor::new(
            Arc::new(repository.clone()),
            Arc::new(cache.clone()),
            config(),
        );
        Harness {
            repository,
            cache,
            processor,
        }
    }

    async fn apply_all(processor: &DomainEventProcessor, events: &[NormalizedEvent]) -> Vec<ApplyOutcome> {
        let mut outcomes = Vec::new();
        for event in events {
            outcomes.push(processor.apply(event).await.unwrap());
        }
        outcomes
    }

    #[tokio::test]
    async fn test_applying_twice_has_one_effect() {
        let h = harness();
        let breach = event("bed-1", 1, 120.0);

        let first = h.processor.apply(&breach).await.unwrap();
        let second = h.processor.apply(&breach).await.unwrap();

        assert!(matches!(first, ApplyOutcome::Applied(_)));
        assert_eq!(second, ApplyOutcome::Skipped(SkipReason::Duplicate));
        assert_eq!(h.repository.applied_count().await, 1);
        assert_eq!(h.repository.list_alerts("bed-1", false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_delivery_converges_on_latest_sequence() {
        let in_order = harness();
        let shuffled = harness();

        apply_all(
            &in_order.processor,
            &[event("bed-1", 1, 70.0), event("bed-1", 2, 75.0), event("bed-1", 3, 80.0)],
        )
        .await;
        let outcomes = apply_all(
            &shuffled.processor,
            &[event("bed-1", 2, 75.0), event("bed-1", 1, 70.0), event("bed-1", 3, 80.0)],
        )
        .await;

        assert_eq!(outcomes[1], ApplyOutcome::Skipped(SkipReason::Stale));

        let id = AggregateId::new("bed-1", MetricKind::HeartRate);
        let a = in_order.repository.get_aggregate(&id).await.unwrap().unwrap();
        let b = shuffled.repository.get_aggregate(&id).await.unwrap().unwrap();
        assert_eq!(a.sequence_number, 3);
        assert_eq!(b.sequence_number, 3);
        assert_eq!(a.value, b.value);
        assert_eq!(a.status, b.status);
        assert_eq!(a.last_idempotency_key, b.last_idempotency_key);
    }

    #[tokio::test]
    async fn test_threshold_crossing_opens_then_resolves_one_alert() {
        let h = harness();
        let events = [event("bed-1", 1, 90.0), event("bed-1", 2, 110.0), event("bed-1", 3, 95.0)];

        apply_all(&h.processor, &events).await;

        let alerts = h.repository.list_alerts("bed-1", false).await.unwrap();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.alert_id, Alert::derive_id(&events[1].idempotency_key));
        assert_eq!(alert.opened_sequence, 2);
        assert_eq!(alert.resolved_sequence, Some(3));
        assert!(h.repository.list_alerts("bed-1", true).await.unwrap().is_empty());

        let state = h
            .repository
            .get_aggregate(&AggregateId::new("bed-1", MetricKind::HeartRate))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, VitalStatus::Nominal);
        assert_eq!(state.open_alert_id, None);
    }

    /// Commits a competing event right before the first write goes through,
    /// the way a second worker instance would.
    struct RacingRepository {
        inner: InMemoryVitalStateRepository,
        rival: Mutex<Option<NormalizedEvent>>,
        conflicts: AtomicUsize,
    }

    #[async_trait]
    impl VitalStateRepository for RacingRepository {
        async fn get_aggregate(&self, id: &AggregateId) -> DomainResult<Option<DeviceVitalState>> {
            self.inner.get_aggregate(id).await
        }

        async fn is_applied(&self, key: &IdempotencyKey) -> DomainResult<bool> {
            self.inner.is_applied(key).await
        }

        async fn apply_transactionally(
            &self,
            id: &AggregateId,
            mutation: AggregateMutation,
        ) -> DomainResult<DeviceVitalState> {
            if let Some(rival) = self.rival.lock().await.take() {
                let current = self.inner.get_aggregate(id).await?;
                if let Decision::Apply(rival_mutation) =
                    decide(current.as_ref(), &rival, None, Utc::now())
                {
                    self.inner.apply_transactionally(id, rival_mutation).await?;
                }
            }
            let result = self.inner.apply_transactionally(id, mutation).await;
            if matches!(result, Err(DomainError::ConflictError { .. })) {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
            }
            result
        }

        async fn get_alert(&self, alert_id: &str) -> DomainResult<Option<Alert>> {
            self.inner.get_alert(alert_id).await
        }

        async fn list_alerts(&self, device_id: &str, open_only: bool) -> DomainResult<Vec<Alert>> {
            self.inner.list_alerts(device_id, open_only).await
        }
    }

    #[tokio::test]
    async fn test_conflict_is_resolved_by_re_deciding() {
        let inner = InMemoryVitalStateRepository::new();
        let cache = InMemoryReadModelCache::new(Duration::from_secs(60));
        let processor = DomainEventProcessor::new(
            Arc::new(inner.clone()),
            Arc::new(cache.clone()),
            config(),
        );
        processor.apply(&event("bed-1", 1, 70.0)).await.unwrap();

        let racing = Arc::new(RacingRepository {
            inner: inner.clone(),
            rival: Mutex::new(Some(event("bed-1", 2, 72.0))),
            conflicts: AtomicUsize::new(0),
        });
        let racing_processor = DomainEventProcessor::new(racing.clone(), Arc::new(cache), config());

        let outcome = racing_processor.apply(&event("bed-1", 3, 130.0)).await.unwrap();

        assert_eq!(racing.conflicts.load(Ordering::SeqCst), 1);
        match outcome {
            ApplyOutcome::Applied(state) => {
                assert_eq!(state.sequence_number, 3);
                assert_eq!(state.status, VitalStatus::AlertOpen);
            }
            other => panic!("expected Applied, got {:?}", other),
        }
        assert_eq!(inner.applied_count().await, 3);
    }

    #[tokio::test]
    async fn test_persistent_conflicts_are_returned() {
        let mut repository = MockVitalStateRepository::new();
        repository.expect_is_applied().returning(|_| Ok(false));
        repository.expect_get_aggregate().returning(|_| Ok(None));
        repository
            .expect_apply_transactionally()
            .times(4)
            .returning(|id, _| {
                Err(DomainError::ConflictError {
                    aggregate: id.to_string(),
                    expected: None,
                    actual: Some(9),
                })
            });
        let mut cache = MockReadModelCache::new();
        cache.expect_invalidate().returning(|_| Ok(()));
        cache.expect_put().times(0);

        let processor = DomainEventProcessor::new(Arc::new(repository), Arc::new(cache), config());

        let result = processor.apply(&event("bed-1", 1, 70.0)).await;

        assert!(matches!(result, Err(DomainError::ConflictError { .. })));
    }

    #[tokio::test]
    async fn test_storage_errors_propagate_after_retries() {
        let mut repository = MockVitalStateRepository::new();
        repository
            .expect_is_applied()
            .times(4)
            .returning(|_| Err(DomainError::StorageError(anyhow::anyhow!("connection reset"))));
        let processor = DomainEventProcessor::new(
            Arc::new(repository),
            Arc::new(MockReadModelCache::new()),
            config(),
        );

        let result = processor.apply(&event("bed-1", 1, 70.0)).await;

        assert!(matches!(result, Err(DomainError::StorageError(_))));
    }

    /// Fails the first `failures` aggregate reads with a storage error.
    struct FlakyRepository {
        inner: InMemoryVitalStateRepository,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl VitalStateRepository for FlakyRepository {
        async fn get_aggregate(&self, id: &AggregateId) -> DomainResult<Option<DeviceVitalState>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DomainError::StorageError(anyhow::anyhow!("connection reset")));
            }
            self.inner.get_aggregate(id).await
        }

        async fn is_applied(&self, key: &IdempotencyKey) -> DomainResult<bool> {
            self.inner.is_applied(key).await
        }

        async fn apply_transactionally(
            &self,
            id: &AggregateId,
            mutation: AggregateMutation,
        ) -> DomainResult<DeviceVitalState> {
            self.inner.apply_transactionally(id, mutation).await
        }

        async fn get_alert(&self, alert_id: &str) -> DomainResult<Option<Alert>> {
            self.inner.get_alert(alert_id).await
        }

        async fn list_alerts(&self, device_id: &str, open_only: bool) -> DomainResult<Vec<Alert>> {
            self.inner.list_alerts(device_id, open_only).await
        }
    }

    #[tokio::test]
    async fn test_transient_storage_error_is_retried_in_place() {
        let inner = InMemoryVitalStateRepository::new();
        let processor = DomainEventProcessor::new(
            Arc::new(FlakyRepository {
                inner: inner.clone(),
                failures: AtomicUsize::new(2),
            }),
            Arc::new(InMemoryReadModelCache::new(Duration::from_secs(60))),
            config(),
        );

        let outcome = processor.apply(&event("bed-1", 1, 130.0)).await.unwrap();

        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
        assert_eq!(inner.list_alerts("bed-1", true).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_back_off_exponentially() {
        let inner = InMemoryVitalStateRepository::new();
        let processor = DomainEventProcessor::new(
            Arc::new(FlakyRepository {
                inner,
                failures: AtomicUsize::new(3),
            }),
            Arc::new(InMemoryReadModelCache::new(Duration::from_secs(60))),
            EventProcessorConfig {
                transient_backoff: Duration::from_millis(100),
                ..config()
            },
        );

        let started = tokio::time::Instant::now();
        let outcome = processor.apply(&event("bed-1", 1, 70.0)).await.unwrap();

        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
        // 100ms + 200ms + 400ms
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_repository_times_out() {
        let mut repository = MockVitalStateRepository::new();
        repository.expect_is_applied().returning(|_| Ok(false));
        repository.expect_get_aggregate().returning(|_| Ok(None));
        let repository = SlowApply {
            inner: repository,
        };
        let mut cache = MockReadModelCache::new();
        cache.expect_invalidate().times(4).returning(|_| Ok(()));

        let processor = DomainEventProcessor::new(
            Arc::new(repository),
            Arc::new(cache),
            EventProcessorConfig {
                operation_timeout: Duration::from_millis(50),
                ..config()
            },
        );

        let result = processor.apply(&event("bed-1", 1, 70.0)).await;

        assert!(matches!(result, Err(DomainError::Timeout(_))));
        assert!(result.unwrap_err().is_transient());
    }

    struct SlowApply {
        inner: MockVitalStateRepository,
    }

    #[async_trait]
    impl VitalStateRepository for SlowApply {
        async fn get_aggregate(&self, id: &AggregateId) -> DomainResult<Option<DeviceVitalState>> {
            self.inner.get_aggregate(id).await
        }

        async fn is_applied(&self, key: &IdempotencyKey) -> DomainResult<bool> {
            self.inner.is_applied(key).await
        }

        async fn apply_transactionally(
            &self,
            _id: &AggregateId,
            mutation: AggregateMutation,
        ) -> DomainResult<DeviceVitalState> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(mutation.next_state)
        }

        async fn get_alert(&self, alert_id: &str) -> DomainResult<Option<Alert>> {
            self.inner.get_alert(alert_id).await
        }

        async fn list_alerts(&self, device_id: &str, open_only: bool) -> DomainResult<Vec<Alert>> {
            self.inner.list_alerts(device_id, open_only).await
        }
    }

    #[tokio::test]
    async fn test_cache_reflects_latest_commit() {
        let h = harness();
        let id = AggregateId::new("bed-1", MetricKind::HeartRate);

        h.processor.apply(&event("bed-1", 1, 70.0)).await.unwrap();
        assert_eq!(h.cache.get(&id).await.unwrap().unwrap().sequence_number, 1);

        h.processor.apply(&event("bed-1", 2, 130.0)).await.unwrap();
        let cached = h.cache.get(&id).await.unwrap().unwrap();
        assert_eq!(cached.sequence_number, 2);
        assert_eq!(cached.status, VitalStatus::AlertOpen);

        // A stale event must not touch the cached snapshot.
        h.processor.apply(&event("bed-1", 1, 70.0)).await.unwrap();
        assert_eq!(h.cache.get(&id).await.unwrap().unwrap().sequence_number, 2);
    }

    #[tokio::test]
    async fn test_cache_is_invalidated_again_after_commit() {
        let repository = InMemoryVitalStateRepository::new();
        let mut seq = mockall::Sequence::new();
        let mut cache = MockReadModelCache::new();
        cache
            .expect_invalidate()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        cache
            .expect_put()
            .withf(|state: &DeviceVitalState| state.sequence_number == 1)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let processor = DomainEventProcessor::new(Arc::new(repository), Arc::new(cache), config());

        let outcome = processor.apply(&event("bed-1", 1, 70.0)).await.unwrap();

        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_fail_commit() {
        let repository = InMemoryVitalStateRepository::new();
        let mut cache = MockReadModelCache::new();
        cache
            .expect_invalidate()
            .returning(|_| Err(DomainError::CacheError("redis down".to_string())));
        cache
            .expect_put()
            .returning(|_| Err(DomainError::CacheError("redis down".to_string())));
        let processor = DomainEventProcessor::new(Arc::new(repository.clone()), Arc::new(cache), config());

        let outcome = processor.apply(&event("bed-1", 1, 70.0)).await.unwrap();

        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
        assert_eq!(repository.applied_count().await, 1);
    }
}
