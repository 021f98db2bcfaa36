use crate::domain::{DomainEventProcessor, EventProcessorConfig, VitalStateQueryService};
use crate::partition::{PartitionedWorkerPool, WorkerPoolConfig};
use carechain_runner::AppProcess;
use common::domain::{EventSubscriber, ReadModelCache, VitalStateRepository};
use std::sync::Arc;
use tracing::info;

pub struct VitalsWorkerConfig {
    pub processor: EventProcessorConfig,
    pub pool: WorkerPoolConfig,
}

/// Process stage: bus subscription, event processor, repository and cache.
pub struct VitalsWorker {
    pool: PartitionedWorkerPool,
    query_service: Arc<VitalStateQueryService>,
}

impl VitalsWorker {
    pub fn new(
        subscriber: Arc<dyn EventSubscriber>,
        repository: Arc<dyn VitalStateRepository>,
        cache: Arc<dyn ReadModelCache>,
        config: VitalsWorkerConfig,
    ) -> Self {
        info!(
            thresholds_configured = !config.processor.thresholds.is_empty(),
            max_conflict_retries = config.processor.max_conflict_retries,
            max_transient_retries = config.processor.max_transient_retries,
            operation_timeout_ms = config.processor.operation_timeout.as_millis() as u64,
            "initializing vitals worker"
        );

        let processor = Arc::new(DomainEventProcessor::new(
            Arc::clone(&repository),
            Arc::clone(&cache),
            config.processor,
        ));
        let pool = PartitionedWorkerPool::new(subscriber, processor, config.pool);
        let query_service = Arc::new(VitalStateQueryService::new(repository, cache));

        Self {
            pool,
            query_service,
        }
    }

    pub fn query_service(&self) -> Arc<VitalStateQueryService> {
        Arc::clone(&self.query_service)
    }

    pub fn into_runner_process(self) -> (String, AppProcess) {
        let pool = self.pool;
        (
            "vitals_worker_pool".to_string(),
            Box::new(move |ctx| Box::pin(pool.run(ctx))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use common::domain::{
        AggregateId, AlertThresholds, EventPublisher, IdempotencyKey, MetricKind, NormalizedEvent,
        ThresholdBand, VitalStatus,
    };
    use common::memory::{InMemoryEventBus, InMemoryReadModelCache, InMemoryVitalStateRepository};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_worker_consumes_bus_and_serves_reads() {
        let bus = InMemoryEventBus::new();
        let repository = InMemoryVitalStateRepository::new();
        let cache = InMemoryReadModelCache::new(Duration::from_secs(60));

        let worker = VitalsWorker::new(
            Arc::new(bus.clone()),
            Arc::new(repository.clone()),
            Arc::new(cache),
            VitalsWorkerConfig {
                processor: EventProcessorConfig {
                    thresholds: AlertThresholds::new().with_band(
                        MetricKind::BloodGlucose,
                        ThresholdBand::new(Some(70.0), Some(180.0)),
                    ),
                    ..EventProcessorConfig::default()
                },
                pool: WorkerPoolConfig::default(),
            },
        );
        let queries = worker.query_service();

        let ts = Utc::now() - ChronoDuration::seconds(5);
        bus.publish(&NormalizedEvent {
            device_id: "cgm-3".to_string(),
            metric: MetricKind::BloodGlucose,
            value: 240.0,
            unit: "mg/dL".to_string(),
            device_timestamp: ts,
            received_at: ts,
            sequence_number: 11,
            idempotency_key: IdempotencyKey::compute("cgm-3", MetricKind::BloodGlucose, &ts, Some(11)),
            quality_score: Some(0.8),
        })
        .await
        .unwrap();
        bus.close().await;

        let (name, process) = worker.into_runner_process();
        assert_eq!(name, "vitals_worker_pool");
        process(CancellationToken::new()).await.unwrap();

        let state = queries
            .latest_state(&AggregateId::new("cgm-3", MetricKind::BloodGlucose))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, VitalStatus::AlertOpen);
        assert_eq!(queries.alerts("cgm-3", true).await.unwrap().len(), 1);
        assert_eq!(repository.applied_count().await, 1);
    }
}
