mod config;

use carechain_runner::Runner;
use chrono::Duration as ChronoDuration;
use common::domain::{EventPublisher, EventSubscriber, ReadModelCache, VitalStateRepository};
use common::memory::{InMemoryEventBus, InMemoryReadModelCache, InMemoryVitalStateRepository};
use common::nats::{
    NatsClient, NatsEventPublisher, NatsEventSubscriber, NatsPublisherBuilder,
    NatsSubscriberConfig, NatsTracingConfig, PublishRetryPolicy,
};
use common::postgres::{PostgresClient, PostgresVitalStateRepository};
use common::redis::RedisReadModelCache;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use config::{BusBackend, CacheBackend, ServiceConfig, StorageBackend};
use ingestion_gateway::domain::NormalizerConfig;
use ingestion_gateway::ingestion_gateway::{IngestionGateway, IngestionGatewayConfig};
use ingestion_gateway::mqtt::MqttListenerConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vitals_worker::domain::EventProcessorConfig;
use vitals_worker::partition::WorkerPoolConfig;
use vitals_worker::vitals_worker::{VitalsWorker, VitalsWorkerConfig};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        bus_backend = ?config.bus_backend,
        storage_backend = ?config.storage_backend,
        cache_backend = ?config.cache_backend,
        otel_enabled = config.otel_enabled,
        "Starting carechain-all-in-one service"
    );
    debug!("Configuration: {:?}", config);

    let thresholds = match config.thresholds() {
        Ok(thresholds) => thresholds,
        Err(e) => {
            error!("Invalid alert thresholds: {}", e);
            std::process::exit(1);
        }
    };
    if thresholds.is_empty() {
        warn!("no alert thresholds configured, alerts will never open");
    }

    let deps = match initialize_shared_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("Failed to initialize shared dependencies: {:#}", e);
            std::process::exit(1);
        }
    };

    let ingestion_gateway = IngestionGateway::new(
        Arc::clone(&deps.publisher),
        IngestionGatewayConfig {
            normalizer: NormalizerConfig {
                clock_skew_tolerance: ChronoDuration::seconds(
                    config.clock_skew_tolerance_secs as i64,
                ),
                max_reading_age: ChronoDuration::seconds(config.max_reading_age_secs as i64),
            },
            mqtt: config.mqtt_enabled.then(|| MqttListenerConfig {
                broker_url: config.mqtt_broker_url.clone(),
                topic_prefix: config.mqtt_topic_prefix.clone(),
                ..MqttListenerConfig::default()
            }),
        },
    );

    let vitals_worker = VitalsWorker::new(
        Arc::clone(&deps.subscriber),
        Arc::clone(&deps.repository),
        Arc::clone(&deps.cache),
        VitalsWorkerConfig {
            processor: EventProcessorConfig {
                thresholds,
                max_conflict_retries: config.max_conflict_retries,
                max_transient_retries: config.max_transient_retries,
                transient_backoff: Duration::from_millis(config.transient_backoff_ms),
                operation_timeout: Duration::from_millis(config.operation_timeout_ms),
                ..EventProcessorConfig::default()
            },
            pool: WorkerPoolConfig {
                max_buffered_deliveries: config.max_buffered_deliveries,
                idle_timeout: Duration::from_secs(config.partition_idle_timeout_secs),
            },
        },
    );

    let mut runner = Runner::new();

    for (name, process) in ingestion_gateway.into_runner_processes() {
        runner = runner.with_boxed_process(name, process);
    }
    let (name, process) = vitals_worker.into_runner_process();
    runner = runner.with_boxed_process(name, process);

    let SharedDependencies {
        nats_client,
        memory_bus,
        ..
    } = deps;

    if let Some(nats_client) = nats_client {
        runner = runner.with_closer("nats", move || async move {
            match Arc::try_unwrap(nats_client) {
                Ok(client) => client.close().await,
                Err(_) => {
                    warn!("NATS client still shared at shutdown, skipping flush");
                    Ok(())
                }
            }
        });
    }

    if let Some(bus) = memory_bus {
        runner = runner.with_closer("memory_bus", move || async move {
            bus.close().await;
            Ok(())
        });
    }

    runner = runner
        .with_closer("telemetry", move || async move {
            shutdown_telemetry(telemetry_providers);
            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(10));

    runner.run().await;
}

struct SharedDependencies {
    publisher: Arc<dyn EventPublisher>,
    subscriber: Arc<dyn EventSubscriber>,
    repository: Arc<dyn VitalStateRepository>,
    cache: Arc<dyn ReadModelCache>,
    nats_client: Option<Arc<NatsClient>>,
    memory_bus: Option<InMemoryEventBus>,
}

async fn initialize_shared_dependencies(
    config: &ServiceConfig,
) -> anyhow::Result<SharedDependencies> {
    let repository: Arc<dyn VitalStateRepository> = match config.storage_backend {
        StorageBackend::Postgres => {
            info!("Initializing PostgreSQL...");
            let client = PostgresClient::from_url(
                &config.database_url,
                config.database_max_connections,
                config.startup_timeout(),
            )?;
            client.ping().await?;
            client.ensure_schema().await?;
            Arc::new(PostgresVitalStateRepository::new(client))
        }
        StorageBackend::Memory => {
            warn!("using in-memory vital state storage, state is lost on restart");
            Arc::new(InMemoryVitalStateRepository::new())
        }
    };

    let cache_ttl = Duration::from_secs(config.cache_ttl_secs);
    let cache: Arc<dyn ReadModelCache> = match config.cache_backend {
        CacheBackend::Redis => {
            info!("Initializing Redis...");
            let cache = RedisReadModelCache::connect(&config.redis_url, cache_ttl).await?;
            cache.ping().await?;
            Arc::new(cache)
        }
        CacheBackend::Memory => Arc::new(InMemoryReadModelCache::new(cache_ttl)),
    };

    let deps = match config.bus_backend {
        BusBackend::Nats => {
            info!("Initializing NATS...");
            let nats_client =
                Arc::new(NatsClient::connect(&config.nats_url, config.startup_timeout()).await?);
            nats_client.ensure_stream(&config.nats_stream).await?;

            let layered = NatsPublisherBuilder::new(nats_client.create_publisher_client())
                .with_tracing(NatsTracingConfig::new(config.otel_service_name.clone()))
                .with_retry(PublishRetryPolicy {
                    max_attempts: config.publish_max_attempts,
                    initial_backoff: Duration::from_millis(config.publish_initial_backoff_ms),
                    max_backoff: Duration::from_millis(config.publish_max_backoff_ms),
                    attempt_timeout: Duration::from_millis(config.publish_timeout_ms),
                })
                .build();
            let publisher = NatsEventPublisher::new(layered, config.nats_stream.clone());
            let subscriber = NatsEventSubscriber::new(
                nats_client.create_consumer_client(),
                NatsSubscriberConfig {
                    stream: config.nats_stream.clone(),
                    consumer_name: config.nats_consumer_name.clone(),
                    batch_size: config.nats_batch_size,
                    max_wait: Duration::from_secs(config.nats_batch_wait_secs),
                    redelivery_backoff: config.redelivery_backoff(),
                },
            );

            SharedDependencies {
                publisher: Arc::new(publisher),
                subscriber: Arc::new(subscriber),
                repository,
                cache,
                nats_client: Some(nats_client),
                memory_bus: None,
            }
        }
        BusBackend::Memory => {
            warn!("using in-memory event bus, unprocessed events are lost on restart");
            let bus = InMemoryEventBus::with_redelivery_backoff(config.redelivery_backoff());
            SharedDependencies {
                publisher: Arc::new(bus.clone()),
                subscriber: Arc::new(bus.clone()),
                repository,
                cache,
                nats_client: None,
                memory_bus: Some(bus),
            }
        }
    };

    Ok(deps)
}
