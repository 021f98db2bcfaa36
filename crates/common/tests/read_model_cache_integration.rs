#![cfg(feature = "integration-tests")]

use chrono::Utc;
use common::domain::{
    AggregateId, DeviceVitalState, IdempotencyKey, MetricKind, ReadModelCache, VitalStatus,
};
use common::redis::RedisReadModelCache;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::Redis;

async fn setup_cache(ttl: Duration) -> (ContainerAsync<Redis>, RedisReadModelCache) {
    let redis = Redis::default().start().await.unwrap();
    let host = redis.get_host().await.unwrap();
    let port = redis.get_host_port_ipv4(6379).await.unwrap();

    let cache = RedisReadModelCache::connect(&format!("redis://{}:{}", host, port), ttl)
        .await
        .expect("Failed to connect to redis");
    cache.ping().await.expect("Redis ping failed");

    (redis, cache)
}

fn state(sequence: u64, value: f64) -> DeviceVitalState {
    DeviceVitalState {
        device_id: "pump-4".to_string(),
        metric: MetricKind::BloodGlucose,
        value,
        unit: "mg/dL".to_string(),
        observed_at: Utc::now(),
        sequence_number: sequence,
        status: VitalStatus::Nominal,
        open_alert_id: None,
        last_idempotency_key: IdempotencyKey::from_raw(format!("key-{}", sequence)),
        updated_at: Utc::now(),
    }
}

fn aggregate() -> AggregateId {
    AggregateId::new("pump-4", MetricKind::BloodGlucose)
}

#[tokio::test]
async fn test_put_get_invalidate() {
    let (_container, cache) = setup_cache(Duration::from_secs(60)).await;

    assert!(cache.get(&aggregate()).await.unwrap().is_none());

    let snapshot = state(3, 110.0);
    cache.put(&snapshot).await.unwrap();
    assert_eq!(cache.get(&aggregate()).await.unwrap(), Some(snapshot));

    cache.invalidate(&aggregate()).await.unwrap();
    assert!(cache.get(&aggregate()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_older_snapshot_never_overwrites_newer() {
    let (_container, cache) = setup_cache(Duration::from_secs(60)).await;

    cache.put(&state(5, 140.0)).await.unwrap();
    cache.put(&state(4, 100.0)).await.unwrap();

    let cached = cache.get(&aggregate()).await.unwrap().unwrap();
    assert_eq!(cached.sequence_number, 5);
    assert_eq!(cached.value, 140.0);

    cache.put(&state(6, 95.0)).await.unwrap();
    assert_eq!(
        cache.get(&aggregate()).await.unwrap().unwrap().sequence_number,
        6
    );
}

#[tokio::test]
async fn test_entries_expire_after_ttl() {
    let (_container, cache) = setup_cache(Duration::from_millis(500)).await;

    cache.put(&state(1, 100.0)).await.unwrap();
    assert!(cache.get(&aggregate()).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(cache.get(&aggregate()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_large_sequences_compare_exactly() {
    let (_container, cache) = setup_cache(Duration::from_secs(60)).await;
    let floor = 1u64 << 62;

    cache.put(&state(floor + 2, 120.0)).await.unwrap();
    cache.put(&state(floor + 1, 100.0)).await.unwrap();
    assert_eq!(
        cache.get(&aggregate()).await.unwrap().unwrap().sequence_number,
        floor + 2
    );

    cache.put(&state(floor + 3, 95.0)).await.unwrap();
    assert_eq!(
        cache.get(&aggregate()).await.unwrap().unwrap().sequence_number,
        floor + 3
    );
}
