use crate::domain::{AggregateId, DeviceVitalState, DomainResult, ReadModelCache};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

struct CacheEntry {
    state: DeviceVitalState,
    expires_at: Instant,
}

/// In-memory read model with per-entry TTL.
#[derive(Clone)]
pub struct InMemoryReadModelCache {
    entries: Arc<RwLock<HashMap<AggregateId, CacheEntry>>>,
    ttl: Duration,
}

impl InMemoryReadModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }
}

#[async_trait]
impl ReadModelCache for InMemoryReadModelCache {
    async fn get(&self, aggregate_id: &AggregateId) -> DomainResult<Option<DeviceVitalState>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(aggregate_id) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.state.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: evict unless someone refreshed it in the meantime.
        let mut entries = self.entries.write().await;
        if entries
            .get(aggregate_id)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            entries.remove(aggregate_id);
        }
        Ok(None)
    }

    async fn put(&self, state: &DeviceVitalState) -> DomainResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let id = state.aggregate_id();

        let newer_cached = entries.get(&id).is_some_and(|entry| {
            entry.expires_at > now && entry.state.sequence_number > state.sequence_number
        });
        if !newer_cached {
            entries.insert(
                id,
                CacheEntry {
                    state: state.clone(),
                    expires_at: now + self.ttl,
                },
            );
        }
        Ok(())
    }

    async fn invalidate(&self, aggregate_id: &AggregateId) -> DomainResult<()> {
        self.entries.write().await.remove(aggregate_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IdempotencyKey, MetricKind, VitalStatus};
    use chrono::Utc;

    fn snapshot(sequence: u64) -> DeviceVitalState {
        DeviceVitalState {
            device_id: "dev-1".to_string(),
            metric: MetricKind::Spo2,
            value: 97.0,
            unit: "%".to_string(),
            observed_at: Utc::now(),
            sequence_number: sequence,
            status: VitalStatus::Nominal,
            open_alert_id: None,
            last_idempotency_key: IdempotencyKey::from_raw(format!("k{}", sequence)),
            updated_at: Utc::now(),
        }
    }

    fn id() -> AggregateId {
        AggregateId::new("dev-1", MetricKind::Spo2)
    }

    #[tokio::test]
    async fn test_older_snapshot_never_overwrites_newer() {
        let cache = InMemoryReadModelCache::new(Duration::from_secs(60));

        cache.put(&snapshot(5)).await.unwrap();
        cache.put(&snapshot(3)).await.unwrap();

        assert_eq!(cache.get(&id()).await.unwrap().unwrap().sequence_number, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = InMemoryReadModelCache::new(Duration::from_secs(30));
        cache.put(&snapshot(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(cache.get(&id()).await.unwrap().is_none());
        // An expired newer entry no longer blocks older writes.
        cache.put(&snapshot(0)).await.unwrap();
        assert!(cache.get(&id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let cache = InMemoryReadModelCache::new(Duration::from_secs(60));
        cache.put(&snapshot(1)).await.unwrap();

        cache.invalidate(&id()).await.unwrap();

        assert!(cache.get(&id()).await.unwrap().is_none());
    }
}
