use crate::domain::{AggregateId, DeviceVitalState, DomainError, DomainResult, ReadModelCache};
use anyhow::Context;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info};

pub const VITALS_KEY_PREFIX: &str = "carechain:vitals:";

/// Writes the snapshot only when no newer sequence is cached, then refreshes
/// the TTL. KEYS[1] = entry, ARGV = padded sequence, snapshot JSON, ttl ms.
/// Sequences are compared as fixed-width strings; Lua numbers are doubles.
const PUT_IF_NEWER: &str = r#"
local current = redis.call('HGET', KEYS[1], 'seq')
if current and current > ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'seq', ARGV[1], 'snapshot', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
"#;

/// Zero-padded to the width of u64::MAX so string order equals numeric order.
fn sequence_field(sequence: u64) -> String {
    format!("{:020}", sequence)
}

/// Key format: carechain:vitals:{device_id}:{metric}
pub fn vitals_key(aggregate_id: &AggregateId) -> String {
    format!(
        "{}{}:{}",
        VITALS_KEY_PREFIX, aggregate_id.device_id, aggregate_id.metric
    )
}

fn cache_error(e: impl std::fmt::Display) -> DomainError {
    DomainError::CacheError(e.to_string())
}

/// Redis-backed read model. Each entry is a hash holding the snapshot and its
/// sequence number so writers can compare atomically.
#[derive(Clone)]
pub struct RedisReadModelCache {
    connection: MultiplexedConnection,
    ttl: Duration,
    put_script: Script,
}

impl RedisReadModelCache {
    pub async fn connect(redis_url: &str, ttl: Duration) -> anyhow::Result<Self> {
        info!(url = %redis_url, ttl_secs = ttl.as_secs(), "connecting to redis");

        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")?;

        Ok(Self {
            connection,
            ttl,
            put_script: Script::new(PUT_IF_NEWER),
        })
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("redis ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl ReadModelCache for RedisReadModelCache {
    async fn get(&self, aggregate_id: &AggregateId) -> DomainResult<Option<DeviceVitalState>> {
        let mut conn = self.connection.clone();
        let key = vitals_key(aggregate_id);

        let json: Option<String> = conn.hget(&key, "snapshot").await.map_err(cache_error)?;

        match json {
            Some(j) => {
                let state = serde_json::from_str(&j).map_err(cache_error)?;
                debug!(key = %key, "cache hit");
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, state: &DeviceVitalState) -> DomainResult<()> {
        let mut conn = self.connection.clone();
        let key = vitals_key(&state.aggregate_id());
        let json = serde_json::to_string(state).map_err(cache_error)?;
        let ttl_ms = self.ttl.as_millis().max(1) as u64;

        let written: i32 = self
            .put_script
            .key(&key)
            .arg(sequence_field(state.sequence_number))
            .arg(json)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(cache_error)?;

        if written == 0 {
            debug!(
                key = %key,
                sequence_number = state.sequence_number,
                "newer snapshot already cached"
            );
        }
        Ok(())
    }

    async fn invalidate(&self, aggregate_id: &AggregateId) -> DomainResult<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(vitals_key(aggregate_id))
            .await
            .map_err(cache_error)
    }
}
