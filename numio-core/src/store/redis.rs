//! Redis-backed stores: distributed locks, KV cache, sliding-window rate
//! limits, and the event transport (pub/sub + bounded replay streams).
//!
//! One [`ConnectionManager`] is shared process-wide; it transparently
//! reconnects on connection errors (including the `READONLY` answers a
//! failed-over replica gives) and callers just retry through the normal
//! error path.

use std::time::Duration;

use async_trait::async_trait;
use common::id::UserId;
use numio_api_core::models::EventEnvelope;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::traits::{
    EventTransport, KvCache, LockGuard, LockStore, RateLimiter,
    RateDecision, StoreError,
};

/// The global fan-out pub/sub channel.
pub const GLOBAL_CHANNEL: &str = "events:global";

fn redis_err(e: redis::RedisError) -> StoreError {
    if e.is_connection_refusal() || e.is_timeout() || e.is_io_error() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Internal(e.to_string())
    }
}

pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(redis_err)?;
        let manager =
            ConnectionManager::new(client).await.map_err(redis_err)?;
        Ok(Self { manager })
    }

    /// Cheap liveness probe for warm-up.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    fn stream_key(user_id: UserId) -> String {
        format!("events:stream:user:{user_id}")
    }
}

// --- LockStore --- //

#[async_trait]
impl LockStore for RedisStore {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, StoreError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.manager.clone();

        // SET key token NX PX ttl
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(acquired.map(|_| LockGuard {
            key: key.to_owned(),
            token,
        }))
    }

    async fn release(&self, guard: LockGuard) -> Result<(), StoreError> {
        // Compare-and-delete so a stale guard can't free someone else's
        // lock after the TTL already rotated ownership.
        const RELEASE: &str = r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
        "#;
        let mut conn = self.manager.clone();
        let _: i64 = redis::Script::new(RELEASE)
            .key(&guard.key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}

// --- KvCache --- //

#[async_trait]
impl KvCache for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(redis_err)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(redis_err)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await.map_err(redis_err)
    }
}

// --- RateLimiter --- //

#[async_trait]
impl RateLimiter for RedisStore {
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, StoreError> {
        // Sorted-set sliding window, done atomically server-side: trim
        // entries older than the window, count, and only add when under
        // the limit.
        const CHECK: &str = r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])
            local limit = tonumber(ARGV[3])
            redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
            local count = redis.call('ZCARD', key)
            if count >= limit then
                local oldest = redis.call(
                    'ZRANGE', key, 0, 0, 'WITHSCORES')
                return {0, 0, tonumber(oldest[2]) + window - now}
            end
            redis.call('ZADD', key, now, now .. ':' .. ARGV[4])
            redis.call('PEXPIRE', key, window)
            return {1, limit - count - 1, 0}
        "#;

        let now_ms = common::time::TimestampMs::now().as_i64();
        let nonce = Uuid::new_v4().to_string();
        let mut conn = self.manager.clone();
        let (allowed, remaining, retry_ms): (i64, i64, i64) =
            redis::Script::new(CHECK)
                .key(key)
                .arg(now_ms)
                .arg(window.as_millis() as i64)
                .arg(limit as i64)
                .arg(nonce)
                .invoke_async(&mut conn)
                .await
                .map_err(redis_err)?;

        Ok(RateDecision {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u32,
            retry_after: (allowed == 0).then(|| {
                Duration::from_millis(retry_ms.max(0) as u64)
            }),
        })
    }
}

// --- EventTransport --- //

#[async_trait]
impl EventTransport for RedisStore {
    async fn publish_global(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(envelope).map_err(StoreError::internal)?;
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(GLOBAL_CHANNEL, json)
            .await
            .map_err(redis_err)
    }

    async fn append_user_stream(
        &self,
        user_id: UserId,
        envelope: &EventEnvelope,
        maxlen: usize,
    ) -> Result<String, StoreError> {
        let json =
            serde_json::to_string(envelope).map_err(StoreError::internal)?;
        let mut conn = self.manager.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(Self::stream_key(user_id))
            .arg("MAXLEN")
            .arg("~")
            .arg(maxlen)
            .arg("*")
            .arg("event")
            .arg(json)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(entry_id)
    }

    async fn read_user_stream(
        &self,
        user_id: UserId,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, EventEnvelope)>, StoreError> {
        // Exclusive lower bound via the `(` prefix (Redis >= 6.2).
        let start = match after_id {
            Some(id) => format!("({id}"),
            None => "-".to_owned(),
        };
        let mut conn = self.manager.clone();
        let reply: redis::streams::StreamRangeReply = redis::cmd("XRANGE")
            .arg(Self::stream_key(user_id))
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let mut entries = Vec::with_capacity(reply.ids.len());
        for stream_id in reply.ids {
            let Some(raw) = stream_id.get::<String>("event") else {
                continue;
            };
            match serde_json::from_str::<EventEnvelope>(&raw) {
                Ok(envelope) => entries.push((stream_id.id, envelope)),
                Err(e) => {
                    tracing::warn!("Bad envelope in stream: {e}");
                }
            }
        }
        Ok(entries)
    }
}
