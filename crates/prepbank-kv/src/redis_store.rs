//! Redis store backend over a `deadpool-redis` pool.
//!
//! This is the production backend: every service instance shares the same
//! logical store, which is what makes the per-key cache locks and the
//! per-user login locks meaningful across instances.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::{AsyncCommands, Script};

use crate::error::{KvError, KvResult};
use crate::store::{KvStore, SetOptions};

/// Token-checked delete, executed atomically server-side.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed [`KvStore`].
#[derive(Clone)]
pub struct RedisKv {
    pool: Pool,
}

impl RedisKv {
    /// Wrap an existing connection pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from a Redis URL (`redis://host:port/db`).
    pub fn from_url(url: &str) -> KvResult<Self> {
        let pool = PoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| KvError::unavailable(format!("failed to create Redis pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Check connectivity (for health checks).
    pub async fn ping(&self) -> bool {
        match self.conn().await {
            Ok(mut conn) => match redis::cmd("PING").query_async::<String>(&mut conn).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Redis PING failed");
                    false
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to get Redis connection");
                false
            }
        }
    }

    async fn conn(&self) -> KvResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| KvError::unavailable(format!("failed to get Redis connection: {e}")))
    }
}

fn map_err(e: redis::RedisError) -> KvError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        KvError::unavailable(e.to_string())
    } else {
        KvError::protocol(e.to_string())
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> KvResult<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = opts.ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        if opts.if_not_exists {
            cmd.arg("NX");
        }
        // SET replies nil when NX blocks the write.
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(map_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await.map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut conn = self.conn().await?;
        conn.expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(map_err)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.conn().await?;
        conn.exists(key).await.map_err(map_err)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        if values.is_empty() {
            return self.lrange(key, 0, -1).await.map(|l| l.len() as u64);
        }
        let mut conn = self.conn().await?;
        conn.rpush(key, values).await.map_err(map_err)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.lrange(key, start as isize, stop as isize)
            .await
            .map_err(map_err)
    }

    async fn lindex(&self, key: &str, index: i64) -> KvResult<Option<String>> {
        let mut conn = self.conn().await?;
        conn.lindex(key, index as isize).await.map_err(map_err)
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> KvResult<u64> {
        let mut conn = self.conn().await?;
        conn.lrem(key, count as isize, value).await.map_err(map_err)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> KvResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        conn.sadd(key, members).await.map_err(map_err)
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.smembers(key).await.map_err(map_err)
    }

    async fn srem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        conn.srem(key, members).await.map_err(map_err)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        conn.hset_multiple(key, fields).await.map_err(map_err)
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        conn.hgetall(key).await.map_err(map_err)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        let mut conn = self.conn().await?;
        conn.hincr(key, field, delta).await.map_err(map_err)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> KvResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(deleted > 0)
    }
}
