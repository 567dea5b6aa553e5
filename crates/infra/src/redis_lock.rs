//! Redis-backed lock cache (feature `redis`).
//!
//! `add` is `SET key 1 NX [PX ttl]`, which Redis applies atomically, so two
//! nodes racing for the same key see exactly one `OK`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use davq_core::{QueueError, QueueResult};
use davq_queue::LockCache;

/// Lock cache over a shared Redis instance.
#[derive(Debug, Clone)]
pub struct RedisLockCache {
    client: redis::Client,
}

impl RedisLockCache {
    pub fn new(redis_url: impl AsRef<str>) -> QueueResult<Self> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| QueueError::lock(e.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::lock(e.to_string()))
    }
}

fn set_nx_command(key: &str, ttl: Option<Duration>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(1).arg("NX");
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
    }
    cmd
}

#[async_trait]
impl LockCache for RedisLockCache {
    async fn add(&self, key: &str, ttl: Option<Duration>) -> QueueResult<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = set_nx_command(key, ttl)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::lock(e.to_string()))?;
        debug!(key, created = reply.is_some(), "lock key add");
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::lock(e.to_string()))?;
        Ok(())
    }
}
