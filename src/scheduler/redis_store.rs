//! Redis implementation of `QueueStore`.
//!
//! Cross-list moves run as Lua scripts so they stay atomic against any number
//! of dispatcher instances sharing the same Redis. Multi-key writes that need
//! no reads go through MULTI/EXEC pipelines.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::store::{EnqueueEntry, OrphanCheck, OrphanRequeue, QueueStore};
use crate::error::QueueError;

const MOVE_BATCH_LUA: &str = include_str!("lua/move_batch.lua");
const DRAIN_LUA: &str = include_str!("lua/drain.lua");
const MOVE_ENTRY_LUA: &str = include_str!("lua/move_entry.lua");
const REQUEUE_ORPHAN_LUA: &str = include_str!("lua/requeue_orphan.lua");
const STARTUP_LOCK_LUA: &str = include_str!("lua/startup_lock.lua");
const RELEASE_LOCK_LUA: &str = include_str!("lua/release_lock.lua");

/// `QueueStore` backed by a Redis connection manager.
///
/// The connection manager reconnects on its own; each call clones the handle.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    move_batch_script: Script,
    drain_script: Script,
    move_entry_script: Script,
    requeue_orphan_script: Script,
    startup_lock_script: Script,
    release_lock_script: Script,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis))
    }

    /// Creates a store from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            move_batch_script: Script::new(MOVE_BATCH_LUA),
            drain_script: Script::new(DRAIN_LUA),
            move_entry_script: Script::new(MOVE_ENTRY_LUA),
            requeue_orphan_script: Script::new(REQUEUE_ORPHAN_LUA),
            startup_lock_script: Script::new(STARTUP_LOCK_LUA),
            release_lock_script: Script::new(RELEASE_LOCK_LUA),
        }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn enqueue(
        &self,
        queue: &str,
        entries: &[EnqueueEntry],
        ttl: Duration,
    ) -> Result<(), QueueError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in entries {
            pipe.cmd("LPUSH").arg(queue).arg(&entry.payload).ignore();
            pipe.cmd("SET")
                .arg(&entry.status_key)
                .arg(&entry.status)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn move_batch(
        &self,
        source: &str,
        destination: &str,
        count: usize,
    ) -> Result<Vec<String>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let moved: Vec<String> = self
            .move_batch_script
            .key(source)
            .key(destination)
            .arg(count)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn move_entry(
        &self,
        source: &str,
        destination: &str,
        raw: &str,
    ) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let moved: i64 = self
            .move_entry_script
            .key(source)
            .key(destination)
            .arg(raw)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn drain(&self, source: &str, destination: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let moved: usize = self
            .drain_script
            .key(source)
            .key(destination)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn position(&self, list: &str, raw: &str) -> Result<Option<usize>, QueueError> {
        let mut conn = self.redis.clone();
        let index: Option<usize> = redis::cmd("LPOS")
            .arg(list)
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(index)
    }

    async fn len(&self, list: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    async fn finish(
        &self,
        list: &str,
        raw: &str,
        status_key: &str,
        status: &str,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(list)
            .arg(1)
            .arg(raw)
            .ignore()
            .cmd("SET")
            .arg(status_key)
            .arg(status)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, QueueError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("GET").arg(key);
        }
        let values: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(values)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), QueueError> {
        let mut conn = self.redis.clone();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let acquired: i64 = self
            .startup_lock_script
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = self
            .release_lock_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn requeue_orphan(
        &self,
        queue: &str,
        processing: &str,
        status_key: &str,
        orphan: &OrphanRequeue,
        ttl: Duration,
    ) -> Result<OrphanCheck, QueueError> {
        let mut conn = self.redis.clone();
        let outcome: i64 = self
            .requeue_orphan_script
            .key(queue)
            .key(processing)
            .key(status_key)
            .arg(&orphan.dispatched_payload)
            .arg(&orphan.requeue_payload)
            .arg(&orphan.requeued_status)
            .arg(&orphan.queued_status)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(OrphanCheck::Requeued),
            0 => Ok(OrphanCheck::AlreadyQueued),
            -1 => Ok(OrphanCheck::InFlight),
            other => Err(QueueError::UnexpectedReply {
                script: "requeue_orphan",
                reply: other.to_string(),
            }),
        }
    }
}
