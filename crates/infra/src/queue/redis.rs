//! Redis-backed queue substrate.
//!
//! - **Ready list**: a Redis list, consumed with `BLPOP`, produced with `RPUSH`
//! - **Delayed set**: a sorted set scored by due time in unix millis
//! - **Promotion**: a Lua script, so `ZREM` + `RPUSH` happen atomically per batch
//!
//! A single [`ConnectionManager`] is shared by clones; it reconnects on its own
//! after a dropped connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::{QueueError, QueueSubstrate, RawPayload};

/// Removes each ARGV member from KEYS[1] and, only if it was removed, appends
/// it to KEYS[2]. Returns the number of members moved.
const PROMOTE_SCRIPT: &str = r#"
local moved = 0
for i = 1, #ARGV do
  if redis.call('ZREM', KEYS[1], ARGV[i]) == 1 then
    redis.call('RPUSH', KEYS[2], ARGV[i])
    moved = moved + 1
  end
end
return moved
"#;

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    promote_script: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue").finish_non_exhaustive()
    }
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> QueueError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        QueueError::Connection(format!("{operation}: {err}"))
    } else {
        QueueError::Command(format!("{operation} failed: {err}"))
    }
}

impl RedisQueue {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| map_redis_error("connect", e))?;

        Ok(Self {
            conn,
            promote_script: Arc::new(redis::Script::new(PROMOTE_SCRIPT)),
        })
    }
}

#[async_trait]
impl QueueSubstrate for RedisQueue {
    #[instrument(skip(self), err)]
    async fn blocking_pop(
        &self,
        ready_key: &str,
        timeout: Duration,
    ) -> Result<Option<RawPayload>, QueueError> {
        let mut conn = self.conn.clone();

        // BLPOP replies with [key, value], or nil once the timeout elapses.
        let popped: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(ready_key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("BLPOP", e))?;

        Ok(popped.map(|(_, payload)| payload))
    }

    async fn range_due(
        &self,
        delayed_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<RawPayload>, QueueError> {
        let mut conn = self.conn.clone();

        let due: Vec<Vec<u8>> = redis::cmd("ZRANGEBYSCORE")
            .arg(delayed_key)
            .arg(0)
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZRANGEBYSCORE", e))?;

        Ok(due)
    }

    #[instrument(skip(self, entries), fields(entries = entries.len()), err)]
    async fn promote(
        &self,
        delayed_key: &str,
        ready_key: &str,
        entries: &[RawPayload],
    ) -> Result<usize, QueueError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let mut invocation = self.promote_script.prepare_invoke();
        invocation.key(delayed_key).key(ready_key);
        for entry in entries {
            invocation.arg(entry.as_slice());
        }

        let moved: usize = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("promote script", e))?;

        Ok(moved)
    }

    #[instrument(skip(self, payload), err)]
    async fn insert_scored(
        &self,
        delayed_key: &str,
        due_ms: i64,
        payload: &[u8],
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let _: i64 = redis::cmd("ZADD")
            .arg(delayed_key)
            .arg(due_ms)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZADD", e))?;

        Ok(())
    }

    async fn push_ready(&self, ready_key: &str, payload: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let _: i64 = redis::cmd("RPUSH")
            .arg(ready_key)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("RPUSH", e))?;

        Ok(())
    }
}
