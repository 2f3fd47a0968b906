//! Queue substrate: a FIFO ready list plus a due-time ordered delayed set.
//!
//! The worker consumes four primitives from the substrate:
//!
//! - **blocking pop** from the ready list, bounded by a timeout
//! - **range by score** over the delayed set (`0..=now`, limited batch)
//! - **promote**: atomically move delayed entries to the tail of the ready list
//! - **insert scored**: park a payload in the delayed set until its due time
//!
//! Payloads are opaque bytes. The substrate never inspects them, which is what
//! lets a promotion move a job byte-for-byte.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueue;

/// Serialized job as stored in the substrate.
pub type RawPayload = Vec<u8>;

/// Default ready list key.
pub const DEFAULT_READY_KEY: &str = "inscriptions:ready";

/// Default delayed sorted-set key.
pub const DEFAULT_DELAYED_KEY: &str = "inscriptions:delayed";

/// Names of the two substrate structures the worker reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub ready: String,
    pub delayed: String,
}

impl QueueKeys {
    pub fn new(ready: impl Into<String>, delayed: impl Into<String>) -> Self {
        Self {
            ready: ready.into(),
            delayed: delayed.into(),
        }
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_READY_KEY, DEFAULT_DELAYED_KEY)
    }
}

/// Queue substrate error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),
}

/// Ready list + delayed set operations consumed by the worker.
#[async_trait]
pub trait QueueSubstrate: Send + Sync {
    /// Pop the head of the ready list, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing to pop.
    async fn blocking_pop(
        &self,
        ready_key: &str,
        timeout: Duration,
    ) -> Result<Option<RawPayload>, QueueError>;

    /// Delayed entries with a due score in `0..=now_ms`, ascending, at most `limit`.
    async fn range_due(
        &self,
        delayed_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<RawPayload>, QueueError>;

    /// Move `entries` from the delayed set to the tail of the ready list, in order.
    ///
    /// Atomic as a whole. An entry is appended only if this call removed it
    /// from the delayed set, so concurrent sweeps cannot duplicate a job.
    /// Returns how many entries were moved.
    async fn promote(
        &self,
        delayed_key: &str,
        ready_key: &str,
        entries: &[RawPayload],
    ) -> Result<usize, QueueError>;

    /// Add `payload` to the delayed set, due at `due_ms` (unix millis).
    async fn insert_scored(
        &self,
        delayed_key: &str,
        due_ms: i64,
        payload: &[u8],
    ) -> Result<(), QueueError>;

    /// Append `payload` to the tail of the ready list (producer side).
    async fn push_ready(&self, ready_key: &str, payload: &[u8]) -> Result<(), QueueError>;
}

#[async_trait]
impl<T: QueueSubstrate + ?Sized> QueueSubstrate for Arc<T> {
    async fn blocking_pop(
        &self,
        ready_key: &str,
        timeout: Duration,
    ) -> Result<Option<RawPayload>, QueueError> {
        (**self).blocking_pop(ready_key, timeout).await
    }

    async fn range_due(
        &self,
        delayed_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<RawPayload>, QueueError> {
        (**self).range_due(delayed_key, now_ms, limit).await
    }

    async fn promote(
        &self,
        delayed_key: &str,
        ready_key: &str,
        entries: &[RawPayload],
    ) -> Result<usize, QueueError> {
        (**self).promote(delayed_key, ready_key, entries).await
    }

    async fn insert_scored(
        &self,
        delayed_key: &str,
        due_ms: i64,
        payload: &[u8],
    ) -> Result<(), QueueError> {
        (**self).insert_scored(delayed_key, due_ms, payload).await
    }

    async fn push_ready(&self, ready_key: &str, payload: &[u8]) -> Result<(), QueueError> {
        (**self).push_ready(ready_key, payload).await
    }
}
