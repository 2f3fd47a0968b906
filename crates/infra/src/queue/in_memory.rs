//! In-memory queue substrate for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{QueueError, QueueSubstrate, RawPayload};

#[derive(Debug, Default)]
struct Structures {
    ready: HashMap<String, VecDeque<RawPayload>>,
    /// `(due_ms, payload)`; a payload appears at most once per key, like a sorted set.
    delayed: HashMap<String, Vec<(i64, RawPayload)>>,
}

/// In-memory ready lists and delayed sets keyed by name.
///
/// Mirrors the Redis semantics the worker relies on: FIFO ready lists,
/// member-unique delayed sets ordered by `(score, member)`, and
/// blocking pops that wake up when something is pushed.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    structures: Mutex<Structures>,
    pushed: Notify,
    unavailable: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn structures(&self) -> MutexGuard<'_, Structures> {
        self.structures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current contents of a ready list, head first.
    pub fn ready_snapshot(&self, ready_key: &str) -> Vec<RawPayload> {
        self.structures()
            .ready
            .get(ready_key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current contents of a delayed set, ascending by due time.
    pub fn delayed_snapshot(&self, delayed_key: &str) -> Vec<(i64, RawPayload)> {
        let mut entries = self
            .structures()
            .delayed
            .get(delayed_key)
            .cloned()
            .unwrap_or_default();
        entries.sort();
        entries
    }

    pub fn ready_len(&self, ready_key: &str) -> usize {
        self.structures().ready.get(ready_key).map_or(0, VecDeque::len)
    }

    pub fn delayed_len(&self, delayed_key: &str) -> usize {
        self.structures().delayed.get(delayed_key).map_or(0, Vec::len)
    }

    /// Make every substrate call fail with [`QueueError::Connection`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Connection(
                "in-memory queue switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueSubstrate for InMemoryQueue {
    async fn blocking_pop(
        &self,
        ready_key: &str,
        timeout: Duration,
    ) -> Result<Option<RawPayload>, QueueError> {
        self.check_available()?;

        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Pushes use `notify_one`, which leaves a permit behind when nobody
            // is waiting yet, so a push between the check and the wait is not lost.
            let pushed = self.pushed.notified();

            let popped = self
                .structures()
                .ready
                .get_mut(ready_key)
                .and_then(VecDeque::pop_front);
            if popped.is_some() {
                return Ok(popped);
            }

            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn range_due(
        &self,
        delayed_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<RawPayload>, QueueError> {
        self.check_available()?;

        let structures = self.structures();
        let Some(set) = structures.delayed.get(delayed_key) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<&(i64, RawPayload)> = set
            .iter()
            .filter(|(score, _)| (0..=now_ms).contains(score))
            .collect();
        due.sort();

        Ok(due
            .into_iter()
            .take(limit)
            .map(|(_, payload)| payload.clone())
            .collect())
    }

    async fn promote(
        &self,
        delayed_key: &str,
        ready_key: &str,
        entries: &[RawPayload],
    ) -> Result<usize, QueueError> {
        self.check_available()?;

        let moved = {
            let mut structures = self.structures();
            let mut moved = Vec::new();

            if let Some(set) = structures.delayed.get_mut(delayed_key) {
                for entry in entries {
                    if let Some(pos) = set.iter().position(|(_, member)| member == entry) {
                        set.remove(pos);
                        moved.push(entry.clone());
                    }
                }
            }

            let count = moved.len();
            structures
                .ready
                .entry(ready_key.to_string())
                .or_default()
                .extend(moved);
            count
        };

        for _ in 0..moved {
            self.pushed.notify_one();
        }

        Ok(moved)
    }

    async fn insert_scored(
        &self,
        delayed_key: &str,
        due_ms: i64,
        payload: &[u8],
    ) -> Result<(), QueueError> {
        self.check_available()?;

        let mut structures = self.structures();
        let set = structures.delayed.entry(delayed_key.to_string()).or_default();

        match set.iter_mut().find(|(_, member)| member.as_slice() == payload) {
            Some(existing) => existing.0 = due_ms,
            None => set.push((due_ms, payload.to_vec())),
        }

        Ok(())
    }

    async fn push_ready(&self, ready_key: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.check_available()?;

        self.structures()
            .ready
            .entry(ready_key.to_string())
            .or_default()
            .push_back(payload.to_vec());
        self.pushed.notify_one();
        Ok(())
    }
}
