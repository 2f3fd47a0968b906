//! Moves due retries from the delayed set back onto the ready list.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::queue::{QueueError, QueueKeys, QueueSubstrate};

/// Default number of due entries moved per sweep.
pub const DEFAULT_PROMOTE_BATCH: usize = 25;

/// One sweep per worker iteration, bounded so a large backlog of retries
/// cannot starve fresh jobs on the ready list.
#[derive(Debug, Clone)]
pub struct DelayedPromoter {
    keys: QueueKeys,
    batch_size: usize,
}

impl DelayedPromoter {
    pub fn new(keys: QueueKeys, batch_size: usize) -> Self {
        Self {
            keys,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Move up to `batch_size` entries due at or before `now`, oldest first.
    pub async fn try_promote_due<Q>(&self, queue: &Q, now: DateTime<Utc>) -> Result<usize, QueueError>
    where
        Q: QueueSubstrate + ?Sized,
    {
        let due = queue
            .range_due(&self.keys.delayed, now.timestamp_millis(), self.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let moved = queue
            .promote(&self.keys.delayed, &self.keys.ready, &due)
            .await?;
        if moved > 0 {
            debug!(moved, "promoted due retries to ready queue");
        }

        Ok(moved)
    }

    /// Like [`Self::try_promote_due`], but a substrate failure is logged and
    /// reported as 0. Entries stay in the delayed set until a move succeeds,
    /// so the next sweep picks them up.
    pub async fn promote_due<Q>(&self, queue: &Q, now: DateTime<Utc>) -> usize
    where
        Q: QueueSubstrate + ?Sized,
    {
        match self.try_promote_due(queue, now).await {
            Ok(moved) => moved,
            Err(err) => {
                warn!(error = %err, "delayed-set promotion failed; retrying next sweep");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(10_000).unwrap()
    }

    #[tokio::test]
    async fn promotes_due_entries_in_due_order() {
        let queue = InMemoryQueue::new();
        let keys = QueueKeys::default();
        queue.insert_scored(&keys.delayed, 9_000, b"second").await.unwrap();
        queue.insert_scored(&keys.delayed, 1_000, b"first").await.unwrap();
        queue.insert_scored(&keys.delayed, 20_000, b"later").await.unwrap();

        let promoter = DelayedPromoter::new(keys.clone(), DEFAULT_PROMOTE_BATCH);
        assert_eq!(promoter.try_promote_due(&queue, now()).await.unwrap(), 2);

        assert_eq!(
            queue.ready_snapshot(&keys.ready),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        assert_eq!(queue.delayed_snapshot(&keys.delayed), vec![(20_000, b"later".to_vec())]);
    }

    #[tokio::test]
    async fn sweeps_are_bounded_by_batch_size() {
        let queue = InMemoryQueue::new();
        let keys = QueueKeys::default();
        for i in 0..5i64 {
            queue
                .insert_scored(&keys.delayed, i, format!("job-{i}").as_bytes())
                .await
                .unwrap();
        }

        let promoter = DelayedPromoter::new(keys.clone(), 2);
        assert_eq!(promoter.promote_due(&queue, now()).await, 2);
        assert_eq!(promoter.promote_due(&queue, now()).await, 2);
        assert_eq!(promoter.promote_due(&queue, now()).await, 1);
        assert_eq!(promoter.promote_due(&queue, now()).await, 0);
        assert_eq!(queue.ready_len(&keys.ready), 5);
    }

    #[tokio::test]
    async fn failed_sweep_keeps_entries_for_next_time() {
        let queue = InMemoryQueue::new();
        let keys = QueueKeys::default();
        queue.insert_scored(&keys.delayed, 1_000, b"job").await.unwrap();

        let promoter = DelayedPromoter::new(keys.clone(), DEFAULT_PROMOTE_BATCH);

        queue.set_unavailable(true);
        assert!(promoter.try_promote_due(&queue, now()).await.is_err());
        assert_eq!(promoter.promote_due(&queue, now()).await, 0);

        queue.set_unavailable(false);
        assert_eq!(queue.delayed_len(&keys.delayed), 1);
        assert_eq!(promoter.promote_due(&queue, now()).await, 1);
        assert_eq!(queue.ready_snapshot(&keys.ready), vec![b"job".to_vec()]);
    }

    #[test]
    fn batch_size_is_at_least_one() {
        assert_eq!(DelayedPromoter::new(QueueKeys::default(), 0).batch_size(), 1);
    }
}
