//! Processes one inscription job end to end.
//!
//! ## Algorithm
//!
//! 1. Load the record; discard the job if it is gone or not a user-assembled parlay
//! 2. Skip records that are already `confirmed` (duplicate delivery) or `failed`
//! 3. Mark `queued`, build the payload, submit to the ledger (bounded by a timeout)
//! 4. Success: mark `confirmed` with the receipt
//! 5. Failure: either mark `failed` (attempt budget used up) or re-emit the job
//!    with `attempt + 1` into the delayed set at `now + backoff(attempt)`
//!
//! Ledger errors are all treated as retryable. Record store and queue errors
//! are not handled here; they surface as [`ProcessError`] to the worker loop.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, error, info, info_span, warn};

use inscriber_core::{InscriptionStatus, MAX_BACKOFF, ParlayKind, RetryPolicy, sanitize_error_summary};

use crate::ledger::{InscriptionPayload, LedgerClient, LedgerError, LedgerTag};
use crate::queue::{QueueError, QueueKeys, QueueSubstrate};
use crate::records::{ParlayRepository, RepositoryError};

use super::message::{JobMessage, MessageError};

/// Default bound on a single ledger submission.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub retry: RetryPolicy,
    pub tag: LedgerTag,
    pub keys: QueueKeys,
    pub submit_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            tag: LedgerTag::default(),
            keys: QueueKeys::default(),
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
        }
    }
}

impl ProcessorConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_keys(mut self, keys: QueueKeys) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_tag(mut self, tag: LedgerTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }
}

/// Why a job was dropped without touching the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    RecordNotFound,
    NotInscribable(ParlayKind),
    AlreadyFailed,
    /// The store refused to mark the record `queued` although it still looked open.
    NotQueueable(InscriptionStatus),
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Discarded(DiscardReason),
    /// Duplicate delivery of a job whose record is already confirmed.
    AlreadyConfirmed,
    Confirmed {
        tx_id: String,
        inscription_hash: String,
    },
    RetryScheduled {
        next_attempt: u32,
        due_at: DateTime<Utc>,
    },
    /// The ledger accepted the submission but the record had already been
    /// settled by someone else, so nothing was written.
    Superseded { tx_id: String },
    /// Attempt budget used up; the record is now `failed`.
    Exhausted { attempts: u32 },
}

/// Infrastructure failure while processing a job.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Message(#[from] MessageError),
}

pub struct InscriptionProcessor<R, L, Q> {
    repository: R,
    ledger: L,
    queue: Q,
    config: ProcessorConfig,
}

impl<R, L, Q> InscriptionProcessor<R, L, Q>
where
    R: ParlayRepository,
    L: LedgerClient,
    Q: QueueSubstrate,
{
    pub fn new(repository: R, ledger: L, queue: Q, config: ProcessorConfig) -> Self {
        Self {
            repository,
            ledger,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub async fn process(&self, job: &JobMessage) -> Result<ProcessOutcome, ProcessError> {
        self.process_at(job, Utc::now()).await
    }

    /// Process `job` as if the current time were `now` (used for retry due times).
    pub async fn process_at(
        &self,
        job: &JobMessage,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let span = info_span!(
            "inscription",
            job_id = job.job_id.as_deref().unwrap_or("-"),
            record_id = %job.record_id,
            attempt = job.attempt,
        );

        self.process_inner(job, now).instrument(span).await
    }

    async fn process_inner(
        &self,
        job: &JobMessage,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let Some(record) = self.repository.get_by_id(&job.record_id).await? else {
            info!("record not found; discarding job");
            return Ok(ProcessOutcome::Discarded(DiscardReason::RecordNotFound));
        };

        if !record.kind.is_inscribable() {
            info!(kind = record.kind.as_str(), "record kind is not inscribable; discarding job");
            return Ok(ProcessOutcome::Discarded(DiscardReason::NotInscribable(
                record.kind,
            )));
        }

        if let Some(outcome) = settled_outcome(record.inscription_status) {
            return Ok(outcome);
        }

        if !self.repository.mark_queued(&job.record_id).await? {
            // Another consumer settled the record after our read.
            let current = self
                .repository
                .get_by_id(&job.record_id)
                .await?
                .map(|r| r.inscription_status);
            let outcome = match current {
                None => ProcessOutcome::Discarded(DiscardReason::RecordNotFound),
                Some(status) => settled_outcome(status)
                    .unwrap_or(ProcessOutcome::Discarded(DiscardReason::NotQueueable(status))),
            };
            info!(?outcome, "record changed before submission; not submitting");
            return Ok(outcome);
        }

        let payload = InscriptionPayload::from_record(&record, &self.config.tag);
        let submitted = match tokio::time::timeout(
            self.config.submit_timeout,
            self.ledger.submit(&payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(self.config.submit_timeout)),
        };

        match submitted {
            Ok(receipt) => {
                let inscription_hash = receipt
                    .hash
                    .clone()
                    .unwrap_or_else(|| record.content_hash.clone());
                let stored = self
                    .repository
                    .mark_confirmed(&job.record_id, &inscription_hash, &receipt.transaction_id)
                    .await?;
                if !stored {
                    warn!(
                        tx_id = %receipt.transaction_id,
                        "record settled elsewhere while submitting; inscription not recorded"
                    );
                    return Ok(ProcessOutcome::Superseded {
                        tx_id: receipt.transaction_id,
                    });
                }

                info!(tx_id = %receipt.transaction_id, "parlay inscribed");
                Ok(ProcessOutcome::Confirmed {
                    tx_id: receipt.transaction_id,
                    inscription_hash,
                })
            }
            Err(err) => self.handle_submit_failure(job, err, now).await,
        }
    }

    async fn handle_submit_failure(
        &self,
        job: &JobMessage,
        err: LedgerError,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let next_attempt = job.attempt.saturating_add(1);

        if self.config.retry.is_exhausted(next_attempt) {
            let summary = sanitize_error_summary(&err.to_string());
            self.repository.mark_failed(&job.record_id, &summary).await?;

            error!(attempts = next_attempt, error = %summary, "inscription failed permanently");
            return Ok(ProcessOutcome::Exhausted {
                attempts: next_attempt,
            });
        }

        // Backoff is keyed on the attempt that just failed, so the first retry waits `base`.
        let delay = self.config.retry.delay_for_attempt(job.attempt);
        let due_at = now + to_time_delta(delay);

        let retry = job.next_attempt().encode()?;
        self.queue
            .insert_scored(&self.config.keys.delayed, due_at.timestamp_millis(), &retry)
            .await?;

        warn!(
            next_attempt,
            due_at = %due_at.to_rfc3339(),
            error = %err,
            "ledger submission failed; retry scheduled"
        );
        Ok(ProcessOutcome::RetryScheduled {
            next_attempt,
            due_at,
        })
    }
}

/// Outcome for a record that must not be submitted again, `None` while it is still open.
fn settled_outcome(status: InscriptionStatus) -> Option<ProcessOutcome> {
    match status {
        InscriptionStatus::Confirmed => {
            debug!("record already confirmed; skipping duplicate job");
            Some(ProcessOutcome::AlreadyConfirmed)
        }
        InscriptionStatus::Failed => {
            info!("record already failed; discarding job");
            Some(ProcessOutcome::Discarded(DiscardReason::AlreadyFailed))
        }
        InscriptionStatus::None | InscriptionStatus::Queued => None,
    }
}

fn to_time_delta(delay: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(delay.min(MAX_BACKOFF)).unwrap_or(chrono::TimeDelta::seconds(300))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use inscriber_core::{ParlayId, ParlayRecord};

    use crate::ledger::{InMemoryLedger, LedgerReceipt};
    use crate::queue::InMemoryQueue;
    use crate::records::{InMemoryParlayRepository, RepositoryWrite};

    type TestProcessor =
        InscriptionProcessor<Arc<InMemoryParlayRepository>, Arc<InMemoryLedger>, Arc<InMemoryQueue>>;

    struct Fixture {
        repo: Arc<InMemoryParlayRepository>,
        ledger: Arc<InMemoryLedger>,
        queue: Arc<InMemoryQueue>,
        processor: TestProcessor,
    }

    fn fixture(records: Vec<ParlayRecord>) -> Fixture {
        let repo = Arc::new(InMemoryParlayRepository::with_records(records));
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(InMemoryQueue::new());
        let processor = InscriptionProcessor::new(
            repo.clone(),
            ledger.clone(),
            queue.clone(),
            ProcessorConfig::default()
                .with_retry(RetryPolicy::new(3, Duration::from_secs(5))),
        );
        Fixture {
            repo,
            ledger,
            queue,
            processor,
        }
    }

    fn id(raw: &str) -> ParlayId {
        ParlayId::parse(raw).unwrap()
    }

    fn record(raw_id: &str, kind: ParlayKind) -> ParlayRecord {
        ParlayRecord::new(
            id(raw_id),
            kind,
            "ab".repeat(32),
            "acct_7",
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()
    }

    fn job(raw_id: &str, attempt: u32) -> JobMessage {
        JobMessage {
            attempt,
            ..JobMessage::new(id(raw_id))
        }
    }

    #[tokio::test]
    async fn success_confirms_record_with_receipt() {
        let fx = fixture(vec![record("p-1", ParlayKind::UserAssembled)]);
        fx.ledger
            .push_outcome(Ok(LedgerReceipt::new("tx-9").with_hash("ledger-hash")));

        let outcome = fx.processor.process_at(&job("p-1", 0), now()).await.unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Confirmed {
                tx_id: "tx-9".to_string(),
                inscription_hash: "ledger-hash".to_string(),
            }
        );
        let stored = fx.repo.get(&id("p-1")).unwrap();
        assert_eq!(stored.inscription_status, InscriptionStatus::Confirmed);
        assert_eq!(stored.inscription_tx_id.as_deref(), Some("tx-9"));
        assert_eq!(
            fx.repo.writes()[0],
            RepositoryWrite::Queued(id("p-1")),
            "record is marked queued before submission"
        );
    }

    #[tokio::test]
    async fn receipt_without_hash_falls_back_to_content_hash() {
        let fx = fixture(vec![record("p-1", ParlayKind::UserAssembled)]);

        let outcome = fx.processor.process_at(&job("p-1", 0), now()).await.unwrap();

        let ProcessOutcome::Confirmed { inscription_hash, .. } = outcome else {
            panic!("expected confirmation, got {outcome:?}");
        };
        assert_eq!(inscription_hash, "ab".repeat(32));
    }

    #[tokio::test]
    async fn payload_is_built_from_record_fields() {
        let fx = fixture(vec![record("p-1", ParlayKind::UserAssembled)]);

        fx.processor.process_at(&job("p-1", 0), now()).await.unwrap();

        let submitted = fx.ledger.submissions();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].record_id, "p-1");
        assert_eq!(submitted[0].account_reference, "acct_7");
        assert_eq!(submitted[0].created_at, "2024-05-01T08:00:00.000Z");
    }

    #[tokio::test]
    async fn missing_record_is_discarded() {
        let fx = fixture(vec![]);

        let outcome = fx.processor.process_at(&job("ghost", 0), now()).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Discarded(DiscardReason::RecordNotFound));
        assert_eq!(fx.ledger.submission_count(), 0);
        assert!(fx.repo.writes().is_empty());
        assert_eq!(fx.queue.delayed_len(&fx.processor.config().keys.delayed), 0);
    }

    #[tokio::test]
    async fn other_kinds_are_never_submitted() {
        let fx = fixture(vec![
            record("c-1", ParlayKind::Curated),
            record("g-1", ParlayKind::Generated),
        ]);

        for (raw, kind) in [("c-1", ParlayKind::Curated), ("g-1", ParlayKind::Generated)] {
            let outcome = fx.processor.process_at(&job(raw, 0), now()).await.unwrap();
            assert_eq!(
                outcome,
                ProcessOutcome::Discarded(DiscardReason::NotInscribable(kind))
            );
        }
        assert_eq!(fx.ledger.submission_count(), 0);
        assert!(fx.repo.writes().is_empty());
    }

    #[tokio::test]
    async fn confirmed_records_are_left_alone() {
        let mut confirmed = record("p-1", ParlayKind::UserAssembled)
            .with_status(InscriptionStatus::Confirmed);
        confirmed.inscription_tx_id = Some("tx-original".to_string());
        let fx = fixture(vec![confirmed.clone()]);

        let outcome = fx.processor.process_at(&job("p-1", 0), now()).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::AlreadyConfirmed);
        assert_eq!(fx.ledger.submission_count(), 0);
        assert!(fx.repo.writes().is_empty());
        assert_eq!(fx.repo.get(&id("p-1")).unwrap(), confirmed);
    }

    #[tokio::test]
    async fn failed_records_are_not_resubmitted() {
        let fx = fixture(vec![
            record("p-1", ParlayKind::UserAssembled).with_status(InscriptionStatus::Failed),
        ]);

        let outcome = fx.processor.process_at(&job("p-1", 0), now()).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Discarded(DiscardReason::AlreadyFailed));
        assert_eq!(fx.ledger.submission_count(), 0);
    }

    #[tokio::test]
    async fn first_failure_schedules_retry_after_base_delay() {
        let fx = fixture(vec![record("p-1", ParlayKind::UserAssembled)]);
        fx.ledger.push_failure("rpc unavailable");

        let original = job("p-1", 0);
        let outcome = fx.processor.process_at(&original, now()).await.unwrap();

        let due_at = now() + chrono::TimeDelta::seconds(5);
        assert_eq!(
            outcome,
            ProcessOutcome::RetryScheduled {
                next_attempt: 1,
                due_at,
            }
        );

        let delayed = fx.queue.delayed_snapshot(&fx.processor.config().keys.delayed);
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].0, due_at.timestamp_millis());
        assert_eq!(
            JobMessage::decode(&delayed[0].1).unwrap(),
            original.next_attempt()
        );

        let stored = fx.repo.get(&id("p-1")).unwrap();
        assert_eq!(stored.inscription_status, InscriptionStatus::Queued);
        assert!(stored.inscription_error.is_none());
    }

    #[tokio::test]
    async fn backoff_grows_with_attempt() {
        let fx = fixture(vec![record("p-1", ParlayKind::UserAssembled)]);
        fx.ledger.push_failure("rpc unavailable");

        let outcome = fx.processor.process_at(&job("p-1", 1), now()).await.unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::RetryScheduled {
                next_attempt: 2,
                due_at: now() + chrono::TimeDelta::seconds(10),
            }
        );
    }

    #[tokio::test]
    async fn last_attempt_marks_record_failed() {
        let fx = fixture(vec![record("p-1", ParlayKind::UserAssembled)]);
        fx.ledger.push_failure("rpc unavailable\n   at submit()");

        let outcome = fx.processor.process_at(&job("p-1", 2), now()).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::Exhausted { attempts: 3 });
        let stored = fx.repo.get(&id("p-1")).unwrap();
        assert_eq!(stored.inscription_status, InscriptionStatus::Failed);
        assert_eq!(
            stored.inscription_error.as_deref(),
            Some("ledger transport error: rpc unavailable at submit()")
        );
        assert_eq!(fx.queue.delayed_len(&fx.processor.config().keys.delayed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ledger_counts_as_failure() {
        let fx = fixture(vec![record("p-1", ParlayKind::UserAssembled)]);
        fx.ledger.set_latency(Some(DEFAULT_SUBMIT_TIMEOUT * 2));

        let outcome = fx.processor.process_at(&job("p-1", 0), now()).await.unwrap();

        assert!(matches!(
            outcome,
            ProcessOutcome::RetryScheduled { next_attempt: 1, .. }
        ));
        assert_eq!(
            fx.repo.get(&id("p-1")).unwrap().inscription_status,
            InscriptionStatus::Queued
        );
    }

    #[tokio::test]
    async fn store_errors_escape_to_the_caller() {
        let fx = fixture(vec![record("p-1", ParlayKind::UserAssembled)]);
        fx.repo.set_unavailable(true);

        let err = fx.processor.process_at(&job("p-1", 0), now()).await.unwrap_err();

        assert!(matches!(err, ProcessError::Repository(RepositoryError::Unavailable(_))));
        assert_eq!(fx.ledger.submission_count(), 0);
    }

    #[tokio::test]
    async fn queue_errors_while_scheduling_retry_escape() {
        let fx = fixture(vec![record("p-1", ParlayKind::UserAssembled)]);
        fx.ledger.push_failure("rpc unavailable");
        fx.queue.set_unavailable(true);

        let err = fx.processor.process_at(&job("p-1", 0), now()).await.unwrap_err();

        assert!(matches!(err, ProcessError::Queue(_)));
    }
    /// Settles the record behind the processor's back at a chosen point.
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum RacePoint {
        AfterRead,
        AfterQueued,
    }

    struct RacingRepository {
        inner: InMemoryParlayRepository,
        race_at: RacePoint,
    }

    impl RacingRepository {
        async fn settle_elsewhere(&self, id: &ParlayId) -> Result<(), RepositoryError> {
            self.inner.mark_confirmed(id, "other-hash", "tx-other").await?;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ParlayRepository for RacingRepository {
        async fn get_by_id(&self, id: &ParlayId) -> Result<Option<ParlayRecord>, RepositoryError> {
            let found = self.inner.get_by_id(id).await?;
            if self.race_at == RacePoint::AfterRead {
                self.settle_elsewhere(id).await?;
            }
            Ok(found)
        }

        async fn mark_queued(&self, id: &ParlayId) -> Result<bool, RepositoryError> {
            let updated = self.inner.mark_queued(id).await?;
            if self.race_at == RacePoint::AfterQueued {
                self.settle_elsewhere(id).await?;
            }
            Ok(updated)
        }

        async fn mark_confirmed(
            &self,
            id: &ParlayId,
            inscription_hash: &str,
            tx_id: &str,
        ) -> Result<bool, RepositoryError> {
            self.inner.mark_confirmed(id, inscription_hash, tx_id).await
        }

        async fn mark_failed(&self, id: &ParlayId, error: &str) -> Result<bool, RepositoryError> {
            self.inner.mark_failed(id, error).await
        }
    }

    fn racing_processor(
        race_at: RacePoint,
    ) -> (
        Arc<RacingRepository>,
        Arc<InMemoryLedger>,
        InscriptionProcessor<Arc<RacingRepository>, Arc<InMemoryLedger>, Arc<InMemoryQueue>>,
    ) {
        let repo = Arc::new(RacingRepository {
            inner: InMemoryParlayRepository::with_records(vec![record(
                "p-1",
                ParlayKind::UserAssembled,
            )]),
            race_at,
        });
        let ledger = Arc::new(InMemoryLedger::new());
        let processor = InscriptionProcessor::new(
            repo.clone(),
            ledger.clone(),
            Arc::new(InMemoryQueue::new()),
            ProcessorConfig::default(),
        );
        (repo, ledger, processor)
    }

    #[tokio::test]
    async fn record_confirmed_after_read_is_not_submitted() {
        let (repo, ledger, processor) = racing_processor(RacePoint::AfterRead);

        let outcome = processor.process_at(&job("p-1", 0), now()).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::AlreadyConfirmed);
        assert_eq!(ledger.submission_count(), 0);
        let stored = repo.inner.get(&id("p-1")).unwrap();
        assert_eq!(stored.inscription_tx_id.as_deref(), Some("tx-other"));
    }

    #[tokio::test]
    async fn confirmation_lost_to_another_consumer_is_not_reported_as_ours() {
        let (repo, ledger, processor) = racing_processor(RacePoint::AfterQueued);

        let outcome = processor.process_at(&job("p-1", 0), now()).await.unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Superseded {
                tx_id: "tx-1".to_string()
            }
        );
        assert_eq!(ledger.submission_count(), 1);
        let stored = repo.inner.get(&id("p-1")).unwrap();
        assert_eq!(stored.inscription_status, InscriptionStatus::Confirmed);
        assert_eq!(stored.inscription_tx_id.as_deref(), Some("tx-other"));
    }
}
