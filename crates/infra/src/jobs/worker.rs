//! Worker loop: promote due retries, pop one job, process it, repeat.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ledger::LedgerClient;
use crate::queue::{QueueSubstrate, RawPayload};
use crate::records::ParlayRepository;

use super::message::JobMessage;
use super::processor::{InscriptionProcessor, ProcessOutcome};
use super::promoter::{DEFAULT_PROMOTE_BATCH, DelayedPromoter};

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct InscriptionWorkerConfig {
    /// How long one blocking pop waits before the loop re-checks the delayed set.
    pub pop_timeout: Duration,
    /// Due retries moved per iteration.
    pub promote_batch: usize,
    /// Pause after an error escapes a job.
    pub error_pause: Duration,
}

impl Default for InscriptionWorkerConfig {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_secs(5),
            promote_batch: DEFAULT_PROMOTE_BATCH,
            error_pause: Duration::from_secs(1),
        }
    }
}

impl InscriptionWorkerConfig {
    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn with_promote_batch(mut self, batch: usize) -> Self {
        self.promote_batch = batch;
        self
    }

    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    /// Payloads popped from the ready queue, whatever became of them.
    pub jobs_processed: u64,
    pub confirmed: u64,
    pub retries_scheduled: u64,
    pub exhausted: u64,
    /// Jobs that left no inscription behind: missing or wrong-kind records,
    /// records already terminal, and submissions that lost a race to another consumer.
    pub discarded: u64,
    pub malformed: u64,
    /// Errors and panics that escaped a job, plus failed pops.
    pub errors: u64,
    /// Delayed entries moved back to the ready queue.
    pub promoted: u64,
}

impl WorkerStats {
    fn record_outcome(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Confirmed { .. } => self.confirmed += 1,
            ProcessOutcome::RetryScheduled { .. } => self.retries_scheduled += 1,
            ProcessOutcome::Exhausted { .. } => self.exhausted += 1,
            ProcessOutcome::Discarded(_)
            | ProcessOutcome::AlreadyConfirmed
            | ProcessOutcome::Superseded { .. } => self.discarded += 1,
        }
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStep {
    /// Pop timed out with nothing ready.
    Idle,
    /// Payload could not be decoded and was dropped.
    Malformed,
    Processed(ProcessOutcome),
    /// Something escaped the job (or the pop); the loop should pause.
    Failed,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the loop to finish its current job.
    pub async fn shutdown(mut self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "inscription worker task ended abnormally");
            }
        }
        self.stats()
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-threaded inscription consumer. Jobs run strictly one at a time.
pub struct InscriptionWorker<R, L, Q> {
    processor: InscriptionProcessor<R, L, Q>,
    promoter: DelayedPromoter,
    config: InscriptionWorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<R, L, Q> InscriptionWorker<R, L, Q>
where
    R: ParlayRepository + 'static,
    L: LedgerClient + 'static,
    Q: QueueSubstrate + 'static,
{
    pub fn new(processor: InscriptionProcessor<R, L, Q>, config: InscriptionWorkerConfig) -> Self {
        let promoter = DelayedPromoter::new(processor.config().keys.clone(), config.promote_batch);
        Self {
            processor,
            promoter,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn processor(&self) -> &InscriptionProcessor<R, L, Q> {
        &self.processor
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    /// Spawn the loop on the tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    /// Loop until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// A pop in flight is never cancelled, so shutdown takes effect after the
    /// current pop or job, at most one pop timeout later.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            ready_key = %self.processor.config().keys.ready,
            delayed_key = %self.processor.config().keys.delayed,
            "inscription worker started"
        );

        loop {
            let stop = *shutdown.borrow() || shutdown.has_changed().is_err();
            if stop {
                break;
            }

            if self.run_once().await == LoopStep::Failed {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.error_pause) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(stats = ?self.stats(), "inscription worker stopped");
    }

    /// One iteration: promote, pop, decode, process.
    pub async fn run_once(&self) -> LoopStep {
        let queue = self.processor.queue();

        let promoted = self.promoter.promote_due(queue, Utc::now()).await;
        if promoted > 0 {
            lock_stats(&self.stats).promoted += promoted as u64;
        }

        let ready_key = &self.processor.config().keys.ready;
        let payload = match queue.blocking_pop(ready_key, self.config.pop_timeout).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return LoopStep::Idle,
            Err(err) => {
                error!(error = %err, "failed to pop from ready queue");
                lock_stats(&self.stats).errors += 1;
                return LoopStep::Failed;
            }
        };

        lock_stats(&self.stats).jobs_processed += 1;
        self.handle_payload(&payload).await
    }

    async fn handle_payload(&self, payload: &RawPayload) -> LoopStep {
        let job = match JobMessage::decode(payload) {
            Ok(job) => job,
            Err(err) => {
                warn!(
                    error = %err,
                    payload = %String::from_utf8_lossy(payload),
                    "discarding malformed job payload"
                );
                lock_stats(&self.stats).malformed += 1;
                return LoopStep::Malformed;
            }
        };

        let result = AssertUnwindSafe(self.processor.process(&job))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(outcome)) => {
                lock_stats(&self.stats).record_outcome(&outcome);
                LoopStep::Processed(outcome)
            }
            Ok(Err(err)) => {
                error!(
                    error = %err,
                    record_id = %job.record_id,
                    attempt = job.attempt,
                    payload = %String::from_utf8_lossy(payload),
                    "inscription job failed"
                );
                lock_stats(&self.stats).errors += 1;
                LoopStep::Failed
            }
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    record_id = %job.record_id,
                    payload = %String::from_utf8_lossy(payload),
                    "inscription job panicked"
                );
                lock_stats(&self.stats).errors += 1;
                LoopStep::Failed
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
