//! Scriptable in-memory ledger (for tests/dev).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{AccountSetup, InscriptionPayload, LedgerClient, LedgerError, LedgerReceipt};

#[derive(Debug, Default)]
struct Script {
    outcomes: VecDeque<Result<LedgerReceipt, LedgerError>>,
    fallback_error: Option<LedgerError>,
    latency: Option<Duration>,
    submissions: Vec<InscriptionPayload>,
}

/// Ledger double.
///
/// Scripted outcomes are consumed in order. Once they run out, submissions
/// fail with the fallback error if one is set, otherwise they succeed with
/// `tx-<n>`.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    script: Mutex<Script>,
    initialized: AtomicUsize,
    issued: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger whose every submission fails with `message`.
    pub fn always_failing(message: impl Into<String>) -> Self {
        let ledger = Self::new();
        ledger.set_fallback_error(Some(LedgerError::Transport(message.into())));
        ledger
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_outcome(&self, outcome: Result<LedgerReceipt, LedgerError>) {
        self.script().outcomes.push_back(outcome);
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.push_outcome(Err(LedgerError::Transport(message.into())));
    }

    pub fn set_fallback_error(&self, error: Option<LedgerError>) {
        self.script().fallback_error = error;
    }

    /// Delay every submission by `latency` before answering.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.script().latency = latency;
    }

    /// Payloads received so far, in order.
    pub fn submissions(&self) -> Vec<InscriptionPayload> {
        self.script().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.script().submissions.len()
    }

    pub fn initialize_count(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn initialize(&self) -> Result<AccountSetup, LedgerError> {
        let previous = self.initialized.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            Ok(AccountSetup::Created)
        } else {
            Ok(AccountSetup::AlreadyInitialized)
        }
    }

    async fn submit(&self, payload: &InscriptionPayload) -> Result<LedgerReceipt, LedgerError> {
        let (outcome, latency) = {
            let mut script = self.script();
            script.submissions.push(payload.clone());
            let outcome = script
                .outcomes
                .pop_front()
                .or_else(|| script.fallback_error.clone().map(Err));
            (outcome, script.latency)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        outcome.unwrap_or_else(|| {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(LedgerReceipt::new(format!("tx-{n}")))
        })
    }
}
