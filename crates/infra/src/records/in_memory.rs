//! In-memory parlay repository (for tests/dev).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use inscriber_core::{InscriptionStatus, ParlayId, ParlayRecord, truncate_error_summary};

use super::{ParlayRepository, RepositoryError};

/// A write call as seen by the repository, recorded whether or not it changed a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryWrite {
    Queued(ParlayId),
    Confirmed {
        id: ParlayId,
        inscription_hash: String,
        tx_id: String,
    },
    Failed {
        id: ParlayId,
        error: String,
    },
}

#[derive(Debug, Default)]
pub struct InMemoryParlayRepository {
    records: RwLock<HashMap<ParlayId, ParlayRecord>>,
    writes: RwLock<Vec<RepositoryWrite>>,
    unavailable: AtomicBool,
}

impl InMemoryParlayRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ParlayRecord>) -> Self {
        let repo = Self::new();
        for record in records {
            repo.insert(record);
        }
        repo
    }

    /// Insert or replace a record.
    pub fn insert(&self, record: ParlayRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record);
    }

    /// Current state of a record.
    pub fn get(&self, id: &ParlayId) -> Option<ParlayRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Every write call made so far, in call order.
    pub fn writes(&self) -> Vec<RepositoryWrite> {
        self.writes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make every call fail with [`RepositoryError::Unavailable`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable(
                "in-memory record store switched off".to_string(),
            ));
        }
        Ok(())
    }

    fn record_write(&self, write: RepositoryWrite) {
        self.writes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(write);
    }

    /// Apply `update` to a non-terminal record. Returns whether it was applied.
    fn update_open(&self, id: &ParlayId, update: impl FnOnce(&mut ParlayRecord)) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(id) {
            Some(record) if !record.inscription_status.is_terminal() => {
                update(record);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ParlayRepository for InMemoryParlayRepository {
    async fn get_by_id(&self, id: &ParlayId) -> Result<Option<ParlayRecord>, RepositoryError> {
        self.check_available()?;
        Ok(self.get(id))
    }

    async fn mark_queued(&self, id: &ParlayId) -> Result<bool, RepositoryError> {
        self.check_available()?;
        self.record_write(RepositoryWrite::Queued(id.clone()));

        Ok(self.update_open(id, |record| {
            record.inscription_status = InscriptionStatus::Queued;
        }))
    }

    async fn mark_confirmed(
        &self,
        id: &ParlayId,
        inscription_hash: &str,
        tx_id: &str,
    ) -> Result<bool, RepositoryError> {
        self.check_available()?;
        self.record_write(RepositoryWrite::Confirmed {
            id: id.clone(),
            inscription_hash: inscription_hash.to_string(),
            tx_id: tx_id.to_string(),
        });

        Ok(self.update_open(id, |record| {
            record.inscription_status = InscriptionStatus::Confirmed;
            record.inscription_hash = Some(inscription_hash.to_string());
            record.inscription_tx_id = Some(tx_id.to_string());
            record.inscription_error = None;
        }))
    }

    async fn mark_failed(&self, id: &ParlayId, error: &str) -> Result<bool, RepositoryError> {
        self.check_available()?;
        let error = truncate_error_summary(error);
        self.record_write(RepositoryWrite::Failed {
            id: id.clone(),
            error: error.clone(),
        });

        Ok(self.update_open(id, |record| {
            record.inscription_status = InscriptionStatus::Failed;
            record.inscription_error = Some(error);
        }))
    }
}
