//! Record store adapter for saved parlays.
//!
//! The worker needs one point lookup and three status writes. Every write is
//! guarded so that rows already in a terminal status (`confirmed`/`failed`)
//! are left untouched; the returned `bool` says whether a row changed.

use std::sync::Arc;

use async_trait::async_trait;

use inscriber_core::{ParlayId, ParlayRecord};

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryParlayRepository, RepositoryWrite};
pub use postgres::PostgresParlayRepository;

/// Record store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("record store query failed: {0}")]
    Query(String),

    #[error("invalid record row: {0}")]
    InvalidRow(String),
}

/// Access to saved parlay records.
#[async_trait]
pub trait ParlayRepository: Send + Sync {
    /// Point lookup. `Ok(None)` when no record has this id.
    async fn get_by_id(&self, id: &ParlayId) -> Result<Option<ParlayRecord>, RepositoryError>;

    /// Set status to `queued`. Repeating it is harmless.
    async fn mark_queued(&self, id: &ParlayId) -> Result<bool, RepositoryError>;

    /// Set status to `confirmed` with the ledger hash and transaction id.
    async fn mark_confirmed(
        &self,
        id: &ParlayId,
        inscription_hash: &str,
        tx_id: &str,
    ) -> Result<bool, RepositoryError>;

    /// Set status to `failed` with an error summary (truncated to 500 chars).
    async fn mark_failed(&self, id: &ParlayId, error: &str) -> Result<bool, RepositoryError>;
}

#[async_trait]
impl<T: ParlayRepository + ?Sized> ParlayRepository for Arc<T> {
    async fn get_by_id(&self, id: &ParlayId) -> Result<Option<ParlayRecord>, RepositoryError> {
        (**self).get_by_id(id).await
    }

    async fn mark_queued(&self, id: &ParlayId) -> Result<bool, RepositoryError> {
        (**self).mark_queued(id).await
    }

    async fn mark_confirmed(
        &self,
        id: &ParlayId,
        inscription_hash: &str,
        tx_id: &str,
    ) -> Result<bool, RepositoryError> {
        (**self).mark_confirmed(id, inscription_hash, tx_id).await
    }

    async fn mark_failed(&self, id: &ParlayId, error: &str) -> Result<bool, RepositoryError> {
        (**self).mark_failed(id, error).await
    }
}
