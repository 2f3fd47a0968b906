//! Postgres-backed parlay repository.
//!
//! Reads and writes the `saved_parlays` table. The worker touches only these
//! columns:
//!
//! | Column | Type | Access |
//! |--------|------|--------|
//! | `id` | `text` | read |
//! | `kind` | `text` | read |
//! | `content_hash` | `text` | read |
//! | `account_reference` | `text` | read |
//! | `created_at` | `timestamptz` | read |
//! | `inscription_status` | `text` | read/write |
//! | `inscription_hash` | `text null` | write (on confirm) |
//! | `inscription_tx_id` | `text null` | write (on confirm) |
//! | `inscription_error` | `text null` | write (on fail) |
//!
//! ## Error Mapping
//!
//! | SQLx Error | RepositoryError |
//! |------------|-----------------|
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls` | `Unavailable` |
//! | `ColumnDecode`, `ColumnNotFound`, `Decode` | `InvalidRow` |
//! | anything else | `Query` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use inscriber_core::{ParlayId, ParlayRecord, truncate_error_summary};

use super::{ParlayRepository, RepositoryError};

/// Only rows still open for inscription may be written.
const OPEN_STATUS_GUARD: &str = "inscription_status IN ('none', 'queued')";

#[derive(Debug, Clone)]
pub struct PostgresParlayRepository {
    pool: Arc<PgPool>,
}

impl PostgresParlayRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::PoolClosed => {
            RepositoryError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            RepositoryError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => RepositoryError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => RepositoryError::Unavailable(format!("tls error in {}: {}", operation, e)),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            RepositoryError::InvalidRow(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::Database(db_err) => {
            RepositoryError::Query(format!("database error in {}: {}", operation, db_err.message()))
        }
        _ => RepositoryError::Query(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct SavedParlayRow {
    id: String,
    kind: String,
    content_hash: String,
    account_reference: String,
    created_at: DateTime<Utc>,
    inscription_status: String,
    inscription_hash: Option<String>,
    inscription_tx_id: Option<String>,
    inscription_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SavedParlayRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SavedParlayRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            content_hash: row.try_get("content_hash")?,
            account_reference: row.try_get("account_reference")?,
            created_at: row.try_get("created_at")?,
            inscription_status: row.try_get("inscription_status")?,
            inscription_hash: row.try_get("inscription_hash")?,
            inscription_tx_id: row.try_get("inscription_tx_id")?,
            inscription_error: row.try_get("inscription_error")?,
        })
    }
}

impl TryFrom<SavedParlayRow> for ParlayRecord {
    type Error = RepositoryError;

    fn try_from(row: SavedParlayRow) -> Result<Self, Self::Error> {
        let invalid = |e: inscriber_core::DomainError| RepositoryError::InvalidRow(e.to_string());

        Ok(ParlayRecord {
            id: ParlayId::parse(row.id).map_err(invalid)?,
            kind: row.kind.parse().map_err(invalid)?,
            content_hash: row.content_hash,
            account_reference: row.account_reference,
            created_at: row.created_at,
            inscription_status: row.inscription_status.parse().map_err(invalid)?,
            inscription_hash: row.inscription_hash,
            inscription_tx_id: row.inscription_tx_id,
            inscription_error: row.inscription_error,
        })
    }
}

#[async_trait]
impl ParlayRepository for PostgresParlayRepository {
    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn get_by_id(&self, id: &ParlayId) -> Result<Option<ParlayRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT
                id,
                kind,
                content_hash,
                account_reference,
                created_at,
                inscription_status,
                inscription_hash,
                inscription_tx_id,
                inscription_error
            FROM saved_parlays
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_id", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let parsed = SavedParlayRow::from_row(&row).map_err(|e| map_sqlx_error("get_by_id", e))?;
        parsed.try_into().map(Some)
    }

    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn mark_queued(&self, id: &ParlayId) -> Result<bool, RepositoryError> {
        let sql = format!(
            "UPDATE saved_parlays SET inscription_status = 'queued' WHERE id = $1 AND {}",
            OPEN_STATUS_GUARD
        );

        let result = sqlx::query(&sql)
            .bind(id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_queued", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn mark_confirmed(
        &self,
        id: &ParlayId,
        inscription_hash: &str,
        tx_id: &str,
    ) -> Result<bool, RepositoryError> {
        let sql = format!(
            r#"
            UPDATE saved_parlays
            SET inscription_status = 'confirmed',
                inscription_hash = $2,
                inscription_tx_id = $3,
                inscription_error = NULL
            WHERE id = $1 AND {}
            "#,
            OPEN_STATUS_GUARD
        );

        let result = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(inscription_hash)
            .bind(tx_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_confirmed", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error), fields(record_id = %id), err)]
    async fn mark_failed(&self, id: &ParlayId, error: &str) -> Result<bool, RepositoryError> {
        let sql = format!(
            r#"
            UPDATE saved_parlays
            SET inscription_status = 'failed',
                inscription_error = $2
            WHERE id = $1 AND {}
            "#,
            OPEN_STATUS_GUARD
        );

        let result = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(truncate_error_summary(error))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;

        Ok(result.rows_affected() > 0)
    }
}
