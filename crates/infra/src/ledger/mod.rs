//! Ledger client boundary.
//!
//! The worker treats the ledger as a black box: build a deterministic
//! [`InscriptionPayload`] from a record, submit it, and get back a
//! [`LedgerReceipt`] or an error. Every error is retryable from the
//! worker's point of view.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use inscriber_core::ParlayRecord;

pub mod http;
pub mod in_memory;

pub use http::{HttpLedgerClient, HttpLedgerConfig};
pub use in_memory::InMemoryLedger;

pub const DEFAULT_TAG_DATATYPE: &str = "parlay-proof";
pub const DEFAULT_TAG_HANDLE: &str = "parlay-inscriber";

/// Tag attached to every inscription so ledger-side indexers can find them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTag {
    pub datatype: String,
    pub handle: String,
}

impl LedgerTag {
    pub fn new(datatype: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            datatype: datatype.into(),
            handle: handle.into(),
        }
    }
}

impl Default for LedgerTag {
    fn default() -> Self {
        Self::new(DEFAULT_TAG_DATATYPE, DEFAULT_TAG_HANDLE)
    }
}

/// What gets written to the ledger for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InscriptionPayload {
    pub record_id: String,
    pub account_reference: String,
    pub content_hash: String,
    /// RFC 3339, millisecond precision, UTC (`Z` suffix).
    pub created_at: String,
    pub tag: LedgerTag,
}

impl InscriptionPayload {
    /// Same record and tag always produce the same payload.
    pub fn from_record(record: &ParlayRecord, tag: &LedgerTag) -> Self {
        Self {
            record_id: record.id.as_str().to_string(),
            account_reference: record.account_reference.clone(),
            content_hash: record.content_hash.clone(),
            created_at: record
                .created_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            tag: tag.clone(),
        }
    }
}

/// Proof of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub transaction_id: String,
    /// Ledger-side hash of the inscription, when the ledger reports one.
    pub hash: Option<String>,
}

impl LedgerReceipt {
    pub fn new(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// Result of the start-up account initialization. Both are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountSetup {
    Created,
    AlreadyInitialized,
}

/// Ledger client error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger not configured: {0}")]
    NotConfigured(String),

    #[error("ledger transport error: {0}")]
    Transport(String),

    #[error("ledger request timed out after {0:?}")]
    Timeout(Duration),

    #[error("ledger rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid ledger response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// One-time, idempotent account setup. Called once at start-up.
    async fn initialize(&self) -> Result<AccountSetup, LedgerError>;

    /// Submit one inscription.
    async fn submit(&self, payload: &InscriptionPayload) -> Result<LedgerReceipt, LedgerError>;
}

#[async_trait]
impl<T: LedgerClient + ?Sized> LedgerClient for Arc<T> {
    async fn initialize(&self) -> Result<AccountSetup, LedgerError> {
        (**self).initialize().await
    }

    async fn submit(&self, payload: &InscriptionPayload) -> Result<LedgerReceipt, LedgerError> {
        (**self).submit(payload).await
    }
}

/// Stand-in used when ledger credentials are missing.
///
/// Every call fails, so jobs go down the normal retry path and eventually
/// land in `failed` with a readable reason instead of crashing the process.
#[derive(Debug, Clone)]
pub struct UnconfiguredLedger {
    missing: String,
}

impl UnconfiguredLedger {
    /// `missing` names the absent setting(s), e.g. `"LEDGER_SIGNING_KEY"`.
    pub fn new(missing: impl Into<String>) -> Self {
        Self {
            missing: missing.into(),
        }
    }

    fn error(&self) -> LedgerError {
        LedgerError::NotConfigured(format!("missing {}", self.missing))
    }
}

#[async_trait]
impl LedgerClient for UnconfiguredLedger {
    async fn initialize(&self) -> Result<AccountSetup, LedgerError> {
        Err(self.error())
    }

    async fn submit(&self, _payload: &InscriptionPayload) -> Result<LedgerReceipt, LedgerError> {
        Err(self.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use inscriber_core::{ParlayId, ParlayKind};

    fn record() -> ParlayRecord {
        ParlayRecord::new(
            ParlayId::parse("p-42").unwrap(),
            ParlayKind::UserAssembled,
            "c0ffee".repeat(10),
            "acct_9",
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap(),
        )
    }

    #[test]
    fn payload_is_deterministic() {
        let tag = LedgerTag::default();
        let a = InscriptionPayload::from_record(&record(), &tag);
        let b = InscriptionPayload::from_record(&record(), &tag);
        assert_eq!(a, b);
        assert_eq!(a.created_at, "2024-03-01T12:30:05.000Z");
    }

    #[test]
    fn payload_serializes_with_camel_case_fields() {
        let payload = InscriptionPayload::from_record(&record(), &LedgerTag::default());
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["recordId"], "p-42");
        assert_eq!(json["accountReference"], "acct_9");
        assert_eq!(json["contentHash"], "c0ffee".repeat(10));
        assert_eq!(json["tag"]["datatype"], DEFAULT_TAG_DATATYPE);
        assert_eq!(json["tag"]["handle"], DEFAULT_TAG_HANDLE);
    }

    #[tokio::test]
    async fn unconfigured_ledger_always_fails() {
        let ledger = UnconfiguredLedger::new("LEDGER_RPC_URL");
        let payload = InscriptionPayload::from_record(&record(), &LedgerTag::default());

        let err = ledger.submit(&payload).await.unwrap_err();
        assert_eq!(err.to_string(), "ledger not configured: missing LEDGER_RPC_URL");
        assert!(ledger.initialize().await.is_err());
    }
}
