//! Saved parlay records as seen by the inscription worker.
//!
//! The record store owns these rows; the worker only reads the immutable
//! fields and moves `inscription_status` forward.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::ParlayId;

/// Longest error summary persisted on a failed record.
pub const MAX_ERROR_SUMMARY_CHARS: usize = 500;

/// Category of a saved parlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParlayKind {
    /// Assembled leg by leg by a user. The only kind that gets inscribed.
    UserAssembled,
    /// Picked from an editorial/curated slate.
    Curated,
    /// Produced by a recommendation model.
    Generated,
}

impl ParlayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParlayKind::UserAssembled => "user_assembled",
            ParlayKind::Curated => "curated",
            ParlayKind::Generated => "generated",
        }
    }

    pub fn is_inscribable(&self) -> bool {
        matches!(self, ParlayKind::UserAssembled)
    }
}

impl FromStr for ParlayKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_assembled" => Ok(ParlayKind::UserAssembled),
            "curated" => Ok(ParlayKind::Curated),
            "generated" => Ok(ParlayKind::Generated),
            other => Err(DomainError::unknown_variant("parlay kind", other)),
        }
    }
}

/// Inscription lifecycle of a record.
///
/// `none -> queued -> (confirmed | failed)`. Retries stay in `queued`;
/// `confirmed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InscriptionStatus {
    None,
    Queued,
    Confirmed,
    Failed,
}

impl InscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InscriptionStatus::None => "none",
            InscriptionStatus::Queued => "queued",
            InscriptionStatus::Confirmed => "confirmed",
            InscriptionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InscriptionStatus::Confirmed | InscriptionStatus::Failed)
    }
}

impl core::fmt::Display for InscriptionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InscriptionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(InscriptionStatus::None),
            "queued" => Ok(InscriptionStatus::Queued),
            "confirmed" => Ok(InscriptionStatus::Confirmed),
            "failed" => Ok(InscriptionStatus::Failed),
            other => Err(DomainError::unknown_variant("inscription status", other)),
        }
    }
}

/// A saved parlay and its inscription fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParlayRecord {
    pub id: ParlayId,
    pub kind: ParlayKind,
    /// Fixed-length content fingerprint (hex), immutable once set.
    pub content_hash: String,
    /// External account the parlay belongs to.
    pub account_reference: String,
    pub created_at: DateTime<Utc>,
    pub inscription_status: InscriptionStatus,
    pub inscription_hash: Option<String>,
    pub inscription_tx_id: Option<String>,
    pub inscription_error: Option<String>,
}

impl ParlayRecord {
    /// A fresh, never-inscribed record.
    pub fn new(
        id: ParlayId,
        kind: ParlayKind,
        content_hash: impl Into<String>,
        account_reference: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            content_hash: content_hash.into(),
            account_reference: account_reference.into(),
            created_at,
            inscription_status: InscriptionStatus::None,
            inscription_hash: None,
            inscription_tx_id: None,
            inscription_error: None,
        }
    }

    pub fn with_status(mut self, status: InscriptionStatus) -> Self {
        self.inscription_status = status;
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.inscription_status == InscriptionStatus::Confirmed
    }
}

/// Cut `message` to at most [`MAX_ERROR_SUMMARY_CHARS`] characters.
///
/// Counts chars, not bytes, so multi-byte text is never split mid-codepoint.
pub fn truncate_error_summary(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_SUMMARY_CHARS) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

/// Flatten an error chain into a single bounded line fit for persistence.
///
/// Control characters (newlines, tabs, ...) become spaces, runs of
/// whitespace collapse to one, and the result is truncated.
pub fn sanitize_error_summary(raw: &str) -> String {
    let flattened = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>();
    let collapsed = flattened.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.is_empty() {
        return "unknown error".to_string();
    }

    truncate_error_summary(&collapsed)
}
