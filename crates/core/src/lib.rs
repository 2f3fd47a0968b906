//! `inscriber-core`: domain building blocks for parlay inscription.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! record identity and status, the retry/backoff curve, and error-summary
//! shaping. Everything that touches Redis, Postgres or the ledger lives in
//! `inscriber-infra`.

pub mod backoff;
pub mod error;
pub mod id;
pub mod record;

pub use backoff::{MAX_BACKOFF, MAX_BACKOFF_EXPONENT, RetryPolicy, compute_backoff};
pub use error::{DomainError, DomainResult};
pub use id::ParlayId;
pub use record::{
    InscriptionStatus, MAX_ERROR_SUMMARY_CHARS, ParlayKind, ParlayRecord, sanitize_error_summary,
    truncate_error_summary,
};
