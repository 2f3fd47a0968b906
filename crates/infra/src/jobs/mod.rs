//! Inscription job pipeline.
//!
//! ## Components
//!
//! - `JobMessage`: validated queue payload (wire format + defaulting rules)
//! - `DelayedPromoter`: moves due retries from the delayed set to the ready list
//! - `InscriptionProcessor`: runs one job against the record store and the ledger
//! - `InscriptionWorker`: the single-consumer loop, with a `WorkerHandle` for shutdown

pub mod message;
pub mod processor;
pub mod promoter;
pub mod worker;

pub use message::{CURRENT_MESSAGE_VERSION, JobMessage, MessageError};
pub use processor::{
    DEFAULT_SUBMIT_TIMEOUT, DiscardReason, InscriptionProcessor, ProcessError, ProcessOutcome,
    ProcessorConfig,
};
pub use promoter::{DEFAULT_PROMOTE_BATCH, DelayedPromoter};
pub use worker::{InscriptionWorker, InscriptionWorkerConfig, LoopStep, WorkerHandle, WorkerStats};
