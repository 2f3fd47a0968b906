//! Infrastructure layer: queue substrate, record store, ledger client, and the
//! inscription worker built on top of them.

pub mod jobs;
pub mod ledger;
pub mod queue;
pub mod records;
