//! Import orchestration: the resumable club import, the single worker that
//! drives it, and the background triggers that keep imported data fresh.

mod config;
mod flush;
mod import;
pub mod ops;
mod service;
mod triggers;
mod worker;

#[cfg(test)]
mod testing;

pub use config::SyncConfig;
pub use import::{ImportError, ImportRunner, StepOutcome};
pub use service::Supervisor;
pub use triggers::{AutoImportReport, AutoImportScheduler, RefreshOutcome, StaleEventRefresher};
pub use worker::{classify, AttemptOutcome, Disposition, ImportWorker, TickReport};

pub const CRATE_NAME: &str = "clubsync-sync";
