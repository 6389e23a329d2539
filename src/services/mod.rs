//! Service layer: batch classification and missing-data reconciliation.
//!
//! Services hold the domain logic and emit progress events over channels;
//! rendering is left to whoever drives them (the CLI here).

pub mod batch;
pub mod reconcile;

pub use batch::{
    BatchEvent, BatchService, DateStatus, DateSummary, RunCounters, RunSummary,
};
pub use reconcile::{MissingReport, ReconcileOutcome, ReconcileSummary};
