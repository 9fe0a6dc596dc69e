//! Sync engine: reconciliation and the per-stream run state machine
//!
//! Every operation here is idempotent and safe to retry.

mod orchestrator;
mod reconcile;
pub mod timing;

pub use orchestrator::{SyncMode, SyncOrchestrator, SyncPhase, SyncReport};
pub use reconcile::{ReconcileOutcome, ReconcileStats, Reconciler};
