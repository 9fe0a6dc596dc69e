//! Courier - incremental Gmail and Google Calendar sync engine
//!
//! Converges local threads, messages and calendar events with the
//! provider using change-feed cursors (Gmail `historyId`, Calendar
//! `syncToken`). Push deliveries only trigger runs; every run fetches by
//! cursor, applies changes idempotently and advances the cursor last.

pub mod config;
pub mod dispatch;
pub mod effects;
pub mod error;
pub mod fetch;
pub mod google;
pub mod models;
pub mod service;
pub mod storage;
pub mod sync;
pub mod watch;
pub mod webhook;

pub use config::{GoogleCredentials, SyncSettings};
pub use dispatch::{DispatchDecision, DropReason, NotificationDispatcher, RunTicket};
pub use effects::{
    Aggregate, AggregateObserver, Classifier, EffectsReport, NotificationKind, Notifier,
    PostSyncEffects, UserNotification,
};
pub use error::{AuthExpiredError, CursorExpiredError, ReconcileError, SyncError};
pub use fetch::{ChangeFetcher, SnapshotWindow};
pub use models::{
    Account, AggregateId, ChangeBatch, ChangeRecord, ItemKey, PushEvent, StreamKey, StreamKind,
    SyncCursor, SyncItem, UserCredentials, UserId,
};
pub use service::{PushOutcome, RenewalSummary, SyncService};
pub use storage::{InMemoryStore, SqliteStore, SyncStore};
pub use sync::{
    ReconcileOutcome, ReconcileStats, Reconciler, SyncMode, SyncOrchestrator, SyncPhase,
    SyncReport,
};
