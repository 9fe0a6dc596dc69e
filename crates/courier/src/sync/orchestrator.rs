//! Sync run state machine
//!
//! ```text
//! Idle → Deciding → FullSync | IncrementalSync → Reconciling
//!      → CursorPersisted → EffectsDispatched → Idle
//! ```
//!
//! Any step may end in `Error`. The cursor is written only after the
//! whole batch is applied, so a failed run can be retried from the start.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, warn};

use super::reconcile::{ReconcileStats, Reconciler};
use super::timing::deadline_exceeded;
use crate::effects::{AggregateObserver, EffectsReport};
use crate::error::{CursorExpiredError, ReconcileError, SyncError};
use crate::fetch::{ChangeFetcher, SnapshotWindow};
use crate::models::{AggregateId, ChangeBatch, StreamKey, compare_history_ids};
use crate::storage::{CursorStore, EntityStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Idle,
    Deciding,
    FullSync,
    IncrementalSync,
    Reconciling,
    CursorPersisted,
    EffectsDispatched,
    Error,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Deciding => "deciding",
            SyncPhase::FullSync => "full_sync",
            SyncPhase::IncrementalSync => "incremental_sync",
            SyncPhase::Reconciling => "reconciling",
            SyncPhase::CursorPersisted => "cursor_persisted",
            SyncPhase::EffectsDispatched => "effects_dispatched",
            SyncPhase::Error => "error",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run obtained its batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// From the stored cursor
    Incremental,
    /// No cursor stored yet
    Full,
    /// The stored cursor had expired
    FullAfterExpiry,
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub stream: StreamKey,
    pub mode: SyncMode,
    /// Every phase entered, in order
    pub phases: Vec<SyncPhase>,
    pub records: usize,
    pub stats: ReconcileStats,
    pub affected: BTreeSet<AggregateId>,
    pub previous_cursor: Option<String>,
    pub cursor: String,
    /// False when a concurrent run had already stored a newer cursor
    pub cursor_advanced: bool,
    pub effects: Option<EffectsReport>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn final_phase(&self) -> SyncPhase {
        self.phases.last().copied().unwrap_or(SyncPhase::Idle)
    }
}

/// Records and logs phase transitions for one run
struct Transitions<'k> {
    stream: &'k StreamKey,
    phases: Vec<SyncPhase>,
}

impl<'k> Transitions<'k> {
    fn new(stream: &'k StreamKey) -> Self {
        Self {
            stream,
            phases: vec![SyncPhase::Idle],
        }
    }

    fn current(&self) -> SyncPhase {
        self.phases.last().copied().unwrap_or(SyncPhase::Idle)
    }

    fn enter(&mut self, phase: SyncPhase) {
        debug!("{}: {} -> {}", self.stream, self.current(), phase);
        self.phases.push(phase);
    }

    fn fail(&mut self, err: SyncError) -> SyncError {
        warn!("{}: sync failed in {}: {:#}", self.stream, self.current(), err);
        self.enter(SyncPhase::Error);
        err
    }
}

/// Drives one sync run per call.
///
/// Callers serialize runs per stream (see
/// [`NotificationDispatcher`](crate::dispatch::NotificationDispatcher));
/// a racing second run is still safe because every record is idempotent
/// and the cursor never moves backward.
pub struct SyncOrchestrator<'a, S: CursorStore + EntityStore + ?Sized> {
    store: &'a S,
    observer: Option<&'a dyn AggregateObserver>,
    window: SnapshotWindow,
    max_run: Option<Duration>,
}

impl<'a, S: CursorStore + EntityStore + ?Sized> SyncOrchestrator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            observer: None,
            window: SnapshotWindow::default(),
            max_run: None,
        }
    }

    /// Receives the affected aggregates after each successful run
    pub fn with_observer(mut self, observer: &'a dyn AggregateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_window(mut self, window: SnapshotWindow) -> Self {
        self.window = window;
        self
    }

    /// Abort the run before the cursor write once this much time has passed
    pub fn with_max_run(mut self, max_run: Duration) -> Self {
        self.max_run = Some(max_run);
        self
    }

    pub fn run(&self, stream: &StreamKey, fetcher: &dyn ChangeFetcher) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let mut trace = Transitions::new(stream);

        trace.enter(SyncPhase::Deciding);
        let previous = match self.store.get_cursor(stream) {
            Ok(cursor) => cursor.and_then(|c| c.token),
            Err(e) => {
                return Err(trace.fail(SyncError::Storage {
                    phase: SyncPhase::Deciding,
                    source: e,
                }));
            }
        };

        let (mode, batch) = match previous.as_deref() {
            None => {
                trace.enter(SyncPhase::FullSync);
                (SyncMode::Full, self.full_snapshot(fetcher, &mut trace)?)
            }
            Some(cursor) => {
                trace.enter(SyncPhase::IncrementalSync);
                match fetcher.fetch_incremental(cursor) {
                    Ok(batch) => (SyncMode::Incremental, batch),
                    Err(e) if is_cursor_expired(&e) => {
                        info!("{}: cursor {} expired, falling back to full sync", stream, cursor);
                        trace.enter(SyncPhase::FullSync);
                        (SyncMode::FullAfterExpiry, self.full_snapshot(fetcher, &mut trace)?)
                    }
                    Err(e) => {
                        return Err(trace.fail(fetch_error(SyncPhase::IncrementalSync, e)));
                    }
                }
            }
        };
        self.check_deadline(started, &mut trace)?;

        trace.enter(SyncPhase::Reconciling);
        let outcome = match Reconciler::new(self.store).apply(stream, &batch.records) {
            Ok(outcome) => outcome,
            Err(e) => return Err(trace.fail(reconcile_error(e))),
        };
        self.check_deadline(started, &mut trace)?;

        let cursor_advanced = match self.persist_cursor(stream, &batch) {
            Ok(advanced) => advanced,
            Err(e) => {
                return Err(trace.fail(SyncError::Storage {
                    phase: SyncPhase::CursorPersisted,
                    source: e,
                }));
            }
        };
        trace.enter(SyncPhase::CursorPersisted);

        // Failures past this point never undo the cursor write
        let effects = match self.observer {
            Some(observer) if !outcome.affected.is_empty() => {
                Some(observer.on_aggregates_changed(&stream.user_id, &outcome.affected))
            }
            _ => None,
        };
        trace.enter(SyncPhase::EffectsDispatched);
        trace.enter(SyncPhase::Idle);

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Synced {} ({:?}): {} records, {} aggregates, cursor {} -> {} in {}ms",
            stream,
            mode,
            batch.records.len(),
            outcome.affected.len(),
            previous.as_deref().unwrap_or("none"),
            batch.next_cursor,
            duration_ms
        );

        Ok(SyncReport {
            stream: stream.clone(),
            mode,
            phases: trace.phases,
            records: batch.records.len(),
            stats: outcome.stats,
            affected: outcome.affected,
            previous_cursor: previous,
            cursor: batch.next_cursor,
            cursor_advanced,
            effects,
            duration_ms,
        })
    }

    fn full_snapshot(
        &self,
        fetcher: &dyn ChangeFetcher,
        trace: &mut Transitions<'_>,
    ) -> Result<ChangeBatch, SyncError> {
        fetcher
            .fetch_full_snapshot(&self.window)
            .map_err(|e| trace.fail(fetch_error(SyncPhase::FullSync, e)))
    }

    fn check_deadline(&self, started: Instant, trace: &mut Transitions<'_>) -> Result<(), SyncError> {
        if deadline_exceeded(started, self.max_run) {
            let phase = trace.current();
            return Err(trace.fail(SyncError::Timeout { phase }));
        }
        Ok(())
    }

    /// Store the batch's cursor unless a newer one is already there.
    ///
    /// Re-reads the cursor instead of trusting the value seen at the
    /// start: a racing run may have moved it since.
    fn persist_cursor(&self, stream: &StreamKey, batch: &ChangeBatch) -> Result<bool> {
        let next = batch.next_cursor.trim();
        if next.is_empty() {
            warn!("{}: fetch returned an empty cursor, keeping the stored one", stream);
            return Ok(false);
        }

        if stream.kind.has_ordered_cursors() {
            let current = self.store.get_cursor(stream)?.and_then(|c| c.token);
            if let Some(current) = current
                && compare_history_ids(next, &current).is_lt()
            {
                debug!("{}: stored cursor {} is newer than {}, not rewinding", stream, current, next);
                return Ok(false);
            }
        }

        self.store.set_cursor(stream, next)?;
        Ok(true)
    }
}

fn is_cursor_expired(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<CursorExpiredError>())
}

fn is_malformed(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<ReconcileError>())
}

/// Fetch failures: malformed payloads are reconciliation errors, the rest
/// are classified as provider errors
fn fetch_error(phase: SyncPhase, err: anyhow::Error) -> SyncError {
    if is_malformed(&err) {
        return SyncError::Reconciliation { source: err };
    }
    SyncError::from_provider(phase, err)
}

fn reconcile_error(err: anyhow::Error) -> SyncError {
    if is_malformed(&err) {
        SyncError::Reconciliation { source: err }
    } else {
        SyncError::Storage {
            phase: SyncPhase::Reconciling,
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthExpiredError;
    use crate::models::{
        ChangeRecord, EmailAddress, Message, MessageId, SyncItem, ThreadId, UserId, labels,
    };
    use crate::storage::InMemoryStore;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Replays queued results; the full snapshot is fixed
    struct ScriptedFetcher {
        incremental: RefCell<VecDeque<Result<ChangeBatch>>>,
        snapshot: ChangeBatch,
    }

    impl ScriptedFetcher {
        fn new(snapshot: ChangeBatch) -> Self {
            Self {
                incremental: RefCell::new(VecDeque::new()),
                snapshot,
            }
        }

        fn then(self, result: Result<ChangeBatch>) -> Self {
            self.incremental.borrow_mut().push_back(result);
            self
        }
    }

    impl ChangeFetcher for ScriptedFetcher {
        fn fetch_incremental(&self, _cursor: &str) -> Result<ChangeBatch> {
            self.incremental
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| anyhow::bail!("no scripted batch"))
        }

        fn fetch_full_snapshot(&self, _window: &SnapshotWindow) -> Result<ChangeBatch> {
            Ok(self.snapshot.clone())
        }
    }

    struct CountingObserver {
        calls: RefCell<usize>,
    }

    impl AggregateObserver for CountingObserver {
        fn on_aggregates_changed(&self, _user: &UserId, ids: &BTreeSet<AggregateId>) -> EffectsReport {
            *self.calls.borrow_mut() += 1;
            EffectsReport {
                classified: ids.len(),
                ..Default::default()
            }
        }
    }

    fn stream() -> StreamKey {
        StreamKey::email("u1", "me@example.com")
    }

    fn added(id: &str) -> ChangeRecord {
        ChangeRecord::Added(SyncItem::Message(
            Message::builder(MessageId::new(id), ThreadId::new(format!("t-{}", id)))
                .from(EmailAddress::new("a@example.com"))
                .subject("hello")
                .label_ids(vec![labels::INBOX.to_string()])
                .build(),
        ))
    }

    fn cursor(store: &InMemoryStore) -> Option<String> {
        store.get_cursor(&stream()).unwrap().and_then(|c| c.token)
    }

    #[test]
    fn test_first_run_takes_full_path() {
        let store = InMemoryStore::new();
        let fetcher = ScriptedFetcher::new(ChangeBatch::new(vec![added("m1")], "50"));

        let report = SyncOrchestrator::new(&store).run(&stream(), &fetcher).unwrap();

        assert_eq!(report.mode, SyncMode::Full);
        assert_eq!(
            report.phases,
            vec![
                SyncPhase::Idle,
                SyncPhase::Deciding,
                SyncPhase::FullSync,
                SyncPhase::Reconciling,
                SyncPhase::CursorPersisted,
                SyncPhase::EffectsDispatched,
                SyncPhase::Idle,
            ]
        );
        assert_eq!(cursor(&store).as_deref(), Some("50"));
    }

    #[test]
    fn test_provider_error_leaves_cursor() {
        let store = InMemoryStore::new();
        store.set_cursor(&stream(), "100").unwrap();
        let fetcher = ScriptedFetcher::new(ChangeBatch::new(vec![], "0"))
            .then(Err(anyhow::anyhow!("503 Service Unavailable")));

        let err = SyncOrchestrator::new(&store).run(&stream(), &fetcher).unwrap_err();

        assert!(matches!(
            err,
            SyncError::Transient {
                phase: SyncPhase::IncrementalSync,
                ..
            }
        ));
        assert_eq!(cursor(&store).as_deref(), Some("100"));
    }

    #[test]
    fn test_auth_expired_is_terminal() {
        let store = InMemoryStore::new();
        store.set_cursor(&stream(), "100").unwrap();
        let fetcher = ScriptedFetcher::new(ChangeBatch::new(vec![], "0")).then(Err(
            AuthExpiredError {
                user_id: "u1".into(),
            }
            .into(),
        ));

        let err = SyncOrchestrator::new(&store).run(&stream(), &fetcher).unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired { .. }));
    }

    #[test]
    fn test_malformed_batch_does_not_advance() {
        let store = InMemoryStore::new();
        store.set_cursor(&stream(), "100").unwrap();
        let broken = ChangeRecord::Added(SyncItem::Message(
            Message::builder(MessageId::new("m2"), ThreadId::new("")).build(),
        ));
        let fetcher = ScriptedFetcher::new(ChangeBatch::new(vec![], "0"))
            .then(Ok(ChangeBatch::new(vec![added("m1"), broken], "101")));

        let err = SyncOrchestrator::new(&store).run(&stream(), &fetcher).unwrap_err();

        assert!(matches!(err, SyncError::Reconciliation { .. }));
        assert_eq!(cursor(&store).as_deref(), Some("100"));
    }

    #[test]
    fn test_timeout_before_cursor_write() {
        let store = InMemoryStore::new();
        let fetcher = ScriptedFetcher::new(ChangeBatch::new(vec![added("m1")], "50"));

        let err = SyncOrchestrator::new(&store)
            .with_max_run(Duration::ZERO)
            .run(&stream(), &fetcher)
            .unwrap_err();

        assert!(matches!(err, SyncError::Timeout { .. }));
        assert_eq!(cursor(&store), None);
    }

    #[test]
    fn test_cursor_never_rewinds() {
        let store = InMemoryStore::new();
        store.set_cursor(&stream(), "100").unwrap();
        // A provider answering with an older head
        let fetcher = ScriptedFetcher::new(ChangeBatch::new(vec![], "0"))
            .then(Ok(ChangeBatch::new(vec![added("m1")], "99")));

        let report = SyncOrchestrator::new(&store).run(&stream(), &fetcher).unwrap();

        assert!(!report.cursor_advanced);
        assert_eq!(cursor(&store).as_deref(), Some("100"));
    }

    #[test]
    fn test_observer_sees_affected_aggregates() {
        let store = InMemoryStore::new();
        let observer = CountingObserver {
            calls: RefCell::new(0),
        };
        let fetcher = ScriptedFetcher::new(ChangeBatch::new(vec![added("m1"), added("m2")], "7"));

        let report = SyncOrchestrator::new(&store)
            .with_observer(&observer)
            .run(&stream(), &fetcher)
            .unwrap();

        assert_eq!(*observer.calls.borrow(), 1);
        assert_eq!(report.effects.map(|e| e.classified), Some(2));
    }

    #[test]
    fn test_empty_batch_skips_effects() {
        let store = InMemoryStore::new();
        store.set_cursor(&stream(), "100").unwrap();
        let observer = CountingObserver {
            calls: RefCell::new(0),
        };
        let fetcher = ScriptedFetcher::new(ChangeBatch::new(vec![], "0"))
            .then(Ok(ChangeBatch::new(vec![], "100")));

        let report = SyncOrchestrator::new(&store)
            .with_observer(&observer)
            .run(&stream(), &fetcher)
            .unwrap();

        assert_eq!(report.final_phase(), SyncPhase::Idle);
        assert_eq!(*observer.calls.borrow(), 0);
    }
}
