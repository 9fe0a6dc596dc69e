//! Integration tests for the courier crate
//!
//! These drive the orchestrator end to end against scripted fetchers, the
//! in-memory store and SQLite.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use courier::dispatch::{DispatchDecision, DropReason, NotificationDispatcher};
use courier::effects::{Aggregate, AggregateObserver, Classifier, Notifier, PostSyncEffects};
use courier::models::{
    Account, AggregateId, CalendarEvent, CalendarSeries, ChangeBatch, ChangeRecord, EmailAddress,
    EventId, EventStatus, ItemKey, Message, MessageId, Priority, PushEvent, SeriesId, StreamKey,
    SyncCursor, SyncItem, Thread, ThreadId, UserId, labels,
};
use courier::storage::{AccountStore, CursorStore, EntityStore, InMemoryStore, SqliteStore};
use courier::{
    ChangeFetcher, CursorExpiredError, Reconciler, SnapshotWindow, SyncError, SyncMode,
    SyncOrchestrator, SyncPhase, UserNotification,
};
use tempfile::TempDir;

// === Fixtures ===

fn mailbox() -> StreamKey {
    StreamKey::email("u1", "me@example.com")
}

fn user() -> UserId {
    UserId::new("u1")
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

fn make_message(id: &str, thread_id: &str, minutes: i64, unread: bool) -> Message {
    let mut label_ids = vec![labels::INBOX.to_string()];
    if unread {
        label_ids.push(labels::UNREAD.to_string());
    }
    Message::builder(MessageId::new(id), ThreadId::new(thread_id))
        .from(EmailAddress::with_name("Test User", "test@example.com"))
        .to(vec![EmailAddress::new("me@example.com")])
        .subject(format!("Thread {}", thread_id))
        .body_preview(format!("This is the preview for message {}", id))
        .received_at(base_time() + Duration::minutes(minutes))
        .label_ids(label_ids)
        .build()
}

fn added(message: Message) -> ChangeRecord {
    ChangeRecord::Added(SyncItem::Message(message))
}

fn removed(id: &str) -> ChangeRecord {
    ChangeRecord::Removed(ItemKey::Message(MessageId::new(id)))
}

fn make_event(id: &str, series: &str, updated_minutes: i64) -> CalendarEvent {
    CalendarEvent {
        id: EventId::new(id),
        series_id: SeriesId::new(series),
        summary: format!("Event {}", id),
        start_at: Some(base_time() + Duration::days(30)),
        end_at: Some(base_time() + Duration::days(30) + Duration::hours(1)),
        all_day: false,
        organizer_email: Some("organizer@example.com".into()),
        status: EventStatus::Confirmed,
        updated_at: base_time() + Duration::minutes(updated_minutes),
    }
}

fn stored_cursor(store: &dyn CursorStore, stream: &StreamKey) -> Option<String> {
    store.get_cursor(stream).unwrap().and_then(|c| c.token)
}

/// Scripted provider: incremental answers keyed by cursor, fixed snapshot
#[derive(Clone)]
enum Answer {
    Batch(ChangeBatch),
    Expired,
    Unavailable,
}

struct FakeFetcher {
    incremental: HashMap<String, Answer>,
    snapshot: ChangeBatch,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    fn new(snapshot: ChangeBatch) -> Self {
        Self {
            incremental: HashMap::new(),
            snapshot,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn on(mut self, cursor: &str, answer: Answer) -> Self {
        self.incremental.insert(cursor.to_string(), answer);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ChangeFetcher for FakeFetcher {
    fn fetch_incremental(&self, cursor: &str) -> Result<ChangeBatch> {
        self.calls.lock().unwrap().push(format!("incremental:{}", cursor));
        match self.incremental.get(cursor) {
            Some(Answer::Batch(batch)) => Ok(batch.clone()),
            Some(Answer::Expired) => Err(CursorExpiredError.into()),
            Some(Answer::Unavailable) | None => anyhow::bail!("503 Service Unavailable"),
        }
    }

    fn fetch_full_snapshot(&self, window: &SnapshotWindow) -> Result<ChangeBatch> {
        self.calls.lock().unwrap().push(format!("full:{}d", window.days));
        Ok(self.snapshot.clone())
    }
}

fn empty_snapshot() -> ChangeBatch {
    ChangeBatch::new(vec![], "1")
}

/// Store wrapper that fails the n-th message insert once, and optionally
/// every thread read after the first few
struct FlakyStore {
    inner: InMemoryStore,
    fail_on: usize,
    inserts: AtomicUsize,
    thread_reads_allowed: Option<usize>,
    thread_reads: AtomicUsize,
}

impl FlakyStore {
    fn failing_on(fail_on: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_on,
            inserts: AtomicUsize::new(0),
            thread_reads_allowed: None,
            thread_reads: AtomicUsize::new(0),
        }
    }

    fn failing_thread_reads_after(allowed: usize) -> Self {
        Self {
            thread_reads_allowed: Some(allowed),
            ..Self::failing_on(0)
        }
    }
}

impl CursorStore for FlakyStore {
    fn get_cursor(&self, key: &StreamKey) -> Result<Option<SyncCursor>> {
        self.inner.get_cursor(key)
    }

    fn set_cursor(&self, key: &StreamKey, token: &str) -> Result<()> {
        self.inner.set_cursor(key, token)
    }
}

impl EntityStore for FlakyStore {
    fn get_thread(&self, user: &UserId, id: &ThreadId) -> Result<Option<Thread>> {
        let n = self.thread_reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.thread_reads_allowed.is_some_and(|allowed| n > allowed) {
            anyhow::bail!("database is locked");
        }
        self.inner.get_thread(user, id)
    }

    fn upsert_thread(&self, user: &UserId, thread: Thread) -> Result<()> {
        self.inner.upsert_thread(user, thread)
    }

    fn delete_thread(&self, user: &UserId, id: &ThreadId) -> Result<()> {
        self.inner.delete_thread(user, id)
    }

    fn get_message(&self, user: &UserId, id: &MessageId) -> Result<Option<Message>> {
        self.inner.get_message(user, id)
    }

    fn has_message(&self, user: &UserId, id: &MessageId) -> Result<bool> {
        self.inner.has_message(user, id)
    }

    fn insert_message(&self, user: &UserId, message: Message) -> Result<()> {
        let n = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            anyhow::bail!("disk I/O error");
        }
        self.inner.insert_message(user, message)
    }

    fn update_message_labels(&self, user: &UserId, id: &MessageId, label_ids: Vec<String>) -> Result<()> {
        self.inner.update_message_labels(user, id, label_ids)
    }

    fn delete_message(&self, user: &UserId, id: &MessageId) -> Result<()> {
        self.inner.delete_message(user, id)
    }

    fn list_messages_for_thread(&self, user: &UserId, thread_id: &ThreadId) -> Result<Vec<Message>> {
        self.inner.list_messages_for_thread(user, thread_id)
    }

    fn count_messages(&self, user: &UserId) -> Result<usize> {
        self.inner.count_messages(user)
    }

    fn count_threads(&self, user: &UserId) -> Result<usize> {
        self.inner.count_threads(user)
    }

    fn get_series(&self, user: &UserId, id: &SeriesId) -> Result<Option<CalendarSeries>> {
        self.inner.get_series(user, id)
    }

    fn upsert_series(&self, user: &UserId, series: CalendarSeries) -> Result<()> {
        self.inner.upsert_series(user, series)
    }

    fn get_event(&self, user: &UserId, id: &EventId) -> Result<Option<CalendarEvent>> {
        self.inner.get_event(user, id)
    }

    fn upsert_event(&self, user: &UserId, event: CalendarEvent) -> Result<()> {
        self.inner.upsert_event(user, event)
    }

    fn list_events_for_series(&self, user: &UserId, series_id: &SeriesId) -> Result<Vec<CalendarEvent>> {
        self.inner.list_events_for_series(user, series_id)
    }

    fn count_events(&self, user: &UserId) -> Result<usize> {
        self.inner.count_events(user)
    }

    fn set_priority(&self, user: &UserId, id: &AggregateId, priority: Priority) -> Result<bool> {
        self.inner.set_priority(user, id, priority)
    }
}

/// Thread and message state for the given ids, for whole-state comparison
fn mail_state(
    store: &dyn EntityStore,
    threads: &[&str],
    messages: &[&str],
) -> (Vec<Option<Thread>>, Vec<Option<Message>>) {
    let threads = threads
        .iter()
        .map(|id| store.get_thread(&user(), &ThreadId::new(*id)).unwrap())
        .collect();
    let messages = messages
        .iter()
        .map(|id| store.get_message(&user(), &MessageId::new(*id)).unwrap())
        .collect();
    (threads, messages)
}

fn mixed_batch() -> Vec<ChangeRecord> {
    let unread = make_message("m2", "t1", 20, true);
    let mut read = unread.clone();
    read.label_ids.retain(|l| l != labels::UNREAD);
    vec![
        added(make_message("m1", "t1", 10, false)),
        added(unread),
        added(make_message("m3", "t2", 30, true)),
        ChangeRecord::Updated(SyncItem::Message(read)),
        added(make_message("m4", "t3", 40, false)),
        removed("m4"),
        removed("never-existed"),
    ]
}

// === Properties ===

#[test]
fn test_apply_is_idempotent() {
    let once = InMemoryStore::new();
    let twice = InMemoryStore::new();
    let batch = mixed_batch();

    Reconciler::new(&once).apply(&mailbox(), &batch).unwrap();
    Reconciler::new(&twice).apply(&mailbox(), &batch).unwrap();
    Reconciler::new(&twice).apply(&mailbox(), &batch).unwrap();

    let ids_t = ["t1", "t2", "t3"];
    let ids_m = ["m1", "m2", "m3", "m4"];
    assert_eq!(mail_state(&once, &ids_t, &ids_m), mail_state(&twice, &ids_t, &ids_m));
    assert_eq!(twice.count_messages(&user()).unwrap(), 3);
    assert_eq!(twice.count_threads(&user()).unwrap(), 2);
}

#[test]
fn test_calendar_apply_is_idempotent() {
    let calendar = StreamKey::calendar("u1", "primary");
    let store = InMemoryStore::new();
    let batch = vec![
        ChangeRecord::Added(SyncItem::Event(make_event("s1", "s1", 0))),
        ChangeRecord::Added(SyncItem::Event(make_event("s1_20260401", "s1", 5))),
        ChangeRecord::Updated(SyncItem::Event(make_event("s1_20260401", "s1", 10))),
        ChangeRecord::Removed(ItemKey::Event(EventId::new("s1"))),
    ];

    Reconciler::new(&store).apply(&calendar, &batch).unwrap();
    let series = store.get_series(&user(), &SeriesId::new("s1")).unwrap();
    let replay = Reconciler::new(&store).apply(&calendar, &batch).unwrap();

    assert_eq!(store.get_series(&user(), &SeriesId::new("s1")).unwrap(), series);
    assert_eq!(replay.stats.unchanged, batch.len());
    assert_eq!(store.count_events(&user()).unwrap(), 2);
    assert_eq!(series.map(|s| s.instance_count), Some(1));
}

#[test]
fn test_cursor_is_monotonic_under_out_of_order_results() {
    let store = InMemoryStore::new();
    store.set_cursor(&mailbox(), "100").unwrap();
    let fetcher = FakeFetcher::new(empty_snapshot())
        .on("100", Answer::Batch(ChangeBatch::new(vec![], "103")))
        .on("103", Answer::Batch(ChangeBatch::new(vec![], "101")));
    let orchestrator = SyncOrchestrator::new(&store);

    orchestrator.run(&mailbox(), &fetcher).unwrap();
    assert_eq!(stored_cursor(&store, &mailbox()).as_deref(), Some("103"));

    let report = orchestrator.run(&mailbox(), &fetcher).unwrap();
    assert!(!report.cursor_advanced);
    assert_eq!(stored_cursor(&store, &mailbox()).as_deref(), Some("103"));
}

#[test]
fn test_cursor_compares_history_ids_by_magnitude() {
    let store = InMemoryStore::new();
    store.set_cursor(&mailbox(), "999").unwrap();
    let fetcher = FakeFetcher::new(empty_snapshot())
        .on("999", Answer::Batch(ChangeBatch::new(vec![], "1000")));

    SyncOrchestrator::new(&store).run(&mailbox(), &fetcher).unwrap();

    // Lexically "1000" < "999"; numerically it is newer
    assert_eq!(stored_cursor(&store, &mailbox()).as_deref(), Some("1000"));
}

#[test]
fn test_read_error_while_collecting_affected_fails_the_apply() {
    // Adding to a new thread reads it twice; the third read checks survival
    let store = FlakyStore::failing_thread_reads_after(2);
    let err = Reconciler::new(&store)
        .apply(&mailbox(), &[added(make_message("m1", "t1", 1, true))])
        .unwrap_err();
    assert!(format!("{:#}", err).contains("database is locked"), "{:#}", err);
}

#[test]
fn test_partial_failure_then_rerun_converges() {
    let batch = ChangeBatch::new(
        vec![
            added(make_message("m1", "t1", 1, true)),
            added(make_message("m2", "t1", 2, true)),
            added(make_message("m3", "t2", 3, false)),
            added(make_message("m4", "t3", 4, false)),
        ],
        "110",
    );
    let fetcher = FakeFetcher::new(empty_snapshot()).on("100", Answer::Batch(batch.clone()));

    let flaky = FlakyStore::failing_on(3);
    flaky.set_cursor(&mailbox(), "100").unwrap();

    let err = SyncOrchestrator::new(&flaky).run(&mailbox(), &fetcher).unwrap_err();
    assert!(matches!(
        err,
        SyncError::Storage {
            phase: SyncPhase::Reconciling,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(stored_cursor(&flaky, &mailbox()).as_deref(), Some("100"));
    assert_eq!(flaky.count_messages(&user()).unwrap(), 2);

    // The retry re-fetches the same range and finishes
    let report = SyncOrchestrator::new(&flaky).run(&mailbox(), &fetcher).unwrap();
    assert_eq!(report.stats.added, 2);
    assert_eq!(report.stats.unchanged, 2);
    assert_eq!(stored_cursor(&flaky, &mailbox()).as_deref(), Some("110"));

    let clean = InMemoryStore::new();
    Reconciler::new(&clean).apply(&mailbox(), &batch.records).unwrap();
    let ids_t = ["t1", "t2", "t3"];
    let ids_m = ["m1", "m2", "m3", "m4"];
    assert_eq!(mail_state(&flaky, &ids_t, &ids_m), mail_state(&clean, &ids_t, &ids_m));
}

#[test]
fn test_cursor_expiry_falls_back_to_full_snapshot() {
    let store = InMemoryStore::new();
    store.set_cursor(&mailbox(), "100").unwrap();

    let snapshot: Vec<ChangeRecord> = (0..12)
        .map(|i| added(make_message(&format!("m{}", i), &format!("t{}", i % 5), i, false)))
        .collect();
    let fetcher = FakeFetcher::new(ChangeBatch::new(snapshot, "205")).on("100", Answer::Expired);

    let report = SyncOrchestrator::new(&store)
        .with_window(SnapshotWindow::last_days(7))
        .run(&mailbox(), &fetcher)
        .unwrap();

    assert_eq!(report.mode, SyncMode::FullAfterExpiry);
    assert_eq!(report.final_phase(), SyncPhase::Idle);
    assert!(!report.phases.contains(&SyncPhase::Error));
    assert_eq!(fetcher.calls(), vec!["incremental:100", "full:7d"]);
    assert_eq!(stored_cursor(&store, &mailbox()).as_deref(), Some("205"));
    assert_eq!(store.count_messages(&user()).unwrap(), 12);
    assert_eq!(store.count_threads(&user()).unwrap(), 5);
}

#[test]
fn test_transient_error_keeps_cursor_for_retry() {
    let store = InMemoryStore::new();
    store.set_cursor(&mailbox(), "100").unwrap();
    let fetcher = FakeFetcher::new(empty_snapshot()).on("100", Answer::Unavailable);

    let err = SyncOrchestrator::new(&store).run(&mailbox(), &fetcher).unwrap_err();

    assert!(err.is_retryable());
    assert!(!err.is_user_actionable());
    assert_eq!(stored_cursor(&store, &mailbox()).as_deref(), Some("100"));
}

// === Scenarios ===

#[test]
fn test_incremental_run_applies_three_additions() {
    let store = InMemoryStore::new();
    store.set_cursor(&mailbox(), "100").unwrap();
    let batch = ChangeBatch::new(
        vec![
            added(make_message("m1", "t1", 1, true)),
            added(make_message("m2", "t1", 2, false)),
            added(make_message("m3", "t2", 3, false)),
        ],
        "103",
    );
    let fetcher = FakeFetcher::new(empty_snapshot()).on("100", Answer::Batch(batch));

    let report = SyncOrchestrator::new(&store).run(&mailbox(), &fetcher).unwrap();

    assert_eq!(report.mode, SyncMode::Incremental);
    assert_eq!(report.previous_cursor.as_deref(), Some("100"));
    assert_eq!(report.stats.added, 3);
    let expected: BTreeSet<_> = [
        AggregateId::Thread(ThreadId::new("t1")),
        AggregateId::Thread(ThreadId::new("t2")),
    ]
    .into_iter()
    .collect();
    assert_eq!(report.affected, expected);
    assert_eq!(stored_cursor(&store, &mailbox()).as_deref(), Some("103"));

    let t1 = store.get_thread(&user(), &ThreadId::new("t1")).unwrap().unwrap();
    assert_eq!(t1.message_count, 2);
    assert!(t1.is_unread);
    assert_eq!(t1.last_message_at, base_time() + Duration::minutes(2));
}

#[test]
fn test_duplicate_add_in_one_batch_stores_one_row() {
    let store = InMemoryStore::new();
    let x = make_message("x", "tx", 1, true);
    let fetcher = FakeFetcher::new(ChangeBatch::new(vec![added(x.clone()), added(x)], "9"));

    let report = SyncOrchestrator::new(&store).run(&mailbox(), &fetcher).unwrap();

    assert_eq!(report.stats.added, 1);
    assert_eq!(report.stats.unchanged, 1);
    assert_eq!(store.count_messages(&user()).unwrap(), 1);
    let thread = store.get_thread(&user(), &ThreadId::new("tx")).unwrap().unwrap();
    assert_eq!(thread.message_count, 1);
}

#[test]
fn test_add_then_remove_across_runs() {
    let store = InMemoryStore::new();
    store.set_cursor(&mailbox(), "100").unwrap();
    let fetcher = FakeFetcher::new(empty_snapshot())
        .on(
            "100",
            Answer::Batch(ChangeBatch::new(vec![added(make_message("y", "ty", 1, false))], "101")),
        )
        .on("101", Answer::Batch(ChangeBatch::new(vec![removed("y")], "102")));
    let orchestrator = SyncOrchestrator::new(&store);

    orchestrator.run(&mailbox(), &fetcher).unwrap();
    assert!(store.has_message(&user(), &MessageId::new("y")).unwrap());

    let report = orchestrator.run(&mailbox(), &fetcher).unwrap();
    assert_eq!(report.stats.removed, 1);
    assert!(!store.has_message(&user(), &MessageId::new("y")).unwrap());
    assert!(store.get_thread(&user(), &ThreadId::new("ty")).unwrap().is_none());
    assert_eq!(stored_cursor(&store, &mailbox()).as_deref(), Some("102"));
}

#[test]
fn test_duplicate_push_runs_once() {
    let store = InMemoryStore::new();
    store
        .upsert_account(Account::new("u1", "me@example.com"))
        .unwrap();
    store.set_cursor(&mailbox(), "100").unwrap();
    let fetcher = FakeFetcher::new(empty_snapshot()).on(
        "100",
        Answer::Batch(ChangeBatch::new(vec![added(make_message("m1", "t1", 1, true))], "105")),
    );
    let dispatcher = NotificationDispatcher::new();
    let push = PushEvent::gmail("me@example.com", "105");

    // Second delivery arrives while the first run is in flight
    let mut ticket = match dispatcher.on_push_event(&store, &push).unwrap() {
        DispatchDecision::Start(ticket) => ticket,
        other => panic!("expected a run, got {:?}", other),
    };
    let during = dispatcher.on_push_event(&store, &push).unwrap();
    assert!(matches!(during, DispatchDecision::Coalesced(_)));

    let mut runs = 0;
    loop {
        SyncOrchestrator::new(&store).run(ticket.stream(), &fetcher).unwrap();
        runs += 1;
        if !ticket.finish() {
            break;
        }
    }
    assert_eq!(runs, 1);

    // Third delivery after the run: the cursor already covers it
    let after = dispatcher.on_push_event(&store, &push).unwrap();
    assert!(matches!(after, DispatchDecision::Dropped(DropReason::Stale)));
    assert_eq!(fetcher.calls().len(), 1);
}

// === Effects ===

struct KeywordClassifier;

impl Classifier for KeywordClassifier {
    fn classify(&self, _user: &UserId, aggregate: &Aggregate) -> Result<Priority> {
        match aggregate {
            Aggregate::Thread(t) if t.is_unread => Ok(Priority::High),
            Aggregate::Thread(_) => Ok(Priority::Low),
            Aggregate::Series(_) => anyhow::bail!("classifier offline"),
        }
    }
}

#[derive(Default)]
struct CollectingNotifier {
    sent: Mutex<Vec<UserNotification>>,
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notification: &UserNotification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[test]
fn test_effects_failure_does_not_block_cursor() {
    let store = InMemoryStore::new();
    let calendar = StreamKey::calendar("u1", "primary");
    let notifier = CollectingNotifier::default();
    let effects = PostSyncEffects::new(&store, &KeywordClassifier, &notifier);
    let fetcher = FakeFetcher::new(ChangeBatch::new(
        vec![ChangeRecord::Added(SyncItem::Event(make_event("e1", "e1", 0)))],
        "token-1",
    ));

    let report = SyncOrchestrator::new(&store)
        .with_observer(&effects)
        .run(&calendar, &fetcher)
        .unwrap();

    let effects_report = report.effects.unwrap();
    assert_eq!(effects_report.failed, vec![AggregateId::Series(SeriesId::new("e1"))]);
    assert_eq!(stored_cursor(&store, &calendar).as_deref(), Some("token-1"));
    assert!(notifier.sent.lock().unwrap().is_empty());
}

#[test]
fn test_one_notification_per_run() {
    let store = InMemoryStore::new();
    let notifier = CollectingNotifier::default();
    let effects = PostSyncEffects::new(&store, &KeywordClassifier, &notifier);
    let fetcher = FakeFetcher::new(ChangeBatch::new(
        vec![
            added(make_message("m1", "t1", 1, true)),
            added(make_message("m2", "t2", 2, true)),
            added(make_message("m3", "t3", 3, false)),
        ],
        "50",
    ));

    SyncOrchestrator::new(&store)
        .with_observer(&effects)
        .run(&mailbox(), &fetcher)
        .unwrap();

    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].aggregates.len(), 2);
    let t3 = store.get_thread(&user(), &ThreadId::new("t3")).unwrap().unwrap();
    assert_eq!(t3.priority, Some(Priority::Low));
}

#[test]
fn test_observer_only_sees_surviving_aggregates() {
    struct Recorder(Mutex<Vec<AggregateId>>);

    impl AggregateObserver for Recorder {
        fn on_aggregates_changed(
            &self,
            _user: &UserId,
            ids: &BTreeSet<AggregateId>,
        ) -> courier::EffectsReport {
            self.0.lock().unwrap().extend(ids.iter().cloned());
            courier::EffectsReport::default()
        }
    }

    let store = InMemoryStore::new();
    let recorder = Recorder(Mutex::new(Vec::new()));
    let fetcher = FakeFetcher::new(ChangeBatch::new(
        vec![
            added(make_message("m1", "t1", 1, false)),
            added(make_message("m2", "t2", 2, false)),
            removed("m2"),
        ],
        "10",
    ));

    SyncOrchestrator::new(&store)
        .with_observer(&recorder)
        .run(&mailbox(), &fetcher)
        .unwrap();

    assert_eq!(
        *recorder.0.lock().unwrap(),
        vec![AggregateId::Thread(ThreadId::new("t1"))]
    );
}

// === SQLite ===

#[test]
fn test_sqlite_incremental_and_fallback() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("courier.sqlite");
    let store = SqliteStore::open(&db_path).unwrap();
    store
        .upsert_account(Account::new("u1", "me@example.com"))
        .unwrap();

    let first = FakeFetcher::new(ChangeBatch::new(
        vec![
            added(make_message("m1", "t1", 1, true)),
            added(make_message("m2", "t1", 2, true)),
        ],
        "100",
    ));
    let report = SyncOrchestrator::new(&store).run(&mailbox(), &first).unwrap();
    assert_eq!(report.mode, SyncMode::Full);

    let mut read = make_message("m1", "t1", 1, false);
    read.subject = "ignored".into();
    let second = FakeFetcher::new(empty_snapshot()).on(
        "100",
        Answer::Batch(ChangeBatch::new(
            vec![ChangeRecord::Updated(SyncItem::Message(read)), removed("m2")],
            "104",
        )),
    );
    SyncOrchestrator::new(&store).run(&mailbox(), &second).unwrap();
    drop(store);

    // Survives reopening
    let store = SqliteStore::open(&db_path).unwrap();
    assert_eq!(stored_cursor(&store, &mailbox()).as_deref(), Some("104"));
    let m1 = store.get_message(&user(), &MessageId::new("m1")).unwrap().unwrap();
    assert!(!m1.is_unread());
    assert_eq!(m1.subject, "Thread t1");
    let t1 = store.get_thread(&user(), &ThreadId::new("t1")).unwrap().unwrap();
    assert_eq!(t1.message_count, 1);
    assert!(!t1.is_unread);

    // Expired cursor rebuilds from the snapshot without duplicating rows
    let third = FakeFetcher::new(ChangeBatch::new(
        vec![added(make_message("m1", "t1", 1, false)), added(make_message("m5", "t5", 5, true))],
        "300",
    ))
    .on("104", Answer::Expired);
    let report = SyncOrchestrator::new(&store).run(&mailbox(), &third).unwrap();
    assert_eq!(report.mode, SyncMode::FullAfterExpiry);
    assert_eq!(store.count_messages(&user()).unwrap(), 2);
    assert_eq!(stored_cursor(&store, &mailbox()).as_deref(), Some("300"));
}
