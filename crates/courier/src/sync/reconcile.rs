//! Applies change records to local entity state
//!
//! Every record is idempotent on its own: an item already stored with the
//! same flags is a no-op, a removal of an absent item is a no-op, and a
//! calendar update older than what is stored is ignored. Applying the
//! same batch twice therefore yields the state of applying it once.
//!
//! Aggregates (threads, series) are recomputed from their stored
//! children after each change rather than patched incrementally, so
//! counts cannot drift under replays.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use log::{debug, error};

use crate::error::ReconcileError;
use crate::models::{
    AggregateId, CalendarEvent, CalendarSeries, ChangeRecord, EventId, EventStatus, ItemKey,
    Message, MessageId, SeriesId, StreamKey, StreamKind, SyncItem, Thread, ThreadId, UserId,
};
use crate::storage::EntityStore;

/// Per-batch counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Items that did not exist locally
    pub added: usize,
    /// Stored items whose flags or content changed
    pub updated: usize,
    /// Items deleted (messages) or cancelled (events)
    pub removed: usize,
    /// Records that changed nothing
    pub unchanged: usize,
}

/// Result of applying one batch
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Aggregates touched by the batch that still exist
    pub affected: BTreeSet<AggregateId>,
    pub stats: ReconcileStats,
}

/// What applying a single record did
enum Applied {
    Added(AggregateId),
    Updated(AggregateId),
    Removed(Option<AggregateId>),
    Unchanged,
}

/// Applies change records for one stream
pub struct Reconciler<'a, S: EntityStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: EntityStore + ?Sized> Reconciler<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Apply `records` strictly in order.
    ///
    /// Stops at the first record that fails; records before it stay
    /// applied. A malformed record yields [`ReconcileError`], anything
    /// else is a storage failure.
    pub fn apply(&self, stream: &StreamKey, records: &[ChangeRecord]) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();

        for (index, record) in records.iter().enumerate() {
            let applied = self.apply_record(stream, index, record).map_err(|e| {
                error!(
                    "Reconcile of {} failed at record {} ({} {}): {:#}",
                    stream,
                    index,
                    record.kind(),
                    record.item_key().as_str(),
                    e
                );
                e
            })?;

            match applied {
                Applied::Added(id) => {
                    outcome.stats.added += 1;
                    outcome.affected.insert(id);
                }
                Applied::Updated(id) => {
                    outcome.stats.updated += 1;
                    outcome.affected.insert(id);
                }
                Applied::Removed(id) => {
                    outcome.stats.removed += 1;
                    if let Some(id) = id {
                        outcome.affected.insert(id);
                    }
                }
                Applied::Unchanged => outcome.stats.unchanged += 1,
            }
        }

        // A later removal may have emptied an aggregate touched earlier
        for id in std::mem::take(&mut outcome.affected) {
            if self.aggregate_exists(&stream.user_id, &id)? {
                outcome.affected.insert(id);
            }
        }

        debug!(
            "Reconciled {} records for {}: {:?}, {} aggregates affected",
            records.len(),
            stream,
            outcome.stats,
            outcome.affected.len()
        );
        Ok(outcome)
    }

    fn apply_record(&self, stream: &StreamKey, index: usize, record: &ChangeRecord) -> Result<Applied> {
        let user = &stream.user_id;
        let expected = match record {
            ChangeRecord::Added(SyncItem::Message(_))
            | ChangeRecord::Updated(SyncItem::Message(_))
            | ChangeRecord::Removed(ItemKey::Message(_)) => StreamKind::Email,
            _ => StreamKind::Calendar,
        };
        if expected != stream.kind {
            return Err(reject(index, record.item_key().as_str(), "record does not belong to this stream"));
        }

        match record {
            ChangeRecord::Added(SyncItem::Message(message))
            | ChangeRecord::Updated(SyncItem::Message(message)) => {
                validate_message(index, message)?;
                self.upsert_message(user, message)
            }
            ChangeRecord::Removed(ItemKey::Message(id)) => self.remove_message(user, id),
            ChangeRecord::Added(SyncItem::Event(event))
            | ChangeRecord::Updated(SyncItem::Event(event)) => {
                validate_event(index, event)?;
                self.upsert_event(user, event)
            }
            ChangeRecord::Removed(ItemKey::Event(id)) => self.cancel_event(user, id),
        }
        .with_context(|| format!("record {} ({})", index, record.item_key().as_str()))
    }

    // === Mail ===

    fn upsert_message(&self, user: &UserId, message: &Message) -> Result<Applied> {
        if let Some(existing) = self.store.get_message(user, &message.id)? {
            if !existing.flags_differ(message) {
                return Ok(Applied::Unchanged);
            }
            // Content is immutable; only labels move
            self.store
                .update_message_labels(user, &message.id, message.label_ids.clone())?;
            self.recompute_thread(user, &existing.thread_id)?;
            return Ok(Applied::Updated(AggregateId::Thread(existing.thread_id)));
        }

        if self.store.get_thread(user, &message.thread_id)?.is_none() {
            self.store.upsert_thread(user, Thread::seed(message))?;
        }
        self.store.insert_message(user, message.clone())?;
        self.recompute_thread(user, &message.thread_id)?;
        Ok(Applied::Added(AggregateId::Thread(message.thread_id.clone())))
    }

    fn remove_message(&self, user: &UserId, id: &MessageId) -> Result<Applied> {
        let Some(existing) = self.store.get_message(user, id)? else {
            return Ok(Applied::Unchanged);
        };
        self.store.delete_message(user, id)?;
        let still_exists = self.recompute_thread(user, &existing.thread_id)?;
        Ok(Applied::Removed(
            still_exists.then(|| AggregateId::Thread(existing.thread_id)),
        ))
    }

    /// Rebuild a thread from its stored messages; an empty thread is
    /// deleted. Returns whether the thread still exists.
    fn recompute_thread(&self, user: &UserId, thread_id: &ThreadId) -> Result<bool> {
        let messages = self.store.list_messages_for_thread(user, thread_id)?;
        let previous = self.store.get_thread(user, thread_id)?;

        match Thread::from_messages(thread_id, &messages, previous.as_ref()) {
            Some(thread) => {
                self.store.upsert_thread(user, thread)?;
                Ok(true)
            }
            None => {
                if previous.is_some() {
                    self.store.delete_thread(user, thread_id)?;
                }
                Ok(false)
            }
        }
    }

    // === Calendar ===

    fn upsert_event(&self, user: &UserId, event: &CalendarEvent) -> Result<Applied> {
        let aggregate = AggregateId::Series(event.series_id.clone());

        let applied = match self.store.get_event(user, &event.id)? {
            // Replays and out-of-order deliveries carry an older stamp
            Some(existing) if event.updated_at <= existing.updated_at => {
                return Ok(Applied::Unchanged);
            }
            Some(_) => Applied::Updated(aggregate),
            None => Applied::Added(aggregate),
        };

        if self.store.get_series(user, &event.series_id)?.is_none() {
            self.store.upsert_series(user, CalendarSeries::seed(event))?;
        }
        self.store.upsert_event(user, event.clone())?;
        self.recompute_series(user, &event.series_id)?;
        Ok(applied)
    }

    /// Calendar removals are soft: the event stays, marked cancelled
    fn cancel_event(&self, user: &UserId, id: &EventId) -> Result<Applied> {
        let Some(mut existing) = self.store.get_event(user, id)? else {
            return Ok(Applied::Unchanged);
        };
        if existing.status == EventStatus::Cancelled {
            return Ok(Applied::Unchanged);
        }

        existing.status = EventStatus::Cancelled;
        let series_id = existing.series_id.clone();
        self.store.upsert_event(user, existing)?;
        self.recompute_series(user, &series_id)?;
        Ok(Applied::Removed(Some(AggregateId::Series(series_id))))
    }

    fn recompute_series(&self, user: &UserId, series_id: &SeriesId) -> Result<()> {
        let events = self.store.list_events_for_series(user, series_id)?;
        let previous = self.store.get_series(user, series_id)?;
        if let Some(series) = CalendarSeries::from_events(series_id, &events, previous.as_ref()) {
            self.store.upsert_series(user, series)?;
        }
        Ok(())
    }

    fn aggregate_exists(&self, user: &UserId, id: &AggregateId) -> Result<bool> {
        Ok(match id {
            AggregateId::Thread(thread_id) => self.store.get_thread(user, thread_id)?.is_some(),
            AggregateId::Series(series_id) => self.store.get_series(user, series_id)?.is_some(),
        })
    }
}

fn reject(index: usize, item_id: &str, reason: &str) -> anyhow::Error {
    ReconcileError {
        index,
        item_id: item_id.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn validate_message(index: usize, message: &Message) -> Result<()> {
    if message.id.as_str().trim().is_empty() {
        return Err(reject(index, "<missing>", "message has no id"));
    }
    if message.thread_id.as_str().trim().is_empty() {
        return Err(reject(index, message.id.as_str(), "message has no thread id"));
    }
    Ok(())
}

fn validate_event(index: usize, event: &CalendarEvent) -> Result<()> {
    if event.id.as_str().trim().is_empty() {
        return Err(reject(index, "<missing>", "event has no id"));
    }
    if event.series_id.as_str().trim().is_empty() {
        return Err(reject(index, event.id.as_str(), "event has no series id"));
    }
    Ok(())
}
