//! Post-sync effects: classification and user notification
//!
//! Runs after the cursor is persisted. Nothing here can fail a sync run;
//! errors are logged per aggregate and reported in [`EffectsReport`].

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::models::{AggregateId, CalendarSeries, Priority, StreamKey, StreamKind, Thread, UserId};
use crate::storage::EntityStore;

/// An aggregate as handed to the classifier
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    Thread(Thread),
    Series(CalendarSeries),
}

impl Aggregate {
    pub fn id(&self) -> AggregateId {
        match self {
            Aggregate::Thread(t) => AggregateId::Thread(t.id.clone()),
            Aggregate::Series(s) => AggregateId::Series(s.id.clone()),
        }
    }

    /// Subject or summary
    pub fn title(&self) -> &str {
        match self {
            Aggregate::Thread(t) => &t.subject,
            Aggregate::Series(s) => &s.summary,
        }
    }

    pub fn priority(&self) -> Option<Priority> {
        match self {
            Aggregate::Thread(t) => t.priority,
            Aggregate::Series(s) => s.priority,
        }
    }
}

/// Assigns a priority to an aggregate
pub trait Classifier: Send + Sync {
    fn classify(&self, user: &UserId, aggregate: &Aggregate) -> Result<Priority>;
}

/// Delivers notifications to the user
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &UserNotification) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    HighPriority,
    ReconnectAccount,
    SyncFailing,
}

/// A single user-facing notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNotification {
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    /// Aggregates the notification is about, if any
    pub aggregates: Vec<AggregateId>,
}

impl UserNotification {
    /// One notification covering every newly high-priority aggregate of a run
    pub fn high_priority(user: &UserId, items: &[(AggregateId, String)]) -> Self {
        let title = match items.len() {
            1 => "1 important update".to_string(),
            n => format!("{} important updates", n),
        };
        let body = items
            .iter()
            .map(|(_, title)| title.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            user_id: user.clone(),
            kind: NotificationKind::HighPriority,
            title,
            body,
            aggregates: items.iter().map(|(id, _)| id.clone()).collect(),
        }
    }

    pub fn reconnect_account(user: &UserId) -> Self {
        Self {
            user_id: user.clone(),
            kind: NotificationKind::ReconnectAccount,
            title: "Reconnect your account".to_string(),
            body: "Access to your Google account has expired. Sign in again to resume syncing."
                .to_string(),
            aggregates: Vec::new(),
        }
    }

    /// A stream has kept failing past the retry budget
    pub fn sync_failing(user: &UserId, stream: &StreamKey, failures: u32, error: &str) -> Self {
        let source = match stream.kind {
            StreamKind::Email => "mail",
            StreamKind::Calendar => "calendar",
        };
        Self {
            user_id: user.clone(),
            kind: NotificationKind::SyncFailing,
            title: format!("Your {} is not syncing", source),
            body: format!(
                "{} has failed to sync {} times in a row. Last error: {}",
                stream.stream_id, failures, error
            ),
            aggregates: Vec::new(),
        }
    }
}

/// What the effects step did for one run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EffectsReport {
    pub classified: usize,
    /// Aggregates that became high priority in this run
    pub high_priority: Vec<AggregateId>,
    pub failed: Vec<AggregateId>,
    pub notified: bool,
}

/// Receives the aggregates a sync run touched
pub trait AggregateObserver {
    fn on_aggregates_changed(&self, user: &UserId, ids: &BTreeSet<AggregateId>) -> EffectsReport;
}

/// Classifies changed aggregates, persists the result and batches one
/// notification per run
pub struct PostSyncEffects<'a, S: EntityStore + ?Sized> {
    store: &'a S,
    classifier: &'a dyn Classifier,
    notifier: &'a dyn Notifier,
}

impl<'a, S: EntityStore + ?Sized> PostSyncEffects<'a, S> {
    pub fn new(store: &'a S, classifier: &'a dyn Classifier, notifier: &'a dyn Notifier) -> Self {
        Self {
            store,
            classifier,
            notifier,
        }
    }

    fn load(&self, user: &UserId, id: &AggregateId) -> Result<Option<Aggregate>> {
        Ok(match id {
            AggregateId::Thread(thread_id) => {
                self.store.get_thread(user, thread_id)?.map(Aggregate::Thread)
            }
            AggregateId::Series(series_id) => {
                self.store.get_series(user, series_id)?.map(Aggregate::Series)
            }
        })
    }

    /// Classify one aggregate; returns its title if it newly became high priority
    fn classify_one(&self, user: &UserId, id: &AggregateId) -> Result<Option<String>> {
        let Some(aggregate) = self.load(user, id)? else {
            debug!("Aggregate {} vanished before classification", id);
            return Ok(None);
        };

        let previous = aggregate.priority();
        let priority = self
            .classifier
            .classify(user, &aggregate)
            .with_context(|| format!("classifying {}", id))?;

        if previous != Some(priority) {
            self.store
                .set_priority(user, id, priority)
                .with_context(|| format!("saving priority for {}", id))?;
        }

        let newly_high = priority.is_high() && !previous.is_some_and(|p| p.is_high());
        Ok(newly_high.then(|| aggregate.title().to_string()))
    }

    /// Tell the user their account needs to be reconnected
    pub fn notify_reconnect(&self, user: &UserId) {
        self.send(UserNotification::reconnect_account(user));
    }

    pub fn notify_sync_failing(&self, stream: &StreamKey, failures: u32, error: &str) {
        self.send(UserNotification::sync_failing(
            &stream.user_id,
            stream,
            failures,
            error,
        ));
    }

    fn send(&self, notification: UserNotification) {
        if let Err(e) = self.notifier.notify(&notification) {
            warn!(
                "Failed to send {:?} notification to {}: {:#}",
                notification.kind, notification.user_id, e
            );
        }
    }
}

impl<S: EntityStore + ?Sized> AggregateObserver for PostSyncEffects<'_, S> {
    fn on_aggregates_changed(&self, user: &UserId, ids: &BTreeSet<AggregateId>) -> EffectsReport {
        let mut report = EffectsReport::default();
        let mut important = Vec::new();

        for id in ids {
            match self.classify_one(user, id) {
                Ok(Some(title)) => {
                    report.classified += 1;
                    report.high_priority.push(id.clone());
                    important.push((id.clone(), title));
                }
                Ok(None) => report.classified += 1,
                Err(e) => {
                    warn!("Post-sync effects failed for {} ({}): {:#}", id, user, e);
                    report.failed.push(id.clone());
                }
            }
        }

        if !important.is_empty() {
            let notification = UserNotification::high_priority(user, &important);
            match self.notifier.notify(&notification) {
                Ok(()) => {
                    info!("Notified {} about {} aggregates", user, important.len());
                    report.notified = true;
                }
                Err(e) => warn!("Failed to notify {}: {:#}", user, e),
            }
        }

        report
    }
}
