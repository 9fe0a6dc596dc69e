//! Built-in classifier and notifier so the daemon runs without external
//! services

use anyhow::Result;
use chrono::{Duration, Utc};
use courier::models::{CalendarSeries, Priority, Thread, UserId};
use courier::{Aggregate, Classifier, Notifier, UserNotification};
use log::info;

const URGENT_KEYWORDS: &[&str] = &[
    "urgent",
    "asap",
    "action required",
    "immediately",
    "deadline",
    "security alert",
];

const IMPORTANT_KEYWORDS: &[&str] = &["invoice", "contract", "interview", "offer", "payment"];

/// Rates threads by read state, sender and subject keywords, and series by
/// how soon they start
pub struct HeuristicClassifier {
    /// Senders whose unread mail is always high priority (lower-case)
    vip_senders: Vec<String>,
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl HeuristicClassifier {
    pub fn new(vip_senders: Vec<String>) -> Self {
        Self {
            vip_senders: vip_senders.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    fn classify_thread(&self, thread: &Thread) -> Priority {
        if !thread.is_unread {
            return Priority::Low;
        }
        let text = format!("{} {}", thread.subject, thread.snippet).to_lowercase();
        let recent = Utc::now() - thread.last_message_at < Duration::days(2);

        if recent && URGENT_KEYWORDS.iter().any(|k| text.contains(k)) {
            Priority::Urgent
        } else if self.vip_senders.contains(&thread.sender_email.to_lowercase())
            || IMPORTANT_KEYWORDS.iter().any(|k| text.contains(k))
        {
            Priority::High
        } else {
            Priority::Normal
        }
    }

    fn classify_series(&self, series: &CalendarSeries) -> Priority {
        let Some(start) = series.next_start_at else {
            return Priority::Low;
        };
        let until = start - Utc::now();
        if until < Duration::hours(24) {
            Priority::High
        } else if until < Duration::days(7) {
            Priority::Normal
        } else {
            Priority::Low
        }
    }
}

impl Classifier for HeuristicClassifier {
    fn classify(&self, _user: &UserId, aggregate: &Aggregate) -> Result<Priority> {
        Ok(match aggregate {
            Aggregate::Thread(thread) => self.classify_thread(thread),
            Aggregate::Series(series) => self.classify_series(series),
        })
    }
}

/// Writes notifications to the log as JSON
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &UserNotification) -> Result<()> {
        info!("Notification: {}", serde_json::to_string(notification)?);
        Ok(())
    }
}
