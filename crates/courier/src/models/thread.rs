//! Thread model representing a Gmail thread (conversation)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Message;

/// Unique identifier for a thread (Gmail thread ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ThreadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Classification label assigned after sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }

    /// Whether this priority warrants a user-facing notification
    pub fn is_high(&self) -> bool {
        *self >= Priority::High
    }
}

/// A thread represents a conversation containing one or more messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    /// Gmail thread ID
    pub id: ThreadId,
    /// Subject line of the thread (from its first message)
    pub subject: String,
    /// Preview text of the latest message
    pub snippet: String,
    /// Timestamp of the most recent message in the thread
    pub last_message_at: DateTime<Utc>,
    pub message_count: usize,
    /// Email address of the thread starter
    pub sender_email: String,
    /// Whether the thread has unread messages
    pub is_unread: bool,
    /// Set by post-sync classification
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl Thread {
    /// Compute a thread from the messages currently stored for it.
    ///
    /// Returns `None` for an empty message list. Classification carries
    /// over from `previous` since it is not derived from messages.
    pub fn from_messages(
        id: &ThreadId,
        messages: &[Message],
        previous: Option<&Thread>,
    ) -> Option<Thread> {
        let first = messages.iter().min_by_key(|m| m.received_at)?;
        let latest = messages.iter().max_by_key(|m| m.received_at)?;

        let subject = if first.subject.trim().is_empty() {
            "(no subject)".to_string()
        } else {
            first.subject.clone()
        };

        Some(Thread {
            id: id.clone(),
            subject,
            snippet: latest.body_preview.clone(),
            last_message_at: latest.received_at,
            message_count: messages.len(),
            sender_email: first.from.email.clone(),
            is_unread: messages.iter().any(|m| m.is_unread()),
            priority: previous.and_then(|t| t.priority),
        })
    }

    /// Placeholder created from a first-seen message, before it is linked
    pub fn seed(message: &Message) -> Thread {
        let subject = if message.subject.trim().is_empty() {
            "(no subject)".to_string()
        } else {
            message.subject.clone()
        };
        Thread {
            id: message.thread_id.clone(),
            subject,
            snippet: message.body_preview.clone(),
            last_message_at: message.received_at,
            message_count: 0,
            sender_email: message.from.email.clone(),
            is_unread: message.is_unread(),
            priority: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailAddress, MessageId, labels};

    fn make_message(id: &str, subject: &str, age_hours: i64, unread: bool) -> Message {
        let mut label_ids = vec![labels::INBOX.to_string()];
        if unread {
            label_ids.push(labels::UNREAD.to_string());
        }
        Message::builder(MessageId::new(id), ThreadId::new("t1"))
            .from(EmailAddress::new(format!("{}@example.com", id)))
            .subject(subject)
            .body_preview(format!("Body for {}", id))
            .received_at(Utc::now() - chrono::Duration::hours(age_hours))
            .label_ids(label_ids)
            .build()
    }

    #[test]
    fn test_from_messages() {
        let messages = vec![
            make_message("m2", "Re: Original Subject", 2, false),
            make_message("m1", "Original Subject", 3, false),
            make_message("m3", "Re: Original Subject", 1, true),
        ];

        let thread = Thread::from_messages(&ThreadId::new("t1"), &messages, None).unwrap();

        assert_eq!(thread.subject, "Original Subject");
        assert_eq!(thread.message_count, 3);
        assert_eq!(thread.snippet, "Body for m3");
        assert_eq!(thread.sender_email, "m1@example.com");
        assert!(thread.is_unread);
    }

    #[test]
    fn test_from_messages_empty() {
        assert!(Thread::from_messages(&ThreadId::new("t1"), &[], None).is_none());
    }

    #[test]
    fn test_from_messages_keeps_priority() {
        let messages = vec![make_message("m1", "", 1, false)];
        let mut previous = Thread::seed(&messages[0]);
        previous.priority = Some(Priority::High);

        let thread =
            Thread::from_messages(&ThreadId::new("t1"), &messages, Some(&previous)).unwrap();
        assert_eq!(thread.subject, "(no subject)");
        assert_eq!(thread.priority, Some(Priority::High));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent.is_high());
        assert!(Priority::High.is_high());
        assert!(!Priority::Normal.is_high());
        assert_eq!(Priority::parse("urgent"), Some(Priority::Urgent));
    }
}
