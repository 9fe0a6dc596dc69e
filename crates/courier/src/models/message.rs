//! Gmail messages and addresses

use std::collections::BTreeSet;
use std::fmt;

use super::ThreadId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Gmail system label ids the sync engine cares about
pub mod labels {
    pub const INBOX: &str = "INBOX";
    pub const UNREAD: &str = "UNREAD";
}

/// Unique identifier for a message (Gmail message ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Sender or recipient as parsed from a header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub email: String,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse `Name <addr>`, `"Last, First" <addr>` or a bare address
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let Some((display, rest)) = raw.rsplit_once('<') else {
            return Self::new(raw);
        };
        let Some((addr, _)) = rest.split_once('>') else {
            return Self::new(raw);
        };

        let display = display.trim().trim_matches('"').trim();
        Self {
            name: (!display.is_empty()).then(|| display.to_string()),
            email: addr.trim().to_string(),
        }
    }

    /// Lower-cased address, for comparisons
    pub fn normalized(&self) -> String {
        self.email.trim().to_lowercase()
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => f.write_str(&self.email),
        }
    }
}

/// One synced Gmail message.
///
/// Only `label_ids` changes after the first sync; read state, stars and
/// folder moves all arrive as label edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub subject: String,
    /// Plain-text snippet, entities decoded
    pub body_preview: String,
    pub received_at: DateTime<Utc>,
    pub label_ids: Vec<String>,
}

impl Message {
    pub fn builder(id: MessageId, thread_id: ThreadId) -> MessageBuilder {
        MessageBuilder {
            message: Message {
                id,
                thread_id,
                from: EmailAddress::new(UNKNOWN_SENDER),
                to: Vec::new(),
                subject: String::new(),
                body_preview: String::new(),
                received_at: Utc::now(),
                label_ids: Vec::new(),
            },
        }
    }

    pub fn is_unread(&self) -> bool {
        self.has_label(labels::UNREAD)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l == label)
    }

    /// Labels as a set, ignoring order and duplicates
    pub fn label_set(&self) -> BTreeSet<&str> {
        self.label_ids.iter().map(String::as_str).collect()
    }

    /// Whether `other` carries a different flag set than this message
    pub fn flags_differ(&self, other: &Message) -> bool {
        self.label_set() != other.label_set()
    }
}

/// Placeholder sender for messages without a parsable From header
pub const UNKNOWN_SENDER: &str = "unknown@unknown.invalid";

/// Fills a [`Message`] field by field; unset fields keep their defaults
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn from(mut self, from: EmailAddress) -> Self {
        self.message.from = from;
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.message.to = to;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.message.subject = subject.into();
        self
    }

    pub fn body_preview(mut self, body_preview: impl Into<String>) -> Self {
        self.message.body_preview = body_preview.into();
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.message.received_at = received_at;
        self
    }

    pub fn label_ids(mut self, label_ids: Vec<String>) -> Self {
        self.message.label_ids = label_ids;
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}
