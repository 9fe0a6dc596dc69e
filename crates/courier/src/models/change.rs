//! Provider change records, decoded once at the fetcher boundary

use serde::{Deserialize, Serialize};

use super::{CalendarEvent, EventId, Message, MessageId, SeriesId, ThreadId};

/// A child entity as reported by the provider
#[derive(Debug, Clone, PartialEq)]
pub enum SyncItem {
    Message(Message),
    Event(CalendarEvent),
}

impl SyncItem {
    pub fn key(&self) -> ItemKey {
        match self {
            SyncItem::Message(m) => ItemKey::Message(m.id.clone()),
            SyncItem::Event(e) => ItemKey::Event(e.id.clone()),
        }
    }
}

/// Provider-native key of a child entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Message(MessageId),
    Event(EventId),
}

impl ItemKey {
    pub fn as_str(&self) -> &str {
        match self {
            ItemKey::Message(id) => id.as_str(),
            ItemKey::Event(id) => id.as_str(),
        }
    }
}

/// Key of a parent aggregate (thread or calendar series)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AggregateId {
    Thread(ThreadId),
    Series(SeriesId),
}

impl AggregateId {
    pub fn as_str(&self) -> &str {
        match self {
            AggregateId::Thread(id) => id.as_str(),
            AggregateId::Series(id) => id.as_str(),
        }
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateId::Thread(id) => write!(f, "thread:{}", id.as_str()),
            AggregateId::Series(id) => write!(f, "series:{}", id.as_str()),
        }
    }
}

/// A single provider-reported delta
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRecord {
    Added(SyncItem),
    Updated(SyncItem),
    Removed(ItemKey),
}

impl ChangeRecord {
    pub fn item_key(&self) -> ItemKey {
        match self {
            ChangeRecord::Added(item) | ChangeRecord::Updated(item) => item.key(),
            ChangeRecord::Removed(key) => key.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeRecord::Added(_) => "added",
            ChangeRecord::Updated(_) => "updated",
            ChangeRecord::Removed(_) => "removed",
        }
    }
}

/// Ordered records plus the cursor to store once they are applied
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,
    pub next_cursor: String,
}

impl ChangeBatch {
    pub fn new(records: Vec<ChangeRecord>, next_cursor: impl Into<String>) -> Self {
        Self {
            records,
            next_cursor: next_cursor.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
