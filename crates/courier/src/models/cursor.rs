//! Change-feed cursors and the ordering rules for comparing them

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// Which provider change feed a stream follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamKind {
    /// Gmail mailbox history (`historyId`)
    Email,
    /// Google Calendar events feed (`syncToken`)
    Calendar,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Email => "email",
            StreamKind::Calendar => "calendar",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "email" | "gmail" => Some(StreamKind::Email),
            "calendar" => Some(StreamKind::Calendar),
            _ => None,
        }
    }

    /// Whether cursors of this kind have a meaningful order
    pub fn has_ordered_cursors(&self) -> bool {
        matches!(self, StreamKind::Email)
    }
}

/// Identifies one change feed: a user plus a provider resource
///
/// For email the stream id is the mailbox address; for calendar it is
/// the calendar id (usually `primary`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub user_id: UserId,
    pub kind: StreamKind,
    pub stream_id: String,
}

impl StreamKey {
    pub fn new(user_id: UserId, kind: StreamKind, stream_id: impl Into<String>) -> Self {
        Self {
            user_id,
            kind,
            stream_id: stream_id.into(),
        }
    }

    pub fn email(user_id: impl Into<String>, mailbox: impl Into<String>) -> Self {
        Self::new(UserId::new(user_id), StreamKind::Email, mailbox)
    }

    pub fn calendar(user_id: impl Into<String>, calendar_id: impl Into<String>) -> Self {
        Self::new(UserId::new(user_id), StreamKind::Calendar, calendar_id)
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.kind.as_str(), self.stream_id)
    }
}

/// Last successfully applied cursor for a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub key: StreamKey,
    /// Provider-opaque token; `None` means the stream was never synced
    pub token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    pub fn new(key: StreamKey, token: Option<String>) -> Self {
        Self {
            key,
            token,
            updated_at: Utc::now(),
        }
    }
}

/// Compare two Gmail history ids without parsing them as integers.
///
/// History ids are decimal strings that only grow. Leading zeros are
/// ignored, a longer id is newer, equal-length ids compare lexically.
/// Ids containing non-digits fall back to plain string comparison.
pub fn compare_history_ids(a: &str, b: &str) -> Ordering {
    let a = a.trim();
    let b = b.trim();
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());
    if !(numeric(a) && numeric(b)) {
        return a.cmp(b);
    }

    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Whether `candidate` is strictly newer than `current` for this stream kind.
///
/// Calendar sync tokens carry no order, so any differing value counts as
/// newer there; staleness for calendar pushes is judged elsewhere.
pub fn marker_is_newer(kind: StreamKind, candidate: &str, current: Option<&str>) -> bool {
    let Some(current) = current else {
        return true;
    };
    match kind {
        StreamKind::Email => compare_history_ids(candidate, current) == Ordering::Greater,
        StreamKind::Calendar => candidate != current,
    }
}
