//! Calendar models: recurring series and their event instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Priority;

/// Google Calendar event id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Id of the series an event belongs to.
///
/// For a recurring instance this is the `recurringEventId`; a one-off
/// event is its own series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesId(pub String);

impl SeriesId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Confirmed => "confirmed",
            EventStatus::Tentative => "tentative",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "cancelled" => EventStatus::Cancelled,
            "tentative" => EventStatus::Tentative,
            _ => EventStatus::Confirmed,
        }
    }
}

/// A single calendar event (or one instance of a recurring event)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: EventId,
    pub series_id: SeriesId,
    pub summary: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub all_day: bool,
    pub organizer_email: Option<String>,
    pub status: EventStatus,
    /// Provider's last-modified timestamp, used to ignore stale replays
    pub updated_at: DateTime<Utc>,
}

impl CalendarEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }

    /// Whether this event is the master of its series
    pub fn is_series_master(&self) -> bool {
        self.id.as_str() == self.series_id.as_str()
    }
}

/// Parent aggregate for calendar events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarSeries {
    pub id: SeriesId,
    pub summary: String,
    /// Latest provider update seen across the series' events
    pub last_activity_at: DateTime<Utc>,
    /// Start of the next non-cancelled instance we know of
    pub next_start_at: Option<DateTime<Utc>>,
    pub instance_count: usize,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl CalendarSeries {
    /// Recompute a series from its stored events.
    ///
    /// Summary prefers the series master; otherwise the most recently
    /// updated instance. Returns `None` if there are no events.
    pub fn from_events(
        id: &SeriesId,
        events: &[CalendarEvent],
        previous: Option<&CalendarSeries>,
    ) -> Option<CalendarSeries> {
        let latest = events.iter().max_by_key(|e| e.updated_at)?;
        let summary = events
            .iter()
            .find(|e| e.is_series_master())
            .unwrap_or(latest)
            .summary
            .clone();

        let now = Utc::now();
        let next_start_at = events
            .iter()
            .filter(|e| !e.is_cancelled())
            .filter_map(|e| e.start_at)
            .filter(|start| *start >= now)
            .min();

        Some(CalendarSeries {
            id: id.clone(),
            summary,
            last_activity_at: latest.updated_at,
            next_start_at,
            instance_count: events.iter().filter(|e| !e.is_cancelled()).count(),
            priority: previous.and_then(|s| s.priority),
        })
    }

    pub fn seed(event: &CalendarEvent) -> CalendarSeries {
        CalendarSeries {
            id: event.series_id.clone(),
            summary: event.summary.clone(),
            last_activity_at: event.updated_at,
            next_start_at: None,
            instance_count: 0,
            priority: None,
        }
    }
}
