//! Calendar events feed → change records

use anyhow::Result;
use chrono::{Duration, Utc};

use super::{ChangeFetcher, SnapshotWindow, malformed};
use crate::google::calendar_api::Event;
use crate::google::{CalendarClient, EventQuery, is_new_event, normalize_event};
use crate::models::{ChangeBatch, ChangeRecord, EventId, ItemKey, SyncItem};

/// Change fetcher over one calendar's sync-token feed
pub struct CalendarFetcher {
    client: CalendarClient,
}

impl CalendarFetcher {
    pub fn new(client: CalendarClient) -> Self {
        Self { client }
    }
}

impl ChangeFetcher for CalendarFetcher {
    fn fetch_incremental(&self, cursor: &str) -> Result<ChangeBatch> {
        let (events, next) = self
            .client
            .list_events_all(&EventQuery::SyncToken(cursor.to_string()))?;
        Ok(ChangeBatch::new(events_to_records(events)?, next))
    }

    fn fetch_full_snapshot(&self, window: &SnapshotWindow) -> Result<ChangeBatch> {
        let now = Utc::now();
        let span = Duration::days(i64::from(window.days.max(1)));
        let query = EventQuery::Window {
            time_min: now - span,
            time_max: now + span,
            page_size: window.max_items,
        };
        let (events, next) = self.client.list_events_all(&query)?;
        Ok(ChangeBatch::new(events_to_records(events)?, next))
    }
}

/// Map listed events to records, keeping provider order.
///
/// Cancelled events arrive as stubs (often without a summary or times),
/// so only their id is read.
pub fn events_to_records(events: Vec<Event>) -> Result<Vec<ChangeRecord>> {
    let mut records: Vec<ChangeRecord> = Vec::with_capacity(events.len());

    for event in events {
        let index = records.len();
        let id = event.id.clone().unwrap_or_default();

        if event.status.as_deref() == Some("cancelled") {
            if id.trim().is_empty() {
                let err = anyhow::anyhow!("cancelled event without id");
                return Err(malformed(index, "<missing>", err));
            }
            records.push(ChangeRecord::Removed(ItemKey::Event(EventId::new(id))));
            continue;
        }

        let created = is_new_event(&event);
        let normalized = normalize_event(event).map_err(|e| malformed(index, &id, e))?;
        let item = SyncItem::Event(normalized);
        records.push(if created {
            ChangeRecord::Added(item)
        } else {
            ChangeRecord::Updated(item)
        });
    }

    Ok(records)
}
