//! Change fetchers
//!
//! A fetcher turns one provider change feed into ordered
//! [`ChangeRecord`](crate::models::ChangeRecord)s. Provider payloads are
//! decoded here, once; the reconciler only ever sees domain types.

mod calendar;
mod gmail;

pub use calendar::{CalendarFetcher, events_to_records};
pub use gmail::{GmailFetcher, history_to_records};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::models::ChangeBatch;

/// Bounds a full-snapshot fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWindow {
    /// How many days back (and, for calendars, ahead) to cover
    pub days: u32,
    /// Item cap for mail; page size for calendar listings, whose sync
    /// token only covers a listing read to its last page
    pub max_items: usize,
}

impl SnapshotWindow {
    pub fn last_days(days: u32) -> Self {
        Self {
            days,
            ..Self::default()
        }
    }
}

impl Default for SnapshotWindow {
    fn default() -> Self {
        Self {
            days: 7,
            max_items: 500,
        }
    }
}

/// Incremental and full-snapshot access to one provider stream.
///
/// `fetch_incremental` fails with
/// [`CursorExpiredError`](crate::error::CursorExpiredError) when the
/// provider can no longer serve changes since `cursor`. Every other error
/// is fatal for the run.
pub trait ChangeFetcher {
    fn fetch_incremental(&self, cursor: &str) -> Result<ChangeBatch>;

    /// Establish a baseline; `next_cursor` of the result is a fresh cursor
    fn fetch_full_snapshot(&self, window: &SnapshotWindow) -> Result<ChangeBatch>;
}

/// A provider payload that cannot be turned into a record
pub(crate) fn malformed(index: usize, item_id: &str, err: anyhow::Error) -> anyhow::Error {
    ReconcileError {
        index,
        item_id: item_id.to_string(),
        reason: format!("{:#}", err),
    }
    .into()
}
