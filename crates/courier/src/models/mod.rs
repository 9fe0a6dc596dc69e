//! Domain models for synced mail and calendar entities

mod account;
mod change;
mod channel;
mod cursor;
mod event;
mod message;
mod push;
mod thread;

pub use account::{Account, UserCredentials, UserId};
pub use change::{AggregateId, ChangeBatch, ChangeRecord, ItemKey, SyncItem};
pub use channel::WatchChannel;
pub use cursor::{StreamKey, StreamKind, SyncCursor, compare_history_ids, marker_is_newer};
pub use event::{CalendarEvent, CalendarSeries, EventId, EventStatus, SeriesId};
pub use message::{EmailAddress, Message, MessageId, UNKNOWN_SENDER, labels};
pub use push::{PushEvent, PushSource, ResourceState};
pub use thread::{Priority, Thread, ThreadId};
