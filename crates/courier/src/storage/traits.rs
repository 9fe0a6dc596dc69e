//! Storage trait definitions
//!
//! All tables are partitioned by user. No method spans partitions, so
//! backends need per-key consistency only.

use anyhow::Result;

use crate::models::{
    Account, AggregateId, CalendarEvent, CalendarSeries, EventId, Message, MessageId, Priority,
    SeriesId, StreamKey, SyncCursor, Thread, ThreadId, UserCredentials, UserId, WatchChannel,
};

/// Per-stream change-feed cursors
pub trait CursorStore: Send + Sync {
    /// Get the stored cursor, `None` if the stream was never seen
    fn get_cursor(&self, key: &StreamKey) -> Result<Option<SyncCursor>>;

    /// Durably store `token` as the stream's cursor.
    ///
    /// Must not return before the write is durable.
    fn set_cursor(&self, key: &StreamKey, token: &str) -> Result<()>;
}

/// Threads, messages, calendar series and events
pub trait EntityStore: Send + Sync {
    // === Mail ===

    fn get_thread(&self, user: &UserId, id: &ThreadId) -> Result<Option<Thread>>;

    /// Insert or update a thread
    fn upsert_thread(&self, user: &UserId, thread: Thread) -> Result<()>;

    fn delete_thread(&self, user: &UserId, id: &ThreadId) -> Result<()>;

    fn get_message(&self, user: &UserId, id: &MessageId) -> Result<Option<Message>>;

    fn has_message(&self, user: &UserId, id: &MessageId) -> Result<bool>;

    /// Insert a new message. Its thread must already exist.
    fn insert_message(&self, user: &UserId, message: Message) -> Result<()>;

    /// Replace a message's labels; no-op if the message is unknown
    fn update_message_labels(
        &self,
        user: &UserId,
        id: &MessageId,
        label_ids: Vec<String>,
    ) -> Result<()>;

    /// Hard-delete a message; no-op if absent
    fn delete_message(&self, user: &UserId, id: &MessageId) -> Result<()>;

    /// Messages of a thread, ordered by received_at ascending
    fn list_messages_for_thread(&self, user: &UserId, thread_id: &ThreadId)
    -> Result<Vec<Message>>;

    fn count_messages(&self, user: &UserId) -> Result<usize>;

    fn count_threads(&self, user: &UserId) -> Result<usize>;

    // === Calendar ===

    fn get_series(&self, user: &UserId, id: &SeriesId) -> Result<Option<CalendarSeries>>;

    fn upsert_series(&self, user: &UserId, series: CalendarSeries) -> Result<()>;

    fn get_event(&self, user: &UserId, id: &EventId) -> Result<Option<CalendarEvent>>;

    /// Insert or replace an event. Its series must already exist.
    fn upsert_event(&self, user: &UserId, event: CalendarEvent) -> Result<()>;

    fn list_events_for_series(
        &self,
        user: &UserId,
        series_id: &SeriesId,
    ) -> Result<Vec<CalendarEvent>>;

    fn count_events(&self, user: &UserId) -> Result<usize>;

    // === Classification ===

    /// Persist a classification result; returns false if the aggregate is gone
    fn set_priority(&self, user: &UserId, id: &AggregateId, priority: Priority) -> Result<bool>;
}

/// Connected accounts
pub trait AccountStore: Send + Sync {
    fn upsert_account(&self, account: Account) -> Result<()>;

    fn get_account(&self, user: &UserId) -> Result<Option<Account>>;

    /// Look up the account owning a mailbox (Gmail pushes name the address)
    fn find_account_by_email(&self, email: &str) -> Result<Option<Account>>;

    fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Persist refreshed credentials for an existing account
    fn update_credentials(&self, user: &UserId, credentials: &UserCredentials) -> Result<()>;
}

/// Push channel → stream mapping
pub trait ChannelStore: Send + Sync {
    fn save_channel(&self, channel: WatchChannel) -> Result<()>;

    fn get_channel(&self, channel_id: &str) -> Result<Option<WatchChannel>>;

    fn delete_channel(&self, channel_id: &str) -> Result<()>;

    fn list_channels(&self) -> Result<Vec<WatchChannel>>;

    /// Record a delivery's message number.
    ///
    /// Returns `true` if it is higher than any number seen on the channel
    /// (or the channel has seen none), `false` for a replay.
    fn record_message_number(&self, channel_id: &str, message_number: u64) -> Result<bool>;
}

/// Everything a sync service needs from one backend
pub trait SyncStore: CursorStore + EntityStore + AccountStore + ChannelStore {}

impl<T: CursorStore + EntityStore + AccountStore + ChannelStore> SyncStore for T {}
