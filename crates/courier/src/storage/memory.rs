//! In-memory storage implementation
//!
//! Used by tests and by ephemeral one-shot runs. Every map is keyed by
//! (user id, provider id) and protected by its own RwLock.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{AccountStore, ChannelStore, CursorStore, EntityStore};
use crate::models::{
    Account, AggregateId, CalendarEvent, CalendarSeries, EventId, Message, MessageId, Priority,
    SeriesId, StreamKey, SyncCursor, Thread, ThreadId, UserCredentials, UserId, WatchChannel,
};

type Key = (String, String);

fn key(user: &UserId, id: &str) -> Key {
    (user.0.clone(), id.to_string())
}

/// In-memory implementation of every storage trait
pub struct InMemoryStore {
    cursors: RwLock<HashMap<StreamKey, SyncCursor>>,
    threads: RwLock<HashMap<Key, Thread>>,
    messages: RwLock<HashMap<Key, Message>>,
    series: RwLock<HashMap<Key, CalendarSeries>>,
    events: RwLock<HashMap<Key, CalendarEvent>>,
    accounts: RwLock<HashMap<UserId, Account>>,
    channels: RwLock<HashMap<String, WatchChannel>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            cursors: RwLock::new(HashMap::new()),
            threads: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            series: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            accounts: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorStore for InMemoryStore {
    fn get_cursor(&self, key: &StreamKey) -> Result<Option<SyncCursor>> {
        let cursors = self.cursors.read().unwrap();
        Ok(cursors.get(key).cloned())
    }

    fn set_cursor(&self, key: &StreamKey, token: &str) -> Result<()> {
        let mut cursors = self.cursors.write().unwrap();
        cursors.insert(
            key.clone(),
            SyncCursor::new(key.clone(), Some(token.to_string())),
        );
        Ok(())
    }
}

impl EntityStore for InMemoryStore {
    fn get_thread(&self, user: &UserId, id: &ThreadId) -> Result<Option<Thread>> {
        let threads = self.threads.read().unwrap();
        Ok(threads.get(&key(user, id.as_str())).cloned())
    }

    fn upsert_thread(&self, user: &UserId, thread: Thread) -> Result<()> {
        let mut threads = self.threads.write().unwrap();
        threads.insert(key(user, thread.id.as_str()), thread);
        Ok(())
    }

    fn delete_thread(&self, user: &UserId, id: &ThreadId) -> Result<()> {
        self.threads.write().unwrap().remove(&key(user, id.as_str()));
        self.messages
            .write()
            .unwrap()
            .retain(|(owner, _), m| !(owner == &user.0 && &m.thread_id == id));
        Ok(())
    }

    fn get_message(&self, user: &UserId, id: &MessageId) -> Result<Option<Message>> {
        let messages = self.messages.read().unwrap();
        Ok(messages.get(&key(user, id.as_str())).cloned())
    }

    fn has_message(&self, user: &UserId, id: &MessageId) -> Result<bool> {
        let messages = self.messages.read().unwrap();
        Ok(messages.contains_key(&key(user, id.as_str())))
    }

    fn insert_message(&self, user: &UserId, message: Message) -> Result<()> {
        let thread_exists = self
            .threads
            .read()
            .unwrap()
            .contains_key(&key(user, message.thread_id.as_str()));
        if !thread_exists {
            anyhow::bail!(
                "Thread {} must exist before inserting message {}",
                message.thread_id.as_str(),
                message.id.as_str()
            );
        }

        let mut messages = self.messages.write().unwrap();
        messages.insert(key(user, message.id.as_str()), message);
        Ok(())
    }

    fn update_message_labels(
        &self,
        user: &UserId,
        id: &MessageId,
        label_ids: Vec<String>,
    ) -> Result<()> {
        let mut messages = self.messages.write().unwrap();
        if let Some(message) = messages.get_mut(&key(user, id.as_str())) {
            message.label_ids = label_ids;
        }
        Ok(())
    }

    fn delete_message(&self, user: &UserId, id: &MessageId) -> Result<()> {
        self.messages.write().unwrap().remove(&key(user, id.as_str()));
        Ok(())
    }

    fn list_messages_for_thread(
        &self,
        user: &UserId,
        thread_id: &ThreadId,
    ) -> Result<Vec<Message>> {
        let messages = self.messages.read().unwrap();
        let mut result: Vec<Message> = messages
            .iter()
            .filter(|((owner, _), m)| owner == &user.0 && &m.thread_id == thread_id)
            .map(|(_, m)| m.clone())
            .collect();
        result.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(result)
    }

    fn count_messages(&self, user: &UserId) -> Result<usize> {
        let messages = self.messages.read().unwrap();
        Ok(messages.keys().filter(|(owner, _)| owner == &user.0).count())
    }

    fn count_threads(&self, user: &UserId) -> Result<usize> {
        let threads = self.threads.read().unwrap();
        Ok(threads.keys().filter(|(owner, _)| owner == &user.0).count())
    }

    fn get_series(&self, user: &UserId, id: &SeriesId) -> Result<Option<CalendarSeries>> {
        let series = self.series.read().unwrap();
        Ok(series.get(&key(user, id.as_str())).cloned())
    }

    fn upsert_series(&self, user: &UserId, series: CalendarSeries) -> Result<()> {
        let mut all = self.series.write().unwrap();
        all.insert(key(user, series.id.as_str()), series);
        Ok(())
    }

    fn get_event(&self, user: &UserId, id: &EventId) -> Result<Option<CalendarEvent>> {
        let events = self.events.read().unwrap();
        Ok(events.get(&key(user, id.as_str())).cloned())
    }

    fn upsert_event(&self, user: &UserId, event: CalendarEvent) -> Result<()> {
        let series_exists = self
            .series
            .read()
            .unwrap()
            .contains_key(&key(user, event.series_id.as_str()));
        if !series_exists {
            anyhow::bail!(
                "Series {} must exist before storing event {}",
                event.series_id.as_str(),
                event.id.as_str()
            );
        }

        let mut events = self.events.write().unwrap();
        events.insert(key(user, event.id.as_str()), event);
        Ok(())
    }

    fn list_events_for_series(
        &self,
        user: &UserId,
        series_id: &SeriesId,
    ) -> Result<Vec<CalendarEvent>> {
        let events = self.events.read().unwrap();
        let mut result: Vec<CalendarEvent> = events
            .iter()
            .filter(|((owner, _), e)| owner == &user.0 && &e.series_id == series_id)
            .map(|(_, e)| e.clone())
            .collect();
        result.sort_by(|a, b| a.start_at.cmp(&b.start_at));
        Ok(result)
    }

    fn count_events(&self, user: &UserId) -> Result<usize> {
        let events = self.events.read().unwrap();
        Ok(events.keys().filter(|(owner, _)| owner == &user.0).count())
    }

    fn set_priority(&self, user: &UserId, id: &AggregateId, priority: Priority) -> Result<bool> {
        match id {
            AggregateId::Thread(thread_id) => {
                let mut threads = self.threads.write().unwrap();
                Ok(threads
                    .get_mut(&key(user, thread_id.as_str()))
                    .map(|t| t.priority = Some(priority))
                    .is_some())
            }
            AggregateId::Series(series_id) => {
                let mut series = self.series.write().unwrap();
                Ok(series
                    .get_mut(&key(user, series_id.as_str()))
                    .map(|s| s.priority = Some(priority))
                    .is_some())
            }
        }
    }
}

impl AccountStore for InMemoryStore {
    fn upsert_account(&self, account: Account) -> Result<()> {
        let mut accounts = self.accounts.write().unwrap();
        accounts.insert(account.user_id.clone(), account);
        Ok(())
    }

    fn get_account(&self, user: &UserId) -> Result<Option<Account>> {
        let accounts = self.accounts.read().unwrap();
        Ok(accounts.get(user).cloned())
    }

    fn find_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let email = email.to_lowercase();
        let accounts = self.accounts.read().unwrap();
        Ok(accounts.values().find(|a| a.email == email).cloned())
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let accounts = self.accounts.read().unwrap();
        let mut list: Vec<Account> = accounts.values().cloned().collect();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(list)
    }

    fn update_credentials(&self, user: &UserId, credentials: &UserCredentials) -> Result<()> {
        let mut accounts = self.accounts.write().unwrap();
        let account = accounts
            .get_mut(user)
            .with_context(|| format!("No account for user {}", user))?;
        account.token_data = Some(serde_json::to_string(credentials)?);
        Ok(())
    }
}

impl ChannelStore for InMemoryStore {
    fn save_channel(&self, channel: WatchChannel) -> Result<()> {
        let mut channels = self.channels.write().unwrap();
        channels.insert(channel.channel_id.clone(), channel);
        Ok(())
    }

    fn get_channel(&self, channel_id: &str) -> Result<Option<WatchChannel>> {
        let channels = self.channels.read().unwrap();
        Ok(channels.get(channel_id).cloned())
    }

    fn delete_channel(&self, channel_id: &str) -> Result<()> {
        self.channels.write().unwrap().remove(channel_id);
        Ok(())
    }

    fn list_channels(&self) -> Result<Vec<WatchChannel>> {
        let channels = self.channels.read().unwrap();
        let mut list: Vec<WatchChannel> = channels.values().cloned().collect();
        list.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(list)
    }

    fn record_message_number(&self, channel_id: &str, message_number: u64) -> Result<bool> {
        let mut channels = self.channels.write().unwrap();
        let Some(channel) = channels.get_mut(channel_id) else {
            return Ok(false);
        };
        if channel
            .last_message_number
            .is_some_and(|seen| seen >= message_number)
        {
            return Ok(false);
        }
        channel.last_message_number = Some(message_number);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailAddress, EventStatus};

    fn user() -> UserId {
        UserId::new("u1")
    }

    fn make_message(id: &str, thread_id: &str) -> Message {
        Message::builder(MessageId::new(id), ThreadId::new(thread_id))
            .from(EmailAddress::new("test@example.com"))
            .subject("Test")
            .build()
    }

    #[test]
    fn test_insert_message_requires_thread() {
        let store = InMemoryStore::new();
        let message = make_message("m1", "t1");
        assert!(store.insert_message(&user(), message.clone()).is_err());

        store.upsert_thread(&user(), Thread::seed(&message)).unwrap();
        store.insert_message(&user(), message).unwrap();
        assert!(store.has_message(&user(), &MessageId::new("m1")).unwrap());
    }

    #[test]
    fn test_users_are_partitioned() {
        let store = InMemoryStore::new();
        let message = make_message("m1", "t1");
        store.upsert_thread(&user(), Thread::seed(&message)).unwrap();
        store.insert_message(&user(), message).unwrap();

        let other = UserId::new("u2");
        assert!(!store.has_message(&other, &MessageId::new("m1")).unwrap());
        assert_eq!(store.count_messages(&other).unwrap(), 0);
        assert_eq!(store.count_messages(&user()).unwrap(), 1);
    }

    #[test]
    fn test_cursor_round_trip() {
        let store = InMemoryStore::new();
        let key = StreamKey::email("u1", "a@example.com");
        assert!(store.get_cursor(&key).unwrap().is_none());

        store.set_cursor(&key, "100").unwrap();
        let cursor = store.get_cursor(&key).unwrap().unwrap();
        assert_eq!(cursor.token.as_deref(), Some("100"));

        let calendar = StreamKey::calendar("u1", "a@example.com");
        assert!(store.get_cursor(&calendar).unwrap().is_none());
    }

    #[test]
    fn test_record_message_number() {
        let store = InMemoryStore::new();
        store
            .save_channel(WatchChannel {
                channel_id: "c1".into(),
                stream: StreamKey::calendar("u1", "primary"),
                resource_id: None,
                token: None,
                expires_at: Utc::now(),
                last_message_number: None,
            })
            .unwrap();

        assert!(store.record_message_number("c1", 2).unwrap());
        assert!(!store.record_message_number("c1", 2).unwrap());
        assert!(!store.record_message_number("c1", 1).unwrap());
        assert!(store.record_message_number("c1", 3).unwrap());
        assert!(!store.record_message_number("unknown", 1).unwrap());
    }

    #[test]
    fn test_set_priority_on_missing_aggregate() {
        let store = InMemoryStore::new();
        let updated = store
            .set_priority(
                &user(),
                &AggregateId::Series(SeriesId::new("nope")),
                Priority::High,
            )
            .unwrap();
        assert!(!updated);

        let event = CalendarEvent {
            id: EventId::new("e1"),
            series_id: SeriesId::new("e1"),
            summary: "Review".into(),
            start_at: None,
            end_at: None,
            all_day: false,
            organizer_email: None,
            status: EventStatus::Confirmed,
            updated_at: Utc::now(),
        };
        store.upsert_series(&user(), CalendarSeries::seed(&event)).unwrap();
        assert!(
            store
                .set_priority(&user(), &AggregateId::Series(SeriesId::new("e1")), Priority::High)
                .unwrap()
        );
    }
}
