//! SQLite-backed storage

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};
use serde::de::DeserializeOwned;

use super::{AccountStore, ChannelStore, CursorStore, EntityStore};
use crate::models::{
    Account, AggregateId, CalendarEvent, CalendarSeries, EmailAddress, EventId, EventStatus,
    Message, MessageId, Priority, SeriesId, StreamKey, StreamKind, SyncCursor, Thread, ThreadId,
    UserCredentials, UserId, WatchChannel,
};

/// Database migrations, tracked through the user_version pragma
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            r#"
            CREATE TABLE accounts (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                added_at TEXT NOT NULL,
                token_data TEXT
            );

            CREATE TABLE sync_cursors (
                user_id TEXT NOT NULL,
                stream_kind TEXT NOT NULL,
                stream_id TEXT NOT NULL,
                token TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, stream_id)
            );

            CREATE TABLE threads (
                user_id TEXT NOT NULL,
                id TEXT NOT NULL,
                subject TEXT NOT NULL,
                snippet TEXT NOT NULL,
                last_message_at TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                sender_email TEXT NOT NULL,
                is_unread INTEGER NOT NULL DEFAULT 0,
                priority TEXT,
                PRIMARY KEY (user_id, id)
            );

            CREATE TABLE messages (
                user_id TEXT NOT NULL,
                id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                from_name TEXT,
                from_email TEXT NOT NULL,
                to_json TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL,
                body_preview TEXT NOT NULL,
                received_at TEXT NOT NULL,
                label_ids TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (user_id, id),
                FOREIGN KEY (user_id, thread_id) REFERENCES threads(user_id, id) ON DELETE CASCADE
            );

            CREATE INDEX idx_messages_thread ON messages(user_id, thread_id);

            CREATE TABLE calendar_series (
                user_id TEXT NOT NULL,
                id TEXT NOT NULL,
                summary TEXT NOT NULL,
                last_activity_at TEXT NOT NULL,
                next_start_at TEXT,
                instance_count INTEGER NOT NULL DEFAULT 0,
                priority TEXT,
                PRIMARY KEY (user_id, id)
            );

            CREATE TABLE calendar_events (
                user_id TEXT NOT NULL,
                id TEXT NOT NULL,
                series_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                start_at TEXT,
                end_at TEXT,
                all_day INTEGER NOT NULL DEFAULT 0,
                organizer_email TEXT,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, id),
                FOREIGN KEY (user_id, series_id) REFERENCES calendar_series(user_id, id) ON DELETE CASCADE
            );

            CREATE INDEX idx_events_series ON calendar_events(user_id, series_id);

            CREATE TABLE watch_channels (
                channel_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                stream_kind TEXT NOT NULL,
                stream_id TEXT NOT NULL,
                resource_id TEXT,
                token TEXT,
                expires_at TEXT NOT NULL,
                last_message_number INTEGER
            );

            CREATE INDEX idx_watch_channels_expiry ON watch_channels(expires_at);
            "#,
        ),
        M::up(
            r#"
            -- A mailbox and its primary calendar share a stream id
            CREATE TABLE sync_cursors_v2 (
                user_id TEXT NOT NULL,
                stream_kind TEXT NOT NULL,
                stream_id TEXT NOT NULL,
                token TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, stream_kind, stream_id)
            );

            INSERT INTO sync_cursors_v2 (user_id, stream_kind, stream_id, token, updated_at)
                SELECT user_id, stream_kind, stream_id, token, updated_at FROM sync_cursors;

            DROP TABLE sync_cursors;
            ALTER TABLE sync_cursors_v2 RENAME TO sync_cursors;
            "#,
        ),
    ])
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => time_at(row, idx).map(Some),
        None => Ok(None),
    }
}

fn json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

fn parse_kind(s: &str) -> rusqlite::Result<StreamKind> {
    StreamKind::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            format!("unknown stream kind: {}", s).into(),
        )
    })
}

const THREAD_COLUMNS: &str = "id, subject, snippet, last_message_at, message_count,
     sender_email, is_unread, priority";

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let priority: Option<String> = row.get(7)?;
    Ok(Thread {
        id: ThreadId::new(row.get::<_, String>(0)?),
        subject: row.get(1)?,
        snippet: row.get(2)?,
        last_message_at: time_at(row, 3)?,
        message_count: row.get::<_, i64>(4)? as usize,
        sender_email: row.get(5)?,
        is_unread: row.get(6)?,
        priority: priority.as_deref().and_then(Priority::parse),
    })
}

const MESSAGE_COLUMNS: &str = "id, thread_id, from_name, from_email, to_json, subject,
     body_preview, received_at, label_ids";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId::new(row.get::<_, String>(0)?),
        thread_id: ThreadId::new(row.get::<_, String>(1)?),
        from: EmailAddress {
            name: row.get(2)?,
            email: row.get(3)?,
        },
        to: json_at(row, 4)?,
        subject: row.get(5)?,
        body_preview: row.get(6)?,
        received_at: time_at(row, 7)?,
        label_ids: json_at(row, 8)?,
    })
}

const SERIES_COLUMNS: &str = "id, summary, last_activity_at, next_start_at, instance_count, priority";

fn series_from_row(row: &Row<'_>) -> rusqlite::Result<CalendarSeries> {
    let priority: Option<String> = row.get(5)?;
    Ok(CalendarSeries {
        id: SeriesId::new(row.get::<_, String>(0)?),
        summary: row.get(1)?,
        last_activity_at: time_at(row, 2)?,
        next_start_at: opt_time_at(row, 3)?,
        instance_count: row.get::<_, i64>(4)? as usize,
        priority: priority.as_deref().and_then(Priority::parse),
    })
}

const EVENT_COLUMNS: &str = "id, series_id, summary, start_at, end_at, all_day,
     organizer_email, status, updated_at";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<CalendarEvent> {
    Ok(CalendarEvent {
        id: EventId::new(row.get::<_, String>(0)?),
        series_id: SeriesId::new(row.get::<_, String>(1)?),
        summary: row.get(2)?,
        start_at: opt_time_at(row, 3)?,
        end_at: opt_time_at(row, 4)?,
        all_day: row.get(5)?,
        organizer_email: row.get(6)?,
        status: EventStatus::parse(&row.get::<_, String>(7)?),
        updated_at: time_at(row, 8)?,
    })
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        user_id: UserId::new(row.get::<_, String>(0)?),
        email: row.get(1)?,
        added_at: time_at(row, 2)?,
        token_data: row.get(3)?,
    })
}

const CHANNEL_COLUMNS: &str = "channel_id, user_id, stream_kind, stream_id, resource_id, token,
     expires_at, last_message_number";

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<WatchChannel> {
    let kind = parse_kind(&row.get::<_, String>(2)?)?;
    Ok(WatchChannel {
        channel_id: row.get(0)?,
        stream: StreamKey::new(UserId::new(row.get::<_, String>(1)?), kind, row.get::<_, String>(3)?),
        resource_id: row.get(4)?,
        token: row.get(5)?,
        expires_at: time_at(row, 6)?,
        last_message_number: row.get::<_, Option<i64>>(7)?.map(|n| n as u64),
    })
}

/// SQLite-based storage for cursors, entities, accounts and channels
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database (tests, one-shot runs)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL keeps webhook reads unblocked while a run writes; synchronous
        // NORMAL is durable at commit under WAL.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CursorStore for SqliteStore {
    fn get_cursor(&self, key: &StreamKey) -> Result<Option<SyncCursor>> {
        let conn = self.conn.lock().unwrap();
        let cursor = conn
            .query_row(
                "SELECT token, updated_at FROM sync_cursors
                 WHERE user_id = ? AND stream_kind = ? AND stream_id = ?",
                params![key.user_id.as_str(), key.kind.as_str(), key.stream_id],
                |row| {
                    Ok(SyncCursor {
                        key: key.clone(),
                        token: row.get(0)?,
                        updated_at: time_at(row, 1)?,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    fn set_cursor(&self, key: &StreamKey, token: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_cursors (user_id, stream_kind, stream_id, token, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, stream_kind, stream_id) DO UPDATE SET
                token = excluded.token,
                updated_at = excluded.updated_at",
            params![
                key.user_id.as_str(),
                key.kind.as_str(),
                key.stream_id,
                token,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to persist sync cursor")?;
        Ok(())
    }
}

impl EntityStore for SqliteStore {
    fn get_thread(&self, user: &UserId, id: &ThreadId) -> Result<Option<Thread>> {
        let conn = self.conn.lock().unwrap();
        let thread = conn
            .query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE user_id = ? AND id = ?"),
                params![user.as_str(), id.as_str()],
                thread_from_row,
            )
            .optional()?;
        Ok(thread)
    }

    fn upsert_thread(&self, user: &UserId, thread: Thread) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        // ON CONFLICT DO UPDATE rather than INSERT OR REPLACE: a replace
        // deletes the row first and the cascade would take the messages.
        conn.execute(
            "INSERT INTO threads
             (user_id, id, subject, snippet, last_message_at, message_count,
              sender_email, is_unread, priority)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, id) DO UPDATE SET
                subject = excluded.subject,
                snippet = excluded.snippet,
                last_message_at = excluded.last_message_at,
                message_count = excluded.message_count,
                sender_email = excluded.sender_email,
                is_unread = excluded.is_unread,
                priority = excluded.priority",
            params![
                user.as_str(),
                thread.id.as_str(),
                thread.subject,
                thread.snippet,
                thread.last_message_at.to_rfc3339(),
                thread.message_count as i64,
                thread.sender_email,
                thread.is_unread,
                thread.priority.map(|p| p.as_str()),
            ],
        )?;
        Ok(())
    }

    fn delete_thread(&self, user: &UserId, id: &ThreadId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM threads WHERE user_id = ? AND id = ?",
            params![user.as_str(), id.as_str()],
        )?;
        Ok(())
    }

    fn get_message(&self, user: &UserId, id: &MessageId) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ? AND id = ?"),
                params![user.as_str(), id.as_str()],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    fn has_message(&self, user: &UserId, id: &MessageId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE user_id = ? AND id = ?)",
            params![user.as_str(), id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn insert_message(&self, user: &UserId, message: Message) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages
             (user_id, id, thread_id, from_name, from_email, to_json, subject,
              body_preview, received_at, label_ids)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                user.as_str(),
                message.id.as_str(),
                message.thread_id.as_str(),
                message.from.name,
                message.from.email,
                serde_json::to_string(&message.to)?,
                message.subject,
                message.body_preview,
                message.received_at.to_rfc3339(),
                serde_json::to_string(&message.label_ids)?,
            ],
        )
        .with_context(|| format!("Failed to insert message {}", message.id.as_str()))?;
        Ok(())
    }

    fn update_message_labels(
        &self,
        user: &UserId,
        id: &MessageId,
        label_ids: Vec<String>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE messages SET label_ids = ? WHERE user_id = ? AND id = ?",
            params![serde_json::to_string(&label_ids)?, user.as_str(), id.as_str()],
        )?;
        Ok(())
    }

    fn delete_message(&self, user: &UserId, id: &MessageId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM messages WHERE user_id = ? AND id = ?",
            params![user.as_str(), id.as_str()],
        )?;
        Ok(())
    }

    fn list_messages_for_thread(
        &self,
        user: &UserId,
        thread_id: &ThreadId,
    ) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE user_id = ? AND thread_id = ?
             ORDER BY received_at ASC"
        ))?;
        let messages = stmt
            .query_map(params![user.as_str(), thread_id.as_str()], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn count_messages(&self, user: &UserId) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE user_id = ?",
            [user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn count_threads(&self, user: &UserId) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE user_id = ?",
            [user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn get_series(&self, user: &UserId, id: &SeriesId) -> Result<Option<CalendarSeries>> {
        let conn = self.conn.lock().unwrap();
        let series = conn
            .query_row(
                &format!(
                    "SELECT {SERIES_COLUMNS} FROM calendar_series WHERE user_id = ? AND id = ?"
                ),
                params![user.as_str(), id.as_str()],
                series_from_row,
            )
            .optional()?;
        Ok(series)
    }

    fn upsert_series(&self, user: &UserId, series: CalendarSeries) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO calendar_series
             (user_id, id, summary, last_activity_at, next_start_at, instance_count, priority)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, id) DO UPDATE SET
                summary = excluded.summary,
                last_activity_at = excluded.last_activity_at,
                next_start_at = excluded.next_start_at,
                instance_count = excluded.instance_count,
                priority = excluded.priority",
            params![
                user.as_str(),
                series.id.as_str(),
                series.summary,
                series.last_activity_at.to_rfc3339(),
                series.next_start_at.map(|t| t.to_rfc3339()),
                series.instance_count as i64,
                series.priority.map(|p| p.as_str()),
            ],
        )?;
        Ok(())
    }

    fn get_event(&self, user: &UserId, id: &EventId) -> Result<Option<CalendarEvent>> {
        let conn = self.conn.lock().unwrap();
        let event = conn
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM calendar_events WHERE user_id = ? AND id = ?"
                ),
                params![user.as_str(), id.as_str()],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    fn upsert_event(&self, user: &UserId, event: CalendarEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO calendar_events
             (user_id, id, series_id, summary, start_at, end_at, all_day,
              organizer_email, status, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, id) DO UPDATE SET
                series_id = excluded.series_id,
                summary = excluded.summary,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                all_day = excluded.all_day,
                organizer_email = excluded.organizer_email,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                user.as_str(),
                event.id.as_str(),
                event.series_id.as_str(),
                event.summary,
                event.start_at.map(|t| t.to_rfc3339()),
                event.end_at.map(|t| t.to_rfc3339()),
                event.all_day,
                event.organizer_email,
                event.status.as_str(),
                event.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to store event {}", event.id.as_str()))?;
        Ok(())
    }

    fn list_events_for_series(
        &self,
        user: &UserId,
        series_id: &SeriesId,
    ) -> Result<Vec<CalendarEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM calendar_events
             WHERE user_id = ? AND series_id = ?
             ORDER BY start_at ASC"
        ))?;
        let events = stmt
            .query_map(params![user.as_str(), series_id.as_str()], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn count_events(&self, user: &UserId) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM calendar_events WHERE user_id = ?",
            [user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn set_priority(&self, user: &UserId, id: &AggregateId, priority: Priority) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let sql = match id {
            AggregateId::Thread(_) => "UPDATE threads SET priority = ? WHERE user_id = ? AND id = ?",
            AggregateId::Series(_) => {
                "UPDATE calendar_series SET priority = ? WHERE user_id = ? AND id = ?"
            }
        };
        let changed = conn.execute(sql, params![priority.as_str(), user.as_str(), id.as_str()])?;
        Ok(changed > 0)
    }
}

impl AccountStore for SqliteStore {
    fn upsert_account(&self, account: Account) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO accounts (user_id, email, added_at, token_data)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                email = excluded.email,
                token_data = COALESCE(excluded.token_data, accounts.token_data)",
            params![
                account.user_id.as_str(),
                account.email,
                account.added_at.to_rfc3339(),
                account.token_data,
            ],
        )?;
        Ok(())
    }

    fn get_account(&self, user: &UserId) -> Result<Option<Account>> {
        let conn = self.conn.lock().unwrap();
        let account = conn
            .query_row(
                "SELECT user_id, email, added_at, token_data FROM accounts WHERE user_id = ?",
                [user.as_str()],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    fn find_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock().unwrap();
        let account = conn
            .query_row(
                "SELECT user_id, email, added_at, token_data FROM accounts WHERE email = ?",
                [email.to_lowercase()],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, email, added_at, token_data FROM accounts ORDER BY user_id",
        )?;
        let accounts = stmt
            .query_map([], account_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    fn update_credentials(&self, user: &UserId, credentials: &UserCredentials) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE accounts SET token_data = ? WHERE user_id = ?",
            params![serde_json::to_string(credentials)?, user.as_str()],
        )?;
        if changed == 0 {
            anyhow::bail!("No account for user {}", user);
        }
        Ok(())
    }
}

impl ChannelStore for SqliteStore {
    fn save_channel(&self, channel: WatchChannel) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO watch_channels
             (channel_id, user_id, stream_kind, stream_id, resource_id, token,
              expires_at, last_message_number)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                channel.channel_id,
                channel.stream.user_id.as_str(),
                channel.stream.kind.as_str(),
                channel.stream.stream_id,
                channel.resource_id,
                channel.token,
                channel.expires_at.to_rfc3339(),
                channel.last_message_number.map(|n| n as i64),
            ],
        )?;
        Ok(())
    }

    fn get_channel(&self, channel_id: &str) -> Result<Option<WatchChannel>> {
        let conn = self.conn.lock().unwrap();
        let channel = conn
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM watch_channels WHERE channel_id = ?"),
                [channel_id],
                channel_from_row,
            )
            .optional()?;
        Ok(channel)
    }

    fn delete_channel(&self, channel_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM watch_channels WHERE channel_id = ?", [channel_id])?;
        Ok(())
    }

    fn list_channels(&self) -> Result<Vec<WatchChannel>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM watch_channels ORDER BY expires_at ASC"
        ))?;
        let channels = stmt
            .query_map([], channel_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    fn record_message_number(&self, channel_id: &str, message_number: u64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE watch_channels SET last_message_number = ?
             WHERE channel_id = ?
               AND (last_message_number IS NULL OR last_message_number < ?)",
            params![message_number as i64, channel_id, message_number as i64],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        // .test.sqlite keeps test databases distinguishable from real ones
        let store = SqliteStore::open(dir.path().join("courier.test.sqlite")).unwrap();
        (store, dir)
    }

    fn user() -> UserId {
        UserId::new("u1")
    }

    fn make_message(id: &str, thread_id: &str) -> Message {
        Message::builder(MessageId::new(id), ThreadId::new(thread_id))
            .from(EmailAddress::with_name("Test User", "test@example.com"))
            .to(vec![EmailAddress::new("me@example.com")])
            .subject("Test")
            .body_preview("Test preview")
            .label_ids(vec!["INBOX".to_string(), "UNREAD".to_string()])
            .build()
    }

    fn make_event(id: &str, series: &str) -> CalendarEvent {
        CalendarEvent {
            id: EventId::new(id),
            series_id: SeriesId::new(series),
            summary: "Planning".into(),
            start_at: Some(Utc::now()),
            end_at: None,
            all_day: false,
            organizer_email: Some("boss@example.com".into()),
            status: EventStatus::Confirmed,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_message_crud() {
        let (store, _dir) = create_test_store();
        let message = make_message("m1", "t1");
        store.upsert_thread(&user(), Thread::seed(&message)).unwrap();
        store.insert_message(&user(), message.clone()).unwrap();

        let loaded = store.get_message(&user(), &message.id).unwrap().unwrap();
        assert_eq!(loaded.subject, "Test");
        assert_eq!(loaded.from.name.as_deref(), Some("Test User"));
        assert_eq!(loaded.to.len(), 1);
        assert!(loaded.is_unread());

        store
            .update_message_labels(&user(), &message.id, vec!["INBOX".into()])
            .unwrap();
        let loaded = store.get_message(&user(), &message.id).unwrap().unwrap();
        assert!(!loaded.is_unread());

        store.delete_message(&user(), &message.id).unwrap();
        assert!(!store.has_message(&user(), &message.id).unwrap());
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let (store, _dir) = create_test_store();
        let message = make_message("m1", "t1");
        store.upsert_thread(&user(), Thread::seed(&message)).unwrap();
        store.insert_message(&user(), message.clone()).unwrap();
        assert!(store.insert_message(&user(), message).is_err());
        assert_eq!(store.count_messages(&user()).unwrap(), 1);
    }

    #[test]
    fn test_message_requires_thread() {
        let (store, _dir) = create_test_store();
        assert!(store.insert_message(&user(), make_message("m1", "t1")).is_err());
    }

    #[test]
    fn test_thread_upsert_keeps_messages() {
        let (store, _dir) = create_test_store();
        let message = make_message("m1", "t1");
        let mut thread = Thread::seed(&message);
        store.upsert_thread(&user(), thread.clone()).unwrap();
        store.insert_message(&user(), message).unwrap();

        thread.message_count = 1;
        thread.priority = Some(Priority::High);
        store.upsert_thread(&user(), thread).unwrap();

        assert_eq!(store.count_messages(&user()).unwrap(), 1);
        let loaded = store.get_thread(&user(), &ThreadId::new("t1")).unwrap().unwrap();
        assert_eq!(loaded.priority, Some(Priority::High));
    }

    #[test]
    fn test_delete_thread_cascades() {
        let (store, _dir) = create_test_store();
        let message = make_message("m1", "t1");
        store.upsert_thread(&user(), Thread::seed(&message)).unwrap();
        store.insert_message(&user(), message).unwrap();

        store.delete_thread(&user(), &ThreadId::new("t1")).unwrap();
        assert_eq!(store.count_messages(&user()).unwrap(), 0);
        assert_eq!(store.count_threads(&user()).unwrap(), 0);
    }

    #[test]
    fn test_cursor_upsert() {
        let (store, _dir) = create_test_store();
        let key = StreamKey::email("u1", "a@example.com");
        store.set_cursor(&key, "100").unwrap();
        store.set_cursor(&key, "103").unwrap();
        let cursor = store.get_cursor(&key).unwrap().unwrap();
        assert_eq!(cursor.token.as_deref(), Some("103"));
        assert_eq!(cursor.key, key);
    }

    #[test]
    fn test_mailbox_and_primary_calendar_cursors_are_separate() {
        // The primary calendar id is the mailbox address
        let (store, _dir) = create_test_store();
        let mail = StreamKey::email("u1", "me@example.com");
        let calendar = StreamKey::calendar("u1", "me@example.com");

        store.set_cursor(&mail, "1000").unwrap();
        store.set_cursor(&calendar, "CPDAlvWDx70CEPDAlvWDx70CGAU=").unwrap();
        store.set_cursor(&mail, "1001").unwrap();

        let mail_cursor = store.get_cursor(&mail).unwrap().unwrap();
        assert_eq!(mail_cursor.token.as_deref(), Some("1001"));
        assert_eq!(mail_cursor.key.kind, StreamKind::Email);
        let calendar_cursor = store.get_cursor(&calendar).unwrap().unwrap();
        assert_eq!(calendar_cursor.token.as_deref(), Some("CPDAlvWDx70CEPDAlvWDx70CGAU="));
    }

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn test_corrupt_rows_are_errors() {
        let (store, _dir) = create_test_store();
        let message = make_message("m1", "t1");
        store.upsert_thread(&user(), Thread::seed(&message)).unwrap();
        store.insert_message(&user(), message.clone()).unwrap();

        {
            let conn = store.conn.lock().unwrap();
            conn.execute("UPDATE messages SET label_ids = 'not json'", []).unwrap();
        }
        assert!(store.get_message(&user(), &message.id).is_err());

        {
            let conn = store.conn.lock().unwrap();
            conn.execute("UPDATE messages SET label_ids = '[]', received_at = 'yesterday'", [])
                .unwrap();
        }
        assert!(store.get_message(&user(), &message.id).is_err());
        assert!(store.get_thread(&user(), &message.thread_id).unwrap().is_some());
    }

    #[test]
    fn test_event_upsert_and_series() {
        let (store, _dir) = create_test_store();
        let event = make_event("e1", "s1");
        store.upsert_series(&user(), CalendarSeries::seed(&event)).unwrap();
        store.upsert_event(&user(), event.clone()).unwrap();

        let mut cancelled = event.clone();
        cancelled.status = EventStatus::Cancelled;
        store.upsert_event(&user(), cancelled).unwrap();

        let events = store
            .list_events_for_series(&user(), &SeriesId::new("s1"))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_cancelled());
        assert_eq!(store.count_events(&user()).unwrap(), 1);
    }

    #[test]
    fn test_accounts() {
        let (store, _dir) = create_test_store();
        let creds = UserCredentials {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: None,
        };
        store
            .upsert_account(Account::new("u1", "Alice@Example.com").with_credentials(&creds).unwrap())
            .unwrap();

        let found = store.find_account_by_email("alice@example.com").unwrap().unwrap();
        assert_eq!(found.user_id, user());
        assert_eq!(found.credentials(), Some(creds));

        let refreshed = UserCredentials {
            access_token: "at2".into(),
            refresh_token: Some("rt".into()),
            expires_at: Some(1),
        };
        store.update_credentials(&user(), &refreshed).unwrap();
        let account = store.get_account(&user()).unwrap().unwrap();
        assert_eq!(account.credentials(), Some(refreshed));
        assert!(store
            .update_credentials(&UserId::new("ghost"), &UserCredentials {
                access_token: "x".into(),
                refresh_token: None,
                expires_at: None,
            })
            .is_err());
    }

    #[test]
    fn test_channels() {
        let (store, _dir) = create_test_store();
        store
            .save_channel(WatchChannel {
                channel_id: "c1".into(),
                stream: StreamKey::calendar("u1", "primary"),
                resource_id: Some("r1".into()),
                token: Some("secret".into()),
                expires_at: Utc::now(),
                last_message_number: None,
            })
            .unwrap();

        let channel = store.get_channel("c1").unwrap().unwrap();
        assert_eq!(channel.stream.kind, StreamKind::Calendar);
        assert_eq!(channel.token.as_deref(), Some("secret"));

        assert!(store.record_message_number("c1", 5).unwrap());
        assert!(!store.record_message_number("c1", 5).unwrap());
        assert!(!store.record_message_number("c1", 4).unwrap());
        assert!(store.record_message_number("c1", 6).unwrap());

        store.delete_channel("c1").unwrap();
        assert!(store.list_channels().unwrap().is_empty());
    }
}
