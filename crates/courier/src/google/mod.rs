//! Google API integration
//!
//! This module provides:
//! - OAuth2 token refresh and per-user credential resolution
//! - Gmail and Calendar HTTP clients
//! - Response normalization to domain models
//!
//! All calls are blocking (ureq) through a shared [`ureq::Agent`] that
//! carries the per-call timeout.

mod auth;
mod calendar;
mod gmail;
mod normalize;

use std::time::Duration;

pub use auth::{CredentialSource, GoogleOAuth, UserAuth};
pub use calendar::{CalendarClient, EventQuery};
pub use gmail::GmailClient;
pub use normalize::{normalize_event, normalize_message};
pub(crate) use normalize::is_new_event;

use crate::error::{AuthExpiredError, CursorExpiredError};
use crate::models::UserId;

/// Build the shared HTTP agent
pub fn http_agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    ureq::Agent::new_with_config(config)
}

/// Map a failed provider call onto the designed errors.
///
/// 401 means the user's grant no longer works; `expired_status` is the
/// code the endpoint uses for a cursor it can no longer serve.
pub(crate) fn provider_error(
    err: ureq::Error,
    user_id: &UserId,
    expired_status: Option<u16>,
    what: &str,
) -> anyhow::Error {
    match err {
        ureq::Error::StatusCode(401) => AuthExpiredError {
            user_id: user_id.to_string(),
        }
        .into(),
        ureq::Error::StatusCode(code) if Some(code) == expired_status => CursorExpiredError.into(),
        e => anyhow::Error::new(e).context(format!("{} failed", what)),
    }
}

/// Gmail API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Profile {
        pub email_address: String,
        pub history_id: String,
        pub messages_total: Option<u64>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        pub history_id: Option<String>,
        pub internal_date: Option<String>,
        pub payload: Option<MessagePayload>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePayload>>,
        pub mime_type: Option<String>,
    }

    #[derive(Debug, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct MessageBody {
        pub size: Option<u32>,
        pub data: Option<String>,
    }

    /// One page of `users.history.list`
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
        pub history_id: Option<String>,
    }

    /// A history entry; each carries at most one kind of change in practice
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub id: String,
        #[serde(default)]
        pub messages_added: Vec<HistoryMessage>,
        #[serde(default)]
        pub messages_deleted: Vec<HistoryMessage>,
        #[serde(default)]
        pub labels_added: Vec<HistoryLabelChange>,
        #[serde(default)]
        pub labels_removed: Vec<HistoryLabelChange>,
    }

    #[derive(Debug, Deserialize)]
    pub struct HistoryMessage {
        pub message: MessageRef,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryLabelChange {
        pub message: MessageRef,
        #[serde(default)]
        pub label_ids: Vec<String>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WatchRequest {
        pub topic_name: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub label_ids: Vec<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WatchResponse {
        pub history_id: String,
        /// Milliseconds since epoch, as a string
        pub expiration: String,
    }
}

/// Calendar API response types
pub mod calendar_api {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EventsResponse {
        pub items: Option<Vec<Event>>,
        pub next_page_token: Option<String>,
        pub next_sync_token: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Event {
        pub id: Option<String>,
        pub status: Option<String>,
        pub summary: Option<String>,
        pub recurring_event_id: Option<String>,
        pub recurrence: Option<Vec<String>>,
        pub start: Option<EventTime>,
        pub end: Option<EventTime>,
        pub organizer: Option<Person>,
        pub created: Option<String>,
        pub updated: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct EventTime {
        pub date: Option<String>,
        pub date_time: Option<String>,
        pub time_zone: Option<String>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct Person {
        pub email: Option<String>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ChannelRequest<'a> {
        pub id: &'a str,
        #[serde(rename = "type")]
        pub kind: &'a str,
        pub address: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub token: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub params: Option<ChannelParams>,
    }

    #[derive(Debug, Serialize)]
    pub struct ChannelParams {
        /// Requested lifetime in seconds, as a string
        pub ttl: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Channel {
        pub id: String,
        pub resource_id: String,
        /// Milliseconds since epoch, as a string
        pub expiration: Option<String>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct StopRequest<'a> {
        pub id: &'a str,
        pub resource_id: &'a str,
    }
}

/// Parse a millisecond epoch string as returned by watch endpoints
pub(crate) fn parse_epoch_millis(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::TimeZone;
    let millis: i64 = s.trim().parse().ok()?;
    chrono::Utc.timestamp_millis_opt(millis).single()
}
