//! Webhook payload decoding
//!
//! Turns Gmail Pub/Sub push bodies and Calendar channel headers into
//! [`PushEvent`]s. HTTP framing lives in the daemon.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use serde::Deserialize;

use crate::models::{PushEvent, PushSource, ResourceState};
use crate::storage::ChannelStore;

pub const HEADER_CHANNEL_ID: &str = "x-goog-channel-id";
pub const HEADER_CHANNEL_TOKEN: &str = "x-goog-channel-token";
pub const HEADER_RESOURCE_ID: &str = "x-goog-resource-id";
pub const HEADER_RESOURCE_STATE: &str = "x-goog-resource-state";
pub const HEADER_MESSAGE_NUMBER: &str = "x-goog-message-number";
/// Set by relays that forward Pub/Sub redeliveries
pub const HEADER_DELIVERY_ATTEMPT: &str = "x-goog-delivery-attempt";

/// Pub/Sub push envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubEnvelope {
    pub message: PubSubMessage,
    pub subscription: Option<String>,
    /// Present when the subscription has a dead-letter policy
    pub delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubMessage {
    /// Base64 of the Gmail notification JSON
    pub data: Option<String>,
    pub message_id: Option<String>,
    pub publish_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailNotification {
    email_address: String,
    history_id: HistoryIdValue,
}

/// Gmail sends the history id as a number, some relays as a string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryIdValue {
    Number(u64),
    Text(String),
}

impl HistoryIdValue {
    fn into_string(self) -> String {
        match self {
            HistoryIdValue::Number(n) => n.to_string(),
            HistoryIdValue::Text(s) => s.trim().to_string(),
        }
    }
}

/// Decode a Gmail Pub/Sub push body.
///
/// `header_attempt` (from a delivery-attempt header) wins over the
/// envelope's own counter.
pub fn decode_gmail_push(body: &[u8], header_attempt: Option<u32>) -> Result<PushEvent> {
    let envelope: PubSubEnvelope =
        serde_json::from_slice(body).context("Pub/Sub envelope is not valid JSON")?;
    let data = envelope
        .message
        .data
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| anyhow!("Pub/Sub message has no data"))?;

    let decoded = STANDARD
        .decode(data.trim())
        .or_else(|_| URL_SAFE.decode(data.trim()))
        .context("Pub/Sub data is not base64")?;
    let notification: GmailNotification =
        serde_json::from_slice(&decoded).context("Gmail notification is not valid JSON")?;

    let history_id = notification.history_id.into_string();
    if history_id.is_empty() || notification.email_address.trim().is_empty() {
        anyhow::bail!("Gmail notification is missing emailAddress or historyId");
    }

    Ok(PushEvent::gmail(notification.email_address.trim(), history_id)
        .with_delivery_attempt(header_attempt.or(envelope.delivery_attempt)))
}

/// Calendar channel notification headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarHeaders {
    pub channel_id: String,
    pub resource_id: Option<String>,
    pub resource_state: String,
    pub channel_token: Option<String>,
    pub message_number: Option<u64>,
}

impl CalendarHeaders {
    /// Read headers through `lookup`, which receives lower-case names
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let channel_id = non_empty(HEADER_CHANNEL_ID).context("missing channel id header")?;
        let resource_state =
            non_empty(HEADER_RESOURCE_STATE).context("missing resource state header")?;
        let message_number = match non_empty(HEADER_MESSAGE_NUMBER) {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .with_context(|| format!("invalid message number: {}", raw))?,
            ),
            None => None,
        };

        Ok(Self {
            channel_id,
            resource_id: non_empty(HEADER_RESOURCE_ID),
            resource_state,
            channel_token: non_empty(HEADER_CHANNEL_TOKEN),
            message_number,
        })
    }

    pub fn to_push_event(&self) -> Result<PushEvent> {
        let state = ResourceState::parse(&self.resource_state)
            .with_context(|| format!("unknown resource state: {}", self.resource_state))?;
        let mut event = PushEvent::calendar(&self.channel_id, state, self.message_number);
        if let PushSource::Calendar { resource_id, .. } = &mut event.source {
            *resource_id = self.resource_id.clone();
        }
        Ok(event)
    }
}

/// Check the shared secret a calendar notification carries.
///
/// The channel's own token takes precedence; `fallback_secret` covers
/// channels registered before tokens were stored. A channel we do not
/// know passes, so the dispatcher can drop it as unknown.
pub fn verify_calendar_token<S: ChannelStore + ?Sized>(
    store: &S,
    headers: &CalendarHeaders,
    fallback_secret: Option<&str>,
) -> Result<bool> {
    let Some(channel) = store.get_channel(&headers.channel_id)? else {
        return Ok(true);
    };
    let expected = channel.token.as_deref().or(fallback_secret);
    Ok(match expected {
        Some(expected) => headers
            .channel_token
            .as_deref()
            .is_some_and(|presented| tokens_match(expected, presented)),
        None => true,
    })
}

/// Length-independent comparison of two secrets
fn tokens_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}
