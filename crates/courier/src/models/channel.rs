//! Watch channel registrations (push subscription → stream mapping)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StreamKey;

/// An active push subscription for one stream.
///
/// For calendar the `channel_id` is the id we chose when creating the
/// channel; for Gmail it is derived from the mailbox since Pub/Sub
/// deliveries are addressed by email, not by channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchChannel {
    pub channel_id: String,
    pub stream: StreamKey,
    /// Provider's resource id (calendar channels only, needed to stop them)
    pub resource_id: Option<String>,
    /// Shared secret echoed back in `X-Goog-Channel-Token`
    pub token: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Highest `X-Goog-Message-Number` seen on this channel
    pub last_message_number: Option<u64>,
}

impl WatchChannel {
    pub fn gmail_channel_id(stream: &StreamKey) -> String {
        format!("gmail:{}", stream.stream_id)
    }

    pub fn is_expiring(&self, now: DateTime<Utc>, lead: chrono::Duration) -> bool {
        self.expires_at <= now + lead
    }
}
