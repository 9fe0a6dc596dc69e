//! Inbound push notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Calendar `X-Goog-Resource-State` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Initial handshake after a watch is created; carries no change
    Sync,
    Exists,
    NotExists,
}

impl ResourceState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Some(ResourceState::Sync),
            "exists" => Some(ResourceState::Exists),
            "not_exists" => Some(ResourceState::NotExists),
            _ => None,
        }
    }
}

/// Where a push came from and what it names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushSource {
    /// Gmail Pub/Sub notification
    Gmail {
        email_address: String,
        history_id: String,
    },
    /// Calendar channel notification
    Calendar {
        channel_id: String,
        resource_id: Option<String>,
        resource_state: ResourceState,
        message_number: Option<u64>,
    },
}

/// A decoded webhook delivery.
///
/// Only used to trigger a sync run; its payload is never applied as
/// content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub source: PushSource,
    pub received_at: DateTime<Utc>,
    /// Provider redelivery counter, diagnostics only
    pub delivery_attempt: Option<u32>,
}

impl PushEvent {
    pub fn gmail(email_address: impl Into<String>, history_id: impl Into<String>) -> Self {
        Self {
            source: PushSource::Gmail {
                email_address: email_address.into().to_lowercase(),
                history_id: history_id.into(),
            },
            received_at: Utc::now(),
            delivery_attempt: None,
        }
    }

    pub fn calendar(
        channel_id: impl Into<String>,
        resource_state: ResourceState,
        message_number: Option<u64>,
    ) -> Self {
        Self {
            source: PushSource::Calendar {
                channel_id: channel_id.into(),
                resource_id: None,
                resource_state,
                message_number,
            },
            received_at: Utc::now(),
            delivery_attempt: None,
        }
    }

    pub fn with_delivery_attempt(mut self, attempt: Option<u32>) -> Self {
        self.delivery_attempt = attempt;
        self
    }
}
