//! Push subscription registration and renewal
//!
//! Gmail `users.watch` and Calendar `events.watch` both expire (about a
//! week). The renewer re-registers anything expiring inside the lead
//! window and records the mapping the dispatcher resolves pushes with.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::google::parse_epoch_millis;
use crate::google::{CalendarClient, GmailClient};
use crate::models::{StreamKey, StreamKind, WatchChannel};
use crate::storage::ChannelStore;

/// A registered subscription as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub resource_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Provider calls needed to keep one stream subscribed
pub trait WatchApi {
    fn register(&self, channel_id: &str, ttl: std::time::Duration) -> Result<Registration>;

    /// Stop a previous subscription; a gone one is not an error
    fn unregister(&self, channel: &WatchChannel) -> Result<()>;
}

/// Gmail mailbox watch through Pub/Sub
pub struct GmailWatch {
    client: GmailClient,
    topic: String,
}

impl GmailWatch {
    pub fn new(client: GmailClient, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }
}

impl WatchApi for GmailWatch {
    fn register(&self, _channel_id: &str, _ttl: std::time::Duration) -> Result<Registration> {
        let response = self.client.watch(&self.topic, &["INBOX"])?;
        let expires_at = parse_epoch_millis(&response.expiration)
            .with_context(|| format!("invalid watch expiration: {}", response.expiration))?;
        Ok(Registration {
            resource_id: None,
            expires_at,
        })
    }

    fn unregister(&self, _channel: &WatchChannel) -> Result<()> {
        // Re-watching replaces the mailbox's single subscription
        Ok(())
    }
}

/// Calendar events channel delivering to our webhook
pub struct CalendarWatch {
    client: CalendarClient,
    address: String,
    token: Option<String>,
}

impl CalendarWatch {
    pub fn new(client: CalendarClient, address: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            address: address.into(),
            token,
        }
    }
}

impl WatchApi for CalendarWatch {
    fn register(&self, channel_id: &str, ttl: std::time::Duration) -> Result<Registration> {
        let channel = self
            .client
            .watch(channel_id, &self.address, self.token.as_deref(), ttl)?;
        let expires_at = channel
            .expiration
            .as_deref()
            .and_then(parse_epoch_millis)
            .unwrap_or_else(|| Utc::now() + Duration::seconds(ttl.as_secs() as i64));
        Ok(Registration {
            resource_id: Some(channel.resource_id),
            expires_at,
        })
    }

    fn unregister(&self, channel: &WatchChannel) -> Result<()> {
        let Some(resource_id) = &channel.resource_id else {
            return Ok(());
        };
        self.client.stop(&channel.channel_id, resource_id)
    }
}

/// Creates and renews watch channels for streams
pub struct WatchRenewer<'a, S: ChannelStore + ?Sized> {
    store: &'a S,
    lead: Duration,
    ttl: std::time::Duration,
    token: Option<String>,
}

impl<'a, S: ChannelStore + ?Sized> WatchRenewer<'a, S> {
    pub fn new(store: &'a S, lead: Duration, ttl: std::time::Duration) -> Self {
        Self {
            store,
            lead,
            ttl,
            token: None,
        }
    }

    /// Shared secret stored on new calendar channels
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Channel currently recorded for `stream`, if any
    pub fn channel_for(&self, stream: &StreamKey) -> Result<Option<WatchChannel>> {
        Ok(self
            .store
            .list_channels()?
            .into_iter()
            .filter(|c| &c.stream == stream)
            .max_by_key(|c| c.expires_at))
    }

    /// Whether `stream` has no channel or one expiring within the lead
    pub fn needs_renewal(&self, stream: &StreamKey, now: DateTime<Utc>) -> Result<bool> {
        Ok(match self.channel_for(stream)? {
            Some(channel) => channel.is_expiring(now, self.lead),
            None => true,
        })
    }

    /// Register a fresh subscription for `stream`, then retire the old one.
    ///
    /// The new channel is recorded before the old one is stopped so pushes
    /// keep resolving during the handover.
    pub fn renew(&self, stream: &StreamKey, api: &dyn WatchApi) -> Result<WatchChannel> {
        let previous = self.channel_for(stream)?;

        let channel_id = match stream.kind {
            StreamKind::Email => WatchChannel::gmail_channel_id(stream),
            StreamKind::Calendar => uuid::Uuid::new_v4().to_string(),
        };
        let registration = api
            .register(&channel_id, self.ttl)
            .with_context(|| format!("registering watch for {}", stream))?;

        let channel = WatchChannel {
            channel_id,
            stream: stream.clone(),
            resource_id: registration.resource_id,
            token: match stream.kind {
                StreamKind::Email => None,
                StreamKind::Calendar => self.token.clone(),
            },
            expires_at: registration.expires_at,
            last_message_number: None,
        };
        self.store.save_channel(channel.clone())?;
        info!(
            "Watch for {} registered as {} until {}",
            stream, channel.channel_id, channel.expires_at
        );

        if let Some(old) = previous
            && old.channel_id != channel.channel_id
        {
            if let Err(e) = api.unregister(&old) {
                warn!("Failed to stop old channel {} for {}: {:#}", old.channel_id, stream, e);
            }
            self.store.delete_channel(&old.channel_id)?;
        }

        Ok(channel)
    }
}
