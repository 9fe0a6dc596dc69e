//! Gmail history → change records

use std::collections::HashMap;

use anyhow::Result;
use log::debug;

use super::{ChangeFetcher, SnapshotWindow, malformed};
use crate::google::api::HistoryRecord;
use crate::google::{GmailClient, normalize_message};
use crate::models::{ChangeBatch, ChangeRecord, ItemKey, Message, MessageId, SyncItem};

/// Attempts per message fetch before the run gives up
const MESSAGE_FETCH_ATTEMPTS: u32 = 3;

/// Change fetcher over a mailbox's history feed
pub struct GmailFetcher {
    client: GmailClient,
}

impl GmailFetcher {
    pub fn new(client: GmailClient) -> Self {
        Self { client }
    }

    /// Current state of a message, `None` if it has been deleted since
    fn load_message(&self, index: usize, id: &MessageId) -> Result<Option<Message>> {
        let Some(raw) = self.client.get_message_with_retry(id, MESSAGE_FETCH_ATTEMPTS)? else {
            return Ok(None);
        };
        normalize_message(raw)
            .map(Some)
            .map_err(|e| malformed(index, id.as_str(), e))
    }
}

impl ChangeFetcher for GmailFetcher {
    fn fetch_incremental(&self, cursor: &str) -> Result<ChangeBatch> {
        let history = self.client.list_history_all(cursor)?;
        let records = history_to_records(history.history.unwrap_or_default(), |index, id| {
            self.load_message(index, id)
        })?;

        // An empty history still reports the head; fall back to the input
        let next_cursor = history.history_id.unwrap_or_else(|| cursor.to_string());
        Ok(ChangeBatch::new(records, next_cursor))
    }

    fn fetch_full_snapshot(&self, window: &SnapshotWindow) -> Result<ChangeBatch> {
        // Read the head before listing: anything that lands while we list
        // is replayed by the next incremental run.
        let profile = self.client.get_profile()?;

        let query = format!("newer_than:{}d", window.days.max(1));
        let refs = self.client.list_messages_all(Some(&query), window.max_items)?;
        debug!(
            "Full snapshot of {}: {} messages at history {}",
            profile.email_address,
            refs.len(),
            profile.history_id
        );

        // Listing is newest first; apply oldest first
        let mut records: Vec<ChangeRecord> = Vec::with_capacity(refs.len());
        for message_ref in refs.iter().rev() {
            let id = MessageId::new(&message_ref.id);
            if let Some(message) = self.load_message(records.len(), &id)? {
                records.push(ChangeRecord::Added(SyncItem::Message(message)));
            }
        }

        Ok(ChangeBatch::new(records, profile.history_id))
    }
}

/// Flatten history entries into change records, in provider order.
///
/// Additions and label changes carry the message's current state from
/// `load` (called at most once per id); a message that no longer exists
/// becomes a removal.
pub fn history_to_records<F>(history: Vec<HistoryRecord>, mut load: F) -> Result<Vec<ChangeRecord>>
where
    F: FnMut(usize, &MessageId) -> Result<Option<Message>>,
{
    let mut cache: HashMap<MessageId, Option<Message>> = HashMap::new();
    let mut records: Vec<ChangeRecord> = Vec::new();

    let mut current = |index: usize, id: MessageId| -> Result<Option<Message>> {
        if let Some(hit) = cache.get(&id) {
            return Ok(hit.clone());
        }
        let loaded = load(index, &id)?;
        cache.insert(id, loaded.clone());
        Ok(loaded)
    };

    for entry in history {
        for added in entry.messages_added {
            let id = MessageId::new(added.message.id);
            let record = match current(records.len(), id.clone())? {
                Some(message) => ChangeRecord::Added(SyncItem::Message(message)),
                None => ChangeRecord::Removed(ItemKey::Message(id)),
            };
            records.push(record);
        }

        for change in entry.labels_added.into_iter().chain(entry.labels_removed) {
            let id = MessageId::new(change.message.id);
            let record = match current(records.len(), id.clone())? {
                Some(message) => ChangeRecord::Updated(SyncItem::Message(message)),
                None => ChangeRecord::Removed(ItemKey::Message(id)),
            };
            records.push(record);
        }

        for deleted in entry.messages_deleted {
            records.push(ChangeRecord::Removed(ItemKey::Message(MessageId::new(
                deleted.message.id,
            ))));
        }
    }

    Ok(records)
}
