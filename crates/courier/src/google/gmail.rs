//! Gmail API HTTP client
//!
//! Blocking calls (ureq) scoped to a single user's access token.

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};

use super::api::{
    GmailMessage, HistoryResponse, ListMessagesResponse, MessageRef, Profile, WatchRequest,
    WatchResponse,
};
use super::{UserAuth, provider_error};
use crate::models::MessageId;

/// History types requested from `users.history.list`
const HISTORY_TYPES: [&str; 4] = ["messageAdded", "messageDeleted", "labelAdded", "labelRemoved"];

/// Gmail API client for one user
pub struct GmailClient {
    agent: ureq::Agent,
    auth: UserAuth,
}

impl GmailClient {
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    pub fn new(agent: ureq::Agent, auth: UserAuth) -> Self {
        Self { agent, auth }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        expired_status: Option<u16>,
        what: &str,
    ) -> Result<T> {
        let mut response = self
            .agent
            .get(url)
            .header("Authorization", &self.auth.bearer())
            .call()
            .map_err(|e| provider_error(e, self.auth.user_id(), expired_status, what))?;

        response
            .body_mut()
            .read_json()
            .with_context(|| format!("Failed to parse {} response", what))
    }

    /// Mailbox profile; its `historyId` is the current head of history
    pub fn get_profile(&self) -> Result<Profile> {
        let url = format!("{}/users/me/profile", Self::BASE_URL);
        self.get_json(&url, None, "get profile")
    }

    /// List message ids matching `query`
    pub fn list_messages(
        &self,
        query: Option<&str>,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse> {
        let mut url = format!(
            "{}/users/me/messages?maxResults={}",
            Self::BASE_URL,
            max_results.clamp(1, 500)
        );
        if let Some(q) = query {
            url.push_str(&format!("&q={}", urlencoding::encode(q)));
        }
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }
        self.get_json(&url, None, "list messages")
    }

    /// List message ids across pages, stopping at `max_messages`
    pub fn list_messages_all(
        &self,
        query: Option<&str>,
        max_messages: usize,
    ) -> Result<Vec<MessageRef>> {
        let mut all_messages: Vec<MessageRef> = Vec::new();
        let mut page_token: Option<String> = None;

        while all_messages.len() < max_messages {
            let remaining = max_messages - all_messages.len();
            let response = self.list_messages(query, remaining, page_token.as_deref())?;

            if let Some(messages) = response.messages {
                all_messages.extend(messages);
            }

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        all_messages.truncate(max_messages);
        Ok(all_messages)
    }

    /// Get full message details; `None` if the message no longer exists
    pub fn get_message(&self, id: &MessageId) -> Result<Option<GmailMessage>> {
        let url = format!(
            "{}/users/me/messages/{}?format=full",
            Self::BASE_URL,
            urlencoding::encode(id.as_str())
        );

        match self
            .agent
            .get(&url)
            .header("Authorization", &self.auth.bearer())
            .call()
        {
            Ok(mut response) => {
                let message = response
                    .body_mut()
                    .read_json()
                    .context("Failed to parse message response")?;
                Ok(Some(message))
            }
            Err(ureq::Error::StatusCode(404)) => Ok(None),
            Err(e) => Err(provider_error(e, self.auth.user_id(), None, "get message")),
        }
    }

    /// Get a message, retrying transient failures with backoff and jitter.
    ///
    /// Auth failures and a missing message are returned immediately.
    pub fn get_message_with_retry(
        &self,
        id: &MessageId,
        max_attempts: u32,
    ) -> Result<Option<GmailMessage>> {
        let mut delay = Duration::from_millis(100);
        let mut attempt = 1;

        loop {
            match self.get_message(id) {
                Ok(message) => return Ok(message),
                Err(e) if attempt >= max_attempts || !is_retryable(&e) => return Err(e),
                Err(e) => {
                    warn!(
                        "Fetching message {} failed (attempt {}): {}",
                        id.as_str(),
                        attempt,
                        e
                    );
                    std::thread::sleep(delay + Duration::from_millis(rand_jitter()));
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }

    /// List one page of history since `start_history_id`.
    ///
    /// # Errors
    /// Returns [`CursorExpiredError`](crate::error::CursorExpiredError)
    /// if the history id is too old (404 from Gmail).
    pub fn list_history(
        &self,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={}",
            Self::BASE_URL,
            urlencoding::encode(start_history_id)
        );
        for history_type in HISTORY_TYPES {
            url.push_str(&format!("&historyTypes={}", history_type));
        }
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        self.get_json(&url, Some(404), "list history")
    }

    /// List all history pages since `start_history_id`, in provider order
    pub fn list_history_all(&self, start_history_id: &str) -> Result<HistoryResponse> {
        let mut all_records = Vec::new();
        let mut final_history_id = None;
        let mut page_token: Option<String> = None;

        loop {
            let response = self.list_history(start_history_id, page_token.as_deref())?;

            if let Some(records) = response.history {
                all_records.extend(records);
            }
            if response.history_id.is_some() {
                final_history_id = response.history_id;
            }

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(
            "History since {}: {} records, head {:?}",
            start_history_id,
            all_records.len(),
            final_history_id
        );

        Ok(HistoryResponse {
            history: Some(all_records),
            next_page_token: None,
            history_id: final_history_id,
        })
    }

    /// Start (or renew) Pub/Sub push notifications for the mailbox
    pub fn watch(&self, topic_name: &str, label_ids: &[&str]) -> Result<WatchResponse> {
        let url = format!("{}/users/me/watch", Self::BASE_URL);
        let request = WatchRequest {
            topic_name: topic_name.to_string(),
            label_ids: label_ids.iter().map(|l| l.to_string()).collect(),
        };

        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", &self.auth.bearer())
            .send_json(&request)
            .map_err(|e| provider_error(e, self.auth.user_id(), None, "watch mailbox"))?;

        response
            .body_mut()
            .read_json()
            .context("Failed to parse watch response")
    }
}

/// Auth and 4xx failures are not worth retrying within a run
fn is_retryable(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<crate::error::AuthExpiredError>().is_some() {
        return false;
    }
    !matches!(
        err.chain().find_map(|c| c.downcast_ref::<ureq::Error>()),
        Some(ureq::Error::StatusCode(code)) if (400..500).contains(code) && *code != 429
    )
}

/// Random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    RandomState::new().build_hasher().finish() % 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthExpiredError;

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = anyhow::Error::new(ureq::Error::StatusCode(429)).context("get message failed");
        assert!(is_retryable(&err));
        let err = anyhow::Error::new(ureq::Error::StatusCode(503));
        assert!(is_retryable(&err));
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = anyhow::Error::new(ureq::Error::StatusCode(403));
        assert!(!is_retryable(&err));
        let err: anyhow::Error = AuthExpiredError {
            user_id: "u1".into(),
        }
        .into();
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..20 {
            assert!(rand_jitter() < 100);
        }
    }
}
