//! Google Calendar API HTTP client

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::debug;

use super::calendar_api::{
    Channel, ChannelParams, ChannelRequest, Event, EventsResponse, StopRequest,
};
use super::{UserAuth, provider_error};

/// What an events listing is bounded by
#[derive(Debug, Clone, PartialEq)]
pub enum EventQuery {
    /// Changes since a previous listing
    SyncToken(String),
    /// Baseline listing of a time window, `page_size` events per call
    Window {
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        page_size: usize,
    },
}

impl EventQuery {
    /// Query string for one page, without the leading `?`.
    ///
    /// A window listing carries no ordering or filter beyond the time range:
    /// the provider only hands out `nextSyncToken` for unordered listings.
    fn to_query(&self, page_token: Option<&str>) -> String {
        // Instances, not masters, so moved/cancelled occurrences show up
        let mut query = String::from("singleEvents=true&showDeleted=true");

        match self {
            EventQuery::SyncToken(token) => {
                query.push_str(&format!(
                    "&syncToken={}&maxResults={}",
                    urlencoding::encode(token),
                    CalendarClient::PAGE_SIZE
                ));
            }
            EventQuery::Window {
                time_min,
                time_max,
                page_size,
            } => {
                query.push_str(&format!(
                    "&timeMin={}&timeMax={}&maxResults={}",
                    urlencoding::encode(&time_min.to_rfc3339()),
                    urlencoding::encode(&time_max.to_rfc3339()),
                    (*page_size).clamp(1, CalendarClient::MAX_PAGE_SIZE)
                ));
            }
        }
        if let Some(token) = page_token {
            query.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }
        query
    }
}

/// Calendar API client for one user's calendar
pub struct CalendarClient {
    agent: ureq::Agent,
    auth: UserAuth,
    calendar_id: String,
}

impl CalendarClient {
    const BASE_URL: &'static str = "https://www.googleapis.com/calendar/v3";

    /// Page size for sync token listings
    const PAGE_SIZE: usize = 250;

    /// The API caps `maxResults` here
    const MAX_PAGE_SIZE: usize = 2500;

    pub fn new(agent: ureq::Agent, auth: UserAuth, calendar_id: impl Into<String>) -> Self {
        Self {
            agent,
            auth,
            calendar_id: calendar_id.into(),
        }
    }

    fn events_url(&self) -> String {
        format!(
            "{}/calendars/{}/events",
            Self::BASE_URL,
            urlencoding::encode(&self.calendar_id)
        )
    }

    /// Fetch one page of events.
    ///
    /// # Errors
    /// Returns [`CursorExpiredError`](crate::error::CursorExpiredError)
    /// when the sync token is no longer valid (410 Gone).
    pub fn list_events(&self, query: &EventQuery, page_token: Option<&str>) -> Result<EventsResponse> {
        let url = format!("{}?{}", self.events_url(), query.to_query(page_token));

        let mut response = self
            .agent
            .get(&url)
            .header("Authorization", &self.auth.bearer())
            .call()
            .map_err(|e| provider_error(e, self.auth.user_id(), Some(410), "list events"))?;

        response
            .body_mut()
            .read_json()
            .context("Failed to parse events response")
    }

    /// Fetch every page and return the events with the next sync token.
    ///
    /// The sync token only arrives on the last page, and it covers every
    /// event the listing returned. A window listing therefore keeps all of
    /// them; its time range is what bounds the number of calls.
    pub fn list_events_all(&self, query: &EventQuery) -> Result<(Vec<Event>, String)> {
        let mut events: Vec<Event> = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        let next_sync_token = loop {
            let page = self.list_events(query, page_token.as_deref())?;
            pages += 1;
            if let Some(items) = page.items {
                events.extend(items);
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break page.next_sync_token,
            }
        };

        let next_sync_token = next_sync_token.with_context(|| {
            format!("Calendar {} listing ended without a sync token", self.calendar_id)
        })?;

        debug!(
            "Calendar {}: {} events in {} pages, next token received",
            self.calendar_id,
            events.len(),
            pages
        );
        Ok((events, next_sync_token))
    }

    /// Open a push channel delivering to `address`
    pub fn watch(
        &self,
        channel_id: &str,
        address: &str,
        token: Option<&str>,
        ttl: std::time::Duration,
    ) -> Result<Channel> {
        let url = format!("{}/watch", self.events_url());
        let request = ChannelRequest {
            id: channel_id,
            kind: "web_hook",
            address,
            token,
            params: Some(ChannelParams {
                ttl: ttl.as_secs().to_string(),
            }),
        };

        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", &self.auth.bearer())
            .send_json(&request)
            .map_err(|e| provider_error(e, self.auth.user_id(), None, "watch calendar"))?;

        response
            .body_mut()
            .read_json()
            .context("Failed to parse channel response")
    }

    /// Stop a push channel; an already-gone channel is not an error
    pub fn stop(&self, channel_id: &str, resource_id: &str) -> Result<()> {
        let url = format!("{}/channels/stop", Self::BASE_URL);
        let result = self
            .agent
            .post(&url)
            .header("Authorization", &self.auth.bearer())
            .send_json(&StopRequest {
                id: channel_id,
                resource_id,
            });

        match result {
            Ok(_) | Err(ureq::Error::StatusCode(404)) => Ok(()),
            Err(e) => Err(provider_error(e, self.auth.user_id(), None, "stop channel")),
        }
    }
}
