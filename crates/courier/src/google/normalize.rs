//! Provider payload normalization
//!
//! Converts Gmail and Calendar API responses into domain models. This is
//! the only place provider-specific shapes are read; a payload missing a
//! required field is rejected here instead of reaching the reconciler.

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use super::api::{GmailMessage, MessagePayload};
use super::calendar_api::{Event, EventTime};
use crate::models::{
    CalendarEvent, EmailAddress, EventId, EventStatus, Message, MessageId, SeriesId, ThreadId,
    UNKNOWN_SENDER,
};

/// Longest body preview kept when the snippet is empty
const PREVIEW_CHARS: usize = 200;

/// Normalize a Gmail API message
pub fn normalize_message(gmail_msg: GmailMessage) -> Result<Message> {
    if gmail_msg.id.trim().is_empty() || gmail_msg.thread_id.trim().is_empty() {
        anyhow::bail!("Gmail message is missing its id or thread id");
    }

    let payload = gmail_msg
        .payload
        .as_ref()
        .with_context(|| format!("Message {} has no payload", gmail_msg.id))?;

    let from = extract_header(payload, "From")
        .map(|s| EmailAddress::parse(&s))
        .unwrap_or_else(|| EmailAddress::new(UNKNOWN_SENDER));

    let to = extract_header(payload, "To")
        .map(|s| parse_address_list(&s))
        .unwrap_or_default();

    let subject = extract_header(payload, "Subject").unwrap_or_default();

    // internalDate is milliseconds since epoch
    let received_at = gmail_msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    let body_preview = if !gmail_msg.snippet.is_empty() {
        decode_html_entities(&gmail_msg.snippet)
    } else {
        extract_plain_text_body(payload)
            .map(|text| preview(&text))
            .unwrap_or_default()
    };

    Ok(Message::builder(MessageId::new(gmail_msg.id), ThreadId::new(gmail_msg.thread_id))
        .from(from)
        .to(to)
        .subject(subject)
        .body_preview(body_preview)
        .received_at(received_at)
        .label_ids(gmail_msg.label_ids.unwrap_or_default())
        .build())
}

/// Normalize a Calendar API event.
///
/// Instances of a recurring event join the series of their master;
/// single events form a series of one.
pub fn normalize_event(event: Event) -> Result<CalendarEvent> {
    let id = event
        .id
        .filter(|id| !id.trim().is_empty())
        .context("Calendar event has no id")?;

    let series_id = event
        .recurring_event_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| id.clone());

    let start = event.start.as_ref().and_then(parse_event_time);
    let end = event.end.as_ref().and_then(parse_event_time);
    let all_day = event
        .start
        .as_ref()
        .is_some_and(|t| t.date.is_some() && t.date_time.is_none());

    let updated_at = event
        .updated
        .as_deref()
        .and_then(parse_rfc3339)
        .with_context(|| format!("Calendar event {} has no updated timestamp", id))?;

    Ok(CalendarEvent {
        id: EventId::new(id),
        series_id: SeriesId::new(series_id),
        summary: event
            .summary
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "(no title)".to_string()),
        start_at: start,
        end_at: end,
        all_day,
        organizer_email: event.organizer.and_then(|o| o.email),
        status: EventStatus::parse(event.status.as_deref().unwrap_or("confirmed")),
        updated_at,
    })
}

/// Whether an event payload was created by the change it reports
pub(crate) fn is_new_event(event: &Event) -> bool {
    match (event.created.as_deref(), event.updated.as_deref()) {
        (Some(created), Some(updated)) => match (parse_rfc3339(created), parse_rfc3339(updated)) {
            (Some(c), Some(u)) => (u - c).num_seconds().abs() < 2,
            _ => false,
        },
        _ => false,
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// All-day events carry a bare date, timed events a full timestamp
fn parse_event_time(time: &EventTime) -> Option<DateTime<Utc>> {
    if let Some(date_time) = time.date_time.as_deref() {
        return parse_rfc3339(date_time);
    }
    let date = NaiveDate::parse_from_str(time.date.as_deref()?, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Extract a header value by name
fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_ref()?
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Parse a comma-separated list of email addresses
fn parse_address_list(s: &str) -> Vec<EmailAddress> {
    s.split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(EmailAddress::parse)
        .collect()
}

/// First text/plain body in the payload tree, falling back to any body
fn extract_plain_text_body(payload: &MessagePayload) -> Option<String> {
    if let Some(text) = find_plain_text(payload) {
        return Some(text);
    }
    payload
        .body
        .as_ref()
        .and_then(|b| b.data.as_deref())
        .and_then(decode_base64_body)
}

fn find_plain_text(part: &MessagePayload) -> Option<String> {
    if part
        .mime_type
        .as_deref()
        .is_some_and(|m| m.starts_with("text/plain"))
        && let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref())
        && let Some(text) = decode_base64_body(data)
    {
        return Some(text);
    }

    part.parts.as_ref()?.iter().find_map(find_plain_text)
}

fn preview(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(PREVIEW_CHARS).collect()
}

/// Decode base64-encoded body data.
///
/// Gmail uses URL-safe base64 but padding varies, so several decoders
/// are tried in turn.
fn decode_base64_body(data: &str) -> Option<String> {
    let decoders: [&base64::engine::GeneralPurpose; 4] = [
        &BASE64_URL_SAFE_NO_PAD,
        &BASE64_URL_SAFE,
        &BASE64_STANDARD,
        &BASE64_STANDARD_NO_PAD,
    ];

    decoders
        .iter()
        .find_map(|decoder| decoder.decode(data).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Decode the HTML entities Gmail leaves in snippets
fn decode_html_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
