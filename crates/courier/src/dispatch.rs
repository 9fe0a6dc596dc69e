//! Push notification dispatch
//!
//! Resolves a push to its stream, drops stale redeliveries, and hands out
//! at most one [`RunTicket`] per stream at a time. A push that arrives
//! while a run is in flight is coalesced into a single follow-up run.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::debug;

use crate::models::{PushEvent, PushSource, ResourceState, StreamKey, marker_is_newer};
use crate::storage::{AccountStore, ChannelStore, CursorStore};

/// Why a push did not start a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No account or channel maps to the push; treated like a stale event
    UnknownTarget,
    /// The push's marker is not newer than what we already have
    Stale,
    /// Calendar `sync` handshake, carries no change
    Handshake,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropReason::UnknownTarget => "unknown target",
            DropReason::Stale => "stale",
            DropReason::Handshake => "handshake",
        })
    }
}

#[derive(Debug)]
pub enum DispatchDecision {
    Dropped(DropReason),
    /// A run for the stream is already in flight; it will run once more
    Coalesced(StreamKey),
    Start(RunTicket),
}

/// State of a stream with a run in flight
#[derive(Debug)]
struct Slot {
    /// Newest push marker accepted for this run
    marker: Option<String>,
    rerun: bool,
}

type InFlight = Arc<Mutex<HashMap<StreamKey, Slot>>>;

/// Exclusive right to run one stream.
///
/// Released on [`finish`](RunTicket::finish) or drop, including when the
/// run panics or errors out.
#[derive(Debug)]
pub struct RunTicket {
    stream: StreamKey,
    in_flight: InFlight,
    released: bool,
    /// Stored cursor when the push was accepted (diagnostics only)
    pub previous_marker: Option<String>,
    /// Marker carried by the push (diagnostics only)
    pub pushed_marker: Option<String>,
}

impl RunTicket {
    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }

    /// Finish a run. Returns `true` if pushes arrived meanwhile, in which
    /// case the ticket stays held and the caller should run again.
    pub fn finish(&mut self) -> bool {
        if self.released {
            return false;
        }
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(slot) = in_flight.get_mut(&self.stream)
            && slot.rerun
        {
            slot.rerun = false;
            return true;
        }
        in_flight.remove(&self.stream);
        self.released = true;
        false
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        if !self.released
            && let Ok(mut in_flight) = self.in_flight.lock()
        {
            in_flight.remove(&self.stream);
        }
    }
}

/// Turns push events into at most one run per stream
#[derive(Debug, Default, Clone)]
pub struct NotificationDispatcher {
    in_flight: InFlight,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what a push event should do.
    ///
    /// The event's payload is only compared against stored state; it is
    /// never applied as content.
    pub fn on_push_event<S>(&self, store: &S, event: &PushEvent) -> Result<DispatchDecision>
    where
        S: AccountStore + ChannelStore + CursorStore + ?Sized,
    {
        let (stream, previous, pushed) = match &event.source {
            PushSource::Gmail {
                email_address,
                history_id,
            } => {
                let Some(account) = store.find_account_by_email(email_address)? else {
                    return Ok(self.drop_event(event, DropReason::UnknownTarget));
                };
                let stream = StreamKey::email(account.user_id.as_str(), &account.email);
                let stored = store.get_cursor(&stream)?.and_then(|c| c.token);
                if !marker_is_newer(stream.kind, history_id, stored.as_deref()) {
                    return Ok(self.drop_event(event, DropReason::Stale));
                }
                (stream, stored, Some(history_id.clone()))
            }
            PushSource::Calendar {
                channel_id,
                resource_state,
                message_number,
                ..
            } => {
                if *resource_state == ResourceState::Sync {
                    return Ok(self.drop_event(event, DropReason::Handshake));
                }
                let Some(channel) = store.get_channel(channel_id)? else {
                    return Ok(self.drop_event(event, DropReason::UnknownTarget));
                };
                // Sync tokens are unordered; the channel's message number is not
                if let Some(number) = message_number
                    && !store.record_message_number(channel_id, *number)?
                {
                    return Ok(self.drop_event(event, DropReason::Stale));
                }
                let stored = store.get_cursor(&channel.stream)?.and_then(|c| c.token);
                (channel.stream, stored, message_number.map(|n| n.to_string()))
            }
        };

        Ok(match self.claim(&stream, pushed.as_deref()) {
            Some(mut ticket) => {
                ticket.previous_marker = previous;
                ticket.pushed_marker = pushed;
                DispatchDecision::Start(ticket)
            }
            None => {
                debug!("Coalesced push for {} into the running sync", stream);
                DispatchDecision::Coalesced(stream)
            }
        })
    }

    /// Claim a stream for a run not triggered by a push (catch-up, CLI).
    ///
    /// Returns `None` and requests a follow-up run if one is in flight.
    pub fn try_begin(&self, stream: &StreamKey) -> Option<RunTicket> {
        self.claim(stream, None)
    }

    /// Take the stream, or fold `marker` into the run already holding it.
    ///
    /// A follow-up run is requested unless the marker is known not to be
    /// newer than one the in-flight run already accepted.
    fn claim(&self, stream: &StreamKey, marker: Option<&str>) -> Option<RunTicket> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(slot) = in_flight.get_mut(stream) {
            let newer = match marker {
                Some(marker) if stream.kind.has_ordered_cursors() => {
                    marker_is_newer(stream.kind, marker, slot.marker.as_deref())
                }
                _ => true,
            };
            if newer {
                slot.rerun = true;
                if let Some(marker) = marker {
                    slot.marker = Some(marker.to_string());
                }
            }
            return None;
        }
        in_flight.insert(
            stream.clone(),
            Slot {
                marker: marker.map(str::to_string),
                rerun: false,
            },
        );
        Some(RunTicket {
            stream: stream.clone(),
            in_flight: Arc::clone(&self.in_flight),
            released: false,
            previous_marker: None,
            pushed_marker: None,
        })
    }

    pub fn is_running(&self, stream: &StreamKey) -> bool {
        self.in_flight.lock().unwrap().contains_key(stream)
    }

    fn drop_event(&self, event: &PushEvent, reason: DropReason) -> DispatchDecision {
        debug!("Dropped push {:?}: {}", event.source, reason);
        DispatchDecision::Dropped(reason)
    }
}
