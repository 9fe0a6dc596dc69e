//! Sync service facade
//!
//! The single entry point for the three ways a run starts: a webhook
//! push, a one-shot sync command, and the periodic renewal loop. All of
//! them go through the dispatcher's per-stream tickets and the same
//! orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use log::{debug, info, warn};

use crate::config::SyncSettings;
use crate::dispatch::{DispatchDecision, DropReason, NotificationDispatcher, RunTicket};
use crate::effects::{Classifier, Notifier, PostSyncEffects};
use crate::error::SyncError;
use crate::fetch::{CalendarFetcher, ChangeFetcher, GmailFetcher};
use crate::google::{CalendarClient, GmailClient, GoogleOAuth, UserAuth, http_agent};
use crate::models::{Account, PushEvent, StreamKey, StreamKind, UserId};
use crate::storage::{AccountStore, CursorStore, SyncStore};
use crate::sync::timing::cooldown_elapsed;
use crate::sync::{SyncOrchestrator, SyncPhase, SyncReport};
use crate::watch::{CalendarWatch, GmailWatch, WatchApi, WatchRenewer};

/// What a push led to
#[derive(Debug)]
pub enum PushOutcome {
    Dropped(DropReason),
    /// Folded into a run already in flight
    Coalesced,
    Synced(SyncReport),
}

/// Counters from one renewal pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenewalSummary {
    pub renewed: usize,
    pub renewal_failures: usize,
    pub synced: usize,
    pub sync_failures: usize,
}

pub struct SyncService {
    store: Arc<dyn SyncStore>,
    settings: SyncSettings,
    agent: ureq::Agent,
    oauth: Option<GoogleOAuth>,
    classifier: Arc<dyn Classifier>,
    notifier: Arc<dyn Notifier>,
    dispatcher: NotificationDispatcher,
    /// Consecutive failed runs per stream
    failures: Mutex<HashMap<StreamKey, u32>>,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn SyncStore>,
        settings: SyncSettings,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let agent = http_agent(settings.http_timeout());
        Self {
            store,
            settings,
            agent,
            oauth: None,
            classifier,
            notifier,
            dispatcher: NotificationDispatcher::new(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Enables access-token refresh
    pub fn with_oauth(mut self, oauth: GoogleOAuth) -> Self {
        self.oauth = Some(oauth);
        self
    }

    pub fn store(&self) -> &dyn SyncStore {
        &*self.store
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    /// HTTP agent shared by every client this service builds
    pub fn agent(&self) -> &ureq::Agent {
        &self.agent
    }

    /// Streams followed for an account: its mailbox and configured calendars
    pub fn streams_for(&self, account: &Account) -> Vec<StreamKey> {
        let user = account.user_id.as_str();
        let mut streams = vec![StreamKey::email(user, &account.email)];
        streams.extend(
            self.settings
                .calendar_ids
                .iter()
                .map(|calendar_id| StreamKey::calendar(user, calendar_id)),
        );
        streams
    }

    // === Entry points ===

    /// Handle one decoded webhook delivery
    pub fn handle_push(&self, event: &PushEvent) -> Result<PushOutcome, SyncError> {
        if let Some(attempt) = event.delivery_attempt {
            if attempt > self.settings.delivery_attempt_warn {
                warn!("Push {:?} redelivered {} times", event.source, attempt);
            } else {
                debug!("Push {:?} delivery attempt {}", event.source, attempt);
            }
        }

        let decision = self
            .dispatcher
            .on_push_event(&*self.store, event)
            .map_err(|e| SyncError::Storage {
                phase: SyncPhase::Deciding,
                source: e,
            })?;

        match decision {
            DispatchDecision::Dropped(reason) => Ok(PushOutcome::Dropped(reason)),
            DispatchDecision::Coalesced(_) => Ok(PushOutcome::Coalesced),
            DispatchDecision::Start(ticket) => {
                debug!(
                    "Push for {}: {} -> {}",
                    ticket.stream(),
                    ticket.previous_marker.as_deref().unwrap_or("none"),
                    ticket.pushed_marker.as_deref().unwrap_or("?")
                );
                self.run_ticket(ticket).map(PushOutcome::Synced)
            }
        }
    }

    /// Sync one stream now. `Ok(None)` if a run was already in flight;
    /// that run will go once more instead.
    pub fn sync_stream(&self, stream: &StreamKey) -> Result<Option<SyncReport>, SyncError> {
        match self.dispatcher.try_begin(stream) {
            Some(ticket) => self.run_ticket(ticket).map(Some),
            None => {
                debug!("Sync for {} already running, coalesced", stream);
                Ok(None)
            }
        }
    }

    /// Sync every stream of every account, continuing past failures
    pub fn sync_all(&self) -> Result<Vec<(StreamKey, Result<Option<SyncReport>, SyncError>)>> {
        let mut results = Vec::new();
        for account in self.store.list_accounts()? {
            for stream in self.streams_for(&account) {
                let result = self.sync_stream(&stream);
                results.push((stream, result));
            }
        }
        Ok(results)
    }

    /// Renew expiring watch channels, then catch up streams that have not
    /// synced within the renewal interval
    pub fn renew(&self) -> Result<RenewalSummary> {
        let mut summary = RenewalSummary::default();
        let renewer = WatchRenewer::new(
            &*self.store,
            self.settings.renewal_lead(),
            self.settings.channel_ttl(),
        )
        .with_token(self.settings.calendar_channel_secret.clone());
        let now = Utc::now();

        for account in self.store.list_accounts()? {
            for stream in self.streams_for(&account) {
                if renewer.needs_renewal(&stream, now)? {
                    match self.watch_api_for(&stream) {
                        Ok(Some(api)) => match renewer.renew(&stream, api.as_ref()) {
                            Ok(_) => summary.renewed += 1,
                            Err(e) => {
                                warn!("Watch renewal failed for {}: {:#}", stream, e);
                                summary.renewal_failures += 1;
                            }
                        },
                        Ok(None) => debug!("Push not configured for {}, skipping watch", stream),
                        Err(e) => {
                            warn!("Cannot build watch client for {}: {:#}", stream, e);
                            summary.renewal_failures += 1;
                        }
                    }
                }

                let last_synced = self.store.get_cursor(&stream)?.map(|c| c.updated_at);
                if !cooldown_elapsed(last_synced, self.settings.renewal_interval_secs) {
                    continue;
                }
                match self.sync_stream(&stream) {
                    Ok(Some(_)) => summary.synced += 1,
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Catch-up sync failed for {}: {}", stream, e);
                        summary.sync_failures += 1;
                    }
                }
            }
        }

        info!(
            "Renewal pass: {} renewed ({} failed), {} caught up ({} failed)",
            summary.renewed, summary.renewal_failures, summary.synced, summary.sync_failures
        );
        Ok(summary)
    }

    /// Run `stream` against an explicit fetcher, with effects and
    /// failure notifications. Does not take a dispatcher ticket.
    pub fn run_with(
        &self,
        stream: &StreamKey,
        fetcher: &dyn ChangeFetcher,
    ) -> Result<SyncReport, SyncError> {
        let effects = self.effects();
        let result = SyncOrchestrator::new(&*self.store)
            .with_observer(&effects)
            .with_window(self.settings.snapshot_window())
            .with_max_run(self.settings.max_run_duration())
            .run(stream, fetcher);
        self.after_run(stream, result)
    }

    // === Internals ===

    fn run_ticket(&self, mut ticket: RunTicket) -> Result<SyncReport, SyncError> {
        let stream = ticket.stream().clone();
        loop {
            let report = self.run_stream(&stream)?;
            if !ticket.finish() {
                return Ok(report);
            }
            debug!("New pushes for {} arrived during the run, syncing again", stream);
        }
    }

    fn run_stream(&self, stream: &StreamKey) -> Result<SyncReport, SyncError> {
        match self.fetcher_for(stream) {
            Ok(fetcher) => self.run_with(stream, fetcher.as_ref()),
            Err(e) => {
                let err = SyncError::from_provider(SyncPhase::Deciding, e);
                self.after_run(stream, Err(err))
            }
        }
    }

    fn after_run(
        &self,
        stream: &StreamKey,
        result: Result<SyncReport, SyncError>,
    ) -> Result<SyncReport, SyncError> {
        let err = match &result {
            Ok(_) => {
                self.failures.lock().unwrap().remove(stream);
                return result;
            }
            Err(err) => err,
        };
        if err.is_user_actionable() {
            self.effects().notify_reconnect(&stream.user_id);
            return result;
        }

        let failures = {
            let mut counts = self.failures.lock().unwrap();
            let count = counts.entry(stream.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let threshold = self.settings.failure_notify_after;
        if threshold > 0 && failures == threshold {
            warn!("{} failed {} runs in a row, notifying user", stream, failures);
            self.effects()
                .notify_sync_failing(stream, failures, &err.to_string());
        }
        result
    }

    fn effects(&self) -> PostSyncEffects<'_, dyn SyncStore> {
        PostSyncEffects::new(&*self.store, &*self.classifier, &*self.notifier)
    }

    fn user_auth(&self, user: &UserId) -> Result<UserAuth> {
        UserAuth::resolve(user, &*self.store, self.oauth.as_ref())
    }

    /// Run-scoped fetcher carrying the stream owner's credentials
    fn fetcher_for(&self, stream: &StreamKey) -> Result<Box<dyn ChangeFetcher>> {
        let auth = self.user_auth(&stream.user_id)?;
        let fetcher: Box<dyn ChangeFetcher> = match stream.kind {
            StreamKind::Email => Box::new(GmailFetcher::new(GmailClient::new(
                self.agent.clone(),
                auth,
            ))),
            StreamKind::Calendar => Box::new(CalendarFetcher::new(CalendarClient::new(
                self.agent.clone(),
                auth,
                &stream.stream_id,
            ))),
        };
        Ok(fetcher)
    }

    /// `None` when push delivery for this kind of stream is not configured
    fn watch_api_for(&self, stream: &StreamKey) -> Result<Option<Box<dyn WatchApi>>> {
        Ok(match stream.kind {
            StreamKind::Email => match &self.settings.pubsub_topic {
                Some(topic) => {
                    let client = GmailClient::new(self.agent.clone(), self.user_auth(&stream.user_id)?);
                    let api: Box<dyn WatchApi> = Box::new(GmailWatch::new(client, topic));
                    Some(api)
                }
                None => None,
            },
            StreamKind::Calendar => match &self.settings.webhook_base_url {
                Some(base) => {
                    let client = CalendarClient::new(
                        self.agent.clone(),
                        self.user_auth(&stream.user_id)?,
                        &stream.stream_id,
                    );
                    let address = format!("{}/webhooks/calendar", base.trim_end_matches('/'));
                    let api: Box<dyn WatchApi> = Box::new(CalendarWatch::new(
                        client,
                        address,
                        self.settings.calendar_channel_secret.clone(),
                    ));
                    Some(api)
                }
                None => None,
            },
        })
    }
}
