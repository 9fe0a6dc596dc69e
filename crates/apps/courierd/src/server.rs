//! Webhook HTTP server
//!
//! Handlers only decode and acknowledge; the sync itself runs on the
//! blocking pool so Pub/Sub and Calendar see a fast response.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use courier::models::{PushEvent, ResourceState};
use courier::webhook::{
    CalendarHeaders, HEADER_DELIVERY_ATTEMPT, decode_gmail_push, verify_calendar_token,
};
use courier::{PushOutcome, SyncService};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task;

#[derive(Clone)]
struct AppState {
    service: Arc<SyncService>,
}

pub async fn run_server(service: Arc<SyncService>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = service
        .settings()
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", service.settings().listen_addr))?;

    let app = router(AppState { service });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Webhook server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Webhook server failed")
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/gmail", post(gmail_webhook))
        .route("/webhooks/calendar", post(calendar_webhook))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Gmail Pub/Sub push. Always acknowledged: a body we cannot decode will
/// not decode on redelivery either.
async fn gmail_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let attempt = header_value(&headers, HEADER_DELIVERY_ATTEMPT).and_then(|v| v.trim().parse().ok());
    match decode_gmail_push(&body, attempt) {
        Ok(event) => spawn_push(state.service, event),
        Err(e) => warn!("Ignoring malformed Gmail push: {:#}", e),
    }
    StatusCode::OK
}

/// Calendar channel notification, described entirely by headers
async fn calendar_webhook(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let parsed = match CalendarHeaders::from_lookup(|name| header_value(&headers, name)) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Rejecting calendar push: {:#}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    let service = state.service.clone();
    let checked = parsed.clone();
    let verified = task::spawn_blocking(move || {
        let secret = service.settings().calendar_channel_secret.clone();
        verify_calendar_token(service.store(), &checked, secret.as_deref())
    })
    .await;
    match verified {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            warn!("Calendar push for channel {} has a bad token", parsed.channel_id);
            return StatusCode::UNAUTHORIZED;
        }
        Ok(Err(e)) => {
            error!("Cannot verify calendar push for {}: {:#}", parsed.channel_id, e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        Err(e) => {
            error!("Calendar token check panicked: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }

    let event = match parsed.to_push_event() {
        Ok(event) => event,
        Err(e) => {
            warn!("Rejecting calendar push: {:#}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    if ResourceState::parse(&parsed.resource_state) == Some(ResourceState::Sync) {
        debug!("Calendar channel {} handshake", parsed.channel_id);
        return StatusCode::OK;
    }

    spawn_push(state.service, event);
    StatusCode::OK
}

fn spawn_push(service: Arc<SyncService>, event: PushEvent) {
    task::spawn_blocking(move || match service.handle_push(&event) {
        Ok(PushOutcome::Synced(report)) => debug!(
            "Push for {} synced {} records",
            report.stream, report.records
        ),
        Ok(PushOutcome::Coalesced) => debug!("Push {:?} coalesced", event.source),
        Ok(PushOutcome::Dropped(reason)) => debug!("Push {:?} dropped: {}", event.source, reason),
        Err(e) => warn!("Push {:?} sync failed: {}", event.source, e),
    });
}
