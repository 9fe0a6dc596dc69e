//! Periodic watch renewal and catch-up sync

use std::sync::Arc;
use std::time::Duration;

use courier::SyncService;
use log::{error, info};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Run [`SyncService::renew`] every `every` until `shutdown` flips.
///
/// The first pass runs immediately so a fresh daemon registers its
/// watches before any push can arrive.
pub async fn run_renewal_loop(
    service: Arc<SyncService>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Renewal loop running every {}s", every.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }

        let service = service.clone();
        match tokio::task::spawn_blocking(move || service.renew()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Renewal pass failed: {:#}", e),
            Err(e) => error!("Renewal pass panicked: {}", e),
        }
    }
    info!("Renewal loop stopped");
}
