//! courierd - Gmail and Google Calendar sync daemon
//!
//! `serve` runs the webhook server and the renewal loop; `sync` and
//! `renew` do a single pass and exit, for cron or workflow callers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier::google::GoogleOAuth;
use courier::models::{Account, UserCredentials, UserId};
use courier::storage::{AccountStore, SqliteStore};
use courier::{GoogleCredentials, SyncService, SyncSettings, SyncStore};
use log::{error, info, warn};

mod heuristics;
mod renewal;
mod server;

use heuristics::{HeuristicClassifier, LogNotifier};

#[derive(Parser)]
#[command(name = "courierd", about = "Incremental Gmail and Calendar sync daemon")]
struct Cli {
    /// Settings file (default: courier.json in the config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Google OAuth client file (Cloud Console `installed`/`web` format)
    #[arg(long, global = true)]
    credentials: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve webhooks and renew watches until interrupted
    Serve,
    /// Sync every stream once
    Sync {
        /// Only this user's streams
        #[arg(long)]
        user: Option<String>,
    },
    /// Renew expiring watches and catch up stale streams once
    Renew,
    /// Register an account with a refresh token
    AddAccount {
        user: String,
        email: String,
        #[arg(long)]
        refresh_token: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    if let Err(e) = run(Cli::parse()) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => SyncSettings::load_from(path)?,
        None => SyncSettings::load()?,
    };
    let db_path = settings.database_path()?;
    let store: Arc<dyn SyncStore> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?,
    );
    info!("Using database {}", db_path.display());

    let credentials = match &cli.credentials {
        Some(path) => Some(GoogleCredentials::from_file(path)?),
        None => None,
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::AddAccount {
            user,
            email,
            refresh_token,
        } => add_account(&*store, &user, &email, &refresh_token),
        Command::Serve => serve(build_service(store, settings, credentials)),
        Command::Sync { user } => {
            sync_once(&build_service(store, settings, credentials), user.as_deref())
        }
        Command::Renew => {
            let summary = build_service(store, settings, credentials).renew()?;
            if summary.renewal_failures + summary.sync_failures > 0 {
                anyhow::bail!("renewal pass had failures: {:?}", summary);
            }
            Ok(())
        }
    }
}

fn build_service(
    store: Arc<dyn SyncStore>,
    settings: SyncSettings,
    credentials: Option<GoogleCredentials>,
) -> SyncService {
    let service = SyncService::new(
        store,
        settings,
        Arc::new(HeuristicClassifier::default()),
        Arc::new(LogNotifier),
    );

    match credentials.map_or_else(GoogleCredentials::load, Ok) {
        Ok(creds) => {
            let oauth = GoogleOAuth::new(creds, service.agent().clone());
            service.with_oauth(oauth)
        }
        Err(e) => {
            warn!("Google OAuth credentials not found, tokens will not refresh: {}", e);
            if let Some(path) = GoogleCredentials::default_credentials_path() {
                warn!(
                    "To enable token refresh, either:\n\
                     1. Place your Google OAuth credentials at: {}\n\
                     2. Or set environment variables: GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET",
                    path.display()
                );
            }
            service
        }
    }
}

fn add_account(store: &dyn SyncStore, user: &str, email: &str, refresh_token: &str) -> Result<()> {
    let credentials = UserCredentials {
        access_token: String::new(),
        refresh_token: Some(refresh_token.to_string()),
        expires_at: Some(0),
    };
    store.upsert_account(Account::new(user, email).with_credentials(&credentials)?)?;
    info!("Added account {} ({})", user, email);
    Ok(())
}

fn sync_once(service: &SyncService, user: Option<&str>) -> Result<()> {
    let results = match user {
        None => service.sync_all()?,
        Some(user) => {
            let account = service
                .store()
                .get_account(&UserId::new(user))?
                .with_context(|| format!("Unknown user: {}", user))?;
            service
                .streams_for(&account)
                .into_iter()
                .map(|stream| {
                    let result = service.sync_stream(&stream);
                    (stream, result)
                })
                .collect()
        }
    };

    let mut failures = 0;
    for (stream, result) in results {
        match result {
            Ok(Some(report)) => info!(
                "{}: {:?}, {} records, cursor {}",
                stream, report.mode, report.records, report.cursor
            ),
            Ok(None) => info!("{}: already running", stream),
            Err(e) => {
                error!("{}: {}", stream, e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} stream(s) failed to sync", failures);
    }
    Ok(())
}

fn serve(service: SyncService) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async move {
        let service = Arc::new(service);
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
            }
            let _ = shutdown_tx.send(true);
        });

        let every = std::time::Duration::from_secs(service.settings().renewal_interval_secs.max(60));
        let renewal = tokio::spawn(renewal::run_renewal_loop(
            service.clone(),
            every,
            shutdown_rx.clone(),
        ));

        let result = server::run_server(service, shutdown_rx).await;
        if let Err(e) = renewal.await {
            warn!("Renewal loop ended abnormally: {}", e);
        }
        result
    })
}
