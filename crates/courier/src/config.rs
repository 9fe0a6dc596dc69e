//! Configuration loading for the sync engine
//!
//! OAuth client credentials are loaded from (in order of priority):
//! 1. Compile-time embedded credentials
//! 2. JSON file (Google Cloud Console format)
//! 3. Runtime environment variables
//!
//! Runtime settings come from `courier.json` in the config directory,
//! with `COURIER_*` environment variables taking precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fetch::SnapshotWindow;

/// Credentials filename in the Courier config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// Settings filename in the Courier config directory
const SETTINGS_FILE: &str = "courier.json";

/// OAuth client credentials for the Google APIs
#[derive(Debug, Clone)]
pub struct GoogleCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<ClientSection>,
    web: Option<ClientSection>,
}

#[derive(Deserialize)]
struct ClientSection {
    client_id: String,
    client_secret: String,
}

impl GoogleCredentials {
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let file: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(file);
        }

        Self::from_env()
    }

    /// Credentials baked in with
    /// `GOOGLE_CLIENT_ID=.. GOOGLE_CLIENT_SECRET=.. cargo build --release`
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;
        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }
        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(file)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(file)
    }

    fn from_credential_file(file: GoogleCredentialFile) -> Result<Self> {
        let section = file
            .installed
            .or(file.web)
            .context("Credentials file missing 'installed' or 'web' section")?;
        Ok(Self {
            client_id: section.client_id,
            client_secret: section.client_secret,
        })
    }

    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GOOGLE_CLIENT_ID")
            .context("GOOGLE_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GOOGLE_CLIENT_SECRET")
            .context("GOOGLE_CLIENT_SECRET environment variable not set")?;
        Ok(Self {
            client_id,
            client_secret,
        })
    }

    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}

/// Runtime settings for the daemon and every sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Address the webhook server binds to
    pub listen_addr: String,
    /// SQLite database; defaults to `courier.sqlite` in the config directory
    pub database_path: Option<PathBuf>,
    /// Full-snapshot window: how far back to look
    pub snapshot_days: u32,
    /// Full-snapshot window: hard cap on items fetched
    pub snapshot_max_items: usize,
    /// Per-call HTTP timeout
    pub http_timeout_secs: u64,
    /// Whole-run budget; checked before the cursor write
    pub max_run_secs: u64,
    /// Shared secret expected in `X-Goog-Channel-Token`
    pub calendar_channel_secret: Option<String>,
    /// Pub/Sub topic for Gmail `users.watch`
    pub pubsub_topic: Option<String>,
    /// Public base URL calendar channels deliver to
    pub webhook_base_url: Option<String>,
    /// Calendars followed per account
    pub calendar_ids: Vec<String>,
    /// Renew channels expiring within this window
    pub renewal_lead_secs: u64,
    /// Period of the renewal and catch-up loop
    pub renewal_interval_secs: u64,
    /// Requested lifetime of calendar channels
    pub channel_ttl_secs: u64,
    /// Delivery attempts above this are logged at warn
    pub delivery_attempt_warn: u32,
    /// Consecutive failed runs of a stream before the user is told; 0 never
    pub failure_notify_after: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
            database_path: None,
            snapshot_days: 7,
            snapshot_max_items: 500,
            http_timeout_secs: 30,
            max_run_secs: 300,
            calendar_channel_secret: None,
            pubsub_topic: None,
            webhook_base_url: None,
            calendar_ids: vec!["primary".to_string()],
            renewal_lead_secs: 24 * 3600,
            renewal_interval_secs: 3600,
            channel_ttl_secs: 7 * 24 * 3600,
            delivery_attempt_warn: 5,
            failure_notify_after: 5,
        }
    }
}

impl SyncSettings {
    /// Load `courier.json` from the config directory, then apply env overrides
    pub fn load() -> Result<Self> {
        let mut settings: SyncSettings = config::load_json_or_default(SETTINGS_FILE)?;
        settings.apply_env(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Load from an explicit file, then apply env overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings: SyncSettings = config::load_json_file(path)?;
        settings.apply_env(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Override fields from `COURIER_*` variables returned by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(name: &str, value: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", name, e))
        }

        if let Some(v) = lookup("COURIER_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = lookup("COURIER_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("COURIER_SNAPSHOT_DAYS") {
            self.snapshot_days = parsed("COURIER_SNAPSHOT_DAYS", v)?;
        }
        if let Some(v) = lookup("COURIER_SNAPSHOT_MAX_ITEMS") {
            self.snapshot_max_items = parsed("COURIER_SNAPSHOT_MAX_ITEMS", v)?;
        }
        if let Some(v) = lookup("COURIER_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parsed("COURIER_HTTP_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("COURIER_MAX_RUN_SECS") {
            self.max_run_secs = parsed("COURIER_MAX_RUN_SECS", v)?;
        }
        if let Some(v) = lookup("COURIER_CALENDAR_CHANNEL_SECRET") {
            self.calendar_channel_secret = Some(v);
        }
        if let Some(v) = lookup("COURIER_PUBSUB_TOPIC") {
            self.pubsub_topic = Some(v);
        }
        if let Some(v) = lookup("COURIER_WEBHOOK_BASE_URL") {
            self.webhook_base_url = Some(v.trim_end_matches('/').to_string());
        }
        if let Some(v) = lookup("COURIER_CALENDAR_IDS") {
            self.calendar_ids = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("COURIER_RENEWAL_LEAD_SECS") {
            self.renewal_lead_secs = parsed("COURIER_RENEWAL_LEAD_SECS", v)?;
        }
        if let Some(v) = lookup("COURIER_RENEWAL_INTERVAL_SECS") {
            self.renewal_interval_secs = parsed("COURIER_RENEWAL_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("COURIER_CHANNEL_TTL_SECS") {
            self.channel_ttl_secs = parsed("COURIER_CHANNEL_TTL_SECS", v)?;
        }
        if let Some(v) = lookup("COURIER_DELIVERY_ATTEMPT_WARN") {
            self.delivery_attempt_warn = parsed("COURIER_DELIVERY_ATTEMPT_WARN", v)?;
        }
        if let Some(v) = lookup("COURIER_FAILURE_NOTIFY_AFTER") {
            self.failure_notify_after = parsed("COURIER_FAILURE_NOTIFY_AFTER", v)?;
        }
        Ok(())
    }

    /// Resolved database path
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => config::config_path("courier.sqlite")
                .context("Could not determine config directory"),
        }
    }

    pub fn snapshot_window(&self) -> SnapshotWindow {
        SnapshotWindow {
            days: self.snapshot_days,
            max_items: self.snapshot_max_items,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.max_run_secs)
    }

    pub fn renewal_lead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.renewal_lead_secs as i64)
    }

    pub fn channel_ttl(&self) -> Duration {
        Duration::from_secs(self.channel_ttl_secs)
    }
}
