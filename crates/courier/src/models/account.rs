//! Account model linking a Courier user to a Google mailbox

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a Courier user
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connected Google account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    /// Mailbox address; Gmail push notifications are addressed by it
    pub email: String,
    /// When the account was connected
    pub added_at: DateTime<Utc>,
    /// OAuth token data, JSON-serialized [`UserCredentials`].
    ///
    /// Encryption at rest is the job of the credential subsystem; this
    /// field only ever holds what it hands us.
    pub token_data: Option<String>,
}

impl Account {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            email: email.into().to_lowercase(),
            added_at: Utc::now(),
            token_data: None,
        }
    }

    pub fn with_credentials(mut self, credentials: &UserCredentials) -> Result<Self> {
        self.token_data = Some(
            serde_json::to_string(credentials).context("Failed to serialize credentials")?,
        );
        Ok(self)
    }

    /// Decode the stored token data, if any
    pub fn credentials(&self) -> Option<UserCredentials> {
        self.token_data
            .as_deref()
            .and_then(|data| serde_json::from_str(data).ok())
    }
}

/// Decrypted OAuth credentials for a single user
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) when `access_token` expires
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl UserCredentials {
    /// Whether the access token is usable for at least `margin_secs` more seconds
    pub fn is_fresh(&self, margin_secs: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at > Utc::now().timestamp() + margin_secs)
    }
}

impl std::fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_is_normalized() {
        let account = Account::new("u1", "Alice@Example.COM");
        assert_eq!(account.email, "alice@example.com");
    }

    #[test]
    fn test_credentials_round_trip_through_token_data() {
        let creds = UserCredentials {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: Some(42),
        };
        let account = Account::new("u1", "a@example.com").with_credentials(&creds).unwrap();
        assert_eq!(account.credentials(), Some(creds));
        assert!(account.token_data.is_some());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let creds = UserCredentials {
            access_token: "secret-access".into(),
            refresh_token: Some("secret-refresh".into()),
            expires_at: None,
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
    }

    #[test]
    fn test_is_fresh() {
        let mut creds = UserCredentials {
            access_token: "at".into(),
            refresh_token: None,
            expires_at: Some(Utc::now().timestamp() + 3600),
        };
        assert!(creds.is_fresh(300));
        creds.expires_at = Some(Utc::now().timestamp() + 60);
        assert!(!creds.is_fresh(300));
        creds.expires_at = None;
        assert!(!creds.is_fresh(0));
    }
}
