//! OAuth2 token refresh and per-user credentials
//!
//! Clients never hold process-wide tokens. Each run resolves a
//! [`UserAuth`] from the user's stored credentials, refreshing them
//! first if they are about to expire.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::config::GoogleCredentials;
use crate::error::AuthExpiredError;
use crate::models::{UserCredentials, UserId};
use crate::storage::AccountStore;

/// Refresh tokens expiring within this many seconds
const REFRESH_MARGIN_SECS: i64 = 300;

/// Supplies decrypted per-user credentials and takes back refreshed ones
pub trait CredentialSource: Send + Sync {
    fn get_decrypted_credentials(&self, user: &UserId) -> Result<UserCredentials>;

    fn store_refreshed_credentials(&self, user: &UserId, credentials: &UserCredentials)
    -> Result<()>;
}

impl<T: AccountStore + ?Sized> CredentialSource for T {
    fn get_decrypted_credentials(&self, user: &UserId) -> Result<UserCredentials> {
        let account = self
            .get_account(user)?
            .ok_or_else(|| anyhow::anyhow!("No account for user {}", user))?;
        match account.credentials() {
            Some(credentials) => Ok(credentials),
            None => Err(AuthExpiredError {
                user_id: user.to_string(),
            }
            .into()),
        }
    }

    fn store_refreshed_credentials(
        &self,
        user: &UserId,
        credentials: &UserCredentials,
    ) -> Result<()> {
        self.update_credentials(user, credentials)
    }
}

/// Token response from Google
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Error body from the token endpoint
#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// Whether a token-endpoint failure means the grant is gone for good
fn is_revoked_grant(status: u16, error: Option<&str>) -> bool {
    matches!(status, 400 | 401) && error == Some("invalid_grant")
}

/// OAuth2 client used to refresh user access tokens
pub struct GoogleOAuth {
    credentials: GoogleCredentials,
    agent: ureq::Agent,
}

impl GoogleOAuth {
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    pub fn new(credentials: GoogleCredentials, agent: ureq::Agent) -> Self {
        Self { credentials, agent }
    }

    /// Exchange a refresh token for a fresh access token.
    ///
    /// A revoked or invalid refresh token yields [`AuthExpiredError`].
    pub fn refresh_access_token(
        &self,
        user: &UserId,
        refresh_token: &str,
    ) -> Result<UserCredentials> {
        let mut response = self
            .agent
            .post(Self::TOKEN_URL)
            .config()
            .http_status_as_error(false)
            .build()
            .send_form([
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .context("Failed to refresh access token")?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body: TokenErrorResponse = response.body_mut().read_json().unwrap_or_default();
            if is_revoked_grant(status, body.error.as_deref()) {
                warn!("Refresh token for {} was revoked", user);
                return Err(AuthExpiredError {
                    user_id: user.to_string(),
                }
                .into());
            }
            anyhow::bail!(
                "Token refresh failed ({}): {}",
                status,
                body.error_description
                    .or(body.error)
                    .unwrap_or_else(|| "no details".to_string())
            );
        }

        let token: TokenResponse = response
            .body_mut()
            .read_json()
            .context("Failed to parse refresh token response")?;

        Ok(UserCredentials {
            access_token: token.access_token,
            // Google only returns a refresh token on first consent
            refresh_token: token.refresh_token.or_else(|| Some(refresh_token.to_string())),
            expires_at: token
                .expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs as i64),
        })
    }
}

/// A user's access token, resolved for one run
#[derive(Clone)]
pub struct UserAuth {
    user_id: UserId,
    access_token: String,
}

impl UserAuth {
    /// Wrap an access token that is known to be valid
    pub fn new(user_id: UserId, access_token: impl Into<String>) -> Self {
        Self {
            user_id,
            access_token: access_token.into(),
        }
    }

    /// Load the user's credentials, refreshing them if they are stale
    pub fn resolve<C: CredentialSource + ?Sized>(
        user: &UserId,
        source: &C,
        oauth: Option<&GoogleOAuth>,
    ) -> Result<Self> {
        let credentials = source.get_decrypted_credentials(user)?;

        if credentials.is_fresh(REFRESH_MARGIN_SECS) {
            return Ok(Self::new(user.clone(), credentials.access_token));
        }

        if let Some(refresh_token) = credentials.refresh_token.as_deref()
            && let Some(oauth) = oauth
        {
            debug!("Refreshing access token for {}", user);
            let refreshed = oauth.refresh_access_token(user, refresh_token)?;
            source.store_refreshed_credentials(user, &refreshed)?;
            info!("Refreshed access token for {}", user);
            return Ok(Self::new(user.clone(), refreshed.access_token));
        }

        // No expiry recorded: let the provider judge the token
        if credentials.expires_at.is_none() {
            return Ok(Self::new(user.clone(), credentials.access_token));
        }

        Err(AuthExpiredError {
            user_id: user.to_string(),
        }
        .into())
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub(crate) fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl std::fmt::Debug for UserAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserAuth")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}
