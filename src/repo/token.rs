//! Short-lived repository access tokens.
//!
//! The bridge never persists tokens; it vends one per provisioning or
//! respawn and threads it into the fetch URL and the agent subprocess
//! environment. Two vendors exist: a static personal/installation token
//! from the environment, and a GitHub App vendor that signs an RS256 JWT
//! with the App's private key and exchanges it for an installation token,
//! cached until shortly before expiry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::BoxFuture;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::GithubConfig;
use crate::{AppError, Result};

/// Safety margin subtracted from an installation token's lifetime.
const EXPIRY_MARGIN_MINUTES: i64 = 5;

/// Vendor of short-lived repository access tokens.
pub trait TokenVendor: Send + Sync {
    /// Produce a currently valid token, or `None` when no code-hosting
    /// credentials are configured (anonymous access).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Auth`] when minting fails.
    fn access_token(&self) -> BoxFuture<'_, Result<Option<String>>>;
}

/// Build the vendor matching the configured credentials: App credentials
/// win over a static token; with neither, tokens are absent.
#[must_use]
pub fn vendor_from_config(github: &GithubConfig) -> std::sync::Arc<dyn TokenVendor> {
    if github.has_app_credentials() {
        if let (Some(app_id), Some(key), Some(installation)) = (
            github.app_id.clone(),
            github.private_key.clone(),
            github.installation_id.clone(),
        ) {
            return std::sync::Arc::new(InstallationTokenVendor::new(app_id, key, installation));
        }
    }
    std::sync::Arc::new(StaticTokenVendor::new(github.token.clone()))
}

// ── Static vendor ─────────────────────────────────────────────────────────────

/// Vendor backed by a fixed token from the environment (or none at all).
pub struct StaticTokenVendor {
    token: Option<String>,
}

impl StaticTokenVendor {
    /// Wrap an optional static token.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl TokenVendor for StaticTokenVendor {
    fn access_token(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }
}

// ── GitHub App vendor ─────────────────────────────────────────────────────────

/// JWT claims for a GitHub App authentication token.
#[derive(Debug, Serialize)]
struct AppClaims {
    /// Issued-at, backdated to absorb clock skew.
    iat: i64,
    /// Expiry; GitHub caps App JWTs at ten minutes.
    exp: i64,
    /// The App id.
    iss: String,
}

/// Wire shape of the installation-token response.
#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Vendor that mints GitHub App installation tokens on demand.
pub struct InstallationTokenVendor {
    app_id: String,
    private_key_pem: String,
    installation_id: String,
    api_base: String,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl InstallationTokenVendor {
    /// Create a vendor for the given App credentials.
    #[must_use]
    pub fn new(app_id: String, private_key_pem: String, installation_id: String) -> Self {
        Self::with_api_base(app_id, private_key_pem, installation_id, "https://api.github.com")
    }

    /// Create a vendor against a non-default API base (test seam).
    #[must_use]
    pub fn with_api_base(
        app_id: String,
        private_key_pem: String,
        installation_id: String,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            app_id,
            private_key_pem,
            installation_id,
            api_base: api_base.into(),
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    /// Sign the App JWT used to authenticate the token exchange.
    fn app_jwt(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 540,
            iss: self.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.private_key_pem.as_bytes())
            .map_err(|err| AppError::Auth(format!("invalid app private key: {err}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| AppError::Auth(format!("cannot sign app jwt: {err}")))
    }

    async fn mint(&self) -> Result<CachedToken> {
        let jwt = self.app_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, self.installation_id
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "acp-bridge")
            .send()
            .await
            .map_err(|err| AppError::Auth(format!("installation token request failed: {err}")))?;

        if !response.status().is_success() {
            return Err(AppError::Auth(format!(
                "installation token request returned {}",
                response.status()
            )));
        }

        let body: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|err| AppError::Auth(format!("bad installation token response: {err}")))?;

        debug!(expires_at = %body.expires_at, "minted installation token");
        Ok(CachedToken {
            token: body.token,
            expires_at: body.expires_at,
        })
    }
}

impl TokenVendor for InstallationTokenVendor {
    fn access_token(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let mut cached = self.cached.lock().await;
            let stale_after = Utc::now() + ChronoDuration::minutes(EXPIRY_MARGIN_MINUTES);
            if let Some(entry) = cached.as_ref() {
                if entry.expires_at > stale_after {
                    return Ok(Some(entry.token.clone()));
                }
            }

            let fresh = self.mint().await?;
            let token = fresh.token.clone();
            *cached = Some(fresh);
            Ok(Some(token))
        })
    }
}
