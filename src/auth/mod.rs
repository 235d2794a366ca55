//! Module dedicated to OAuth 2.0 authentication.
//!
//! Two providers share the [`Authorizer`] interface: Google (the
//! authorization code grant with a loopback redirect, see [`gmail`])
//! and Microsoft (the device code grant, see [`outlook`]). Token
//! triples persist to an owner-only JSON file; access tokens are
//! refreshed preemptively five minutes before expiry.

pub mod gmail;
pub mod outlook;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors related to OAuth 2.0 authentication.
#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication setup required: no persisted token at {}, run with --auth-setup", .0.display())]
    SetupRequiredError(PathBuf),
    #[error("cannot refresh access token: {0}")]
    RefreshTokenError(String),
    #[error("cannot refresh access token: no refresh token persisted")]
    MissingRefreshTokenError,
    #[error("token has been revoked")]
    RevokedError,
    #[error("cannot reach the token endpoint")]
    TokenEndpointError(#[source] reqwest::Error),
    #[error("cannot decode the token endpoint response")]
    DecodeTokenResponseError(#[source] reqwest::Error),
    #[error("cannot build authorization url")]
    BuildAuthUrlError(#[source] oauth2::url::ParseError),
    #[error("authorization redirect carried an unexpected state parameter")]
    InvalidStateError,
    #[error("authorization redirect carried no code parameter")]
    MissingCodeError,
    #[error("cannot wait for the authorization redirect")]
    WaitForRedirectError(#[source] std::io::Error),
    #[error("device code expired before the user completed authorization")]
    DeviceCodeExpiredError,
    #[error("device authorization was declined")]
    DeviceCodeDeclinedError,
    #[error("cannot read token file {}", .1.display())]
    ReadTokenFileError(#[source] std::io::Error, PathBuf),
    #[error("cannot write token file {}", .1.display())]
    WriteTokenFileError(#[source] std::io::Error, PathBuf),
    #[error("cannot decode token file {}", .1.display())]
    DecodeTokenFileError(#[source] serde_json::Error, PathBuf),
    #[error("missing oauth2 client configuration: {0}")]
    MissingClientConfigError(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Window before expiry in which the access token is refreshed
/// preemptively.
const REFRESH_WINDOW_SECS: i64 = 5 * 60;

/// A persisted token triple.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenSet {
    /// Whether the access token must be refreshed: less than five
    /// minutes of validity left, or no expiry information at all.
    pub fn needs_refresh(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() + ChronoDuration::seconds(REFRESH_WINDOW_SECS) >= expires_at,
            None => true,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::SetupRequiredError(path.to_owned()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::ReadTokenFileError(err, path.to_owned()))?;
        serde_json::from_str(&raw).map_err(|err| Error::DecodeTokenFileError(err, path.to_owned()))
    }

    /// Persists the token set with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| Error::WriteTokenFileError(err, path.to_owned()))?;
        }
        let raw = serde_json::to_string_pretty(self)
            .expect("token set serialization cannot fail");
        std::fs::write(path, raw)
            .map_err(|err| Error::WriteTokenFileError(err, path.to_owned()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)
                .map_err(|err| Error::WriteTokenFileError(err, path.to_owned()))?;
        }

        debug!("token set saved to {}", path.display());
        Ok(())
    }

    pub fn delete(path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)
                .map_err(|err| Error::WriteTokenFileError(err, path.to_owned()))?;
            info!("token file {} deleted", path.display());
        }
        Ok(())
    }
}

/// The provider-independent authentication interface.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Acquires and persists an initial token triple interactively.
    async fn interactive_setup(&self) -> Result<TokenSet>;

    /// Returns a current, non-expired access token, refreshing and
    /// persisting first when within the refresh window.
    async fn access_token(&self) -> Result<String>;

    /// Forces a refresh regardless of expiry, persisting the result.
    async fn refresh(&self) -> Result<String>;

    /// Revokes the persisted credentials.
    async fn revoke(&self) -> Result<()>;

    /// Operator-facing summary of the persisted credentials.
    async fn info(&self) -> Result<serde_json::Value>;
}

/// Builds the SASL XOAUTH2 initial response,
/// `user={user}\x01auth=Bearer {token}\x01\x01`. The transport layer
/// base64-encodes it on the wire.
pub fn sasl_xoauth2(user: &str, access_token: &str) -> String {
    format!("user={user}\x01auth=Bearer {access_token}\x01\x01")
}

/// Shape of a token endpoint response, shared by both providers.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Converts into a [`TokenSet`], keeping the previous refresh token
    /// when the provider does not return a new one.
    pub(crate) fn into_token_set(self, previous_refresh: Option<String>) -> TokenSet {
        let expires_at = self
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs as i64));
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at,
            scopes: self
                .scope
                .map(|scope| scope.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default(),
        }
    }
}

pub(crate) fn token_info(path: &Path, tokens: &TokenSet) -> serde_json::Value {
    serde_json::json!({
        "token_file": path.display().to_string(),
        "has_refresh_token": tokens.refresh_token.is_some(),
        "expires_at": tokens.expires_at,
        "needs_refresh": tokens.needs_refresh(),
        "scopes": tokens.scopes,
    })
}
