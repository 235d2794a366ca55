//! Microsoft OAuth 2.0 authorizer.
//!
//! Runs the device code grant as a public client: the operator enters
//! the printed user code on the Microsoft verification page while this
//! process polls the token endpoint. Suited to headless deployments
//! where no browser can reach a loopback redirect.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{token_info, Authorizer, Error, Result, TokenResponse, TokenSet};
use crate::config::MicrosoftSettings;

const SCOPE: &str = "https://outlook.office365.com/IMAP.AccessAsUser.All offline_access";

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// Microsoft authorizer backed by a persisted token file.
pub struct OutlookAuthorizer {
    settings: MicrosoftSettings,
    http: reqwest::Client,
    cache: Mutex<Option<TokenSet>>,
}

impl OutlookAuthorizer {
    pub fn new(settings: MicrosoftSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
            cache: Mutex::new(None),
        }
    }

    fn token_file(&self) -> PathBuf {
        PathBuf::from(&self.settings.token_file)
    }

    fn client_id(&self) -> Result<&str> {
        self.settings
            .client_id
            .as_deref()
            .ok_or(Error::MissingClientConfigError("MICROSOFT_CLIENT_ID"))
    }

    fn device_code_url(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/devicecode",
            self.settings.tenant_id
        )
    }

    fn token_url(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.settings.tenant_id
        )
    }

    /// Polls the token endpoint until the user completes the device
    /// flow, the code expires, or the request is declined.
    async fn poll_for_tokens(&self, device: &DeviceCodeResponse) -> Result<TokenSet> {
        let interval = Duration::from_secs(device.interval.unwrap_or(5));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);

        loop {
            tokio::time::sleep(interval).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::DeviceCodeExpiredError);
            }

            let response = self
                .http
                .post(self.token_url())
                .form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                    ("client_id", self.client_id()?),
                    ("device_code", &device.device_code),
                ])
                .send()
                .await
                .map_err(Error::TokenEndpointError)?;

            if response.status().is_success() {
                let token_response: TokenResponse = response
                    .json()
                    .await
                    .map_err(Error::DecodeTokenResponseError)?;
                return Ok(token_response.into_token_set(None));
            }

            let body = response.text().await.unwrap_or_default();
            let error: TokenErrorResponse = serde_json::from_str(&body)
                .unwrap_or(TokenErrorResponse {
                    error: body.clone(),
                });
            match error.error.as_str() {
                "authorization_pending" => {
                    debug!("device authorization pending, polling again");
                    continue;
                }
                "slow_down" => {
                    tokio::time::sleep(interval).await;
                    continue;
                }
                "expired_token" => return Err(Error::DeviceCodeExpiredError),
                "authorization_declined" => return Err(Error::DeviceCodeDeclinedError),
                other => return Err(Error::RefreshTokenError(other.to_owned())),
            }
        }
    }

    async fn do_refresh(&self, previous: TokenSet) -> Result<TokenSet> {
        let refresh_token = previous
            .refresh_token
            .clone()
            .ok_or(Error::MissingRefreshTokenError)?;

        debug!("refreshing microsoft access token");
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
                ("client_id", self.client_id()?),
                ("scope", SCOPE),
            ])
            .send()
            .await
            .map_err(Error::TokenEndpointError)?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("invalid_grant") {
                return Err(Error::RevokedError);
            }
            return Err(Error::RefreshTokenError(body));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(Error::DecodeTokenResponseError)?;
        let tokens = token_response.into_token_set(previous.refresh_token);
        tokens.save(&self.token_file())?;
        Ok(tokens)
    }

    async fn current_tokens(&self) -> Result<TokenSet> {
        let mut cache = self.cache.lock().await;
        match &*cache {
            Some(tokens) => Ok(tokens.clone()),
            None => {
                let tokens = TokenSet::load(&self.token_file())?;
                *cache = Some(tokens.clone());
                Ok(tokens)
            }
        }
    }
}

#[async_trait]
impl Authorizer for OutlookAuthorizer {
    async fn interactive_setup(&self) -> Result<TokenSet> {
        let response = self
            .http
            .post(self.device_code_url())
            .form(&[("client_id", self.client_id()?), ("scope", SCOPE)])
            .send()
            .await
            .map_err(Error::TokenEndpointError)?;

        let device: DeviceCodeResponse = response
            .json()
            .await
            .map_err(Error::DecodeTokenResponseError)?;

        println!("To complete your OAuth 2.0 setup, open the following page:");
        println!();
        println!("    {}", device.verification_uri);
        println!();
        println!("and enter the code: {}", device.user_code);

        let tokens = self.poll_for_tokens(&device).await?;
        tokens.save(&self.token_file())?;
        *self.cache.lock().await = Some(tokens.clone());
        info!(
            "microsoft oauth2 setup complete, token saved to {}",
            self.settings.token_file
        );
        Ok(tokens)
    }

    async fn access_token(&self) -> Result<String> {
        let tokens = self.current_tokens().await?;
        if !tokens.needs_refresh() {
            return Ok(tokens.access_token);
        }

        let refreshed = self.do_refresh(tokens).await?;
        let access_token = refreshed.access_token.clone();
        *self.cache.lock().await = Some(refreshed);
        Ok(access_token)
    }

    async fn refresh(&self) -> Result<String> {
        let tokens = self.current_tokens().await?;
        let refreshed = self.do_refresh(tokens).await?;
        let access_token = refreshed.access_token.clone();
        *self.cache.lock().await = Some(refreshed);
        Ok(access_token)
    }

    /// The Microsoft identity platform has no self-service revocation
    /// endpoint for public clients: dropping the persisted refresh
    /// token is the supported teardown.
    async fn revoke(&self) -> Result<()> {
        TokenSet::delete(&self.token_file())?;
        *self.cache.lock().await = None;
        Ok(())
    }

    async fn info(&self) -> Result<serde_json::Value> {
        let tokens = self.current_tokens().await?;
        Ok(token_info(&self.token_file(), &tokens))
    }
}
