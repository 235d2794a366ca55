//! Google OAuth 2.0 authorizer.
//!
//! Runs the authorization code grant with a loopback redirect: the
//! operator opens the printed URL, Google redirects the browser to a
//! local listener, and the authorization code is exchanged for the
//! token triple. PKCE is always enabled.

use std::path::PathBuf;

use async_trait::async_trait;
use oauth2::{
    basic::BasicClient, url::Url, AuthUrl, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    RedirectUrl, Scope, TokenUrl,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::Mutex,
};
use tracing::{debug, info, warn};

use super::{token_info, Authorizer, Error, Result, TokenResponse, TokenSet};
use crate::config::GoogleSettings;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
const SCOPE: &str = "https://mail.google.com/";

const REDIRECT_RESPONSE: &str = "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\n\r\n\
<html><body>Authentication successful! You can close this window.</body></html>";

/// Google authorizer backed by a persisted token file.
pub struct GmailAuthorizer {
    settings: GoogleSettings,
    http: reqwest::Client,
    cache: Mutex<Option<TokenSet>>,
}

impl GmailAuthorizer {
    pub fn new(settings: GoogleSettings) -> Self {
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
            .ok_or(Error::MissingClientConfigError("GOOGLE_CLIENT_ID"))
    }

    fn client_secret(&self) -> Result<&str> {
        self.settings
            .client_secret
            .as_deref()
            .ok_or(Error::MissingClientConfigError("GOOGLE_CLIENT_SECRET"))
    }

    fn redirect_uri(&self) -> String {
        format!(
            "http://{}:{}",
            self.settings.redirect_host, self.settings.redirect_port
        )
    }

    /// Accepts one connection on the loopback redirect listener and
    /// extracts the `code` and `state` query parameters.
    async fn wait_for_redirect(&self) -> Result<(String, String)> {
        let addr = format!(
            "{}:{}",
            self.settings.redirect_host, self.settings.redirect_port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(Error::WaitForRedirectError)?;
        info!("waiting for the authorization redirect on {addr}");

        let (stream, _) = listener.accept().await.map_err(Error::WaitForRedirectError)?;
        let mut stream = BufReader::new(stream);

        let mut request_line = String::new();
        stream
            .read_line(&mut request_line)
            .await
            .map_err(Error::WaitForRedirectError)?;

        // Request line shape: GET /?state=..&code=.. HTTP/1.1
        let path = request_line.split_whitespace().nth(1).unwrap_or("/");
        let url = Url::parse(&format!("http://localhost{path}"))
            .map_err(Error::BuildAuthUrlError)?;

        let mut code = None;
        let mut state = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => (),
            }
        }

        let _ = stream
            .get_mut()
            .write_all(REDIRECT_RESPONSE.as_bytes())
            .await;

        let code = code.ok_or(Error::MissingCodeError)?;
        let state = state.ok_or(Error::InvalidStateError)?;
        Ok((code, state))
    }

    async fn exchange_code(&self, code: &str, pkce_verifier: &str) -> Result<TokenSet> {
        let redirect_uri = self.redirect_uri();
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &redirect_uri),
            ("client_id", self.client_id()?),
            ("client_secret", self.client_secret()?),
            ("code_verifier", pkce_verifier),
        ];

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(Error::TokenEndpointError)?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RefreshTokenError(body));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(Error::DecodeTokenResponseError)?;
        Ok(token_response.into_token_set(None))
    }

    async fn do_refresh(&self, previous: TokenSet) -> Result<TokenSet> {
        let refresh_token = previous
            .refresh_token
            .clone()
            .ok_or(Error::MissingRefreshTokenError)?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", &refresh_token),
            ("client_id", self.client_id()?),
            ("client_secret", self.client_secret()?),
        ];

        debug!("refreshing google access token");
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&params)
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
impl Authorizer for GmailAuthorizer {
    async fn interactive_setup(&self) -> Result<TokenSet> {
        let client = BasicClient::new(ClientId::new(self.client_id()?.to_owned()))
            .set_client_secret(ClientSecret::new(self.client_secret()?.to_owned()))
            .set_auth_uri(AuthUrl::new(AUTH_URL.to_owned()).map_err(Error::BuildAuthUrlError)?)
            .set_token_uri(TokenUrl::new(TOKEN_URL.to_owned()).map_err(Error::BuildAuthUrlError)?)
            .set_redirect_uri(
                RedirectUrl::new(self.redirect_uri()).map_err(Error::BuildAuthUrlError)?,
            );

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let (auth_url, csrf_token) = client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(SCOPE.to_owned()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_pkce_challenge(pkce_challenge)
            .url();

        println!("To complete your OAuth 2.0 setup, click on the following link:");
        println!();
        println!("{auth_url}");

        let (code, state) = self.wait_for_redirect().await?;
        if state != *csrf_token.secret() {
            return Err(Error::InvalidStateError);
        }

        let tokens = self.exchange_code(&code, pkce_verifier.secret()).await?;
        tokens.save(&self.token_file())?;
        *self.cache.lock().await = Some(tokens.clone());
        info!("google oauth2 setup complete, token saved to {}", self.settings.token_file);
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

    async fn revoke(&self) -> Result<()> {
        let tokens = self.current_tokens().await?;
        let token = tokens
            .refresh_token
            .unwrap_or(tokens.access_token);

        let response = self
            .http
            .post(REVOKE_URL)
            .form(&[("token", token.as_str())])
            .send()
            .await
            .map_err(Error::TokenEndpointError)?;
        if !response.status().is_success() {
            warn!("google token revocation returned {}", response.status());
        }

        TokenSet::delete(&self.token_file())?;
        *self.cache.lock().await = None;
        Ok(())
    }

    async fn info(&self) -> Result<serde_json::Value> {
        let tokens = self.current_tokens().await?;
        Ok(token_info(&self.token_file(), &tokens))
    }
}
