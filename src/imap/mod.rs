//! Module dedicated to the IMAP session.
//!
//! The producer talks to the mailbox through the [`MailSource`] seam;
//! [`ImapMailbox`] implements it over a TLS session authenticated with
//! SASL XOAUTH2. Fetches use `BODY.PEEK` so the server-side `\Seen`
//! flag is never mutated.

pub mod record;

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    result,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use imap::{extensions::idle::SetReadTimeout, Authenticator, Client, Session};
use once_cell::sync::Lazy;
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier},
    Certificate, ClientConfig, ClientConnection, RootCertStore, StreamOwned,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{auth, config::ImapSettings};

/// Errors related to the IMAP session.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot connect to imap server")]
    ConnectError(#[source] imap::Error),
    #[error("cannot authenticate to imap server")]
    AuthenticateError(#[source] imap::Error),
    #[error("cannot refresh access token")]
    RefreshAccessTokenError(#[source] Box<auth::Error>),
    #[error("cannot select mailbox {1}")]
    SelectMailboxError(#[source] imap::Error, String),
    #[error("mailbox {0} reports no uidvalidity")]
    GetUidValidityError(String),
    #[error("cannot search uids in mailbox {1}")]
    SearchUidsError(#[source] imap::Error, String),
    #[error("cannot fetch uid {1}")]
    FetchUidError(#[source] imap::Error, u64),
    #[error("uid {0} missing from fetch results")]
    MissingFetchError(u64),
    #[error("cannot log out from imap server")]
    LogoutError(#[source] imap::Error),
}

/// Coarse classification of session failures, driving the retry policy
/// upstream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Reconnect-worthy: the session must be discarded.
    Transport,
    /// Authentication rejected; token refresh territory.
    Auth,
    /// Server-side protocol failure; the batch is aborted and retried
    /// next cycle on a live session.
    Protocol,
}

fn classify(err: &imap::Error) -> ErrorKind {
    match err {
        imap::Error::Io(_) | imap::Error::ConnectionLost => ErrorKind::Transport,
        imap::Error::Parse(imap::error::ParseError::Authentication(_, _)) => ErrorKind::Auth,
        _ => ErrorKind::Protocol,
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConnectError(err) => classify(err),
            Error::AuthenticateError(_) | Error::RefreshAccessTokenError(_) => ErrorKind::Auth,
            Error::SelectMailboxError(err, _) => classify(err),
            Error::SearchUidsError(err, _) => classify(err),
            Error::FetchUidError(err, _) => classify(err),
            Error::LogoutError(err) => classify(err),
            Error::GetUidValidityError(_) | Error::MissingFetchError(_) => ErrorKind::Protocol,
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Loads the platform's trusted root certificates. Unreadable or
/// unparsable certificates are skipped rather than failing boot; a
/// store left empty simply makes every verification fail later.
fn native_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let der: Vec<Vec<u8>> = certs.into_iter().map(|cert| cert.0).collect();
            let (added, skipped) = roots.add_parsable_certificates(&der);
            debug!("loaded {added} native root certificates ({skipped} unparsable)");
        }
        Err(err) => warn!("cannot load native root certificates: {err}"),
    }
    roots
}

static NATIVE_ROOTS: Lazy<RootCertStore> = Lazy::new(native_root_store);

/// Certificate verifier that accepts anything it is shown. Selected
/// only through the `insecure` option, for servers presenting
/// self-signed certificates.
struct TrustAnyCert;

impl ServerCertVerifier for TrustAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn request_scts(&self) -> bool {
        false
    }
}

/// The session transport: TLS over TCP, or a bare socket when TLS is
/// disabled. [`imap::Session`] wants one concrete stream type.
#[derive(Debug)]
pub enum MailStream {
    Secure(StreamOwned<ClientConnection, TcpStream>),
    Plain(TcpStream),
}

impl MailStream {
    /// The underlying socket, reaching through the TLS layer when one
    /// is present.
    fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Self::Secure(stream) => stream.get_mut(),
            Self::Plain(stream) => stream,
        }
    }
}

/// Runs one call against whichever transport is active.
macro_rules! on_stream {
    ($target:expr, $stream:ident => $call:expr) => {
        match $target {
            MailStream::Secure($stream) => $call,
            MailStream::Plain($stream) => $call,
        }
    };
}

impl SetReadTimeout for MailStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> imap::Result<()> {
        Ok(self.socket_mut().set_read_timeout(timeout)?)
    }
}

impl Read for MailStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        on_stream!(self, stream => stream.read(buf))
    }
}

impl Write for MailStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        on_stream!(self, stream => stream.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        on_stream!(self, stream => stream.flush())
    }
}

/// Alias for the IMAP session.
pub type ImapSession = Session<MailStream>;

/// XOAUTH2 IMAP authenticator, needed to implement the
/// [`imap::Authenticator`] trait.
struct XOAuth2 {
    sasl: String,
}

impl Authenticator for XOAuth2 {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        self.sasl.clone()
    }
}

/// Result of selecting a folder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MailboxStatus {
    pub uidvalidity: u64,
    pub exists: u64,
}

/// One fetched message: envelope metadata plus raw body previews. The
/// producer turns this into a [`record::MailRecord`].
#[derive(Clone, Debug, Default)]
pub struct FetchedMail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: String,
    pub message_id: String,
    pub size: u64,
    pub headers: std::collections::BTreeMap<String, String>,
    pub body_text: String,
    pub body_html: String,
}

/// The mailbox seam the producer engine polls through.
#[async_trait]
pub trait MailSource: Send {
    /// Selects a folder, reading its UIDVALIDITY and message count.
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus>;

    /// Returns the UIDs strictly greater than `since_uid`, in
    /// unspecified order.
    async fn search_since(&mut self, since_uid: u64) -> Result<Vec<u64>>;

    /// Fetches envelope, headers and body preview for one UID without
    /// mutating server-side flags.
    async fn fetch(&mut self, uid: u64) -> Result<FetchedMail>;

    async fn logout(&mut self) -> Result<()>;
}

/// Builds authenticated [`MailSource`]s. The producer reconnects
/// through this seam whenever a session is discarded.
#[async_trait]
pub trait MailConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailSource>>;
}

/// An authenticated IMAP mailbox session.
pub struct ImapMailbox {
    session: ImapSession,
    selected: Option<String>,
    logged_out: bool,
}

impl ImapMailbox {
    fn address_to_string(address: &imap_proto::types::Address) -> String {
        let decode = |bytes: &Option<std::borrow::Cow<'_, [u8]>>| {
            bytes
                .as_ref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default()
        };
        let mailbox = decode(&address.mailbox);
        let host = decode(&address.host);
        let name = decode(&address.name);
        let addr = format!("{mailbox}@{host}");
        if name.is_empty() {
            addr
        } else {
            format!("{name} <{addr}>")
        }
    }
}

impl Drop for ImapMailbox {
    fn drop(&mut self) {
        if !self.logged_out {
            let _ = self.session.logout();
        }
    }
}

#[async_trait]
impl MailSource for ImapMailbox {
    async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let selected = self
            .session
            .select(mailbox)
            .map_err(|err| Error::SelectMailboxError(err, mailbox.to_owned()))?;
        self.selected = Some(mailbox.to_owned());

        let uidvalidity = selected
            .uid_validity
            .ok_or_else(|| Error::GetUidValidityError(mailbox.to_owned()))?;

        debug!(
            "selected mailbox {mailbox}: uidvalidity={uidvalidity}, exists={}",
            selected.exists
        );

        Ok(MailboxStatus {
            uidvalidity: uidvalidity as u64,
            exists: selected.exists as u64,
        })
    }

    async fn search_since(&mut self, since_uid: u64) -> Result<Vec<u64>> {
        let mailbox = self.selected.clone().unwrap_or_default();
        let uids = self
            .session
            .uid_search(format!("UID {}:*", since_uid + 1))
            .map_err(|err| Error::SearchUidsError(err, mailbox))?;

        // `UID n:*` always matches the highest UID in the mailbox, even
        // below `n`. Keep only UIDs strictly greater than the cursor.
        Ok(uids
            .into_iter()
            .map(|uid| uid as u64)
            .filter(|uid| *uid > since_uid)
            .collect())
    }

    async fn fetch(&mut self, uid: u64) -> Result<FetchedMail> {
        let fetches = self
            .session
            .uid_fetch(
                uid.to_string(),
                "(UID RFC822.SIZE ENVELOPE INTERNALDATE BODY.PEEK[HEADER] BODY.PEEK[TEXT])",
            )
            .map_err(|err| Error::FetchUidError(err, uid))?;

        let fetch = fetches
            .iter()
            .find(|fetch| fetch.uid == Some(uid as u32))
            .ok_or(Error::MissingFetchError(uid))?;

        let headers = record::parse_headers(fetch.header().unwrap_or_default());

        let mut mail = FetchedMail {
            size: fetch.size.unwrap_or_default() as u64,
            body_text: String::from_utf8_lossy(fetch.text().unwrap_or_default()).into_owned(),
            headers,
            ..Default::default()
        };

        if let Some(envelope) = fetch.envelope() {
            let decode = |bytes: &Option<std::borrow::Cow<'_, [u8]>>| {
                bytes
                    .as_ref()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default()
            };
            mail.subject = decode(&envelope.subject);
            mail.date = decode(&envelope.date);
            mail.message_id = decode(&envelope.message_id);
            if let Some(from) = envelope.from.as_ref().and_then(|from| from.first()) {
                mail.from = Self::address_to_string(from);
            }
            if let Some(to) = envelope.to.as_ref() {
                mail.to = to.iter().map(Self::address_to_string).collect();
            }
        }

        if mail.date.is_empty() {
            if let Some(internal_date) = fetch.internal_date() {
                mail.date = internal_date.to_rfc3339();
            }
        }
        if mail.message_id.is_empty() {
            mail.message_id = format!(
                "<uid-{uid}@{}>",
                self.selected.as_deref().unwrap_or("unknown")
            );
        }

        Ok(mail)
    }

    async fn logout(&mut self) -> Result<()> {
        self.logged_out = true;
        self.session.logout().map_err(Error::LogoutError)
    }
}

/// Connects and authenticates IMAP sessions using XOAUTH2 credentials
/// from the configured authorizer.
pub struct ImapConnector {
    settings: ImapSettings,
    login: String,
    authorizer: Arc<dyn auth::Authorizer>,
}

impl ImapConnector {
    pub fn new(
        settings: ImapSettings,
        login: impl ToString,
        authorizer: Arc<dyn auth::Authorizer>,
    ) -> Self {
        Self {
            settings,
            login: login.to_string(),
            authorizer,
        }
    }

    /// The TLS client configuration for this connector: platform roots
    /// by default, everything-goes when `insecure` is set.
    fn tls_config(&self) -> Arc<ClientConfig> {
        let verifier: Arc<dyn ServerCertVerifier> = if self.settings.insecure() {
            Arc::new(TrustAnyCert)
        } else {
            Arc::new(WebPkiVerifier::new(NATIVE_ROOTS.clone(), None))
        };

        Arc::new(
            ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth(),
        )
    }

    fn build_client(&self) -> Result<Client<MailStream>> {
        let mut builder = imap::ClientBuilder::new(&self.settings.host, self.settings.port);

        if !self.settings.ssl() {
            return builder
                .connect(|_domain, tcp| Ok(MailStream::Plain(tcp)))
                .map_err(Error::ConnectError);
        }

        let config = self.tls_config();
        builder
            .connect(move |domain, tcp| {
                let name = rustls::ServerName::try_from(domain).map_err(|err| {
                    imap::Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid tls server name {domain}: {err}"),
                    ))
                })?;
                let connection = ClientConnection::new(config, name)
                    .map_err(|err| io::Error::new(io::ErrorKind::ConnectionAborted, err))?;
                Ok(MailStream::Secure(StreamOwned::new(connection, tcp)))
            })
            .map_err(Error::ConnectError)
    }

    fn authenticate(&self, access_token: &str) -> Result<ImapSession> {
        let xoauth2 = XOAuth2 {
            sasl: auth::sasl_xoauth2(&self.login, access_token),
        };
        self.build_client()?
            .authenticate("XOAUTH2", &xoauth2)
            .map_err(|(err, _client)| Error::AuthenticateError(err))
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    /// Builds an authenticated session. If authentication fails, the
    /// access token is refreshed once and the session is rebuilt.
    async fn connect(&self) -> Result<Box<dyn MailSource>> {
        let access_token = self
            .authorizer
            .access_token()
            .await
            .map_err(|err| Error::RefreshAccessTokenError(Box::new(err)))?;

        let session = match self.authenticate(&access_token) {
            Ok(session) => session,
            Err(Error::AuthenticateError(err)) => {
                warn!("imap authentication failed, refreshing access token: {err}");
                let access_token = self
                    .authorizer
                    .refresh()
                    .await
                    .map_err(|err| Error::RefreshAccessTokenError(Box::new(err)))?;
                self.authenticate(&access_token)?
            }
            Err(err) => return Err(err),
        };

        Ok(Box::new(ImapMailbox {
            session,
            selected: None,
            logged_out: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_any_cert_accepts_whatever_it_is_shown() {
        let name = rustls::ServerName::try_from("imap.example.com").unwrap();
        let verdict = TrustAnyCert.verify_server_cert(
            &Certificate(vec![0x30, 0x00]),
            &[],
            &name,
            &mut std::iter::empty::<&[u8]>(),
            &[],
            std::time::SystemTime::now(),
        );

        assert!(verdict.is_ok());
        assert!(!TrustAnyCert.request_scts());
    }

    #[test]
    fn native_root_store_builds_on_any_host() {
        // Host-dependent: a bare container may legitimately have zero
        // roots, but constructing the store must never fail.
        let roots = native_root_store();
        let _ = roots.is_empty();
    }
}
