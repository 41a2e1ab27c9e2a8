//! Azure Blob Storage backend.
//!
//! Blocks are staged with `Put Block` and committed with `Put Block List` against a container URL, authorized
//! either by a pre-signed (SAS) container URL or by a bearer token obtained from a delegated credential.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{AuthType, AuthUrl, ClientId, ClientSecret, Scope, TokenResponse, TokenUrl};
use reqwest::{header, RequestBuilder};
use tokio::sync::RwLock;
use tokio::time::Instant;
use url::Url;

pub use reqwest::Client;

use super::{BlockBackend, Error};
use crate::{BlockId, ConfigError};

pub const SAS_URL_VAR: &str = "AZURE_STORAGE_SAS_URL";
pub const CONTAINER_URL_VAR: &str = "AZURE_STORAGE_CONTAINER_URL";
pub const TENANT_ID_VAR: &str = "AZURE_TENANT_ID";
pub const CLIENT_ID_VAR: &str = "AZURE_CLIENT_ID";
pub const CLIENT_SECRET_VAR: &str = "AZURE_CLIENT_SECRET";

const API_VERSION: &str = "2021-08-06";
const VERSION_HEADER: &str = "x-ms-version";
const LOGIN_AUTHORITY: &str = "https://login.microsoftonline.com";
const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

/// A bearer token expiring within this margin is renewed before being used.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// How requests to the container are authorized.
///
/// Resolved once, when the backend is built, and never re-inspected afterwards.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// A container URL carrying a shared access signature in its query.
    PreSignedUrl(Url),
    /// An application registration exchanging its secret for a storage bearer token.
    DelegatedCredential {
        tenant_id: String,
        client_id: String,
        client_secret: String,
        container: Url,
    },
}

impl AuthMode {
    /// Resolve the authentication method from the process environment.
    ///
    /// A pre-signed URL wins over a delegated credential when both are available.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(sas_url) = lookup(SAS_URL_VAR) {
            let url = parse_container_url(&sas_url)?;

            if !url.query_pairs().any(|(key, _)| key == "sig") {
                return Err(ConfigError::MalformedUrl {
                    url: redact(&url),
                    reason: "missing shared access signature".to_owned(),
                });
            }

            return Ok(Self::PreSignedUrl(url));
        }

        match (lookup(TENANT_ID_VAR), lookup(CLIENT_ID_VAR), lookup(CLIENT_SECRET_VAR), lookup(CONTAINER_URL_VAR)) {
            (Some(tenant_id), Some(client_id), Some(client_secret), Some(container)) => Ok(Self::DelegatedCredential {
                tenant_id,
                client_id,
                client_secret,
                container: parse_container_url(&container)?,
            }),
            _ => Err(ConfigError::NoAuthMethod),
        }
    }

    #[inline]
    fn container(&self) -> &Url {
        match self {
            Self::PreSignedUrl(url) => url,
            Self::DelegatedCredential { container, .. } => container,
        }
    }
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreSignedUrl(url) => f.debug_tuple("PreSignedUrl").field(&redact(url)).finish(),
            Self::DelegatedCredential {
                tenant_id,
                client_id,
                container,
                ..
            } => f
                .debug_struct("DelegatedCredential")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .field("container", &container.as_str())
                .finish(),
        }
    }
}

fn parse_container_url(value: &str) -> Result<Url, ConfigError> {
    let malformed = |reason: String| ConfigError::MalformedUrl {
        url: value.split('?').next().unwrap_or_default().to_owned(),
        reason,
    };

    let url = Url::parse(value.trim()).map_err(|e| malformed(e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(malformed("not an http(s) container url".to_owned()));
    }

    Ok(url)
}

fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.into()
}

/// A bearer token along with its expiry, if the authority told one.
struct CachedToken {
    secret: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() + TOKEN_REFRESH_MARGIN < at)
    }
}

/// Azure Blob Storage block backend.
pub struct AzureBackend {
    client: Client,
    auth: AuthMode,
    /// Base URL of the identity platform delegated credentials are exchanged against.
    authority: String,
    token: RwLock<Option<CachedToken>>,
}

impl AzureBackend {
    pub fn new(auth: AuthMode) -> Self {
        Self {
            client: Client::default(),
            auth,
            authority: LOGIN_AUTHORITY.to_owned(),
            token: RwLock::new(None),
        }
    }

    /// Build a backend from the authentication method available in the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        AuthMode::from_env().map(Self::new)
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    /// Exchange delegated credentials against another identity platform than Microsoft's public one.
    #[inline]
    pub fn with_authority(self, authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            ..self
        }
    }

    #[inline]
    pub fn auth(&self) -> &AuthMode {
        &self.auth
    }

    /// Return the blob URL of object `key`, keeping the container query (if any).
    fn blob_url(&self, key: &str) -> Result<Url, Error> {
        let mut url = self.auth.container().clone();

        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(key);

        Ok(url)
    }

    fn block_url(&self, key: &str, id: &BlockId) -> Result<Url, Error> {
        let mut url = self.blob_url(key)?;
        url.query_pairs_mut().append_pair("comp", "block").append_pair("blockid", id.as_str());
        Ok(url)
    }

    fn block_list_url(&self, key: &str) -> Result<Url, Error> {
        let mut url = self.blob_url(key)?;
        url.query_pairs_mut().append_pair("comp", "blocklist");
        Ok(url)
    }

    /// Return the bearer token of a delegated credential, requesting a new one when missing or about to expire.
    async fn bearer_token(&self) -> Result<Option<String>, Error> {
        let AuthMode::DelegatedCredential {
            tenant_id,
            client_id,
            client_secret,
            ..
        } = &self.auth
        else {
            return Ok(None);
        };

        if let Some(token) = self.token.read().await.as_ref().filter(|token| token.is_fresh()) {
            return Ok(Some(token.secret.clone()));
        }

        let mut cached = self.token.write().await;

        // renewed by a concurrent request meanwhile
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh()) {
            return Ok(Some(token.secret.clone()));
        }

        tracing::debug!("Requesting storage token for client `{client_id}` in tenant `{tenant_id}`...");

        let endpoint = format!("{}/{tenant_id}/oauth2/v2.0", self.authority.trim_end_matches('/'));

        let oauth = BasicClient::new(
            ClientId::new(client_id.clone()),
            Some(ClientSecret::new(client_secret.clone())),
            AuthUrl::new(format!("{endpoint}/authorize"))?,
            Some(TokenUrl::new(format!("{endpoint}/token"))?),
        )
        .set_auth_type(AuthType::RequestBody);

        let resp = oauth
            .exchange_client_credentials()
            .add_scope(Scope::new(STORAGE_SCOPE.to_owned()))
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::Token(Box::new(e)))?;

        let token = CachedToken {
            secret: resp.access_token().secret().clone(),
            expires_at: resp.expires_in().map(|ttl| Instant::now() + ttl),
        };

        tracing::trace!("Storage token for client `{client_id}` expires in {:?}", resp.expires_in());

        let secret = token.secret.clone();
        *cached = Some(token);

        Ok(Some(secret))
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, Error> {
        let request = request.header(VERSION_HEADER, API_VERSION);

        Ok(match self.bearer_token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }
}

impl fmt::Debug for AzureBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureBackend")
            .field("auth", &self.auth)
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

fn block_list_body(ids: &[BlockId]) -> String {
    let mut body = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in ids {
        body.push_str("<Latest>");
        body.push_str(id.as_str());
        body.push_str("</Latest>");
    }
    body.push_str("</BlockList>");
    body
}

impl BlockBackend for AzureBackend {
    /// Check the delegated credential by requesting a first token.
    async fn connect(&self) -> Result<(), Error> {
        match &self.auth {
            AuthMode::PreSignedUrl(url) => {
                tracing::debug!("Using pre-signed container url: `{}`", redact(url));
            }
            AuthMode::DelegatedCredential { .. } => {
                self.bearer_token().await?;
            }
        }

        Ok(())
    }

    async fn stage_block(&self, key: &str, id: &BlockId, data: Bytes) -> Result<(), Error> {
        let url = self.block_url(key, id)?;

        self.authorize(self.client.put(url).body(data))
            .await?
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn commit_block_list(&self, key: &str, ids: &[BlockId]) -> Result<Url, Error> {
        let url = self.block_list_url(key)?;

        self.authorize(self.client.put(url).header(header::CONTENT_TYPE, "application/xml").body(block_list_body(ids)))
            .await?
            .send()
            .await?
            .error_for_status()?;

        let mut address = self.blob_url(key)?;
        address.set_query(None);

        Ok(address)
    }
}
