//! ICE credential provider
//!
//! Fetches short-lived STUN/TURN descriptors once per call setup. A failed or
//! empty fetch never fails the call: [`resolve_ice_servers`] falls back to a
//! public STUN-only set so setup proceeds with direct connectivity only.

use crate::types::IceServer;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Public STUN servers used when credentials cannot be fetched
pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Request timeout for the credential endpoint
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// ICE credential errors
#[derive(Error, Debug)]
pub enum IceError {
    /// HTTP or network failure, including non-success status
    #[error("Credential request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with no usable servers
    #[error("No usable ICE servers returned")]
    Empty,
}

/// Source of ICE server descriptors
#[async_trait]
pub trait IceCredentialProvider: Send + Sync {
    /// Fetch the current descriptor set
    async fn fetch(&self) -> Result<Vec<IceServer>, IceError>;
}

/// Fixed descriptor set, for deployments without a credential endpoint
#[derive(Debug, Clone, Default)]
pub struct StaticIceServers {
    servers: Vec<IceServer>,
}

impl StaticIceServers {
    /// Serve the given descriptors
    #[must_use]
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl IceCredentialProvider for StaticIceServers {
    async fn fetch(&self) -> Result<Vec<IceServer>, IceError> {
        Ok(self.servers.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct RawIceServer {
    #[serde(alias = "url")]
    urls: OneOrMany,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

impl RawIceServer {
    fn into_server(self) -> Option<IceServer> {
        let urls: Vec<String> = match self.urls {
            OneOrMany::One(url) => vec![url],
            OneOrMany::Many(urls) => urls,
        }
        .into_iter()
        .filter(|url| !url.trim().is_empty())
        .collect();

        if urls.is_empty() {
            return None;
        }
        Some(IceServer {
            urls,
            username: self.username,
            credential: self.credential,
        })
    }
}

/// Parse the endpoint's JSON array of descriptors, dropping entries without URLs
///
/// # Errors
///
/// Returns error if the body is not a JSON array of descriptors
pub fn parse_ice_servers(body: &str) -> Result<Vec<IceServer>, serde_json::Error> {
    let raw: Vec<RawIceServer> = serde_json::from_str(body)?;
    Ok(raw.into_iter().filter_map(RawIceServer::into_server).collect())
}

/// Authenticated HTTPS credential endpoint
pub struct HttpIceCredentialProvider {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpIceCredentialProvider {
    /// Create a provider for `endpoint`, sending `auth_token` as a bearer token
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(endpoint: impl Into<String>, auth_token: Option<String>) -> Result<Self, IceError> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth_token,
        })
    }
}

#[async_trait]
impl IceCredentialProvider for HttpIceCredentialProvider {
    #[tracing::instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn fetch(&self) -> Result<Vec<IceServer>, IceError> {
        let mut request = self.client.get(&self.endpoint);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let body = request.send().await?.error_for_status()?.text().await?;
        let servers = parse_ice_servers(&body).map_err(|e| {
            tracing::warn!(error = %e, "Credential endpoint returned malformed body");
            IceError::Empty
        })?;
        if servers.is_empty() {
            return Err(IceError::Empty);
        }
        tracing::debug!(count = servers.len(), "Fetched ICE servers");
        Ok(servers)
    }
}

/// STUN-only descriptors for the given URLs
#[must_use]
pub fn stun_only(urls: &[String]) -> Vec<IceServer> {
    urls.iter().cloned().map(IceServer::stun).collect()
}

/// Fetch descriptors, falling back to STUN-only on any failure
pub async fn resolve_ice_servers(
    provider: &dyn IceCredentialProvider,
    stun_fallback: &[String],
) -> Vec<IceServer> {
    match provider.fetch().await {
        Ok(servers) if !servers.is_empty() => servers,
        Ok(_) => {
            tracing::warn!("Credential provider returned no servers, using STUN-only fallback");
            stun_only(stun_fallback)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Credential fetch failed, using STUN-only fallback");
            stun_only(stun_fallback)
        }
    }
}
