//! Key set retrieval.
//!
//! [`KeySetFetcher`] is the seam between the key cache and the network. The
//! production implementation, [`HttpKeySetFetcher`], performs a plain GET
//! against the discovery URL; tests substitute in-memory fetchers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;

use crate::{
    config::{DEFAULT_FETCH_TIMEOUT, KeySource},
    error::{ConfigError, FetchError},
    jwks::JwkSet,
};

/// Largest key set document [`HttpKeySetFetcher`] accepts (1 MiB).
pub const MAX_KEY_SET_BYTES: usize = 1024 * 1024;

/// Retrieves the current key set document for a key source.
///
/// Implementations must be cheap to call concurrently; the key cache already
/// guarantees at most one outstanding call per source.
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    /// Fetches and parses the key set document for `source`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] describing why no document could be obtained.
    async fn fetch(&self, source: &KeySource) -> Result<JwkSet, FetchError>;
}

/// Fetches key sets over HTTPS with `reqwest`.
///
/// By default the URL is [`KeySource::discovery_url`]. A URL template with
/// `{authority}` and `{pool_id}` placeholders can override it, for
/// self-hosted issuers or local test servers.
#[derive(Debug, Clone)]
pub struct HttpKeySetFetcher {
    client: reqwest::Client,
    url_template: Option<String>,
    timeout: Duration,
}

#[bon::bon]
impl HttpKeySetFetcher {
    /// Creates a fetcher.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the timeout is zero or the HTTP client
    /// cannot be constructed.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_FETCH_TIMEOUT)] timeout: Duration,
        #[builder(into)] url_template: Option<String>,
    ) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be non-zero"));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::invalid("http_client", e.to_string()))?;
        Ok(Self { client, url_template, timeout })
    }

    /// URL fetched for `source`.
    #[must_use]
    pub fn url_for(&self, source: &KeySource) -> String {
        match &self.url_template {
            Some(template) => template
                .replace("{authority}", source.authority())
                .replace("{pool_id}", source.pool_id()),
            None => source.discovery_url(),
        }
    }

    /// Reads the response body, failing once it exceeds
    /// [`MAX_KEY_SET_BYTES`].
    async fn read_body(&self, mut response: reqwest::Response) -> Result<Vec<u8>, FetchError> {
        if let Some(length) = response.content_length()
            && u64::try_from(MAX_KEY_SET_BYTES).is_ok_and(|max| length > max)
        {
            return Err(oversized_body());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(&e))? {
            if body.len() + chunk.len() > MAX_KEY_SET_BYTES {
                return Err(oversized_body());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn transport_error(&self, err: &reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::timeout(self.timeout)
        } else {
            FetchError::network(err.to_string())
        }
    }
}

fn oversized_body() -> FetchError {
    FetchError::decode(format!("key set document exceeds {MAX_KEY_SET_BYTES} bytes"))
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    #[tracing::instrument(skip(self), fields(url))]
    async fn fetch(&self, source: &KeySource) -> Result<JwkSet, FetchError> {
        let url = self.url_for(source);
        tracing::Span::current().record("url", url.as_str());

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::status(status.as_u16()));
        }

        let body = self.read_body(response).await?;
        let document: JwkSet =
            serde_json::from_slice(&body).map_err(|e| FetchError::decode(e.to_string()))?;

        tracing::debug!(keys = document.keys.len(), "fetched key set document");
        Ok(document)
    }
}
