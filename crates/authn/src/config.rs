//! Configuration consumed by the key cache and the token validator.
//!
//! - [`KeySource`] names one (authority, pool) pair and derives its discovery
//!   URL and issuer.
//! - [`ValidationConfig`] holds the expected issuer, audience, allowed
//!   algorithms and clock-skew allowance for one validator.
//! - [`KeyCacheConfig`] tunes key set freshness and fetch timeouts. It can be
//!   loaded from a config file (durations in humantime format, e.g. `"5m"`).

use std::{fmt, time::Duration};

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, validation::is_forbidden_algorithm};

/// Default key set time-to-live (5 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default bound on a single discovery fetch (10 seconds).
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default clock-skew allowance applied to `exp`, `nbf` and `iat` (60 seconds).
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(60);

/// Host suffix of the hosted identity provider's regional endpoints.
const COGNITO_HOST_SUFFIX: &str = "amazonaws.com";

/// Identifies the key set of one token issuer: an authority host and a pool.
///
/// The discovery document lives at
/// `https://{authority}/{pool_id}/.well-known/jwks.json` and tokens from this
/// pool carry `iss = https://{authority}/{pool_id}`.
///
/// # Example
///
/// ```
/// use jwks_authn::KeySource;
///
/// let source = KeySource::cognito("us-east-1", "us-east-1_ABC123")?;
/// assert_eq!(
///     source.discovery_url(),
///     "https://cognito-idp.us-east-1.amazonaws.com/us-east-1_ABC123/.well-known/jwks.json"
/// );
/// # Ok::<(), jwks_authn::error::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySource {
    authority: String,
    pool_id: String,
}

impl KeySource {
    /// Creates a key source from an authority host (optionally with port) and
    /// a pool identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if either part is empty or
    /// contains whitespace or `/`.
    pub fn new(
        authority: impl Into<String>,
        pool_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let authority = authority.into();
        let pool_id = pool_id.into();
        validate_segment("authority", &authority)?;
        validate_segment("pool_id", &pool_id)?;
        Ok(Self { authority, pool_id })
    }

    /// Creates a key source for a user pool in the given region of the hosted
    /// identity provider (`cognito-idp.{region}.amazonaws.com`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the region or pool id is
    /// unusable.
    pub fn cognito(region: &str, pool_id: impl Into<String>) -> Result<Self, ConfigError> {
        validate_segment("region", region)?;
        Self::new(format!("cognito-idp.{region}.{COGNITO_HOST_SUFFIX}"), pool_id)
    }

    /// Authority host.
    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Pool identifier.
    #[must_use]
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// URL of the JWKS discovery document for this pool.
    #[must_use]
    pub fn discovery_url(&self) -> String {
        format!("https://{}/{}/.well-known/jwks.json", self.authority, self.pool_id)
    }

    /// Issuer (`iss`) carried by tokens minted for this pool.
    #[must_use]
    pub fn issuer(&self) -> String {
        format!("https://{}/{}", self.authority, self.pool_id)
    }
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.authority, self.pool_id)
    }
}

fn validate_segment(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    if value.chars().any(|c| c == '/' || c.is_whitespace() || c.is_control()) {
        return Err(ConfigError::invalid(
            field,
            format!("'{value}' must not contain '/', whitespace or control characters"),
        ));
    }
    Ok(())
}

/// Expected claims and algorithm policy for a validator.
///
/// Immutable once built. The builder rejects symmetric algorithms: a verifier
/// that resolves public keys from a JWKS must never accept `HS*`, otherwise a
/// public key could be replayed as an HMAC secret.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use jsonwebtoken::Algorithm;
/// use jwks_authn::ValidationConfig;
///
/// let config = ValidationConfig::builder()
///     .expected_issuer("https://cognito-idp.us-east-1.amazonaws.com/us-east-1_ABC123")
///     .expected_audience("7d8c2example")
///     .allowed_algorithms(vec![Algorithm::RS256])
///     .leeway(Duration::from_secs(30))
///     .build()?;
/// assert!(config.allows(Algorithm::RS256));
/// # Ok::<(), jwks_authn::error::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    expected_issuer: String,
    expected_audience: String,
    allowed_algorithms: Vec<Algorithm>,
    leeway: Duration,
    max_token_age: Option<Duration>,
    expected_token_use: Option<String>,
}

#[bon::bon]
impl ValidationConfig {
    /// Creates a validation config, checking every field.
    ///
    /// # Arguments
    ///
    /// * `expected_issuer` - Exact `iss` value tokens must carry.
    /// * `expected_audience` - Value that `aud` must equal or contain.
    ///
    /// # Optional Fields
    ///
    /// * `allowed_algorithms` - Accepted `alg` values (default: `[RS256]`).
    /// * `leeway` - Clock-skew allowance (default: [`DEFAULT_LEEWAY`]).
    /// * `max_token_age` - Reject tokens whose `iat` is older than this.
    /// * `expected_token_use` - Required `token_use` claim (e.g. `"access"`).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Issuer or audience is empty
    /// - The allowed algorithm set is empty
    /// - The allowed set contains a symmetric algorithm
    #[builder]
    pub fn new(
        #[builder(into)] expected_issuer: String,
        #[builder(into)] expected_audience: String,
        #[builder(default = vec![Algorithm::RS256])] allowed_algorithms: Vec<Algorithm>,
        #[builder(default = DEFAULT_LEEWAY)] leeway: Duration,
        max_token_age: Option<Duration>,
        #[builder(into)] expected_token_use: Option<String>,
    ) -> Result<Self, ConfigError> {
        if expected_issuer.trim().is_empty() {
            return Err(ConfigError::invalid("expected_issuer", "must not be empty"));
        }
        if expected_audience.trim().is_empty() {
            return Err(ConfigError::invalid("expected_audience", "must not be empty"));
        }
        if allowed_algorithms.is_empty() {
            return Err(ConfigError::invalid("allowed_algorithms", "must not be empty"));
        }
        if let Some(alg) = allowed_algorithms.iter().find(|alg| is_forbidden_algorithm(**alg)) {
            return Err(ConfigError::ForbiddenAlgorithm { algorithm: format!("{alg:?}") });
        }
        if let Some(token_use) = &expected_token_use
            && token_use.trim().is_empty()
        {
            return Err(ConfigError::invalid("expected_token_use", "must not be empty"));
        }

        let mut algorithms: Vec<Algorithm> = Vec::with_capacity(allowed_algorithms.len());
        for alg in allowed_algorithms {
            if !algorithms.contains(&alg) {
                algorithms.push(alg);
            }
        }

        Ok(Self {
            expected_issuer,
            expected_audience,
            allowed_algorithms: algorithms,
            leeway,
            max_token_age,
            expected_token_use,
        })
    }

    /// Creates a config expecting the issuer of `source`, the given audience,
    /// and otherwise default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the audience is empty.
    pub fn for_source(
        source: &KeySource,
        audience: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Self::builder().expected_issuer(source.issuer()).expected_audience(audience).build()
    }

    /// Exact issuer tokens must carry.
    #[must_use]
    pub fn expected_issuer(&self) -> &str {
        &self.expected_issuer
    }

    /// Audience tokens must be addressed to.
    #[must_use]
    pub fn expected_audience(&self) -> &str {
        &self.expected_audience
    }

    /// Accepted signing algorithms.
    #[must_use]
    pub fn allowed_algorithms(&self) -> &[Algorithm] {
        &self.allowed_algorithms
    }

    /// Returns `true` if `alg` is in the allowed set.
    #[must_use]
    pub fn allows(&self, alg: Algorithm) -> bool {
        self.allowed_algorithms.contains(&alg)
    }

    /// Clock-skew allowance.
    #[must_use]
    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    /// Maximum accepted token age measured from `iat`.
    #[must_use]
    pub fn max_token_age(&self) -> Option<Duration> {
        self.max_token_age
    }

    /// Required `token_use` claim value.
    #[must_use]
    pub fn expected_token_use(&self) -> Option<&str> {
        self.expected_token_use.as_deref()
    }
}

/// Freshness and timeout settings for [`KeyCache`](crate::KeyCache).
///
/// Deserializing validates the same invariants as the builder.
///
/// ```
/// use std::time::Duration;
/// use jwks_authn::KeyCacheConfig;
///
/// let config: KeyCacheConfig =
///     serde_json::from_str(r#"{ "ttl": "10m", "fetch_timeout": "3s" }"#)?;
/// assert_eq!(config.ttl(), Duration::from_secs(600));
/// assert_eq!(config.fallback_ttl(), None);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawKeyCacheConfig")]
pub struct KeyCacheConfig {
    /// Age after which a key set is refetched.
    #[serde(with = "humantime_serde")]
    ttl: Duration,

    /// Upper bound on a single discovery fetch.
    #[serde(with = "humantime_serde")]
    fetch_timeout: Duration,

    /// When set, an expired key set younger than this is still served if the
    /// refresh fails.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    fallback_ttl: Option<Duration>,
}

#[bon::bon]
impl KeyCacheConfig {
    /// Creates a cache config.
    ///
    /// # Optional Fields
    ///
    /// * `ttl` - Key set time-to-live (default: [`DEFAULT_CACHE_TTL`]).
    /// * `fetch_timeout` - Per-fetch bound (default: [`DEFAULT_FETCH_TIMEOUT`]).
    /// * `fallback_ttl` - Stale-if-error window, measured from the fetch time.
    ///
    /// # Errors
    ///
    /// Returns an error if `ttl` or `fetch_timeout` is zero, or if
    /// `fallback_ttl` is not longer than `ttl`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_CACHE_TTL)] ttl: Duration,
        #[builder(default = DEFAULT_FETCH_TIMEOUT)] fetch_timeout: Duration,
        fallback_ttl: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        if ttl.is_zero() {
            return Err(ConfigError::invalid("ttl", "must be non-zero"));
        }
        if fetch_timeout.is_zero() {
            return Err(ConfigError::invalid("fetch_timeout", "must be non-zero"));
        }
        if let Some(fallback) = fallback_ttl
            && fallback <= ttl
        {
            return Err(ConfigError::invalid(
                "fallback_ttl",
                format!("{fallback:?} must be longer than ttl ({ttl:?})"),
            ));
        }
        Ok(Self { ttl, fetch_timeout, fallback_ttl })
    }

    /// Key set time-to-live.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Per-fetch timeout.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Stale-if-error window.
    #[must_use]
    pub fn fallback_ttl(&self) -> Option<Duration> {
        self.fallback_ttl
    }
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_CACHE_TTL, fetch_timeout: DEFAULT_FETCH_TIMEOUT, fallback_ttl: None }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawKeyCacheConfig {
    #[serde(with = "humantime_serde", default = "default_ttl")]
    ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    fetch_timeout: Duration,
    #[serde(with = "humantime_serde", default)]
    fallback_ttl: Option<Duration>,
}

fn default_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

impl TryFrom<RawKeyCacheConfig> for KeyCacheConfig {
    type Error = ConfigError;

    fn try_from(raw: RawKeyCacheConfig) -> Result<Self, Self::Error> {
        Self::builder()
            .ttl(raw.ttl)
            .fetch_timeout(raw.fetch_timeout)
            .maybe_fallback_ttl(raw.fallback_ttl)
            .build()
    }
}
