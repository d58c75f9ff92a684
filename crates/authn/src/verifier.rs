//! Bearer token verification against a [`KeyCache`].
//!
//! [`verify_token`] runs the whole pipeline:
//!
//! ```text
//! raw → strip "Bearer " → split into 3 segments      (MalformedToken)
//!     → decode header, require kid                    (MalformedToken)
//!     → alg in allow-list                             (UnsupportedAlgorithm)
//!     → resolve kid; unknown → refetch once           (UnknownKey / KeyRetrieval)
//!     → key fits alg, signature over header.payload   (SignatureInvalid)
//!     → decode payload, validate claims               (MalformedToken / ClaimValidation)
//!     → TokenClaims
//! ```
//!
//! The algorithm is checked before any key lookup, so a token with a
//! disallowed `alg` never causes a discovery fetch. Claims are only decoded
//! once the signature holds.

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::Algorithm;

use crate::{
    config::{KeySource, ValidationConfig},
    error::{AuthError, Result},
    jwks::SigningKey,
    jwt::{
        TokenClaims, TokenParts, decode_claims, decode_header, split_token, strip_bearer,
        validate_claims,
    },
    key_cache::KeyCache,
    validation::{validate_algorithm, validate_kid},
};

/// Verifies a bearer token and returns its claims.
///
/// `raw` may carry a `Bearer ` prefix. Either every check passes and the
/// claims are returned, or the first failing check's error is returned.
///
/// When the token's `kid` is not in the cached key set, the set for `source`
/// is force-expired and fetched once more before giving up, so keys rotated
/// in since the last refresh are picked up. Concurrent tokens naming the same
/// unknown `kid` share that refetch; see [`KeyCache::get_key_or_refetch`].
///
/// # Errors
///
/// - [`AuthError::MalformedToken`] for structural or encoding problems
/// - [`AuthError::UnsupportedAlgorithm`] if `alg` is not allowed
/// - [`AuthError::UnknownKey`] if `kid` is absent after the rotation retry
/// - [`AuthError::KeyRetrieval`] if the key set could not be fetched
/// - [`AuthError::SignatureInvalid`] if the key cannot verify `alg` or the
///   signature does not match
/// - [`AuthError::ClaimValidation`] naming the first failed claim
#[tracing::instrument(
    skip_all,
    fields(authority = source.authority(), pool_id = source.pool_id(), kid)
)]
pub async fn verify_token(
    raw: &str,
    cache: &KeyCache,
    source: &KeySource,
    config: &ValidationConfig,
) -> Result<TokenClaims> {
    let parts = split_token(strip_bearer(raw))?;

    let header = decode_header(parts.header)?;
    let kid = header
        .kid
        .as_deref()
        .ok_or_else(|| AuthError::malformed("token header missing 'kid'"))?;
    validate_kid(kid)?;
    tracing::Span::current().record("kid", kid);

    let algorithm = validate_algorithm(&header.alg, config.allowed_algorithms())?;

    let key = cache.get_key_or_refetch(source, kid).await.inspect_err(|err| {
        if err.is_server_error() {
            tracing::warn!(error = %err, "signing key unavailable");
        }
    })?;

    verify_signature(&parts, &key, algorithm)?;

    let claims = decode_claims(parts.payload)?;
    validate_claims(&claims, config, Utc::now().timestamp())?;

    tracing::debug!(sub = claims.subject(), "token verified");
    Ok(claims)
}

fn verify_signature(parts: &TokenParts<'_>, key: &SigningKey, algorithm: Algorithm) -> Result<()> {
    if !key.supports(algorithm) {
        return Err(AuthError::signature_invalid(format!(
            "key '{}' ({}) cannot verify {algorithm:?} signatures",
            key.kid(),
            key.material().key_type()
        )));
    }

    match jsonwebtoken::crypto::verify(
        parts.signature,
        parts.signing_input.as_bytes(),
        key.decoding_key(),
        algorithm,
    ) {
        Ok(true) => Ok(()),
        Ok(false) => Err(AuthError::signature_invalid("signature does not match")),
        Err(err) => Err(AuthError::signature_invalid(err.to_string())),
    }
}

/// Validates tokens from one key source against one config.
///
/// Cheap to clone; clones share the key cache.
///
/// # Example
///
/// ```no_run
/// use jwks_authn::{KeyCache, KeyCacheConfig, KeySource, TokenValidator, ValidationConfig};
///
/// # async fn example(authorization: &str) -> Result<(), Box<dyn std::error::Error>> {
/// let source = KeySource::cognito("us-east-1", "us-east-1_ABC123")?;
/// let config = ValidationConfig::for_source(&source, "7d8c2example")?;
/// let validator = TokenValidator::new(KeyCache::http(KeyCacheConfig::default())?, source, config);
///
/// match validator.validate(authorization).await {
///     Ok(claims) => println!("hello {}", claims.subject()),
///     Err(err) if err.is_server_error() => eprintln!("try again later"),
///     Err(err) => eprintln!("unauthorized: {}", err.public_message()),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TokenValidator {
    cache: KeyCache,
    source: KeySource,
    config: Arc<ValidationConfig>,
}

impl TokenValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(cache: KeyCache, source: KeySource, config: ValidationConfig) -> Self {
        Self { cache, source, config: Arc::new(config) }
    }

    /// Verifies `raw` and returns its claims. See [`verify_token`].
    ///
    /// # Errors
    ///
    /// Any [`AuthError`]; see [`verify_token`].
    pub async fn validate(&self, raw: &str) -> Result<TokenClaims> {
        verify_token(raw, &self.cache, &self.source, &self.config).await
    }

    /// Underlying key cache.
    #[must_use]
    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Key source tokens are verified against.
    #[must_use]
    pub fn source(&self) -> &KeySource {
        &self.source
    }

    /// Validation settings.
    #[must_use]
    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }
}
